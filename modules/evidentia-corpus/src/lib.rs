//! Collaborator seams for the consistency engine.
//!
//! The engine never talks to a concrete database, vector index, or
//! inference provider; it talks to the traits defined here. Production
//! deployments implement them over their storage of choice; the in-memory
//! implementations in [`memory`] back the test suite and
//! infrastructure-free runs.

pub mod memory;
pub mod traits;

pub use memory::{
    cosine_similarity, FailingSimilarityIndex, MemoryCorpus, MemorySimilarityIndex,
    NoopAuthorityNotifier, RecordingAuthorityNotifier, StaticInference, UnavailableInference,
};
pub use traits::*;
