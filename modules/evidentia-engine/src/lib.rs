//! Gap registry, resolution engine, and propagation service.
//!
//! The flow: the extraction pipeline emits unknowns → the registry dedups
//! them into gaps by fingerprint → candidates accumulate confidence until
//! one crosses the gap's threshold → the propagator rewrites every
//! occurrence across the corpus, logging enough to reverse the whole
//! mutation.

pub mod propagation;
pub mod registry;
pub mod resolution;
pub mod service;

pub use propagation::{Propagator, RollbackReport};
pub use registry::{GapRegistry, RegistrationReport};
pub use resolution::{CandidateProposal, ProposalOutcome, ResolutionEngine};
pub use service::{ConsistencyService, GapDetail};
