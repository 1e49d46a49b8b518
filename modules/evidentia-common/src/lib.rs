pub mod config;
pub mod error;
pub mod fieldpath;
pub mod fingerprint;
pub mod types;

pub use config::ConsistencyConfig;
pub use error::{ConsistencyError, Result};
pub use fieldpath::{FieldPath, PathSegment};
pub use fingerprint::fingerprint;
pub use types::*;
