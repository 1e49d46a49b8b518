//! Resumable corpus scanning for duplicate documents.
//!
//! The scanner walks the corpus behind a persisted cursor, runs semantic
//! and metadata detection per document, records candidates idempotently,
//! and auto-merges only high-confidence semantic matches. Interrupting a
//! run is safe: the cursor advances only after a document's detection has
//! fully completed, so resume never skips or reprocesses a document.

pub mod detect;
pub mod review;
pub mod scanner;

pub use detect::{DetectedDuplicate, DuplicateDetector};
pub use review::ReviewQueue;
pub use scanner::{CorpusScanner, ScanProgress};
