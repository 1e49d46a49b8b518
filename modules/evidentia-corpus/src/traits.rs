//! Core traits for the consistency engine's collaborators.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use evidentia_common::{
    AuditEntry, CandidateStatus, DuplicateCandidate, EntityType, FieldPath, GapCandidate,
    GapOccurrence, GapType, KnowledgeGap, PropagationLogEntry, ScanState,
};

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// A document under management, as the consistency engine sees it: typed,
/// timestamped, with a semi-structured metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub doc_type: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
    pub superseded_by: Option<Uuid>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>>;

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Value>>;

    /// Replace the document's metadata blob wholesale.
    async fn put_metadata(&self, id: Uuid, metadata: Value) -> Result<()>;

    /// Literal-substring swap across every string field of the metadata.
    /// Returns the number of fields changed.
    async fn replace_in_metadata(&self, id: Uuid, needle: &str, replacement: &str)
        -> Result<usize>;

    /// Documents with id strictly greater than `cursor`, ordered by id
    /// ascending. `None` starts from the beginning of the corpus.
    async fn list_after(&self, cursor: Option<Uuid>, limit: usize) -> Result<Vec<DocumentRecord>>;

    /// Record that `id` has been merged into `primary`.
    async fn mark_superseded(&self, id: Uuid, primary: Uuid) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Entity store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<EntityRecord>>;

    async fn create(&self, name: &str, entity_type: EntityType) -> Result<EntityRecord>;

    async fn entities_for_document(&self, document_id: Uuid) -> Result<BTreeSet<Uuid>>;

    /// Ids of other documents of the given type sharing at least one
    /// linked entity with `document_id`.
    async fn documents_sharing_entities(
        &self,
        document_id: Uuid,
        doc_type: &str,
    ) -> Result<Vec<Uuid>>;

    async fn link_document_entity(&self, document_id: Uuid, entity_id: Uuid) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Authority-grant subsystem (interface only; re-evaluation lives there)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AuthorityNotifier: Send + Sync {
    async fn authority_roles_changed(
        &self,
        document_id: Uuid,
        field_path: &FieldPath,
        resolved_value: &str,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Similarity index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub id: Uuid,
    pub score: f32,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Vector representations for the given document ids. Ids without a
    /// stored vector are simply absent from the result.
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>>;

    /// Nearest neighbors of `vector`, best first, optionally restricted to
    /// one document type.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        doc_type: Option<&str>,
    ) -> Result<Vec<SimilarityMatch>>;
}

// ---------------------------------------------------------------------------
// Best-effort language-model inference
// ---------------------------------------------------------------------------

/// Outcome of asking the inference service whether a document excerpt
/// names the gap's missing value. Never authoritative by itself; failures
/// map to confidence 0 at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutcome {
    pub found: bool,
    pub value: Option<String>,
    pub confidence: f32,
}

#[async_trait]
pub trait GapInference: Send + Sync {
    async fn infer(&self, gap: &KnowledgeGap, excerpt: &str) -> Result<InferenceOutcome>;
}

// ---------------------------------------------------------------------------
// Gap store
// ---------------------------------------------------------------------------

/// Result of the fingerprint-unique insert. Two concurrent registrations
/// of the same unknown race on the storage constraint; the loser gets
/// `Existing` and links instead of erroring.
#[derive(Debug, Clone)]
pub enum GapInsert {
    Created,
    Existing(KnowledgeGap),
}

#[async_trait]
pub trait GapStore: Send + Sync {
    /// Insert a gap, enforcing fingerprint uniqueness.
    async fn insert_new(&self, gap: KnowledgeGap) -> Result<GapInsert>;

    async fn get(&self, gap_id: Uuid) -> Result<Option<KnowledgeGap>>;

    async fn update(&self, gap: KnowledgeGap) -> Result<()>;

    async fn add_occurrence(&self, occurrence: GapOccurrence) -> Result<()>;

    async fn occurrences_for(&self, gap_id: Uuid) -> Result<Vec<GapOccurrence>>;

    async fn get_candidate(&self, gap_id: Uuid, value: &str) -> Result<Option<GapCandidate>>;

    async fn insert_candidate(&self, candidate: GapCandidate) -> Result<()>;

    async fn update_candidate(&self, candidate: GapCandidate) -> Result<()>;

    async fn candidates_for(&self, gap_id: Uuid) -> Result<Vec<GapCandidate>>;

    async fn list_open(
        &self,
        gap_type: Option<GapType>,
        min_occurrences: u32,
    ) -> Result<Vec<KnowledgeGap>>;

    /// Enter the per-gap critical section shared by resolution and
    /// rollback. Returns false when another mutation holds it.
    async fn begin_mutation(&self, gap_id: Uuid) -> Result<bool>;

    async fn end_mutation(&self, gap_id: Uuid) -> Result<()>;

    async fn append_log(&self, entry: PropagationLogEntry) -> Result<()>;

    async fn latest_log(&self, gap_id: Uuid) -> Result<Option<PropagationLogEntry>>;
}

// ---------------------------------------------------------------------------
// Scan store
// ---------------------------------------------------------------------------

/// Result of the pair-keyed duplicate insert.
#[derive(Debug, Clone)]
pub enum DuplicateUpsert {
    Inserted,
    AlreadyKnown(DuplicateCandidate),
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// The single scan currently in `Running` status, if any.
    async fn active_scan(&self) -> Result<Option<ScanState>>;

    async fn insert_scan(&self, state: ScanState) -> Result<()>;

    async fn update_scan(&self, state: ScanState) -> Result<()>;

    async fn get_scan(&self, id: Uuid) -> Result<Option<ScanState>>;

    /// Conditional-update leader lock: at most one scan run executes at a
    /// time. Returns false when another run holds the lock.
    async fn try_acquire_run_lock(&self) -> Result<bool>;

    async fn release_run_lock(&self) -> Result<()>;

    /// Idempotent insert keyed by the unordered document pair.
    async fn upsert_duplicate(&self, candidate: DuplicateCandidate) -> Result<DuplicateUpsert>;

    async fn get_duplicate(&self, id: Uuid) -> Result<Option<DuplicateCandidate>>;

    async fn update_duplicate(&self, candidate: DuplicateCandidate) -> Result<()>;

    async fn list_duplicates(
        &self,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<DuplicateCandidate>>;
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

/// Write-only log of auto- and manually-resolved decisions.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}
