//! In-memory collaborator implementations.
//!
//! Thread-safe, deterministic, no infrastructure required. These back the
//! test suites of the engine and scanner crates and serve as the reference
//! semantics for production implementations: fingerprint uniqueness, the
//! per-gap mutation guard, the scan run lock, and pair-keyed duplicate
//! upserts all live behind the same trait methods a database-backed
//! implementation must honor.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use evidentia_common::{
    AuditEntry, CandidateStatus, DuplicateCandidate, EntityType, FieldPath, GapCandidate,
    GapOccurrence, GapType, KnowledgeGap, PropagationLogEntry, ScanState, ScanStatus,
};

use crate::traits::{
    AuditSink, AuthorityNotifier, DocumentRecord, DocumentStore, DuplicateUpsert, EntityRecord,
    EntityStore, GapInference, GapInsert, GapStore, InferenceOutcome, ScanStore, SimilarityIndex,
    SimilarityMatch,
};

// ---------------------------------------------------------------------------
// MemoryCorpus — documents, entities, gaps, scans, audit in one store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CorpusInner {
    documents: BTreeMap<Uuid, DocumentRecord>,
    entities: HashMap<Uuid, EntityRecord>,
    entity_links: HashMap<Uuid, BTreeSet<Uuid>>,

    gaps: HashMap<Uuid, KnowledgeGap>,
    gaps_by_fingerprint: HashMap<String, Uuid>,
    occurrences: HashMap<Uuid, Vec<GapOccurrence>>,
    candidates: HashMap<Uuid, Vec<GapCandidate>>,
    logs: HashMap<Uuid, Vec<PropagationLogEntry>>,
    gaps_in_mutation: HashSet<Uuid>,

    scans: HashMap<Uuid, ScanState>,
    run_lock_held: bool,
    duplicates: HashMap<Uuid, DuplicateCandidate>,
    duplicates_by_pair: HashMap<(Uuid, Uuid), Uuid>,

    audit: Vec<AuditEntry>,
}

/// One in-memory corpus implementing every storage-side trait.
#[derive(Default)]
pub struct MemoryCorpus {
    inner: Mutex<CorpusInner>,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document with generated id and the current timestamp.
    pub fn add_document(&self, doc_type: &str, metadata: Value) -> DocumentRecord {
        self.add_document_at(doc_type, metadata, Utc::now())
    }

    /// Seed a document with an explicit creation time (auto-merge picks
    /// the older document as primary, so tests control this).
    pub fn add_document_at(
        &self,
        doc_type: &str,
        metadata: Value,
        created_at: chrono::DateTime<Utc>,
    ) -> DocumentRecord {
        let record = DocumentRecord {
            id: Uuid::new_v4(),
            doc_type: doc_type.to_string(),
            created_at,
            metadata,
            superseded_by: None,
        };
        self.inner
            .lock()
            .unwrap()
            .documents
            .insert(record.id, record.clone());
        record
    }

    /// All audit entries written so far (test assertions).
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().unwrap().audit.clone()
    }

    /// Direct gap lookup by fingerprint (test assertions).
    pub fn gap_by_fingerprint(&self, fingerprint: &str) -> Option<KnowledgeGap> {
        let inner = self.inner.lock().unwrap();
        let id = inner.gaps_by_fingerprint.get(fingerprint)?;
        inner.gaps.get(id).cloned()
    }

    /// Number of documents in the corpus (test assertions).
    pub fn document_count(&self) -> usize {
        self.inner.lock().unwrap().documents.len()
    }
}

fn replace_in_value(value: &mut Value, needle: &str, replacement: &str) -> usize {
    match value {
        Value::String(s) => {
            if s.contains(needle) {
                *s = s.replace(needle, replacement);
                1
            } else {
                0
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|v| replace_in_value(v, needle, replacement))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|v| replace_in_value(v, needle, replacement))
            .sum(),
        _ => 0,
    }
}

#[async_trait]
impl DocumentStore for MemoryCorpus {
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.inner.lock().unwrap().documents.get(&id).cloned())
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .documents
            .get(&id)
            .map(|d| d.metadata.clone()))
    }

    async fn put_metadata(&self, id: Uuid, metadata: Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.documents.get_mut(&id) {
            Some(doc) => {
                doc.metadata = metadata;
                Ok(())
            }
            None => bail!("unknown document {id}"),
        }
    }

    async fn replace_in_metadata(
        &self,
        id: Uuid,
        needle: &str,
        replacement: &str,
    ) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        match inner.documents.get_mut(&id) {
            Some(doc) => Ok(replace_in_value(&mut doc.metadata, needle, replacement)),
            None => bail!("unknown document {id}"),
        }
    }

    async fn list_after(&self, cursor: Option<Uuid>, limit: usize) -> Result<Vec<DocumentRecord>> {
        let inner = self.inner.lock().unwrap();
        let page = inner
            .documents
            .values()
            .filter(|d| cursor.is_none_or(|c| d.id > c))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn mark_superseded(&self, id: Uuid, primary: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.documents.get_mut(&id) {
            Some(doc) => {
                doc.superseded_by = Some(primary);
                Ok(())
            }
            None => bail!("unknown document {id}"),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryCorpus {
    async fn find_by_name(&self, name: &str) -> Result<Option<EntityRecord>> {
        let needle = name.trim().to_lowercase();
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entities
            .values()
            .find(|e| e.name.trim().to_lowercase() == needle)
            .cloned())
    }

    async fn create(&self, name: &str, entity_type: EntityType) -> Result<EntityRecord> {
        let record = EntityRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            entity_type,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap()
            .entities
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn entities_for_document(&self, document_id: Uuid) -> Result<BTreeSet<Uuid>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entity_links
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn documents_sharing_entities(
        &self,
        document_id: Uuid,
        doc_type: &str,
    ) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let Some(own) = inner.entity_links.get(&document_id) else {
            return Ok(Vec::new());
        };
        let mut shared: Vec<Uuid> = inner
            .entity_links
            .iter()
            .filter(|(doc, entities)| {
                **doc != document_id
                    && !entities.is_disjoint(own)
                    && inner
                        .documents
                        .get(doc)
                        .is_some_and(|d| d.doc_type == doc_type)
            })
            .map(|(doc, _)| *doc)
            .collect();
        shared.sort();
        Ok(shared)
    }

    async fn link_document_entity(&self, document_id: Uuid, entity_id: Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .entity_links
            .entry(document_id)
            .or_default()
            .insert(entity_id);
        Ok(())
    }
}

#[async_trait]
impl GapStore for MemoryCorpus {
    async fn insert_new(&self, gap: KnowledgeGap) -> Result<GapInsert> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing_id) = inner.gaps_by_fingerprint.get(&gap.fingerprint) {
            let existing = inner
                .gaps
                .get(existing_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("fingerprint index points at missing gap"))?;
            return Ok(GapInsert::Existing(existing));
        }
        inner
            .gaps_by_fingerprint
            .insert(gap.fingerprint.clone(), gap.id);
        inner.gaps.insert(gap.id, gap);
        Ok(GapInsert::Created)
    }

    async fn get(&self, gap_id: Uuid) -> Result<Option<KnowledgeGap>> {
        Ok(self.inner.lock().unwrap().gaps.get(&gap_id).cloned())
    }

    async fn update(&self, gap: KnowledgeGap) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.gaps.contains_key(&gap.id) {
            bail!("unknown gap {}", gap.id);
        }
        inner.gaps.insert(gap.id, gap);
        Ok(())
    }

    async fn add_occurrence(&self, occurrence: GapOccurrence) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .occurrences
            .entry(occurrence.gap_id)
            .or_default()
            .push(occurrence);
        Ok(())
    }

    async fn occurrences_for(&self, gap_id: Uuid) -> Result<Vec<GapOccurrence>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .occurrences
            .get(&gap_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_candidate(&self, gap_id: Uuid, value: &str) -> Result<Option<GapCandidate>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .candidates
            .get(&gap_id)
            .and_then(|list| list.iter().find(|c| c.candidate_value == value))
            .cloned())
    }

    async fn insert_candidate(&self, candidate: GapCandidate) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .candidates
            .entry(candidate.gap_id)
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn update_candidate(&self, candidate: GapCandidate) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner
            .candidates
            .get_mut(&candidate.gap_id)
            .and_then(|list| list.iter_mut().find(|c| c.id == candidate.id))
        else {
            bail!("unknown candidate {}", candidate.id);
        };
        *slot = candidate;
        Ok(())
    }

    async fn candidates_for(&self, gap_id: Uuid) -> Result<Vec<GapCandidate>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .candidates
            .get(&gap_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_open(
        &self,
        gap_type: Option<GapType>,
        min_occurrences: u32,
    ) -> Result<Vec<KnowledgeGap>> {
        let inner = self.inner.lock().unwrap();
        let mut open: Vec<KnowledgeGap> = inner
            .gaps
            .values()
            .filter(|g| {
                g.status == evidentia_common::GapStatus::Open
                    && gap_type.is_none_or(|t| g.gap_type == t)
                    && g.occurrence_count >= min_occurrences
            })
            .cloned()
            .collect();
        open.sort_by_key(|g| g.first_seen_at);
        Ok(open)
    }

    async fn begin_mutation(&self, gap_id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().unwrap().gaps_in_mutation.insert(gap_id))
    }

    async fn end_mutation(&self, gap_id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().gaps_in_mutation.remove(&gap_id);
        Ok(())
    }

    async fn append_log(&self, entry: PropagationLogEntry) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .entry(entry.gap_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn latest_log(&self, gap_id: Uuid) -> Result<Option<PropagationLogEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .logs
            .get(&gap_id)
            .and_then(|list| list.last())
            .cloned())
    }
}

fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[async_trait]
impl ScanStore for MemoryCorpus {
    async fn active_scan(&self) -> Result<Option<ScanState>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .scans
            .values()
            .find(|s| s.status == ScanStatus::Running)
            .cloned())
    }

    async fn insert_scan(&self, state: ScanState) -> Result<()> {
        self.inner.lock().unwrap().scans.insert(state.id, state);
        Ok(())
    }

    async fn update_scan(&self, state: ScanState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.scans.contains_key(&state.id) {
            bail!("unknown scan {}", state.id);
        }
        inner.scans.insert(state.id, state);
        Ok(())
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<ScanState>> {
        Ok(self.inner.lock().unwrap().scans.get(&id).cloned())
    }

    async fn try_acquire_run_lock(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.run_lock_held {
            return Ok(false);
        }
        inner.run_lock_held = true;
        Ok(true)
    }

    async fn release_run_lock(&self) -> Result<()> {
        self.inner.lock().unwrap().run_lock_held = false;
        Ok(())
    }

    async fn upsert_duplicate(&self, candidate: DuplicateCandidate) -> Result<DuplicateUpsert> {
        let mut inner = self.inner.lock().unwrap();
        let key = pair_key(candidate.document_id, candidate.candidate_document_id);
        if let Some(existing_id) = inner.duplicates_by_pair.get(&key) {
            let existing = inner
                .duplicates
                .get(existing_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("pair index points at missing candidate"))?;
            return Ok(DuplicateUpsert::AlreadyKnown(existing));
        }
        inner.duplicates_by_pair.insert(key, candidate.id);
        inner.duplicates.insert(candidate.id, candidate);
        Ok(DuplicateUpsert::Inserted)
    }

    async fn get_duplicate(&self, id: Uuid) -> Result<Option<DuplicateCandidate>> {
        Ok(self.inner.lock().unwrap().duplicates.get(&id).cloned())
    }

    async fn update_duplicate(&self, candidate: DuplicateCandidate) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.duplicates.contains_key(&candidate.id) {
            bail!("unknown duplicate candidate {}", candidate.id);
        }
        inner.duplicates.insert(candidate.id, candidate);
        Ok(())
    }

    async fn list_duplicates(
        &self,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<DuplicateCandidate>> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<DuplicateCandidate> = inner
            .duplicates
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        list.sort_by_key(|c| c.detected_at);
        Ok(list)
    }
}

#[async_trait]
impl AuditSink for MemoryCorpus {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.inner.lock().unwrap().audit.push(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySimilarityIndex
// ---------------------------------------------------------------------------

/// Seedable vector index with brute-force cosine scoring.
#[derive(Default)]
pub struct MemorySimilarityIndex {
    vectors: Mutex<HashMap<Uuid, (Option<String>, Vec<f32>)>>,
}

impl MemorySimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, doc_type: Option<&str>, vector: Vec<f32>) {
        self.vectors
            .lock()
            .unwrap()
            .insert(id, (doc_type.map(|s| s.to_string()), vector));
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl SimilarityIndex for MemorySimilarityIndex {
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>> {
        let vectors = self.vectors.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| vectors.get(id).map(|(_, v)| (*id, v.clone())))
            .collect())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        doc_type: Option<&str>,
    ) -> Result<Vec<SimilarityMatch>> {
        let vectors = self.vectors.lock().unwrap();
        let mut matches: Vec<SimilarityMatch> = vectors
            .iter()
            .filter(|(_, (stored_type, _))| {
                doc_type.is_none_or(|t| stored_type.as_deref() == Some(t))
            })
            .map(|(id, (_, stored))| SimilarityMatch {
                id: *id,
                score: cosine_similarity(vector, stored),
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// Test doubles for the remaining seams
// ---------------------------------------------------------------------------

/// Discards authority notifications.
#[derive(Default)]
pub struct NoopAuthorityNotifier;

#[async_trait]
impl AuthorityNotifier for NoopAuthorityNotifier {
    async fn authority_roles_changed(
        &self,
        _document_id: Uuid,
        _field_path: &FieldPath,
        _resolved_value: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Records authority notifications for assertions.
#[derive(Default)]
pub struct RecordingAuthorityNotifier {
    calls: Mutex<Vec<(Uuid, String, String)>>,
}

impl RecordingAuthorityNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(Uuid, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorityNotifier for RecordingAuthorityNotifier {
    async fn authority_roles_changed(
        &self,
        document_id: Uuid,
        field_path: &FieldPath,
        resolved_value: &str,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((
            document_id,
            field_path.to_string(),
            resolved_value.to_string(),
        ));
        Ok(())
    }
}

/// Inference double returning one fixed outcome.
pub struct StaticInference {
    outcome: InferenceOutcome,
}

impl StaticInference {
    pub fn new(outcome: InferenceOutcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl GapInference for StaticInference {
    async fn infer(&self, _gap: &KnowledgeGap, _excerpt: &str) -> Result<InferenceOutcome> {
        Ok(self.outcome.clone())
    }
}

/// Inference double that always fails, for downgrade-path tests.
#[derive(Default)]
pub struct UnavailableInference;

#[async_trait]
impl GapInference for UnavailableInference {
    async fn infer(&self, _gap: &KnowledgeGap, _excerpt: &str) -> Result<InferenceOutcome> {
        bail!("inference service unavailable")
    }
}

/// Similarity index that always fails, for detector isolation tests.
#[derive(Default)]
pub struct FailingSimilarityIndex;

#[async_trait]
impl SimilarityIndex for FailingSimilarityIndex {
    async fn get_by_ids(&self, _ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>> {
        bail!("similarity index unavailable")
    }

    async fn query(
        &self,
        _vector: &[f32],
        _top_k: usize,
        _doc_type: Option<&str>,
    ) -> Result<Vec<SimilarityMatch>> {
        bail!("similarity index unavailable")
    }
}
