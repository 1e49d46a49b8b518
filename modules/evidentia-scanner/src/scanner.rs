//! The cursor-driven corpus scanner.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evidentia_common::{
    AuditAction, AuditEntry, CandidateStatus, ConsistencyConfig, ConsistencyError,
    DetectionMethod, DuplicateCandidate, Result, ScanState, ScanStatus, ScanType,
};
use evidentia_corpus::{
    AuditSink, DocumentRecord, DocumentStore, DuplicateUpsert, ScanStore,
};

use crate::detect::{DetectedDuplicate, DuplicateDetector};

/// What one scan run accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub scan_id: Uuid,
    pub scan_type: ScanType,
    pub documents_scanned: u64,
    pub duplicates_found: u64,
    pub completed: bool,
}

/// Single active scanner per corpus. The run lock serializes runs; the
/// persisted `ScanState` cursor survives restarts and only advances after
/// a document's detection work has completed.
pub struct CorpusScanner {
    documents: Arc<dyn DocumentStore>,
    scans: Arc<dyn ScanStore>,
    audit: Arc<dyn AuditSink>,
    detector: DuplicateDetector,
    config: ConsistencyConfig,
}

impl CorpusScanner {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        scans: Arc<dyn ScanStore>,
        audit: Arc<dyn AuditSink>,
        detector: DuplicateDetector,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            documents,
            scans,
            audit,
            detector,
            config,
        }
    }

    /// Process one batch of the active scan, creating a fresh incremental
    /// scan if none is running. Call repeatedly (e.g. from a timer) until
    /// the returned progress reports completion.
    pub async fn run_incremental_scan(&self) -> Result<ScanProgress> {
        if !self.scans.try_acquire_run_lock().await? {
            return Err(ConsistencyError::ConcurrencyConflict(
                "another scan run is executing".into(),
            ));
        }

        let result = self.run_locked(ScanType::Incremental).await;

        if let Err(e) = self.scans.release_run_lock().await {
            warn!(error = %e, "Failed to release scan run lock");
        }
        result
    }

    /// Start a scan of the whole corpus from the beginning. Fails when any
    /// scan is still running; the fresh state is then driven by the
    /// incremental path.
    pub async fn run_full_scan(&self) -> Result<ScanProgress> {
        if !self.scans.try_acquire_run_lock().await? {
            return Err(ConsistencyError::ConcurrencyConflict(
                "another scan run is executing".into(),
            ));
        }

        let result = self.run_full_locked().await;

        if let Err(e) = self.scans.release_run_lock().await {
            warn!(error = %e, "Failed to release scan run lock");
        }
        result
    }

    async fn run_full_locked(&self) -> Result<ScanProgress> {
        if self.scans.active_scan().await?.is_some() {
            return Err(ConsistencyError::ConcurrencyConflict(
                "a scan is already running; wait for it to complete".into(),
            ));
        }

        let state = new_scan_state(ScanType::Full);
        self.scans.insert_scan(state.clone()).await?;
        info!(scan_id = %state.id, "Full corpus scan started");
        self.process_batch(state).await
    }

    async fn run_locked(&self, scan_type: ScanType) -> Result<ScanProgress> {
        let state = match self.scans.active_scan().await? {
            Some(existing) => {
                debug!(scan_id = %existing.id, cursor = ?existing.cursor, "Resuming active scan");
                existing
            }
            None => {
                let fresh = new_scan_state(scan_type);
                self.scans.insert_scan(fresh.clone()).await?;
                info!(scan_id = %fresh.id, "Incremental scan started");
                fresh
            }
        };

        self.process_batch(state).await
    }

    async fn process_batch(&self, mut state: ScanState) -> Result<ScanProgress> {
        let batch = self
            .documents
            .list_after(state.cursor, self.config.scan_batch_size)
            .await?;
        let exhausted = batch.len() < self.config.scan_batch_size;

        for doc in &batch {
            let found = self.scan_document(doc).await;

            // Detection for this document is done; now the cursor may move.
            state.cursor = Some(doc.id);
            state.documents_scanned += 1;
            state.duplicates_found += found;
            self.scans.update_scan(state.clone()).await?;
        }

        if exhausted {
            state.status = ScanStatus::Completed;
            state.completed_at = Some(Utc::now());
            self.scans.update_scan(state.clone()).await?;
            info!(
                scan_id = %state.id,
                documents = state.documents_scanned,
                duplicates = state.duplicates_found,
                "Corpus scan completed"
            );
        }

        Ok(ScanProgress {
            scan_id: state.id,
            scan_type: state.scan_type,
            documents_scanned: state.documents_scanned,
            duplicates_found: state.duplicates_found,
            completed: state.status == ScanStatus::Completed,
        })
    }

    /// Detect and persist duplicates for one document. Never fails the
    /// batch; returns how many new candidates were recorded.
    async fn scan_document(&self, doc: &DocumentRecord) -> u64 {
        if doc.superseded_by.is_some() {
            debug!(document_id = %doc.id, "Skipping detection for superseded document");
            return 0;
        }

        let mut found = 0u64;
        for detected in self.detector.find_duplicates(doc).await {
            match self.persist_match(doc, &detected).await {
                Ok(true) => found += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        document_id = %doc.id,
                        candidate_document_id = %detected.candidate_document_id,
                        error = %e,
                        "Failed to persist duplicate candidate"
                    );
                }
            }
        }
        found
    }

    /// Insert one detected match (idempotent by document pair) and
    /// auto-merge when the semantic score clears the threshold.
    async fn persist_match(
        &self,
        doc: &DocumentRecord,
        detected: &DetectedDuplicate,
    ) -> anyhow::Result<bool> {
        let candidate = DuplicateCandidate {
            id: Uuid::new_v4(),
            document_id: doc.id,
            candidate_document_id: detected.candidate_document_id,
            detection_method: detected.detection_method,
            similarity_score: detected.similarity_score,
            confidence: detected.confidence,
            status: CandidateStatus::Pending,
            auto_resolved: false,
            resolution_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            detected_at: Utc::now(),
        };

        let inserted = match self.scans.upsert_duplicate(candidate.clone()).await? {
            DuplicateUpsert::Inserted => candidate,
            DuplicateUpsert::AlreadyKnown(existing) => {
                debug!(
                    document_id = %doc.id,
                    candidate_document_id = %detected.candidate_document_id,
                    existing_id = %existing.id,
                    "Document pair already recorded"
                );
                return Ok(false);
            }
        };

        // Only semantic matches ever merge without review.
        if inserted.detection_method == DetectionMethod::Semantic
            && inserted.similarity_score >= self.config.auto_merge_threshold
        {
            if let Err(e) = self.auto_merge(inserted).await {
                warn!(
                    document_id = %doc.id,
                    candidate_document_id = %detected.candidate_document_id,
                    error = %e,
                    "Auto-merge failed; candidate left pending"
                );
            }
        }

        Ok(true)
    }

    async fn auto_merge(&self, mut candidate: DuplicateCandidate) -> anyhow::Result<()> {
        let (primary, merged) = merge_documents(
            self.documents.as_ref(),
            candidate.document_id,
            candidate.candidate_document_id,
        )
        .await?;

        candidate.status = CandidateStatus::ConfirmedDuplicate;
        candidate.auto_resolved = true;
        candidate.resolution_notes = Some(format!(
            "auto-merged: semantic similarity {:.3} >= {:.3}",
            candidate.similarity_score, self.config.auto_merge_threshold
        ));
        candidate.reviewed_at = Some(Utc::now());
        self.scans.update_duplicate(candidate.clone()).await?;

        self.audit
            .record(AuditEntry::new(
                "scanner",
                AuditAction::DuplicateAutoMerged,
                candidate.id,
                format!("document {merged} superseded by {primary}"),
            ))
            .await?;

        info!(
            candidate_id = %candidate.id,
            %primary,
            %merged,
            score = candidate.similarity_score,
            "Auto-merged duplicate documents"
        );
        Ok(())
    }

    /// Run detection for one document on demand, without touching scan
    /// state. Returns the number of new candidates recorded.
    pub async fn scan_single_document(&self, document_id: Uuid) -> Result<u64> {
        let doc = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("document", document_id))?;
        Ok(self.scan_document(&doc).await)
    }

    /// The scan currently running, if any.
    pub async fn scan_status(&self) -> Result<Option<ScanState>> {
        Ok(self.scans.active_scan().await?)
    }

    /// Duplicate candidates, optionally filtered by status.
    pub async fn list_candidates(
        &self,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<DuplicateCandidate>> {
        Ok(self.scans.list_duplicates(status).await?)
    }
}

fn new_scan_state(scan_type: ScanType) -> ScanState {
    ScanState {
        id: Uuid::new_v4(),
        scan_type,
        cursor: None,
        documents_scanned: 0,
        duplicates_found: 0,
        started_at: Utc::now(),
        completed_at: None,
        status: ScanStatus::Running,
    }
}

/// Link two documents as duplicates: the older (by creation time) becomes
/// primary, the newer is marked superseded-by. Returns (primary, merged).
pub(crate) async fn merge_documents(
    documents: &dyn DocumentStore,
    a: Uuid,
    b: Uuid,
) -> anyhow::Result<(Uuid, Uuid)> {
    let doc_a = documents
        .get_document(a)
        .await?
        .ok_or_else(|| anyhow::anyhow!("document {a} missing"))?;
    let doc_b = documents
        .get_document(b)
        .await?
        .ok_or_else(|| anyhow::anyhow!("document {b} missing"))?;

    let (primary, merged) = if doc_a.created_at <= doc_b.created_at {
        (doc_a.id, doc_b.id)
    } else {
        (doc_b.id, doc_a.id)
    };

    documents.mark_superseded(merged, primary).await?;
    Ok((primary, merged))
}
