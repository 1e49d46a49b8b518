//! Manual resolution of duplicate candidates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use evidentia_common::{
    AuditAction, AuditEntry, CandidateStatus, ConsistencyError, DuplicateCandidate, Result,
};
use evidentia_corpus::{AuditSink, DocumentStore, ScanStore};

use crate::scanner::merge_documents;

/// Applies reviewer verdicts to pending duplicate candidates.
pub struct ReviewQueue {
    scans: Arc<dyn ScanStore>,
    documents: Arc<dyn DocumentStore>,
    audit: Arc<dyn AuditSink>,
}

impl ReviewQueue {
    pub fn new(
        scans: Arc<dyn ScanStore>,
        documents: Arc<dyn DocumentStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            scans,
            documents,
            audit,
        }
    }

    /// Move a pending candidate to a terminal status. Confirming a
    /// duplicate (or marking it merged) links the documents the same way
    /// auto-merge does.
    pub async fn resolve_candidate(
        &self,
        candidate_id: Uuid,
        resolution: CandidateStatus,
        notes: Option<String>,
        reviewer: &str,
    ) -> Result<DuplicateCandidate> {
        if resolution == CandidateStatus::Pending {
            return Err(ConsistencyError::Validation(
                "resolution must be a terminal status".into(),
            ));
        }

        let mut candidate = self
            .scans
            .get_duplicate(candidate_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("duplicate candidate", candidate_id))?;

        if candidate.status != CandidateStatus::Pending {
            return Err(ConsistencyError::ConcurrencyConflict(format!(
                "candidate {candidate_id} was already resolved"
            )));
        }

        if matches!(
            resolution,
            CandidateStatus::ConfirmedDuplicate | CandidateStatus::Merged
        ) {
            let (primary, merged) = merge_documents(
                self.documents.as_ref(),
                candidate.document_id,
                candidate.candidate_document_id,
            )
            .await?;
            info!(%candidate_id, %primary, %merged, "Reviewer confirmed duplicate; documents linked");
        }

        candidate.status = resolution;
        candidate.auto_resolved = false;
        candidate.resolution_notes = notes;
        candidate.reviewed_by = Some(reviewer.to_string());
        candidate.reviewed_at = Some(Utc::now());
        self.scans.update_duplicate(candidate.clone()).await?;

        let entry = AuditEntry::new(
            reviewer,
            AuditAction::DuplicateManuallyResolved,
            candidate.id,
            format!(
                "candidate pair ({}, {}) resolved as {:?}",
                candidate.document_id, candidate.candidate_document_id, candidate.status
            ),
        );
        if let Err(e) = self.audit.record(entry).await {
            warn!(%candidate_id, error = %e, "Failed to write audit entry");
        }

        Ok(candidate)
    }
}
