//! Gap registration: dedup-or-link for extraction unknowns.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use evidentia_common::{
    fingerprint, ConsistencyConfig, ConsistencyError, ExtractedUnknown, GapOccurrence, GapStatus,
    KnowledgeGap, Result,
};
use evidentia_corpus::{DocumentStore, GapInsert, GapStore};

/// Registers extraction unknowns as knowledge gaps. Re-sightings of a
/// known fingerprint link to the existing gap instead of duplicating it.
pub struct GapRegistry {
    gaps: Arc<dyn GapStore>,
    documents: Arc<dyn DocumentStore>,
    config: ConsistencyConfig,
}

/// What a registration run did, split by outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationReport {
    /// Gaps created by this run.
    pub registered: Vec<Uuid>,
    /// Existing open gaps this run linked new occurrences to.
    pub linked: Vec<Uuid>,
    /// Gaps that were already resolved when re-sighted. Occurrences are
    /// still linked, but callers should re-extract with the resolved
    /// value instead of waiting on these.
    pub already_resolved: Vec<Uuid>,
    pub total: usize,
}

impl GapRegistry {
    pub fn new(
        gaps: Arc<dyn GapStore>,
        documents: Arc<dyn DocumentStore>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            gaps,
            documents,
            config,
        }
    }

    /// Register every unknown the extractor found in one document.
    ///
    /// Validation happens up front for the whole batch; a malformed
    /// unknown rejects the call before anything is written.
    pub async fn process_unknowns(
        &self,
        document_id: Uuid,
        unknowns: Vec<ExtractedUnknown>,
    ) -> Result<RegistrationReport> {
        for unknown in &unknowns {
            validate_unknown(unknown)?;
        }

        let mut report = RegistrationReport {
            total: unknowns.len(),
            ..Default::default()
        };

        for unknown in unknowns {
            let gap_id = self.register_one(document_id, &unknown, &mut report).await?;
            debug!(%gap_id, %document_id, gap_type = %unknown.gap_type, "Registered unknown");
        }

        Ok(report)
    }

    async fn register_one(
        &self,
        document_id: Uuid,
        unknown: &ExtractedUnknown,
        report: &mut RegistrationReport,
    ) -> Result<Uuid> {
        let print = fingerprint(unknown.gap_type, &unknown.partial_value, &unknown.context_clues);
        let now = Utc::now();

        let fresh = KnowledgeGap {
            id: Uuid::new_v4(),
            gap_type: unknown.gap_type,
            fingerprint: print.clone(),
            partial_value: unknown.partial_value.clone(),
            context_clues: unknown.context_clues.iter().cloned().collect(),
            resolution_hints: unknown.resolution_hints.clone(),
            confidence_threshold: self.config.default_confidence_threshold,
            status: GapStatus::Open,
            occurrence_count: 1,
            source_document_ids: BTreeSet::from([document_id]),
            first_seen_at: now,
            last_seen_at: now,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            resolution_source_document_id: None,
        };
        let fresh_id = fresh.id;

        let gap_id = match self.gaps.insert_new(fresh).await? {
            GapInsert::Created => {
                report.registered.push(fresh_id);
                fresh_id
            }
            GapInsert::Existing(mut existing) => {
                existing.occurrence_count += 1;
                existing
                    .context_clues
                    .extend(unknown.context_clues.iter().cloned());
                existing.source_document_ids.insert(document_id);
                existing.last_seen_at = now;
                let status = existing.status;
                let existing_id = existing.id;
                self.gaps.update(existing).await?;

                match status {
                    GapStatus::Open => report.linked.push(existing_id),
                    GapStatus::Resolved => {
                        warn!(gap_id = %existing_id, %document_id, "Re-sighted an already-resolved gap");
                        report.already_resolved.push(existing_id);
                    }
                }
                existing_id
            }
        };

        let placeholder = KnowledgeGap::placeholder_for(gap_id);
        let swapped = self
            .documents
            .replace_in_metadata(document_id, &unknown.placeholder, &placeholder)
            .await?;
        if swapped == 0 {
            warn!(
                %gap_id,
                %document_id,
                marker = %unknown.placeholder,
                "Extractor marker not found in document metadata"
            );
        }

        self.gaps
            .add_occurrence(GapOccurrence {
                id: Uuid::new_v4(),
                gap_id,
                document_id,
                field_path: unknown.field_path.clone(),
                surrounding_text: unknown.surrounding_text.clone(),
                local_context: unknown.context_clues.join("; "),
                extraction_confidence: unknown.confidence,
                placeholder_value: placeholder,
            })
            .await?;

        Ok(gap_id)
    }
}

fn validate_unknown(unknown: &ExtractedUnknown) -> Result<()> {
    if unknown.partial_value.trim().is_empty() {
        return Err(ConsistencyError::Validation(
            "unknown has an empty partial value".into(),
        ));
    }
    if unknown.placeholder.trim().is_empty() {
        return Err(ConsistencyError::Validation(
            "unknown has an empty extractor marker".into(),
        ));
    }
    if !(0.0..=1.0).contains(&unknown.confidence) {
        return Err(ConsistencyError::Validation(format!(
            "extraction confidence {} outside 0..1",
            unknown.confidence
        )));
    }
    Ok(())
}
