//! Cross-document propagation of resolved gaps, with full rollback.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use evidentia_common::{
    AuditAction, AuditEntry, CandidateSource, ConsistencyError, EntityType, GapOccurrence,
    GapStatus, KnowledgeGap, PropagationLogEntry, PropagationReport, Result, RollbackItem,
};
use evidentia_corpus::{AuditSink, AuthorityNotifier, DocumentStore, EntityStore, GapStore};

/// Root keys that identify a party/entity list in document metadata.
const PARTY_ROOTS: &[&str] = &["parties", "entities"];

/// Path keys that carry authority roles.
const AUTHORITY_KEYS: &[&str] = &["grantor", "grantors", "grantee", "grantees", "authority"];

/// Rewrites every occurrence of a resolved gap across the corpus and
/// records enough to reverse the whole mutation. Resolution and rollback
/// for one gap are mutually exclusive via the store's per-gap guard.
pub struct Propagator {
    gaps: Arc<dyn GapStore>,
    documents: Arc<dyn DocumentStore>,
    entities: Arc<dyn EntityStore>,
    authorities: Arc<dyn AuthorityNotifier>,
    audit: Arc<dyn AuditSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub gap_id: Uuid,
    pub fields_restored: u32,
    pub documents_touched: u32,
}

/// What one occurrence contributed to a propagation run.
enum OccurrenceUpdate {
    Skipped,
    Applied { entities: u32, authorities: u32 },
}

impl Propagator {
    pub fn new(
        gaps: Arc<dyn GapStore>,
        documents: Arc<dyn DocumentStore>,
        entities: Arc<dyn EntityStore>,
        authorities: Arc<dyn AuthorityNotifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            gaps,
            documents,
            entities,
            authorities,
            audit,
        }
    }

    /// Resolve an open gap to `resolved_value`, rewriting every occurrence.
    ///
    /// A second resolution attempt on the same gap, or one racing a
    /// rollback, fails fast with `ConcurrencyConflict`. A store failure
    /// partway through stops further mutation, writes the partial
    /// rollback log, and reports exact progress.
    pub async fn resolve_gap(
        &self,
        gap_id: Uuid,
        resolved_value: &str,
        resolved_by: &str,
        source_document_id: Option<Uuid>,
        source: CandidateSource,
    ) -> Result<PropagationReport> {
        if resolved_value.trim().is_empty() {
            return Err(ConsistencyError::Validation(
                "resolved value must not be empty".into(),
            ));
        }

        if !self.gaps.begin_mutation(gap_id).await? {
            return Err(ConsistencyError::ConcurrencyConflict(format!(
                "a resolution or rollback is already in flight for gap {gap_id}"
            )));
        }

        let result = self
            .resolve_locked(gap_id, resolved_value, resolved_by, source_document_id, source)
            .await;

        if let Err(e) = self.gaps.end_mutation(gap_id).await {
            warn!(%gap_id, error = %e, "Failed to release gap mutation guard");
        }
        result
    }

    async fn resolve_locked(
        &self,
        gap_id: Uuid,
        resolved_value: &str,
        resolved_by: &str,
        source_document_id: Option<Uuid>,
        source: CandidateSource,
    ) -> Result<PropagationReport> {
        let mut gap = self
            .gaps
            .get(gap_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("gap", gap_id))?;

        if gap.status != GapStatus::Open {
            return Err(ConsistencyError::ConcurrencyConflict(format!(
                "gap {gap_id} is already resolved"
            )));
        }

        let occurrences = self.gaps.occurrences_for(gap_id).await?;
        let started_at = Utc::now();

        let mut rollback: Vec<RollbackItem> = Vec::new();
        let mut documents_updated: BTreeSet<Uuid> = BTreeSet::new();
        let mut fields_updated: u32 = 0;
        let mut entities_created: u32 = 0;
        let mut authorities_notified: u32 = 0;

        for occurrence in &occurrences {
            match self
                .process_occurrence(occurrence, resolved_value, &mut rollback)
                .await
            {
                Ok(OccurrenceUpdate::Skipped) => {}
                Ok(OccurrenceUpdate::Applied {
                    entities,
                    authorities,
                }) => {
                    documents_updated.insert(occurrence.document_id);
                    fields_updated += 1;
                    entities_created += entities;
                    authorities_notified += authorities;
                }
                Err(e) => {
                    // Stop mutating. Whatever was captured stays reversible
                    // through the partial log.
                    let entry = self.build_log_entry(
                        &gap,
                        resolved_value,
                        documents_updated.len() as u32,
                        fields_updated,
                        entities_created,
                        authorities_notified,
                        started_at,
                        rollback,
                    );
                    if let Err(log_err) = self.gaps.append_log(entry).await {
                        warn!(%gap_id, error = %log_err, "Failed to write partial propagation log");
                    }
                    return Err(ConsistencyError::PropagationInterrupted {
                        updated: fields_updated,
                        attempted: occurrences.len() as u32,
                        reason: e.to_string(),
                    });
                }
            }
        }

        gap.status = GapStatus::Resolved;
        gap.resolved_value = Some(resolved_value.to_string());
        gap.resolved_by = Some(resolved_by.to_string());
        gap.resolved_at = Some(Utc::now());
        gap.resolution_source_document_id = source_document_id;
        self.gaps.update(gap.clone()).await?;

        let entry = self.build_log_entry(
            &gap,
            resolved_value,
            documents_updated.len() as u32,
            fields_updated,
            entities_created,
            authorities_notified,
            started_at,
            rollback,
        );
        self.gaps.append_log(entry).await?;

        let action = match source {
            CandidateSource::Manual => AuditAction::GapManuallyResolved,
            _ => AuditAction::GapAutoResolved,
        };
        self.record_audit(
            resolved_by,
            action,
            gap_id,
            format!(
                "resolved '{}' to '{}' across {} document(s)",
                gap.partial_value,
                resolved_value,
                documents_updated.len()
            ),
        )
        .await;

        info!(
            %gap_id,
            documents = documents_updated.len(),
            fields = fields_updated,
            entities_created,
            authorities_notified,
            "Gap resolved and propagated"
        );

        Ok(PropagationReport {
            gap_id,
            resolved_value: resolved_value.to_string(),
            documents_updated: documents_updated.len() as u32,
            fields_updated,
            entities_created,
            authorities_notified,
        })
    }

    /// Swap the placeholder, then run the entity/authority side effects
    /// for one occurrence. Store failures bubble up to interrupt the run.
    async fn process_occurrence(
        &self,
        occurrence: &GapOccurrence,
        resolved_value: &str,
        rollback: &mut Vec<RollbackItem>,
    ) -> anyhow::Result<OccurrenceUpdate> {
        if !self
            .apply_occurrence(occurrence, resolved_value, rollback)
            .await?
        {
            return Ok(OccurrenceUpdate::Skipped);
        }

        let entities = self.ensure_party_entity(occurrence, resolved_value).await?;
        let authorities = self.notify_authority(occurrence, resolved_value).await;
        Ok(OccurrenceUpdate::Applied {
            entities,
            authorities,
        })
    }

    /// Swap the placeholder for the resolved value in one occurrence.
    /// Returns whether a field was mutated; missing documents or fields
    /// are skipped, store failures bubble up to interrupt the run.
    async fn apply_occurrence(
        &self,
        occurrence: &GapOccurrence,
        resolved_value: &str,
        rollback: &mut Vec<RollbackItem>,
    ) -> anyhow::Result<bool> {
        let Some(mut metadata) = self.documents.get_metadata(occurrence.document_id).await? else {
            warn!(
                document_id = %occurrence.document_id,
                gap_id = %occurrence.gap_id,
                "Occurrence points at a missing document; skipping"
            );
            return Ok(false);
        };

        let Some(Value::String(current)) = occurrence.field_path.read(&metadata).cloned() else {
            warn!(
                document_id = %occurrence.document_id,
                path = %occurrence.field_path,
                "Occurrence field missing or not a string; skipping"
            );
            return Ok(false);
        };

        if !current.contains(&occurrence.placeholder_value) {
            // Another occurrence of the same gap may share the field.
            warn!(
                document_id = %occurrence.document_id,
                path = %occurrence.field_path,
                "Placeholder already gone from field; skipping"
            );
            return Ok(false);
        }

        rollback.push(RollbackItem {
            document_id: occurrence.document_id,
            field_path: occurrence.field_path.clone(),
            original_value: current.clone(),
        });

        let replaced = current.replace(&occurrence.placeholder_value, resolved_value);
        if !occurrence
            .field_path
            .write(&mut metadata, Value::String(replaced))
        {
            anyhow::bail!(
                "field {} vanished mid-propagation in document {}",
                occurrence.field_path,
                occurrence.document_id
            );
        }
        self.documents
            .put_metadata(occurrence.document_id, metadata)
            .await?;
        Ok(true)
    }

    /// Create the named entity when the occurrence sits in a party list
    /// and no entity with that name exists yet.
    async fn ensure_party_entity(
        &self,
        occurrence: &GapOccurrence,
        resolved_value: &str,
    ) -> Result<u32> {
        if !PARTY_ROOTS.contains(&occurrence.field_path.root_key()) {
            return Ok(0);
        }
        if self.entities.find_by_name(resolved_value).await?.is_some() {
            return Ok(0);
        }

        let entity_type = EntityType::infer_from_name(resolved_value);
        let entity = self.entities.create(resolved_value, entity_type).await?;
        self.entities
            .link_document_entity(occurrence.document_id, entity.id)
            .await?;
        info!(
            entity_id = %entity.id,
            name = resolved_value,
            %entity_type,
            "Created entity from resolved gap"
        );
        Ok(1)
    }

    /// Best-effort notification of the authority-grant subsystem. Its
    /// failure never fails the propagation.
    async fn notify_authority(&self, occurrence: &GapOccurrence, resolved_value: &str) -> u32 {
        let touches_authority = occurrence
            .field_path
            .segments()
            .iter()
            .any(|seg| AUTHORITY_KEYS.contains(&seg.key.as_str()));
        if !touches_authority {
            return 0;
        }

        match self
            .authorities
            .authority_roles_changed(
                occurrence.document_id,
                &occurrence.field_path,
                resolved_value,
            )
            .await
        {
            Ok(()) => 1,
            Err(e) => {
                warn!(
                    document_id = %occurrence.document_id,
                    path = %occurrence.field_path,
                    error = %e,
                    "Authority notification failed"
                );
                0
            }
        }
    }

    /// Reverse the most recent propagation for a gap: restore every
    /// captured field verbatim and reopen the gap.
    pub async fn rollback_resolution(&self, gap_id: Uuid) -> Result<RollbackReport> {
        if !self.gaps.begin_mutation(gap_id).await? {
            return Err(ConsistencyError::ConcurrencyConflict(format!(
                "a resolution or rollback is already in flight for gap {gap_id}"
            )));
        }

        let result = self.rollback_locked(gap_id).await;

        if let Err(e) = self.gaps.end_mutation(gap_id).await {
            warn!(%gap_id, error = %e, "Failed to release gap mutation guard");
        }
        result
    }

    async fn rollback_locked(&self, gap_id: Uuid) -> Result<RollbackReport> {
        let mut gap = self
            .gaps
            .get(gap_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("gap", gap_id))?;

        let entry = self
            .gaps
            .latest_log(gap_id)
            .await?
            .ok_or(ConsistencyError::RollbackUnavailable { gap_id })?;

        let mut fields_restored: u32 = 0;
        let mut documents_touched: BTreeSet<Uuid> = BTreeSet::new();

        for item in &entry.rollback_data {
            match self.restore_item(item).await {
                Ok(true) => {
                    fields_restored += 1;
                    documents_touched.insert(item.document_id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        document_id = %item.document_id,
                        path = %item.field_path,
                        error = %e,
                        "Failed to restore field during rollback"
                    );
                }
            }
        }

        gap.status = GapStatus::Open;
        gap.resolved_value = None;
        gap.resolved_by = None;
        gap.resolved_at = None;
        gap.resolution_source_document_id = None;
        self.gaps.update(gap.clone()).await?;

        self.record_audit(
            "system",
            AuditAction::GapRolledBack,
            gap_id,
            format!(
                "rolled back '{}' across {} document(s)",
                entry.resolved_value,
                documents_touched.len()
            ),
        )
        .await;

        info!(%gap_id, fields_restored, "Gap resolution rolled back");

        Ok(RollbackReport {
            gap_id,
            fields_restored,
            documents_touched: documents_touched.len() as u32,
        })
    }

    async fn restore_item(&self, item: &RollbackItem) -> anyhow::Result<bool> {
        let Some(mut metadata) = self.documents.get_metadata(item.document_id).await? else {
            warn!(
                document_id = %item.document_id,
                "Rollback target document missing; skipping"
            );
            return Ok(false);
        };

        if !item
            .field_path
            .write(&mut metadata, Value::String(item.original_value.clone()))
        {
            warn!(
                document_id = %item.document_id,
                path = %item.field_path,
                "Rollback field path no longer resolvable; skipping"
            );
            return Ok(false);
        }

        self.documents.put_metadata(item.document_id, metadata).await?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_log_entry(
        &self,
        gap: &KnowledgeGap,
        resolved_value: &str,
        documents_updated: u32,
        fields_updated: u32,
        entities_created: u32,
        authorities_notified: u32,
        started_at: chrono::DateTime<Utc>,
        rollback_data: Vec<RollbackItem>,
    ) -> PropagationLogEntry {
        PropagationLogEntry {
            id: Uuid::new_v4(),
            gap_id: gap.id,
            resolved_value: resolved_value.to_string(),
            documents_updated,
            fields_updated,
            entities_created,
            authorities_notified,
            started_at,
            completed_at: Utc::now(),
            rollback_data,
            schema_v: 1,
        }
    }

    async fn record_audit(&self, actor: &str, action: AuditAction, subject: Uuid, detail: String) {
        let entry = AuditEntry::new(actor, action, subject, detail);
        if let Err(e) = self.audit.record(entry).await {
            warn!(%subject, error = %e, "Failed to write audit entry");
        }
    }
}
