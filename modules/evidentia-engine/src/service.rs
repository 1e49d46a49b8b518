//! Control-surface facade over the gap services.
//!
//! HTTP, CLI, and dashboard layers live outside this crate; these are the
//! operations they drive. Pure assembly — no logic beyond delegation.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use evidentia_common::{
    CandidateSource, ConsistencyConfig, ConsistencyError, ExtractedUnknown, GapCandidate,
    GapOccurrence, GapType, KnowledgeGap, PropagationReport, Result,
};
use evidentia_corpus::{
    AuditSink, AuthorityNotifier, DocumentStore, EntityStore, GapInference, GapStore,
};

use crate::propagation::{Propagator, RollbackReport};
use crate::registry::{GapRegistry, RegistrationReport};
use crate::resolution::{CandidateProposal, ProposalOutcome, ResolutionEngine};

/// A gap with everything a reviewer needs: its occurrences and the
/// candidates competing to resolve it.
#[derive(Debug, Clone, Serialize)]
pub struct GapDetail {
    pub gap: KnowledgeGap,
    pub occurrences: Vec<GapOccurrence>,
    pub candidates: Vec<GapCandidate>,
}

pub struct ConsistencyService {
    gaps: Arc<dyn GapStore>,
    registry: GapRegistry,
    resolution: ResolutionEngine,
    propagator: Arc<Propagator>,
}

impl ConsistencyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gaps: Arc<dyn GapStore>,
        documents: Arc<dyn DocumentStore>,
        entities: Arc<dyn EntityStore>,
        authorities: Arc<dyn AuthorityNotifier>,
        audit: Arc<dyn AuditSink>,
        inference: Option<Arc<dyn GapInference>>,
        config: ConsistencyConfig,
    ) -> Self {
        let propagator = Arc::new(Propagator::new(
            gaps.clone(),
            documents.clone(),
            entities,
            authorities,
            audit,
        ));
        let registry = GapRegistry::new(gaps.clone(), documents, config.clone());
        let resolution =
            ResolutionEngine::new(gaps.clone(), propagator.clone(), inference, config);
        Self {
            gaps,
            registry,
            resolution,
            propagator,
        }
    }

    /// Register extraction unknowns for a document.
    pub async fn register_unknowns(
        &self,
        document_id: Uuid,
        unknowns: Vec<ExtractedUnknown>,
    ) -> Result<RegistrationReport> {
        self.registry.process_unknowns(document_id, unknowns).await
    }

    /// Propose a gap resolution.
    pub async fn propose_resolution(
        &self,
        gap_id: Uuid,
        candidate_value: &str,
        proposal: CandidateProposal,
    ) -> Result<ProposalOutcome> {
        self.resolution.propose(gap_id, candidate_value, proposal).await
    }

    /// Run best-effort inference against a document excerpt.
    pub async fn propose_from_inference(
        &self,
        gap_id: Uuid,
        source_document_id: Option<Uuid>,
        excerpt: &str,
    ) -> Result<Option<ProposalOutcome>> {
        self.resolution
            .propose_from_inference(gap_id, source_document_id, excerpt)
            .await
    }

    /// Resolve a gap directly (manual review path).
    pub async fn resolve_gap(
        &self,
        gap_id: Uuid,
        resolved_value: &str,
        resolved_by: &str,
        source_document_id: Option<Uuid>,
    ) -> Result<PropagationReport> {
        self.propagator
            .resolve_gap(
                gap_id,
                resolved_value,
                resolved_by,
                source_document_id,
                CandidateSource::Manual,
            )
            .await
    }

    /// Reverse the most recent resolution of a gap.
    pub async fn rollback_gap(&self, gap_id: Uuid) -> Result<RollbackReport> {
        self.propagator.rollback_resolution(gap_id).await
    }

    /// Fetch a gap with its occurrences and candidates.
    pub async fn gap_detail(&self, gap_id: Uuid) -> Result<GapDetail> {
        let gap = self
            .gaps
            .get(gap_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("gap", gap_id))?;
        let occurrences = self.gaps.occurrences_for(gap_id).await?;
        let candidates = self.gaps.candidates_for(gap_id).await?;
        Ok(GapDetail {
            gap,
            occurrences,
            candidates,
        })
    }

    /// List open gaps, optionally filtered by type and minimum occurrence
    /// count.
    pub async fn list_open_gaps(
        &self,
        gap_type: Option<GapType>,
        min_occurrences: u32,
    ) -> Result<Vec<KnowledgeGap>> {
        self.gaps.list_open(gap_type, min_occurrences).await
    }
}
