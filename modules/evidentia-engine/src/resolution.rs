//! Confidence aggregation over gap candidates.
//!
//! Independent corroboration from multiple documents/sources pushes a
//! candidate toward auto-resolution without requiring any single source
//! to be fully confident.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evidentia_common::{
    CandidateSource, ConsistencyConfig, ConsistencyError, GapCandidate, GapStatus, KnowledgeGap,
    PropagationReport, Result,
};
use evidentia_corpus::{GapInference, GapStore};

use crate::propagation::Propagator;

/// Provenance and confidence for one proposal.
#[derive(Debug, Clone)]
pub struct CandidateProposal {
    pub source_type: CandidateSource,
    pub source_document_id: Option<Uuid>,
    pub source_description: Option<String>,
    pub confidence: f32,
    /// Actor recorded as `resolved_by` if this proposal auto-resolves.
    pub proposed_by: Option<String>,
}

#[derive(Debug)]
pub enum ProposalOutcome {
    /// The candidate crossed the gap's threshold and propagation ran.
    AutoResolved(PropagationReport),
    /// An existing candidate gained a confirmation.
    ConfirmationAdded { candidate_id: Uuid, confidence: f32 },
    /// A new candidate was recorded below the threshold.
    CandidateProposed { candidate_id: Uuid, confidence: f32 },
}

pub struct ResolutionEngine {
    gaps: Arc<dyn GapStore>,
    propagator: Arc<Propagator>,
    inference: Option<Arc<dyn GapInference>>,
    config: ConsistencyConfig,
}

impl ResolutionEngine {
    pub fn new(
        gaps: Arc<dyn GapStore>,
        propagator: Arc<Propagator>,
        inference: Option<Arc<dyn GapInference>>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            gaps,
            propagator,
            inference,
            config,
        }
    }

    /// Propose a concrete value for a gap.
    ///
    /// A repeat of an existing candidate value counts as a confirmation:
    /// confirmations increment and confidence steps up by the configured
    /// amount, capped at 1.0 and never decreasing. Crossing the gap's
    /// threshold triggers resolution immediately.
    pub async fn propose(
        &self,
        gap_id: Uuid,
        candidate_value: &str,
        proposal: CandidateProposal,
    ) -> Result<ProposalOutcome> {
        if candidate_value.trim().is_empty() {
            return Err(ConsistencyError::Validation(
                "candidate value must not be empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&proposal.confidence) {
            return Err(ConsistencyError::Validation(format!(
                "proposal confidence {} outside 0..1",
                proposal.confidence
            )));
        }

        let gap = self
            .gaps
            .get(gap_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("gap", gap_id))?;
        if gap.status != GapStatus::Open {
            return Err(ConsistencyError::ConcurrencyConflict(format!(
                "gap {gap_id} is already resolved"
            )));
        }

        let (candidate, confirmed_existing) =
            match self.gaps.get_candidate(gap_id, candidate_value).await? {
                Some(mut existing) => {
                    existing.confirmations += 1;
                    existing.confidence =
                        (existing.confidence + self.config.confirmation_step).min(1.0);
                    existing.last_confirmed_at = Utc::now();
                    self.gaps.update_candidate(existing.clone()).await?;
                    (existing, true)
                }
                None => {
                    let now = Utc::now();
                    let fresh = GapCandidate {
                        id: Uuid::new_v4(),
                        gap_id,
                        candidate_value: candidate_value.to_string(),
                        source_type: proposal.source_type,
                        source_document_id: proposal.source_document_id,
                        source_description: proposal.source_description.clone(),
                        confidence: proposal.confidence,
                        confirmations: 1,
                        proposed_at: now,
                        last_confirmed_at: now,
                    };
                    self.gaps.insert_candidate(fresh.clone()).await?;
                    (fresh, false)
                }
            };

        debug!(
            %gap_id,
            candidate = candidate_value,
            confidence = candidate.confidence,
            threshold = gap.confidence_threshold,
            confirmations = candidate.confirmations,
            "Candidate proposal recorded"
        );

        if candidate.confidence >= gap.confidence_threshold {
            let resolved_by = proposal
                .proposed_by
                .unwrap_or_else(|| proposal.source_type.to_string());
            let report = self
                .propagator
                .resolve_gap(
                    gap_id,
                    candidate_value,
                    &resolved_by,
                    proposal.source_document_id,
                    proposal.source_type,
                )
                .await?;
            info!(%gap_id, candidate = candidate_value, "Candidate crossed threshold; auto-resolved");
            return Ok(ProposalOutcome::AutoResolved(report));
        }

        if confirmed_existing {
            Ok(ProposalOutcome::ConfirmationAdded {
                candidate_id: candidate.id,
                confidence: candidate.confidence,
            })
        } else {
            Ok(ProposalOutcome::CandidateProposed {
                candidate_id: candidate.id,
                confidence: candidate.confidence,
            })
        }
    }

    /// Ask the inference service whether `excerpt` names the gap's missing
    /// value, and feed any hit back through [`propose`](Self::propose) as
    /// an `AiInference` candidate.
    ///
    /// Best effort only: no configured service, a timeout, a failure, or a
    /// miss all yield `Ok(None)` — inference is an input to scoring, never
    /// a synchronization point.
    pub async fn propose_from_inference(
        &self,
        gap_id: Uuid,
        source_document_id: Option<Uuid>,
        excerpt: &str,
    ) -> Result<Option<ProposalOutcome>> {
        let Some(inference) = &self.inference else {
            return Ok(None);
        };

        let gap = self
            .gaps
            .get(gap_id)
            .await?
            .ok_or_else(|| ConsistencyError::not_found("gap", gap_id))?;

        let outcome = match timeout(
            self.config.external_timeout,
            inference.infer(&gap, excerpt),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(%gap_id, error = %e, "Inference failed; treating as zero confidence");
                return Ok(None);
            }
            Err(_) => {
                warn!(%gap_id, "Inference timed out; treating as zero confidence");
                return Ok(None);
            }
        };

        let Some(value) = outcome.value.filter(|_| outcome.found) else {
            return Ok(None);
        };
        if outcome.confidence <= 0.0 {
            return Ok(None);
        }

        let proposal = CandidateProposal {
            source_type: CandidateSource::AiInference,
            source_document_id,
            source_description: Some(describe_inference(&gap)),
            confidence: outcome.confidence.min(1.0),
            proposed_by: None,
        };
        self.propose(gap_id, &value, proposal).await.map(Some)
    }
}

fn describe_inference(gap: &KnowledgeGap) -> String {
    format!(
        "language-model match for {} gap '{}'",
        gap.gap_type, gap.partial_value
    )
}
