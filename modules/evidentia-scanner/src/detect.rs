//! Duplicate detection: semantic similarity and metadata entity overlap.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use evidentia_common::{ConsistencyConfig, DetectionMethod, MatchConfidence};
use evidentia_corpus::{DocumentRecord, EntityStore, SimilarityIndex};

/// One detected match against another document, before persistence.
#[derive(Debug, Clone)]
pub struct DetectedDuplicate {
    pub candidate_document_id: Uuid,
    pub detection_method: DetectionMethod,
    pub similarity_score: f32,
    pub confidence: MatchConfidence,
}

/// Band a semantic similarity score. Scores at or below the match
/// threshold are not duplicates at all.
pub fn classify_semantic(score: f32, config: &ConsistencyConfig) -> Option<MatchConfidence> {
    if score <= config.semantic_match_threshold {
        return None;
    }
    Some(if score > config.semantic_high_confidence {
        MatchConfidence::High
    } else if score > config.semantic_medium_confidence {
        MatchConfidence::Medium
    } else {
        MatchConfidence::Low
    })
}

/// Band an entity-overlap ratio. Metadata matches never reach auto-merge,
/// so the bands stop at high-vs-medium.
pub fn classify_metadata(overlap: f32, config: &ConsistencyConfig) -> Option<MatchConfidence> {
    if overlap <= config.metadata_overlap_threshold {
        return None;
    }
    Some(if overlap > config.metadata_high_confidence {
        MatchConfidence::High
    } else {
        MatchConfidence::Medium
    })
}

/// Jaccard ratio of shared linked entities between two documents.
pub fn entity_overlap(a: &BTreeSet<Uuid>, b: &BTreeSet<Uuid>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Runs both detectors for one document and unions the results.
pub struct DuplicateDetector {
    similarity: Arc<dyn SimilarityIndex>,
    entities: Arc<dyn EntityStore>,
    config: ConsistencyConfig,
}

impl DuplicateDetector {
    pub fn new(
        similarity: Arc<dyn SimilarityIndex>,
        entities: Arc<dyn EntityStore>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            similarity,
            entities,
            config,
        }
    }

    /// Detect duplicates of `doc`. A failing detector is logged and
    /// contributes nothing; detection never fails the caller.
    pub async fn find_duplicates(&self, doc: &DocumentRecord) -> Vec<DetectedDuplicate> {
        let mut matches = match self.semantic_matches(doc).await {
            Ok(found) => found,
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "Semantic detection failed; treating as no duplicates");
                Vec::new()
            }
        };

        let already_reported: HashSet<Uuid> =
            matches.iter().map(|m| m.candidate_document_id).collect();

        match self.metadata_matches(doc, &already_reported).await {
            Ok(found) => matches.extend(found),
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "Metadata detection failed; treating as no duplicates");
            }
        }

        matches
    }

    async fn semantic_matches(&self, doc: &DocumentRecord) -> anyhow::Result<Vec<DetectedDuplicate>> {
        let vectors = timeout(
            self.config.external_timeout,
            self.similarity.get_by_ids(&[doc.id]),
        )
        .await
        .map_err(|_| anyhow::anyhow!("similarity index timed out fetching vector"))??;

        let Some((_, vector)) = vectors.into_iter().next() else {
            debug!(document_id = %doc.id, "No vector representation; skipping semantic detection");
            return Ok(Vec::new());
        };

        let neighbors = timeout(
            self.config.external_timeout,
            self.similarity
                .query(&vector, self.config.similarity_top_k, Some(&doc.doc_type)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("similarity index timed out on query"))??;

        Ok(neighbors
            .into_iter()
            .filter(|m| m.id != doc.id)
            .filter_map(|m| {
                classify_semantic(m.score, &self.config).map(|confidence| DetectedDuplicate {
                    candidate_document_id: m.id,
                    detection_method: DetectionMethod::Semantic,
                    similarity_score: m.score,
                    confidence,
                })
            })
            .collect())
    }

    async fn metadata_matches(
        &self,
        doc: &DocumentRecord,
        already_reported: &HashSet<Uuid>,
    ) -> anyhow::Result<Vec<DetectedDuplicate>> {
        let own = self.entities.entities_for_document(doc.id).await?;
        if own.is_empty() {
            return Ok(Vec::new());
        }

        let sharing = self
            .entities
            .documents_sharing_entities(doc.id, &doc.doc_type)
            .await?;

        let mut matches = Vec::new();
        for other in sharing {
            if already_reported.contains(&other) {
                continue;
            }
            let theirs = self.entities.entities_for_document(other).await?;
            let overlap = entity_overlap(&own, &theirs);
            if let Some(confidence) = classify_metadata(overlap, &self.config) {
                matches.push(DetectedDuplicate {
                    candidate_document_id: other,
                    detection_method: DetectionMethod::Metadata,
                    similarity_score: overlap,
                    confidence,
                });
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsistencyConfig {
        ConsistencyConfig::default()
    }

    // --- classify_semantic ---

    #[test]
    fn semantic_at_threshold_is_not_a_match() {
        assert_eq!(classify_semantic(0.85, &config()), None);
        assert_eq!(classify_semantic(0.5, &config()), None);
    }

    #[test]
    fn semantic_bands() {
        assert_eq!(classify_semantic(0.86, &config()), Some(MatchConfidence::Low));
        assert_eq!(classify_semantic(0.90, &config()), Some(MatchConfidence::Low));
        assert_eq!(classify_semantic(0.91, &config()), Some(MatchConfidence::Medium));
        assert_eq!(classify_semantic(0.95, &config()), Some(MatchConfidence::Medium));
        assert_eq!(classify_semantic(0.96, &config()), Some(MatchConfidence::High));
        assert_eq!(classify_semantic(1.0, &config()), Some(MatchConfidence::High));
    }

    // --- classify_metadata ---

    #[test]
    fn metadata_at_threshold_is_not_a_match() {
        assert_eq!(classify_metadata(0.7, &config()), None);
        assert_eq!(classify_metadata(0.2, &config()), None);
    }

    #[test]
    fn metadata_bands() {
        assert_eq!(classify_metadata(0.75, &config()), Some(MatchConfidence::Medium));
        assert_eq!(classify_metadata(0.9, &config()), Some(MatchConfidence::Medium));
        assert_eq!(classify_metadata(0.95, &config()), Some(MatchConfidence::High));
        assert_eq!(classify_metadata(1.0, &config()), Some(MatchConfidence::High));
    }

    // --- entity_overlap ---

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn overlap_of_identical_sets_is_one() {
        let shared = ids(3);
        let a: BTreeSet<Uuid> = shared.iter().copied().collect();
        assert!((entity_overlap(&a, &a.clone()) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn overlap_of_disjoint_sets_is_zero() {
        let a: BTreeSet<Uuid> = ids(2).into_iter().collect();
        let b: BTreeSet<Uuid> = ids(2).into_iter().collect();
        assert_eq!(entity_overlap(&a, &b), 0.0);
    }

    #[test]
    fn overlap_is_jaccard() {
        let shared = ids(3);
        let extra = ids(1);
        let a: BTreeSet<Uuid> = shared.iter().copied().collect();
        let b: BTreeSet<Uuid> = shared.iter().chain(extra.iter()).copied().collect();
        // |∩| = 3, |∪| = 4
        assert!((entity_overlap(&a, &b) - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn overlap_of_empty_sets_is_zero() {
        let empty = BTreeSet::new();
        assert_eq!(entity_overlap(&empty, &empty.clone()), 0.0);
    }
}
