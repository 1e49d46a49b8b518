use std::env;
use std::time::Duration;

/// Engine-wide thresholds and tuning knobs. Defaults match the platform's
/// production values; any field can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    /// Threshold a new gap gets when the extractor supplies none.
    pub default_confidence_threshold: f32,
    /// Confidence added per corroborating confirmation of an existing
    /// candidate. Policy knob, deliberately not a constant: deployments
    /// that distrust repeated low-trust corroboration tune this down.
    pub confirmation_step: f32,

    /// Semantic matches at or above this score are merged without review.
    pub auto_merge_threshold: f32,
    /// Minimum semantic score to record a duplicate candidate at all.
    pub semantic_match_threshold: f32,
    /// Semantic score band edges.
    pub semantic_high_confidence: f32,
    pub semantic_medium_confidence: f32,

    /// Minimum entity-overlap ratio to record a metadata candidate.
    pub metadata_overlap_threshold: f32,
    /// Overlap ratio above which a metadata match is high confidence.
    pub metadata_high_confidence: f32,

    /// Documents fetched per incremental scan run.
    pub scan_batch_size: usize,
    /// Neighbors requested from the similarity index per document.
    pub similarity_top_k: usize,

    /// Bound on every similarity-index and inference call.
    pub external_timeout: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            default_confidence_threshold: 0.85,
            confirmation_step: 0.1,
            auto_merge_threshold: 0.98,
            semantic_match_threshold: 0.85,
            semantic_high_confidence: 0.95,
            semantic_medium_confidence: 0.90,
            metadata_overlap_threshold: 0.7,
            metadata_high_confidence: 0.9,
            scan_batch_size: 50,
            similarity_top_k: 10,
            external_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsistencyConfig {
    /// Load configuration, overriding defaults from EVIDENTIA_* variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_confidence_threshold: env_f32(
                "EVIDENTIA_DEFAULT_CONFIDENCE_THRESHOLD",
                d.default_confidence_threshold,
            ),
            confirmation_step: env_f32("EVIDENTIA_CONFIRMATION_STEP", d.confirmation_step),
            auto_merge_threshold: env_f32("EVIDENTIA_AUTO_MERGE_THRESHOLD", d.auto_merge_threshold),
            semantic_match_threshold: env_f32(
                "EVIDENTIA_SEMANTIC_MATCH_THRESHOLD",
                d.semantic_match_threshold,
            ),
            semantic_high_confidence: d.semantic_high_confidence,
            semantic_medium_confidence: d.semantic_medium_confidence,
            metadata_overlap_threshold: env_f32(
                "EVIDENTIA_METADATA_OVERLAP_THRESHOLD",
                d.metadata_overlap_threshold,
            ),
            metadata_high_confidence: d.metadata_high_confidence,
            scan_batch_size: env_usize("EVIDENTIA_SCAN_BATCH_SIZE", d.scan_batch_size),
            similarity_top_k: env_usize("EVIDENTIA_SIMILARITY_TOP_K", d.similarity_top_k),
            external_timeout: Duration::from_secs(env_u64(
                "EVIDENTIA_EXTERNAL_TIMEOUT_SECS",
                d.external_timeout.as_secs(),
            )),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
