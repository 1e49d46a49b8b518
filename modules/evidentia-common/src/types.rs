use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fieldpath::FieldPath;

// --- Knowledge Gaps ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GapType {
    EntityName,
    Date,
    Amount,
    Address,
    Other,
}

impl std::fmt::Display for GapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GapType::EntityName => write!(f, "entity_name"),
            GapType::Date => write!(f, "date"),
            GapType::Amount => write!(f, "amount"),
            GapType::Address => write!(f, "address"),
            GapType::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Open,
    Resolved,
}

/// A registered unknown value pending resolution. One gap exists per
/// fingerprint; documents that sight the same unknown link to it as
/// occurrences rather than creating a second gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGap {
    pub id: Uuid,
    pub gap_type: GapType,
    pub fingerprint: String,
    pub partial_value: String,
    pub context_clues: BTreeSet<String>,
    pub resolution_hints: Vec<String>,
    pub confidence_threshold: f32,
    pub status: GapStatus,
    pub occurrence_count: u32,
    pub source_document_ids: BTreeSet<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_value: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_source_document_id: Option<Uuid>,
}

impl KnowledgeGap {
    /// The unique text marker written into documents in place of the
    /// original ad-hoc unknown marker.
    pub fn placeholder_for(gap_id: Uuid) -> String {
        format!("[[gap:{gap_id}]]")
    }
}

/// One instance of a gap's placeholder inside a specific document field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapOccurrence {
    pub id: Uuid,
    pub gap_id: Uuid,
    pub document_id: Uuid,
    pub field_path: FieldPath,
    pub surrounding_text: String,
    pub local_context: String,
    pub extraction_confidence: f32,
    pub placeholder_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Manual,
    AiInference,
    CrossReference,
    DocumentExtraction,
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateSource::Manual => write!(f, "manual"),
            CandidateSource::AiInference => write!(f, "ai_inference"),
            CandidateSource::CrossReference => write!(f, "cross_reference"),
            CandidateSource::DocumentExtraction => write!(f, "document_extraction"),
        }
    }
}

/// A proposed concrete value for a gap, with provenance. Confidence only
/// moves up as corroborating proposals accumulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapCandidate {
    pub id: Uuid,
    pub gap_id: Uuid,
    pub candidate_value: String,
    pub source_type: CandidateSource,
    pub source_document_id: Option<Uuid>,
    pub source_description: Option<String>,
    pub confidence: f32,
    pub confirmations: u32,
    pub proposed_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

// --- Propagation ---

/// One reversible field mutation. `original_value` is the full prior field
/// text (containing the placeholder), restored verbatim on rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackItem {
    pub document_id: Uuid,
    pub field_path: FieldPath,
    pub original_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationLogEntry {
    pub id: Uuid,
    pub gap_id: Uuid,
    pub resolved_value: String,
    pub documents_updated: u32,
    pub fields_updated: u32,
    pub entities_created: u32,
    pub authorities_notified: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub rollback_data: Vec<RollbackItem>,
    pub schema_v: u16,
}

/// Counts reported back to the caller after a successful propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationReport {
    pub gap_id: Uuid,
    pub resolved_value: String,
    pub documents_updated: u32,
    pub fields_updated: u32,
    pub entities_created: u32,
    pub authorities_notified: u32,
}

// --- Corpus scanning ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Incremental,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
}

/// Persisted scan cursor. Survives process restarts; the cursor only
/// advances, and only after a document's detection work has completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanState {
    pub id: Uuid,
    pub scan_type: ScanType,
    pub cursor: Option<Uuid>,
    pub documents_scanned: u64,
    pub duplicates_found: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Semantic,
    Metadata,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Semantic => write!(f, "semantic"),
            DetectionMethod::Metadata => write!(f, "metadata"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    ConfirmedDuplicate,
    NotDuplicate,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub id: Uuid,
    pub document_id: Uuid,
    pub candidate_document_id: Uuid,
    pub detection_method: DetectionMethod,
    pub similarity_score: f32,
    pub confidence: MatchConfidence,
    pub status: CandidateStatus,
    pub auto_resolved: bool,
    pub resolution_notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

// --- Extraction pipeline input ---

/// One unresolved value emitted by the extraction pipeline for a document.
/// `placeholder` is the ad-hoc marker the extractor left in the metadata;
/// registration swaps it for the canonical gap placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedUnknown {
    pub gap_type: GapType,
    pub partial_value: String,
    pub context_clues: Vec<String>,
    pub resolution_hints: Vec<String>,
    pub confidence: f32,
    pub placeholder: String,
    pub field_path: FieldPath,
    pub surrounding_text: String,
}

// --- Entities ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Company,
    Trust,
    Partnership,
    Estate,
    GovernmentBody,
}

impl EntityType {
    /// Infer an entity type from a resolved name by legal-suffix matching.
    /// Unrecognized names default to Person.
    pub fn infer_from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        let last = lower
            .trim_end_matches(['.', ','])
            .rsplit(|c: char| c.is_whitespace() || c == ',')
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();

        match last.as_str() {
            "llc" | "inc" | "corp" | "ltd" | "co" | "company" | "corporation"
            | "incorporated" => EntityType::Company,
            "trust" => EntityType::Trust,
            "partnership" | "lp" | "llp" => EntityType::Partnership,
            "estate" => EntityType::Estate,
            _ => {
                if lower.contains("estate of") {
                    EntityType::Estate
                } else {
                    EntityType::Person
                }
            }
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Person => write!(f, "person"),
            EntityType::Company => write!(f, "company"),
            EntityType::Trust => write!(f, "trust"),
            EntityType::Partnership => write!(f, "partnership"),
            EntityType::Estate => write!(f, "estate"),
            EntityType::GovernmentBody => write!(f, "government_body"),
        }
    }
}

// --- Audit ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GapAutoResolved,
    GapManuallyResolved,
    GapRolledBack,
    DuplicateAutoMerged,
    DuplicateManuallyResolved,
}

/// Write-only audit record of a resolution decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub subject_id: Uuid,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: AuditAction, subject_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            actor: actor.into(),
            action,
            subject_id,
            detail: detail.into(),
        }
    }
}
