//! Deterministic dedup keys for knowledge gaps.
//!
//! Two sightings of the same unknown — across documents, casing, and
//! spacing — must land on the same fingerprint, so registration can link
//! instead of duplicating. Pure functions only; no clocks, no randomness.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::GapType;

static SEPARATORS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_\-/]+").unwrap());
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());
static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,.]*").unwrap());

/// How many hex chars of the context hash go into the fingerprint.
const CONTEXT_HASH_LEN: usize = 8;

/// Compute the dedup fingerprint `"{type}:{normalized}:{context_hash}"`.
///
/// Identical logical input yields identical output regardless of call
/// order, clue ordering, casing, or whitespace.
pub fn fingerprint(gap_type: GapType, partial_value: &str, context_clues: &[String]) -> String {
    let normalized = normalize_value(gap_type, partial_value);
    let hash = context_hash(context_clues);
    format!("{gap_type}:{normalized}:{hash}")
}

/// Normalize a partial value for fingerprinting: lowercase, trim, collapse
/// separator runs, then apply the type-specific masking rules.
pub fn normalize_value(gap_type: GapType, raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let collapsed = SEPARATORS_RE.replace_all(&lowered, " ").to_string();

    let masked = match gap_type {
        // Legal-entity suffixes stay (lowercased) but punctuation around
        // them must not split "ACME, LLC." from "ACME LLC".
        GapType::EntityName => collapsed
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ')
            .collect::<String>(),
        // Years vary across re-typings of the same date reference.
        GapType::Date => YEAR_RE.replace_all(&collapsed, "<yyyy>").to_string(),
        // Digit runs (including grouping separators) collapse to one token.
        GapType::Amount => DIGIT_RUN_RE.replace_all(&collapsed, "<num>").to_string(),
        GapType::Address | GapType::Other => collapsed,
    };

    SEPARATORS_RE.replace_all(masked.trim(), " ").to_string()
}

fn context_hash(context_clues: &[String]) -> String {
    let mut sorted: Vec<String> = context_clues
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for clue in &sorted {
        hasher.update(clue.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..CONTEXT_HASH_LEN].to_string()
}
