//! Integration tests for registration, resolution, and propagation,
//! driven end-to-end against the in-memory corpus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use evidentia_common::{
    CandidateSource, ConsistencyConfig, ConsistencyError, ExtractedUnknown, FieldPath, GapStatus,
    GapType, KnowledgeGap,
};
use evidentia_corpus::{
    DocumentRecord, DocumentStore, GapStore, InferenceOutcome, MemoryCorpus,
    RecordingAuthorityNotifier, StaticInference, UnavailableInference,
};
use evidentia_engine::{CandidateProposal, ConsistencyService, ProposalOutcome};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ConsistencyConfig {
    ConsistencyConfig {
        default_confidence_threshold: 0.90,
        ..ConsistencyConfig::default()
    }
}

fn build_service(corpus: &Arc<MemoryCorpus>) -> ConsistencyService {
    init_tracing();
    ConsistencyService::new(
        corpus.clone(),
        corpus.clone(),
        corpus.clone(),
        Arc::new(RecordingAuthorityNotifier::new()),
        corpus.clone(),
        None,
        test_config(),
    )
}

fn unknown(partial: &str, marker: &str, path: &str) -> ExtractedUnknown {
    ExtractedUnknown {
        gap_type: GapType::EntityName,
        partial_value: partial.to_string(),
        context_clues: vec!["deed".to_string(), "grantor section".to_string()],
        resolution_hints: vec!["check county records".to_string()],
        confidence: 0.6,
        placeholder: marker.to_string(),
        field_path: FieldPath::parse(path).unwrap(),
        surrounding_text: format!("conveyed by {partial} to the buyer"),
    }
}

fn manual(confidence: f32) -> CandidateProposal {
    CandidateProposal {
        source_type: CandidateSource::DocumentExtraction,
        source_document_id: None,
        source_description: Some("later filing".to_string()),
        confidence,
        proposed_by: None,
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_unknown_twice_creates_one_gap() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let doc_a = corpus.add_document("deed", json!({"parties": [{"name": "[UNKNOWN-1]"}]}));
    let doc_b = corpus.add_document("deed", json!({"parties": [{"name": "[UNKNOWN-7]"}]}));

    let first = service
        .register_unknowns(doc_a.id, vec![unknown("ACME ___", "[UNKNOWN-1]", "parties[0].name")])
        .await
        .unwrap();
    assert_eq!(first.registered.len(), 1);
    assert_eq!(first.linked.len(), 0);

    let second = service
        .register_unknowns(doc_b.id, vec![unknown("ACME ___", "[UNKNOWN-7]", "parties[0].name")])
        .await
        .unwrap();
    assert_eq!(second.registered.len(), 0);
    assert_eq!(second.linked, first.registered);

    let detail = service.gap_detail(first.registered[0]).await.unwrap();
    assert_eq!(detail.gap.occurrence_count, 2);
    assert_eq!(detail.occurrences.len(), 2);
    assert_eq!(detail.gap.source_document_ids.len(), 2);
}

#[tokio::test]
async fn casing_and_spacing_variants_share_a_gap() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let doc_a = corpus.add_document("deed", json!({"parties": [{"name": "[U1]"}]}));
    let doc_b = corpus.add_document("deed", json!({"parties": [{"name": "[U2]"}]}));

    let first = service
        .register_unknowns(doc_a.id, vec![unknown("ACME ___", "[U1]", "parties[0].name")])
        .await
        .unwrap();
    let second = service
        .register_unknowns(doc_b.id, vec![unknown("  acme  ___ ", "[U2]", "parties[0].name")])
        .await
        .unwrap();

    assert_eq!(second.linked, first.registered);
}

#[tokio::test]
async fn registration_swaps_marker_for_canonical_placeholder() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let doc = corpus.add_document("deed", json!({"parties": [{"name": "[UNKNOWN-1]"}]}));
    let report = service
        .register_unknowns(doc.id, vec![unknown("ACME ___", "[UNKNOWN-1]", "parties[0].name")])
        .await
        .unwrap();

    let gap_id = report.registered[0];
    let metadata = corpus.get_metadata(doc.id).await.unwrap().unwrap();
    assert_eq!(
        metadata["parties"][0]["name"],
        KnowledgeGap::placeholder_for(gap_id)
    );
}

#[tokio::test]
async fn malformed_unknown_rejects_whole_batch() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let doc = corpus.add_document("deed", json!({"parties": [{"name": "[U1]"}]}));
    let mut bad = unknown("", "[U2]", "parties[0].name");
    bad.partial_value = "   ".to_string();

    let err = service
        .register_unknowns(
            doc.id,
            vec![unknown("ACME ___", "[U1]", "parties[0].name"), bad],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConsistencyError::Validation(_)));

    // Nothing was applied: marker untouched, no gaps.
    let metadata = corpus.get_metadata(doc.id).await.unwrap().unwrap();
    assert_eq!(metadata["parties"][0]["name"], "[U1]");
    assert!(service.list_open_gaps(None, 0).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Resolution + propagation
// ---------------------------------------------------------------------------

async fn register_two_documents(
    corpus: &Arc<MemoryCorpus>,
    service: &ConsistencyService,
) -> (Uuid, Uuid, Uuid) {
    let doc_a = corpus.add_document("deed", json!({"parties": [{"name": "[UNKNOWN-1]"}]}));
    let doc_b = corpus.add_document("deed", json!({"parties": [{"name": "[UNKNOWN-2]"}]}));

    let first = service
        .register_unknowns(doc_a.id, vec![unknown("ACME ___", "[UNKNOWN-1]", "parties[0].name")])
        .await
        .unwrap();
    service
        .register_unknowns(doc_b.id, vec![unknown("ACME ___", "[UNKNOWN-2]", "parties[0].name")])
        .await
        .unwrap();

    (first.registered[0], doc_a.id, doc_b.id)
}

#[tokio::test]
async fn confident_candidate_auto_resolves_and_propagates() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, doc_a, doc_b) = register_two_documents(&corpus, &service).await;

    let outcome = service
        .propose_resolution(gap_id, "ACME Holdings LLC", manual(0.95))
        .await
        .unwrap();
    let report = match outcome {
        ProposalOutcome::AutoResolved(report) => report,
        other => panic!("expected auto-resolution, got {other:?}"),
    };
    assert_eq!(report.documents_updated, 2);
    assert_eq!(report.fields_updated, 2);

    for doc in [doc_a, doc_b] {
        let metadata = corpus.get_metadata(doc).await.unwrap().unwrap();
        assert_eq!(metadata["parties"][0]["name"], "ACME Holdings LLC");
    }

    let detail = service.gap_detail(gap_id).await.unwrap();
    assert_eq!(detail.gap.status, GapStatus::Resolved);
    assert_eq!(detail.gap.resolved_value.as_deref(), Some("ACME Holdings LLC"));
}

#[tokio::test]
async fn sub_threshold_confirmations_leave_gap_open() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    let first = service
        .propose_resolution(gap_id, "ACME Holdings LLC", manual(0.5))
        .await
        .unwrap();
    let confidence = match first {
        ProposalOutcome::CandidateProposed { confidence, .. } => confidence,
        other => panic!("expected a new candidate, got {other:?}"),
    };
    assert!((confidence - 0.5).abs() < f32::EPSILON);

    let second = service
        .propose_resolution(gap_id, "ACME Holdings LLC", manual(0.5))
        .await
        .unwrap();
    let confidence = match second {
        ProposalOutcome::ConfirmationAdded { confidence, .. } => confidence,
        other => panic!("expected a confirmation, got {other:?}"),
    };
    assert!((confidence - 0.6).abs() < 1e-6);

    let detail = service.gap_detail(gap_id).await.unwrap();
    assert_eq!(detail.gap.status, GapStatus::Open);
    assert_eq!(detail.candidates.len(), 1);
    assert_eq!(detail.candidates[0].confirmations, 2);
}

#[tokio::test]
async fn confirmations_never_decrease_confidence() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    let mut last = 0.0f32;
    for _ in 0..3 {
        let outcome = service
            .propose_resolution(gap_id, "ACME Holdings LLC", manual(0.3))
            .await
            .unwrap();
        let confidence = match outcome {
            ProposalOutcome::CandidateProposed { confidence, .. } => confidence,
            ProposalOutcome::ConfirmationAdded { confidence, .. } => confidence,
            ProposalOutcome::AutoResolved(_) => panic!("should stay below threshold"),
        };
        assert!(confidence >= last, "confidence dropped from {last} to {confidence}");
        last = confidence;
    }
}

#[tokio::test]
async fn rollback_restores_placeholders_exactly() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, doc_a, doc_b) = register_two_documents(&corpus, &service).await;

    let before_a = corpus.get_metadata(doc_a).await.unwrap().unwrap();
    let before_b = corpus.get_metadata(doc_b).await.unwrap().unwrap();

    service
        .resolve_gap(gap_id, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();

    let report = service.rollback_gap(gap_id).await.unwrap();
    assert_eq!(report.fields_restored, 2);

    assert_eq!(corpus.get_metadata(doc_a).await.unwrap().unwrap(), before_a);
    assert_eq!(corpus.get_metadata(doc_b).await.unwrap().unwrap(), before_b);

    let detail = service.gap_detail(gap_id).await.unwrap();
    assert_eq!(detail.gap.status, GapStatus::Open);
    assert!(detail.gap.resolved_value.is_none());
    assert!(detail.gap.resolved_at.is_none());
}

#[tokio::test]
async fn resolved_gap_can_resolve_again_after_rollback() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, doc_a, _) = register_two_documents(&corpus, &service).await;

    service
        .resolve_gap(gap_id, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();
    service.rollback_gap(gap_id).await.unwrap();
    service
        .resolve_gap(gap_id, "ACME Partners LLC", "reviewer:omar", None)
        .await
        .unwrap();

    let metadata = corpus.get_metadata(doc_a).await.unwrap().unwrap();
    assert_eq!(metadata["parties"][0]["name"], "ACME Partners LLC");
}

#[tokio::test]
async fn second_resolution_fails_fast() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    service
        .resolve_gap(gap_id, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();
    let err = service
        .resolve_gap(gap_id, "ACME Widgets LLC", "reviewer:omar", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsistencyError::ConcurrencyConflict(_)));
}

#[tokio::test]
async fn rollback_without_log_is_unavailable() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    let err = service.rollback_gap(gap_id).await.unwrap_err();
    assert!(matches!(err, ConsistencyError::RollbackUnavailable { .. }));

    let detail = service.gap_detail(gap_id).await.unwrap();
    assert_eq!(detail.gap.status, GapStatus::Open);
}

#[tokio::test]
async fn resolution_creates_party_entity_and_notifies_authorities() {
    let corpus = Arc::new(MemoryCorpus::new());
    let notifier = Arc::new(RecordingAuthorityNotifier::new());
    let service = ConsistencyService::new(
        corpus.clone(),
        corpus.clone(),
        corpus.clone(),
        notifier.clone(),
        corpus.clone(),
        None,
        test_config(),
    );

    let doc = corpus.add_document(
        "deed",
        json!({"parties": [{"name": "[U1]"}], "grantors": [{"name": "[U2]"}]}),
    );
    let party = service
        .register_unknowns(doc.id, vec![unknown("ACME ___", "[U1]", "parties[0].name")])
        .await
        .unwrap();
    let grantor_unknown = ExtractedUnknown {
        partial_value: "J. Doe ___".to_string(),
        ..unknown("J. Doe ___", "[U2]", "grantors[0].name")
    };
    let grantor = service
        .register_unknowns(doc.id, vec![grantor_unknown])
        .await
        .unwrap();

    let report = service
        .resolve_gap(party.registered[0], "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();
    assert_eq!(report.entities_created, 1);

    use evidentia_corpus::EntityStore;
    let entity = corpus.find_by_name("ACME Holdings LLC").await.unwrap().unwrap();
    assert_eq!(entity.entity_type, evidentia_common::EntityType::Company);

    let report = service
        .resolve_gap(grantor.registered[0], "Jane Doe", "reviewer:jane", None)
        .await
        .unwrap();
    assert_eq!(report.authorities_notified, 1);
    let calls = notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, doc.id);
    assert_eq!(calls[0].1, "grantors[0].name");
    assert_eq!(calls[0].2, "Jane Doe");
}

#[tokio::test]
async fn resighting_a_resolved_gap_is_reported_separately() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    service
        .resolve_gap(gap_id, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();

    let doc_c = corpus.add_document("deed", json!({"parties": [{"name": "[U9]"}]}));
    let report = service
        .register_unknowns(doc_c.id, vec![unknown("ACME ___", "[U9]", "parties[0].name")])
        .await
        .unwrap();
    assert!(report.registered.is_empty());
    assert!(report.linked.is_empty());
    assert_eq!(report.already_resolved, vec![gap_id]);
}

#[tokio::test]
async fn audit_distinguishes_auto_from_manual() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let (gap_a, _, _) = register_two_documents(&corpus, &service).await;
    service
        .resolve_gap(gap_a, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap();

    let doc = corpus.add_document("deed", json!({"note": "[U5]"}));
    let mut other = unknown("Beta ___", "[U5]", "note");
    other.context_clues = vec!["affidavit".to_string()];
    let report = service.register_unknowns(doc.id, vec![other]).await.unwrap();
    service
        .propose_resolution(report.registered[0], "Beta Corp", manual(0.95))
        .await
        .unwrap();

    let actions: Vec<_> = corpus.audit_entries().iter().map(|e| e.action).collect();
    assert!(actions.contains(&evidentia_common::AuditAction::GapManuallyResolved));
    assert!(actions.contains(&evidentia_common::AuditAction::GapAutoResolved));
}

// ---------------------------------------------------------------------------
// Partial propagation stays reversible
// ---------------------------------------------------------------------------

/// Document store wrapper that fails writes after a budget of successes.
struct FlakyDocumentStore {
    inner: Arc<MemoryCorpus>,
    writes_allowed: AtomicUsize,
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        self.inner.get_document(id).await
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Value>> {
        self.inner.get_metadata(id).await
    }

    async fn put_metadata(&self, id: Uuid, metadata: Value) -> Result<()> {
        if self.writes_allowed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
            anyhow::bail!("simulated storage outage");
        }
        self.inner.put_metadata(id, metadata).await
    }

    async fn replace_in_metadata(&self, id: Uuid, needle: &str, replacement: &str) -> Result<usize> {
        self.inner.replace_in_metadata(id, needle, replacement).await
    }

    async fn list_after(&self, cursor: Option<Uuid>, limit: usize) -> Result<Vec<DocumentRecord>> {
        self.inner.list_after(cursor, limit).await
    }

    async fn mark_superseded(&self, id: Uuid, primary: Uuid) -> Result<()> {
        self.inner.mark_superseded(id, primary).await
    }
}

#[tokio::test]
async fn interrupted_propagation_logs_partial_rollback() {
    let corpus = Arc::new(MemoryCorpus::new());
    // Register through the plain store, then resolve through a flaky one
    // that allows a single metadata write.
    let service = build_service(&corpus);
    let (gap_id, doc_a, doc_b) = register_two_documents(&corpus, &service).await;

    let flaky = Arc::new(FlakyDocumentStore {
        inner: corpus.clone(),
        writes_allowed: AtomicUsize::new(1),
    });
    let flaky_service = ConsistencyService::new(
        corpus.clone(),
        flaky,
        corpus.clone(),
        Arc::new(RecordingAuthorityNotifier::new()),
        corpus.clone(),
        None,
        test_config(),
    );

    let err = flaky_service
        .resolve_gap(gap_id, "ACME Holdings LLC", "reviewer:jane", None)
        .await
        .unwrap_err();
    let (updated, attempted) = match err {
        ConsistencyError::PropagationInterrupted { updated, attempted, .. } => (updated, attempted),
        other => panic!("expected an interruption, got {other:?}"),
    };
    assert_eq!(updated, 1);
    assert_eq!(attempted, 2);

    // The gap stays open, the partial log exists, and rollback restores
    // the one document that was touched.
    let gap = GapStore::get(corpus.as_ref(), gap_id).await.unwrap().unwrap();
    assert_eq!(gap.status, GapStatus::Open);
    let log = corpus.latest_log(gap_id).await.unwrap().unwrap();
    assert_eq!(log.rollback_data.len(), 1);

    // Roll back through the healthy store: the captured log restores the
    // one touched document.
    let placeholder = KnowledgeGap::placeholder_for(gap_id);
    service.rollback_gap(gap_id).await.unwrap();
    for doc in [doc_a, doc_b] {
        let metadata = corpus.get_metadata(doc).await.unwrap().unwrap();
        assert_eq!(metadata["parties"][0]["name"], placeholder);
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

fn service_with_inference(
    corpus: &Arc<MemoryCorpus>,
    inference: Arc<dyn evidentia_corpus::GapInference>,
) -> ConsistencyService {
    init_tracing();
    ConsistencyService::new(
        corpus.clone(),
        corpus.clone(),
        corpus.clone(),
        Arc::new(RecordingAuthorityNotifier::new()),
        corpus.clone(),
        Some(inference),
        test_config(),
    )
}

#[tokio::test]
async fn confident_inference_hit_auto_resolves() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = service_with_inference(
        &corpus,
        Arc::new(StaticInference::new(InferenceOutcome {
            found: true,
            value: Some("ACME Holdings LLC".to_string()),
            confidence: 0.95,
        })),
    );
    let (gap_id, doc_a, _) = register_two_documents(&corpus, &service).await;

    let outcome = service
        .propose_from_inference(gap_id, Some(doc_a), "…conveyed to ACME Holdings LLC…")
        .await
        .unwrap();
    assert!(matches!(outcome, Some(ProposalOutcome::AutoResolved(_))));
}

#[tokio::test]
async fn failed_inference_is_a_zero_confidence_no_op() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = service_with_inference(&corpus, Arc::new(UnavailableInference));
    let (gap_id, _, _) = register_two_documents(&corpus, &service).await;

    let outcome = service
        .propose_from_inference(gap_id, None, "excerpt")
        .await
        .unwrap();
    assert!(outcome.is_none());

    let detail = service.gap_detail(gap_id).await.unwrap();
    assert_eq!(detail.gap.status, GapStatus::Open);
    assert!(detail.candidates.is_empty());
}

#[tokio::test]
async fn unknown_gap_is_not_found() {
    let corpus = Arc::new(MemoryCorpus::new());
    let service = build_service(&corpus);

    let err = service
        .propose_resolution(Uuid::new_v4(), "value", manual(0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsistencyError::NotFound { .. }));

    let err = service.gap_detail(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ConsistencyError::NotFound { .. }));
}
