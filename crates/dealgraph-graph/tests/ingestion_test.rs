//! Ingestion service against the in-memory graph store and mock models.

use std::sync::Arc;

use dealgraph_core::{
    defaults, Chunk, ChunkType, Error, GraphQuery, GraphStore, ModelId, ModelPricing,
    ModelSettings, Namespace, PricingTable, Provider,
};
use dealgraph_db::memory::{MemoryGraphStore, MemoryUsageRepository};
use dealgraph_graph::{IngestionConfig, IngestionService};
use dealgraph_inference::mock::{MockBackend, MockFailure};
use dealgraph_inference::{EmbeddingAdapter, FallbackChain, ModelHandle, UsageLogger};
use tracing_test::traced_test;
use uuid::Uuid;

const EXTRACTION_JSON: &str = r#"{
  "entities": [
    {"name": "Acme Corp", "entity_type": "Company", "summary": "Acquirer"},
    {"name": "Beta LLC", "entity_type": "Company", "summary": "Target"}
  ],
  "relationships": [
    {"source": "Acme Corp", "target": "Beta LLC", "relation_type": "OWNS",
     "fact": "Acme Corp owns 100% of Beta LLC."}
  ]
}"#;

struct Harness {
    service: IngestionService,
    store: Arc<MemoryGraphStore>,
    usage: Arc<MemoryUsageRepository>,
    extraction: Arc<FallbackChain>,
}

fn handle(provider: Provider, model: &str, backend: &MockBackend) -> ModelHandle {
    ModelHandle::new(
        ModelId::new(provider, model),
        ModelSettings::default(),
        Arc::new(backend.clone()),
    )
}

fn harness(extractor: &MockBackend, secondary: Option<&MockBackend>, pricing: PricingTable) -> Harness {
    let store = Arc::new(MemoryGraphStore::new());
    let usage = Arc::new(MemoryUsageRepository::new());
    let logger = Arc::new(UsageLogger::new(usage.clone(), Arc::new(pricing)));

    let extraction = Arc::new(FallbackChain::new(
        handle(Provider::Google, "gemini-2.0-flash", extractor),
        secondary.map(|b| handle(Provider::Anthropic, "claude-3-5-haiku-latest", b)),
    ));
    let embedder = MockBackend::new().with_dimension(8);
    let embeddings = Arc::new(EmbeddingAdapter::new(Arc::new(FallbackChain::single(
        handle(Provider::Voyage, "voyage-finance-2", &embedder),
    ))));

    let service = IngestionService::new(extraction.clone(), embeddings, store.clone(), logger)
        .with_config(IngestionConfig::default().with_progress_every(3));
    Harness {
        service,
        store,
        usage,
        extraction,
    }
}

fn chunks(document_id: Uuid, n: i32) -> Vec<Chunk> {
    (0..n)
        .map(|i| Chunk {
            id: Uuid::new_v4(),
            document_id,
            content: format!("Section {i}: Acme Corp owns Beta LLC."),
            chunk_index: i,
            page_number: Some(i + 1),
            sheet_name: None,
            chunk_type: ChunkType::Text,
        })
        .collect()
}

fn ns(org: &str, deal: &str) -> Namespace {
    Namespace::new(org, deal).unwrap()
}

#[tokio::test]
async fn test_eight_chunks_yield_eight_episodes() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let namespace = ns("orgA", "deal1");

    let result = h
        .service
        .ingest(doc, &namespace, "CIM.pdf", &chunks(doc, 8))
        .await
        .unwrap();

    assert_eq!(result.episode_count, 8);
    assert_eq!(h.store.write_count(), 8);
    let names = h.store.episode_names(&namespace);
    assert_eq!(names.len(), 8);
    assert!(names.contains(&"CIM.pdf#chunk-7".to_string()));

    assert_eq!(
        h.usage
            .records_for_feature(defaults::FEATURE_GRAPH_EXTRACTION)
            .len(),
        8
    );
    let embedding_records = h.usage.records_for_feature(defaults::FEATURE_GRAPH_EMBEDDING);
    assert_eq!(embedding_records.len(), 8);
    assert_eq!(embedding_records[0].provider, "voyage");
    assert_eq!(embedding_records[0].organization_id.as_deref(), Some("orgA"));
    assert_eq!(embedding_records[0].deal_id.as_deref(), Some("deal1"));
}

#[tokio::test]
async fn test_chunks_processed_in_index_order() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let mut shuffled = chunks(doc, 4);
    shuffled.reverse();
    shuffled.swap(0, 2);

    h.service
        .ingest(doc, &ns("o", "d"), "CIM.pdf", &shuffled)
        .await
        .unwrap();

    let prompts = extractor.prompts();
    for (i, prompt) in prompts.iter().enumerate() {
        assert!(
            prompt.contains(&format!("CIM.pdf#chunk-{i}")),
            "prompt {i} out of order: {prompt}"
        );
    }
}

#[tokio::test]
async fn test_transient_failure_without_fallback_fails_whole_call() {
    let extractor = MockBackend::new()
        .with_fixed_response(EXTRACTION_JSON)
        .failing_on_call(5, MockFailure::ServerError);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();

    let err = h
        .service
        .ingest(doc, &ns("orgA", "deal1"), "CIM.pdf", &chunks(doc, 8))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProviderTransient(_)), "{err:?}");
    assert!(err.is_retryable());
    // Earlier chunks stay written; nothing after the failure is attempted.
    assert_eq!(h.store.write_count(), 4);
    assert_eq!(extractor.generate_call_count(), 5);
}

#[tokio::test]
async fn test_transient_failure_with_fallback_completes() {
    let extractor = MockBackend::new()
        .with_fixed_response(EXTRACTION_JSON)
        .failing_on_call(5, MockFailure::RateLimited);
    let secondary = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, Some(&secondary), PricingTable::new());
    let doc = Uuid::new_v4();

    let result = h
        .service
        .ingest(doc, &ns("orgA", "deal1"), "CIM.pdf", &chunks(doc, 8))
        .await
        .unwrap();

    assert_eq!(result.episode_count, 8);
    assert_eq!(h.extraction.fallback_count(), 1);
    assert_eq!(secondary.generate_call_count(), 1);
    let extraction_records = h
        .usage
        .records_for_feature(defaults::FEATURE_GRAPH_EXTRACTION);
    assert_eq!(
        extraction_records
            .iter()
            .filter(|r| r.provider == "anthropic")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_deals_in_same_org_share_no_entities() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let one = ns("orgA", "deal1");
    let two = ns("orgA", "deal2");

    h.service
        .ingest(doc, &one, "CIM.pdf", &chunks(doc, 3))
        .await
        .unwrap();
    assert!(h.store.entity_keys(&two).is_empty());

    h.service
        .ingest(doc, &two, "CIM.pdf", &chunks(doc, 3))
        .await
        .unwrap();

    let acme_one = h.store.entity(&one, "Acme Corp").unwrap();
    let acme_two = h.store.entity(&two, "Acme Corp").unwrap();
    assert_eq!(acme_one.episodes.len(), 3);
    assert_eq!(acme_two.episodes.len(), 3);

    let query = GraphQuery {
        text: "acme".into(),
        vector: None,
        limit: 10,
    };
    let hits = h.store.search(&one, &query).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].episode_names.len(), 3);
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let namespace = ns("orgA", "deal1");
    let input = chunks(doc, 5);

    h.service.ingest(doc, &namespace, "CIM.pdf", &input).await.unwrap();
    let names_first = h.store.episode_names(&namespace);
    let keys_first = h.store.entity_keys(&namespace);
    let edges_first = h.store.edge_count(&namespace);

    h.service.ingest(doc, &namespace, "CIM.pdf", &input).await.unwrap();
    assert_eq!(h.store.episode_names(&namespace), names_first);
    assert_eq!(h.store.entity_keys(&namespace), keys_first);
    assert_eq!(h.store.edge_count(&namespace), edges_first);
}

#[tokio::test]
async fn test_malformed_extraction_is_extraction_error_without_fallback() {
    let extractor = MockBackend::new().with_fixed_response("Sorry, I can't help with that.");
    let secondary = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, Some(&secondary), PricingTable::new());
    let doc = Uuid::new_v4();

    let err = h
        .service
        .ingest(doc, &ns("o", "d"), "CIM.pdf", &chunks(doc, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction(_)));
    assert_eq!(secondary.generate_call_count(), 0);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn test_blank_chunks_are_skipped() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let mut input = chunks(doc, 3);
    input[1].content = "   \n".into();

    let result = h
        .service
        .ingest(doc, &ns("o", "d"), "CIM.pdf", &input)
        .await
        .unwrap();
    assert_eq!(result.episode_count, 2);
    assert_eq!(extractor.generate_call_count(), 2);
}

#[tokio::test]
async fn test_estimated_cost_uses_embedding_input_rate() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let pricing = PricingTable::new().with(
        &ModelId::new(Provider::Voyage, "voyage-finance-2"),
        ModelPricing {
            input_per_million: 0.12,
            output_per_million: 0.0,
        },
    );
    let h = harness(&extractor, None, pricing);
    let doc = Uuid::new_v4();
    let input = chunks(doc, 8);
    let total_chars: usize = input.iter().map(|c| c.content.chars().count()).sum();

    let result = h
        .service
        .ingest(doc, &ns("o", "d"), "CIM.pdf", &input)
        .await
        .unwrap();

    let expected = (total_chars / 4) as f64 * 0.12 / 1_000_000.0;
    assert!((result.estimated_cost_usd - expected).abs() < 1e-12);
}

#[tokio::test]
async fn test_empty_extraction_still_writes_episode() {
    let extractor =
        MockBackend::new().with_fixed_response(r#"{"entities": [], "relationships": []}"#);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();
    let namespace = ns("o", "d");

    let result = h
        .service
        .ingest(doc, &namespace, "cover.pdf", &chunks(doc, 1))
        .await
        .unwrap();
    assert_eq!(result.episode_count, 1);
    assert_eq!(h.store.episode_names(&namespace), vec!["cover.pdf#chunk-0".to_string()]);
    assert!(h
        .usage
        .records_for_feature(defaults::FEATURE_GRAPH_EMBEDDING)
        .is_empty());
}

#[traced_test]
#[tokio::test]
async fn test_progress_logged_every_n_chunks() {
    let extractor = MockBackend::new().with_fixed_response(EXTRACTION_JSON);
    let h = harness(&extractor, None, PricingTable::new());
    let doc = Uuid::new_v4();

    h.service
        .ingest(doc, &ns("o", "d"), "CIM.pdf", &chunks(doc, 8))
        .await
        .unwrap();

    assert!(logs_contain("Graph ingestion progress"));
    assert!(logs_contain("processed=3"));
    assert!(logs_contain("processed=6"));
    assert!(!logs_contain("processed=8"));
    assert!(logs_contain("Graph ingestion complete"));
}
