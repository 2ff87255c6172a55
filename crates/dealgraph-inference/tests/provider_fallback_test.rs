//! Resolver + fallback chain behaviour against HTTP providers served by wiremock.

use std::sync::Arc;
use std::time::Duration;

use dealgraph_core::{AgentType, Error, ModelConfig, ModelId, ModelSettings, Prompt, Provider};
use dealgraph_inference::{FallbackChain, ModelResolver, ProviderSettings};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_ok(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 40, "completion_tokens": 6, "total_tokens": 46}
    }))
}

fn resolver_for(primary: &MockServer, secondary: &MockServer) -> ModelResolver {
    let settings = ProviderSettings::default()
        .with_api_key(Provider::Google, "g-key")
        .with_api_key(Provider::OpenAI, "o-key")
        .with_api_key(Provider::Voyage, "v-key")
        .with_base_url(Provider::Google, primary.uri())
        .with_base_url(Provider::Voyage, primary.uri())
        .with_base_url(Provider::OpenAI, secondary.uri())
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(500));
    ModelResolver::new(settings).expect("resolver")
}

fn extraction_config() -> ModelConfig {
    ModelConfig {
        agent_type: AgentType::GraphExtraction,
        primary_model_id: ModelId::parse("google:gemini-2.0-flash").unwrap(),
        fallback_model_id: Some(ModelId::parse("openai:gpt-4o-mini").unwrap()),
        temperature: 0.0,
        max_tokens: 256,
    }
}

#[tokio::test]
async fn test_primary_503_falls_back_to_secondary_once() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer o-key"))
        .respond_with(chat_ok("from secondary"))
        .expect(1)
        .mount(&secondary)
        .await;

    let chain = resolver_for(&primary, &secondary)
        .chain_for(&extraction_config())
        .unwrap();
    let out = chain.complete(&Prompt::new("extract")).await.unwrap();

    assert_eq!(out.output, "from secondary");
    assert!(out.fell_back);
    assert_eq!(out.served_by.to_string(), "openai:gpt-4o-mini");
    assert_eq!(out.usage.input_tokens, 40);
    assert_eq!(chain.fallback_count(), 1);
}

#[tokio::test]
async fn test_primary_401_propagates_without_fallback() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "API key not valid", "type": "invalid_request_error"}
        })))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .respond_with(chat_ok("never"))
        .expect(0)
        .mount(&secondary)
        .await;

    let chain = resolver_for(&primary, &secondary)
        .chain_for(&extraction_config())
        .unwrap();
    let err = chain.complete(&Prompt::new("extract")).await.unwrap_err();

    assert!(matches!(err, Error::Provider(ref m) if m.contains("API key not valid")));
    assert_eq!(chain.fallback_count(), 0);
}

#[tokio::test]
async fn test_primary_timeout_falls_back() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(chat_ok("too late").set_delay(Duration::from_secs(3)))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(chat_ok("on time"))
        .mount(&secondary)
        .await;

    let chain = resolver_for(&primary, &secondary)
        .chain_for(&extraction_config())
        .unwrap();
    let out = chain.complete(&Prompt::new("extract")).await.unwrap();
    assert_eq!(out.output, "on time");
    assert!(out.fell_back);
}

#[tokio::test]
async fn test_json_mode_and_settings_sent() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 256,
            "response_format": {"type": "json_object"}
        })))
        .respond_with(chat_ok("{}"))
        .expect(1)
        .mount(&primary)
        .await;

    let chain = resolver_for(&primary, &secondary)
        .chain_for(&extraction_config())
        .unwrap();
    chain
        .complete(&Prompt::new("extract").with_system("sys").json())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_voyage_embeddings_without_fallback() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer v-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": "list",
            "data": [
                {"object": "embedding", "embedding": [0.0, 1.0], "index": 1},
                {"object": "embedding", "embedding": [1.0, 0.0], "index": 0}
            ],
            "model": "voyage-finance-2",
            "usage": {"total_tokens": 9}
        })))
        .expect(1)
        .mount(&primary)
        .await;

    let resolver = resolver_for(&primary, &secondary);
    let chain = FallbackChain::single(resolver.resolve_embedding("voyage:voyage-finance-2").unwrap());
    let out = chain
        .embed(&["revenue".to_string(), "ebitda".to_string()])
        .await
        .unwrap();

    assert_eq!(out.output[0].as_slice(), &[1.0, 0.0]);
    assert_eq!(out.output[1].as_slice(), &[0.0, 1.0]);
    assert_eq!(out.usage.input_tokens, 9);
    assert!(!out.fell_back);
}

#[tokio::test]
async fn test_short_embedding_response_is_error() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"embedding": [1.0], "index": 0}],
            "usage": {"total_tokens": 1}
        })))
        .mount(&primary)
        .await;

    let resolver = resolver_for(&primary, &secondary);
    let chain = Arc::new(FallbackChain::single(
        resolver.resolve_embedding("voyage:voyage-finance-2").unwrap(),
    ));
    let err = chain
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(_)));
}

#[test]
fn test_settings_passthrough_on_resolve() {
    let resolver = ModelResolver::new(ProviderSettings::default()).unwrap();
    let handle = resolver
        .resolve(
            "ollama:qwen3:8b",
            ModelSettings {
                temperature: 0.5,
                max_tokens: 64,
            },
        )
        .unwrap();
    assert_eq!(handle.settings().max_tokens, 64);
    assert_eq!(handle.id().model(), "qwen3:8b");
}
