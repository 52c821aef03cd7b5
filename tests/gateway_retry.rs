use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use partwise::gateway::openai::OpenAiAdapter;
use partwise::gateway::{
    Attribution, ChatRequest, GatewayConfig, Message, NoopUsageSink, ProviderError,
    ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Fails the first `failures` requests with the given status, then succeeds.
struct FlakyBackend {
    failures: AtomicUsize,
    status: u16,
}

impl FlakyBackend {
    fn new(failures: usize, status: u16) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            status,
        }
    }
}

impl Respond for FlakyBackend {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if remaining.is_ok() {
            ResponseTemplate::new(self.status).set_body_json(json!({
                "error": { "message": "injected failure", "code": "injected" }
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "ok" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 1 }
            }))
        }
    }
}

fn gateway_for(server: &MockServer, max_attempts: u32) -> ProviderGateway<NoopUsageSink> {
    let adapter =
        OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_attempts,
            retry_base_delay: Duration::from_millis(0),
        },
    )
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "gpt-4o-mini",
        vec![Message::user("hello")],
        Attribution::new("test"),
    )
}

async fn mount(server: &MockServer, backend: FlakyBackend) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(backend)
        .mount(server)
        .await;
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    mount(&server, FlakyBackend::new(2, 500)).await;

    let gateway = gateway_for(&server, 5);
    let resp = gateway.chat(request()).await.unwrap();

    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn attempt_cap_surfaces_the_last_error() {
    let server = MockServer::start().await;
    mount(&server, FlakyBackend::new(usize::MAX, 500)).await;

    let gateway = gateway_for(&server, 2);
    let err = gateway.chat(request()).await.unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Provider {
            retryable: true,
            ..
        }
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn client_errors_burn_attempts_the_same_way() {
    // No error-class distinction in the retry loop: a 400 is retried like
    // a 503 and exhausts the same attempt budget.
    let server = MockServer::start().await;
    mount(&server, FlakyBackend::new(usize::MAX, 400)).await;

    let gateway = gateway_for(&server, 2);
    let err = gateway.chat(request()).await.unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Provider {
            retryable: false,
            ..
        }
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rate_limiting_maps_to_its_own_error() {
    let server = MockServer::start().await;
    mount(&server, FlakyBackend::new(usize::MAX, 429)).await;

    let gateway = gateway_for(&server, 1);
    let err = gateway.chat(request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert_eq!(err.code(), "rate_limited");
}
