//! Integration tests for webhook delivery against a local HTTP endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_events::{WebhookConfig, WebhookDelivery, WebhookError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Endpoint that fails the first `fail_first` requests with a 500.
struct Endpoint {
    hits: AtomicUsize,
    fail_first: usize,
    received: Mutex<Vec<WebhookPayload>>,
}

async fn receive(
    State(endpoint): State<Arc<Endpoint>>,
    Json(body): Json<WebhookPayload>,
) -> StatusCode {
    let hit = endpoint.hits.fetch_add(1, Ordering::SeqCst);
    if hit < endpoint.fail_first {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    endpoint.received.lock().unwrap().push(body);
    StatusCode::OK
}

async fn spawn_endpoint(fail_first: usize) -> (String, Arc<Endpoint>) {
    let endpoint = Arc::new(Endpoint {
        hits: AtomicUsize::new(0),
        fail_first,
        received: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/webhook", post(receive))
        .with_state(Arc::clone(&endpoint));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/webhook"), endpoint)
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(5))
}

fn payload() -> WebhookPayload {
    WebhookPayload {
        request_id: "req-1".into(),
        product_oid: "prod-1".into(),
        output_urls: vec!["/out/a.jpg".into(), "/out/b.jpg".into()],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivers_payload_on_first_attempt() {
    let (url, endpoint) = spawn_endpoint(0).await;
    let delivery = WebhookDelivery::new(WebhookConfig::new(url).with_retry(fast_retry(3))).unwrap();

    delivery.deliver(&payload()).await.unwrap();

    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 1);
    let received = endpoint.received.lock().unwrap();
    assert_eq!(received.as_slice(), &[payload()]);
}

#[tokio::test]
async fn retries_through_server_errors() {
    let (url, endpoint) = spawn_endpoint(2).await;
    let delivery = WebhookDelivery::new(WebhookConfig::new(url).with_retry(fast_retry(3))).unwrap();

    delivery.deliver(&payload()).await.unwrap();

    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 3);
    assert_eq!(endpoint.received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn returns_last_status_after_exhausting_retries() {
    let (url, endpoint) = spawn_endpoint(usize::MAX).await;
    let delivery = WebhookDelivery::new(WebhookConfig::new(url).with_retry(fast_retry(2))).unwrap();

    let err = delivery.deliver(&payload()).await.unwrap_err();

    assert_matches!(err, WebhookError::HttpStatus(500));
    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transport_error_is_a_delivery_failure() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = WebhookConfig::new(format!("http://{addr}/webhook"))
        .with_retry(RetryPolicy::no_retry())
        .with_request_timeout(Duration::from_secs(2));
    let delivery = WebhookDelivery::new(config).unwrap();

    let err = delivery.deliver(&payload()).await.unwrap_err();
    assert_matches!(err, WebhookError::Request(_));
}
