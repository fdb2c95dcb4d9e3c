//! Full worker run over in-memory backends: real PNG sources on disk, a
//! local webhook endpoint, graceful shutdown.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_events::{WebhookConfig, WebhookDelivery};
use pixelbatch_pipeline::submit::SubmitItem;
use pixelbatch_pipeline::{request_status, BatchSubmitter};
use pixelbatch_worker::{Backends, WorkerConfig};

type Received = Arc<Mutex<Vec<WebhookPayload>>>;

async fn receive(State(received): State<Received>, Json(body): Json<WebhookPayload>) -> StatusCode {
    received.lock().unwrap().push(body);
    StatusCode::OK
}

async fn spawn_endpoint() -> (String, Received) {
    let received: Received = Arc::default();
    let app = Router::new()
        .route("/webhook", post(receive))
        .with_state(Arc::clone(&received));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/webhook"), received)
}

fn write_png(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([200, 30, 30])))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    format!("file://{}", path.display())
}

fn config(out_dir: &Path, webhook_url: &str, policy: &str) -> WorkerConfig {
    let vars = [
        ("STORE_BACKEND", "memory".to_string()),
        ("WORKER_CONCURRENCY", "3".to_string()),
        ("POLL_INTERVAL_MS", "10".to_string()),
        ("MAX_ATTEMPTS", "1".to_string()),
        ("OUTPUT_DIR", out_dir.display().to_string()),
        ("WEBHOOK_URL", webhook_url.to_string()),
        ("FAILURE_POLICY", policy.to_string()),
    ];
    WorkerConfig::from_lookup(|var| {
        vars.iter()
            .find(|(k, _)| *k == var)
            .map(|(_, v)| v.clone())
    })
    .unwrap()
}

/// Submit `g1` (three good images) and `g2` (one good, one missing).
async fn submit(backends: &Backends, src: &Path) {
    let submitter = BatchSubmitter::new(Arc::clone(&backends.queue), Arc::clone(&backends.tracker));
    let g1 = [
        SubmitItem::new(write_png(src, "a.png")).with_item_id("a"),
        SubmitItem::new(write_png(src, "b.png")).with_item_id("b"),
        SubmitItem::new(write_png(src, "c.png")).with_item_id("c"),
    ];
    let g2 = [
        SubmitItem::new(write_png(src, "d.png")).with_item_id("d"),
        SubmitItem::new(format!("file://{}", src.join("missing.png").display())).with_item_id("e"),
    ];
    submitter.submit_group("req-1", "g1", &g1).await.unwrap();
    submitter.submit_group("req-1", "g2", &g2).await.unwrap();
}

/// Resolves once no job of `req-1` is pending or running and `expected`
/// webhooks have arrived.
async fn settled(backends: Backends, received: Received, expected: usize) {
    loop {
        let counts = backends.queue.request_counts("req-1").await.unwrap();
        let delivered = received.lock().unwrap().len();
        if counts.pending == 0 && counts.running == 0 && delivered >= expected {
            // Let the listener finish any in-flight tracker write.
            tokio::time::sleep(Duration::from_millis(50)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run(policy: &str, expected_webhooks: usize) -> (Backends, Vec<WebhookPayload>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();

    let (url, received) = spawn_endpoint().await;
    let config = config(&dir.path().join("out"), &url, policy);
    let backends = Backends::memory(config.queue_settings());
    submit(&backends, &src).await;

    let notifier = Arc::new(
        WebhookDelivery::new(
            WebhookConfig::new(&url).with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_initial_delay(Duration::from_millis(5)),
            ),
        )
        .unwrap(),
    );

    let transform = Arc::new(pixelbatch_worker::transform_unit(&config).unwrap());
    let shutdown = settled(backends.clone(), Arc::clone(&received), expected_webhooks);
    tokio::time::timeout(
        Duration::from_secs(20),
        pixelbatch_worker::run_until(&config, backends.clone(), transform, notifier, shutdown),
    )
    .await
    .expect("worker run should settle");

    let payloads = received.lock().unwrap().clone();
    (backends, payloads, dir)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strict_policy_dispatches_only_fully_successful_group() {
    let (backends, payloads, _dir) = run("strict", 1).await;

    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload.request_id, "req-1");
    assert_eq!(payload.product_oid, "g1");
    assert_eq!(payload.output_urls.len(), 3);
    for location in &payload.output_urls {
        let bytes = std::fs::read(location).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    let status = request_status(
        &*backends.queue,
        &*backends.tracker,
        &*backends.dead_letters,
        "req-1",
    )
    .await
    .unwrap();
    assert_eq!(status.jobs.completed, 4);
    assert_eq!(status.jobs.failed, 1);
    assert_eq!(status.open_groups.len(), 1);
    let g2 = &status.open_groups[0];
    assert_eq!(g2.group_id, "g2");
    assert_eq!((g2.progress.completed, g2.progress.failed), (1, 1));
    assert!(status.undelivered.is_empty());
    assert!(!status.is_settled());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["open_groups"][0]["group_id"], "g2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_failures_policy_dispatches_every_group() {
    let (backends, payloads, _dir) = run("count-failures", 2).await;

    let mut by_group: Vec<_> = payloads
        .iter()
        .map(|p| (p.product_oid.as_str(), p.output_urls.len()))
        .collect();
    by_group.sort();
    assert_eq!(by_group, [("g1", 3), ("g2", 1)]);

    let status = request_status(
        &*backends.queue,
        &*backends.tracker,
        &*backends.dead_letters,
        "req-1",
    )
    .await
    .unwrap();
    assert!(status.open_groups.is_empty());
    assert!(status.is_settled());
}
