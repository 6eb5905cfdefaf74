//! End-to-end tests for the relay: gateway submissions flow through the queue
//! and the background worker into the store.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use docrelay::broker::dead_letter_queue;
use docrelay::gateway::{router, AppState};
use docrelay::{
    Broker, DecodeFailurePolicy, DocumentStore, MemoryBroker, MemoryStore, RelayWorker, WorkerConfig,
    WorkerHandle, WorkerState, WorkerStats,
};

const QUEUE: &str = "relay_test_queue";

struct Harness {
    broker: MemoryBroker,
    store: MemoryStore,
    state: Arc<AppState>,
    worker: Option<WorkerHandle>,
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        decode_failure: DecodeFailurePolicy::DeadLetter { max_attempts: 2 },
        redelivery_delay: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(20),
        analyze_text: true,
    }
}

async fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    broker.declare_queue(QUEUE).await.unwrap();

    let worker = RelayWorker::new(
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        QUEUE,
        worker_config(),
    )
    .spawn();
    assert!(
        worker.wait_for_state(WorkerState::WaitingForMessage, Duration::from_secs(2)).await,
        "worker never started consuming"
    );

    let state = Arc::new(AppState::new(
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        QUEUE,
    ));

    Harness {
        broker,
        store,
        state,
        worker: Some(worker),
    }
}

impl Harness {
    async fn post(&self, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/data")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(self.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_latest(&self) -> String {
        let request = Request::builder().uri("/data").body(Body::empty()).unwrap();
        let response = router(self.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["data"].as_str().unwrap().to_string()
    }

    /// Poll until the store holds `count` documents.
    async fn wait_for_documents(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.store.len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} documents, have {}",
                count,
                self.store.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the worker's counters satisfy `done`.
    async fn wait_for_stats(&self, done: impl Fn(&WorkerStats) -> bool) -> WorkerStats {
        let worker = self.worker.as_ref().expect("worker is running");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = worker.stats();
            if done(&stats) {
                return stats;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for stats: {:?}", stats);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
    }
}

#[tokio::test]
async fn test_submitted_payloads_are_all_stored() {
    let h = harness().await;

    let submitted: HashSet<String> = (0..10).map(|i| format!("message {}", i)).collect();
    for text in &submitted {
        let (status, _) = h.post(&serde_json::json!({ "data": text }).to_string()).await;
        assert_eq!(status, StatusCode::OK);
    }

    h.wait_for_documents(submitted.len()).await;

    let stored: HashSet<String> = h
        .store
        .documents_snapshot()
        .iter()
        .map(|d| d.content().unwrap().to_string())
        .collect();
    assert_eq!(stored, submitted);
    assert_eq!(h.broker.ready_count(QUEUE), 0);
    assert_eq!(h.broker.in_flight_count(QUEUE), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_fetch_latest_returns_last_stored() {
    let h = harness().await;
    assert_eq!(h.get_latest().await, "");

    h.post(r#"{"data": "first"}"#).await;
    h.wait_for_documents(1).await;
    h.post(r#"{"data": "second"}"#).await;
    h.wait_for_documents(2).await;

    assert_eq!(h.get_latest().await, "second");

    h.shutdown().await;
}

#[tokio::test]
async fn test_text_payload_is_stored_with_analysis() {
    let h = harness().await;

    let (status, body) = h.post(r#"{"text": "a a b"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["analysis"]["word_count"], 3);
    assert_eq!(body["status"]["message"], "Data sent to queue");

    h.wait_for_documents(1).await;
    let doc = h.store.find_latest().await.unwrap().unwrap();
    assert_eq!(doc.body["analysis"]["character_count"], 5);
    assert_eq!(doc.body["analysis"]["unique_words"], 2);
    assert_eq!(h.get_latest().await, "a a b");

    h.shutdown().await;
}

#[tokio::test]
async fn test_transient_store_outage_loses_nothing() {
    let h = harness().await;
    h.store.fail_next_inserts(3);

    h.post(r#"{"data": "survivor"}"#).await;
    h.wait_for_documents(1).await;

    assert_eq!(h.get_latest().await, "survivor");
    assert_eq!(h.store.len(), 1);

    let stats = h.wait_for_stats(|s| s.stored == 1).await;
    assert_eq!(stats.retried, 3);

    h.shutdown().await;
}

#[tokio::test]
async fn test_invalid_payload_is_not_published() {
    let h = harness().await;

    let (status, body) = h.post(r#"{"other": "field"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("text"));

    let (status, _) = h.post("not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker.published_count(QUEUE), 0);
    assert!(h.store.is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn test_malformed_queue_message_is_dead_lettered() {
    let h = harness().await;

    h.broker.publish(QUEUE, b"{broken".to_vec()).await.unwrap();
    h.post(r#"{"data": "after"}"#).await;
    h.wait_for_documents(1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.broker.ready_count(&dead_letter_queue(QUEUE)) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "message never dead-lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(h.broker.ready_bodies(&dead_letter_queue(QUEUE)), vec![b"{broken".to_vec()]);
    assert_eq!(h.store.len(), 1);
    h.wait_for_stats(|s| s.dead_lettered == 1).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_rejected_document_is_dead_lettered_not_retried_forever() {
    let h = harness().await;
    h.store.reject_next_inserts(usize::MAX);

    h.broker.publish(QUEUE, br#"{"data": "unstorable"}"#.to_vec()).await.unwrap();

    let stats = h.wait_for_stats(|s| s.dead_lettered == 1).await;
    assert_eq!(stats.retried, 1);
    assert_eq!(
        h.broker.ready_bodies(&dead_letter_queue(QUEUE)),
        vec![br#"{"data": "unstorable"}"#.to_vec()]
    );
    assert_eq!(h.broker.ready_count(QUEUE), 0);
    assert!(h.store.is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn test_broker_outage_fails_submit() {
    let h = harness().await;
    h.broker.set_available(false);

    let (status, body) = h.post(r#"{"data": "lost"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());

    h.broker.set_available(true);
    h.shutdown().await;
}

#[tokio::test]
async fn test_worker_shutdown_stops_consuming() {
    let mut h = harness().await;

    let worker = h.worker.take().unwrap();
    assert_eq!(worker.shutdown().await, WorkerState::Stopped);

    h.broker.publish(QUEUE, br#"{"data": "queued"}"#.to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nothing consumes it; it stays durable in the queue for the next worker
    assert_eq!(h.broker.ready_count(QUEUE), 1);
    assert!(h.store.is_empty());

    let next = RelayWorker::new(
        Arc::new(h.broker.clone()),
        Arc::new(h.store.clone()),
        QUEUE,
        worker_config(),
    )
    .spawn();
    h.worker = Some(next);
    h.wait_for_documents(1).await;

    let handle = h.worker.take().unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_worker_shutdown_joins_idle_worker() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    broker.declare_queue(QUEUE).await.unwrap();

    let worker = RelayWorker::new(Arc::new(broker), Arc::new(store), QUEUE, worker_config()).spawn();
    assert!(worker.wait_for_state(WorkerState::WaitingForMessage, Duration::from_secs(2)).await);
    assert!(!worker.is_finished());

    let state = tokio::time::timeout(Duration::from_secs(2), worker.shutdown())
        .await
        .expect("worker did not stop");
    assert_eq!(state, WorkerState::Stopped);
}
