//! End-to-end scenarios over the real HTTP surface: ingest a batch over a
//! live `TcpListener` (teacher precedent: `tests/health.rs` spins up the IPC
//! server on a random port), then drive one processing pass by hand so the
//! test stays deterministic instead of racing a background consumer.

use async_trait::async_trait;
use fuel_code::config::ServerConfig;
use fuel_code::objectstore::{LocalObjectStore, ObjectStore};
use fuel_code::processor::{Outcome, Processor};
use fuel_code::queue::{Queue, QueueEntry, QueueError};
use fuel_code::summarizer::{DisabledSummarizer, Summarizer};
use fuel_code::storage::Storage;
use fuel_code::transcript::TranscriptPipeline;
use fuel_code::ws::Hub;
use fuel_code::AppContext;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

const API_KEY: &str = "test-bearer-token";

/// In-memory queue double for the HTTP surface — identical contract to
/// `queue::fake::FakeQueue`, rewritten here since that double is `cfg(test)`
/// inside the lib crate and not visible to this separate test binary.
#[derive(Default)]
struct TestQueue {
    pending: AsyncMutex<Vec<(String, String)>>,
}

#[async_trait]
impl Queue for TestQueue {
    async fn append(&self, _event_id: &str, payload: &str) -> Result<String, QueueError> {
        let mut pending = self.pending.lock().await;
        let entry_id = format!("{}-0", pending.len() + 1);
        pending.push((entry_id.clone(), payload.to_string()));
        Ok(entry_id)
    }

    async fn read(
        &self,
        _consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut pending = self.pending.lock().await;
        let n = count.min(pending.len());
        Ok(pending
            .drain(0..n)
            .map(|(entry_id, payload)| QueueEntry { entry_id, payload })
            .collect())
    }

    async fn ack(&self, _entry_id: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn claim(
        &self,
        _consumer: &str,
        _min_idle_ms: u64,
        _count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(vec![])
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

struct Harness {
    ctx: AppContext,
    processor: Processor,
    queue: Arc<TestQueue>,
    base_url: String,
    _dir: tempfile::TempDir,
}

async fn build_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.db");
    let storage = Arc::new(
        Storage::connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .unwrap(),
    );
    let objects: Arc<dyn ObjectStore> =
        Arc::new(LocalObjectStore::new(dir.path().join("objects")));
    let hub = Arc::new(Hub::new());
    let summarizer: Arc<dyn Summarizer> = Arc::new(DisabledSummarizer);
    let pipeline = TranscriptPipeline::new(
        Arc::clone(&storage),
        Arc::clone(&objects),
        Arc::clone(&hub),
        Arc::clone(&summarizer),
        2,
        10,
        false,
    );
    let queue = Arc::new(TestQueue::default());
    let config = Arc::new(ServerConfig {
        database_url: format!("sqlite://{}", db_path.display()),
        queue_url: "unused".to_string(),
        api_key: API_KEY.to_string(),
        port: 0,
        object_store_root: dir.path().join("objects").display().to_string(),
        summary_enabled: false,
        summary_model: "default".to_string(),
        summary_endpoint: "http://localhost:0".to_string(),
        pipeline_pool_size: 2,
        pipeline_pending_max: 10,
        pipeline_consumer_max_retries: 3,
        consumer_claim_idle_ms: 60_000,
        consumer_block_ms: 5_000,
    });

    let queue_dyn: Arc<dyn Queue> = Arc::clone(&queue) as Arc<dyn Queue>;
    let ctx = AppContext {
        config,
        storage: Arc::clone(&storage),
        queue: queue_dyn,
        objects,
        hub: Arc::clone(&hub),
        pipeline: Arc::clone(&pipeline),
        summarizer,
    };
    let processor = Processor::new(Arc::clone(&storage), hub, pipeline);

    let app = axum::Router::new()
        .merge(fuel_code::ingest::router())
        .merge(fuel_code::rest::router())
        .with_state(ctx.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        ctx,
        processor,
        queue,
        base_url: format!("http://{addr}"),
        _dir: dir,
    }
}

impl Harness {
    async fn post_events(&self, events: Value, token: Option<&str>) -> (u16, Value) {
        let client = reqwest::Client::new();
        let mut req = client
            .post(format!("{}/events/ingest", self.base_url))
            .json(&json!({ "events": events }));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Drains whatever is currently queued and processes each entry in order,
    /// standing in for a consumer loop pass without any timing dependency.
    async fn process_all_pending(&self) -> Vec<Outcome> {
        let entries = self.queue.read("test-consumer", 100, 0).await.unwrap();
        let mut outcomes = vec![];
        for entry in entries {
            outcomes.push(self.processor.process(&entry.payload).await.unwrap());
        }
        outcomes
    }
}

async fn find_workspace(h: &Harness, canonical_id: &str) -> Option<fuel_code::storage::rows::WorkspaceRow> {
    h.ctx
        .storage
        .list_workspaces()
        .await
        .unwrap()
        .into_iter()
        .find(|w| w.canonical_id == canonical_id)
}

fn session_start_event(id: &str, device: &str, cc_session_id: &str) -> Value {
    json!({
        "id": id,
        "type": "session.start",
        "timestamp": "2025-06-01T10:00:00Z",
        "device_id": device,
        "workspace_id": "github.com/u/r",
        "session_id": null,
        "data": {"cc_session_id": cc_session_id, "cwd": "/w", "git_branch": "main", "source": "cli"},
        "blob_refs": [],
    })
}

fn session_end_event(id: &str, device: &str, cc_session_id: &str) -> Value {
    json!({
        "id": id,
        "type": "session.end",
        "timestamp": "2025-06-01T10:05:00Z",
        "device_id": device,
        "workspace_id": "github.com/u/r",
        "session_id": null,
        "data": {"cc_session_id": cc_session_id, "duration_ms": 60_000, "end_reason": "exit"},
        "blob_refs": [],
    })
}

#[tokio::test]
async fn happy_path_session_start() {
    let h = build_harness().await;
    let (status, body) = h.post_events(json!([session_start_event("A", "D1", "CC1")]), Some(API_KEY)).await;
    assert_eq!(status, 202);
    assert_eq!(body["ingested"], 1);
    assert_eq!(body["rejected"], 0);

    let outcomes = h.process_all_pending().await;
    assert_eq!(outcomes, vec![Outcome::Processed]);

    let ws = find_workspace(&h, "github.com/u/r").await.expect("workspace row");
    assert_eq!(ws.canonical_id, "github.com/u/r");
    assert_eq!(ws.display_name, "r");

    let sessions = h
        .ctx
        .storage
        .list_sessions_for_workspace(&ws.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].lifecycle, "detected");
    assert_eq!(sessions[0].cc_session_id, "CC1");
    assert_ne!(sessions[0].id, "CC1");
}

#[tokio::test]
async fn lifecycle_monotone_start_then_end() {
    let h = build_harness().await;
    h.post_events(json!([session_start_event("A", "D1", "CC1")]), Some(API_KEY)).await;
    h.process_all_pending().await;
    h.post_events(json!([session_end_event("B", "D1", "CC1")]), Some(API_KEY)).await;
    let outcomes = h.process_all_pending().await;
    assert_eq!(outcomes, vec![Outcome::Processed]);

    let ws = find_workspace(&h, "github.com/u/r").await.unwrap();
    let sessions = h
        .ctx
        .storage
        .list_sessions_for_workspace(&ws.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].lifecycle, "ended");
    assert!(sessions[0].ended_at.is_some());
}

#[tokio::test]
async fn duplicate_event_is_processed_once() {
    let h = build_harness().await;
    h.post_events(json!([session_start_event("A", "D1", "CC1")]), Some(API_KEY)).await;
    h.post_events(json!([session_start_event("A", "D1", "CC1")]), Some(API_KEY)).await;
    let outcomes = h.process_all_pending().await;
    assert_eq!(outcomes, vec![Outcome::Processed, Outcome::Duplicate]);

    let ws = find_workspace(&h, "github.com/u/r").await.unwrap();
    let sessions = h
        .ctx
        .storage
        .list_sessions_for_workspace(&ws.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn batch_of_ten_distinct_sessions() {
    let h = build_harness().await;
    let events: Vec<Value> = (0..10)
        .map(|i| session_start_event(&format!("E{i}"), "D1", &format!("CC{i}")))
        .collect();
    let (status, body) = h.post_events(json!(events), Some(API_KEY)).await;
    assert_eq!(status, 202);
    assert_eq!(body["ingested"], 10);

    let outcomes = h.process_all_pending().await;
    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|o| *o == Outcome::Processed));

    let ws = find_workspace(&h, "github.com/u/r").await.unwrap();
    let sessions = h
        .ctx
        .storage
        .list_sessions_for_workspace(&ws.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 10);
    assert!(sessions.iter().all(|s| s.lifecycle == "detected"));
}

#[tokio::test]
async fn invalid_payload_is_rejected_without_touching_storage() {
    let h = build_harness().await;
    let bad = json!({
        "id": "BAD",
        "type": "session.start",
        "timestamp": "2025-06-01T10:00:00Z",
        "device_id": "D1",
        "workspace_id": "github.com/u/r",
        "data": {},
        "blob_refs": [],
    });
    let (status, body) = h.post_events(json!([bad]), Some(API_KEY)).await;
    assert_eq!(status, 202);
    assert_eq!(body["ingested"], 0);
    assert_eq!(body["rejected"], 1);

    let outcomes = h.process_all_pending().await;
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn auth_failure_returns_401() {
    let h = build_harness().await;
    let (status_missing, _) = h.post_events(json!([session_start_event("A", "D1", "CC1")]), None).await;
    assert_eq!(status_missing, 401);

    let (status_wrong, _) = h
        .post_events(json!([session_start_event("A", "D1", "CC1")]), Some("wrong-token"))
        .await;
    assert_eq!(status_wrong, 401);
}
