use crate::manager::{BackendFactory, ManagerConfig, ModelManager};
use crate::{ByteSink, ModelBackend, SharedBackend, StreamingProxy};
use async_trait::async_trait;
use bytes::Bytes;
use lemonade_catalog::{Catalog, ModelDescriptor, RecipeOptions};
use lemonade_common::{Error, Result, TelemetryRecord};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Mock backend plumbing for manager tests
// ---------------------------------------------------------------------------

type EventLog = Arc<Mutex<Vec<String>>>;

struct MockBackend {
    descriptor: ModelDescriptor,
    events: EventLog,
    running: AtomicBool,
    fail_start: bool,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl MockBackend {
    fn log(&self, action: &str) {
        self.events
            .lock()
            .expect("event log")
            .push(format!("{}:{}", action, self.descriptor.id));
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn server_name(&self) -> &str {
        "mock-server"
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn start(&self) -> Result<()> {
        self.log("starting");
        // A little latency so concurrent callers overlap the load window
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_start {
            self.log("fail");
            return Err(Error::BackendStartFailed {
                reason: "mock start failure".into(),
                exit_code: Some(3),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        self.log("start");
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.log("stop");
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn base_url(&self) -> Option<String> {
        None
    }

    async fn forward_request(
        &self,
        _endpoint: &str,
        _request: &Value,
        _timeout: Option<Duration>,
    ) -> Value {
        Value::Null
    }

    async fn forward_streaming_request(
        &self,
        _endpoint: &str,
        _request_body: Bytes,
        _sink: ByteSink,
        _sse: bool,
    ) {
    }

    fn telemetry(&self) -> TelemetryRecord {
        TelemetryRecord::default()
    }
}

struct MockFactory {
    events: EventLog,
    spawns: AtomicUsize,
    fail_ids: HashSet<String>,
}

impl MockFactory {
    fn new(events: EventLog) -> Self {
        Self {
            events,
            spawns: AtomicUsize::new(0),
            fail_ids: HashSet::new(),
        }
    }

    fn failing(events: EventLog, ids: &[&str]) -> Self {
        Self {
            events,
            spawns: AtomicUsize::new(0),
            fail_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn create(
        &self,
        descriptor: &ModelDescriptor,
        _options: &RecipeOptions,
    ) -> Result<SharedBackend> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBackend {
            descriptor: descriptor.clone(),
            events: self.events.clone(),
            running: AtomicBool::new(false),
            fail_start: self.fail_ids.contains(&descriptor.id),
        }))
    }
}

const LLM_A: &str = "Qwen2.5-0.5B-Instruct-GGUF";
const LLM_B: &str = "Llama-3.2-1B-Instruct-GGUF";
const LLM_C: &str = "DeepSeek-R1-Distill-Qwen-7B-GGUF";
const EMBED: &str = "nomic-embed-text-v1.5-GGUF";

fn manager_with(
    factory: Arc<MockFactory>,
    config: ManagerConfig,
) -> Arc<ModelManager> {
    let catalog = Catalog::load_from_cache_dir(Path::new("/nonexistent")).expect("catalog");
    Arc::new(
        ModelManager::new(Arc::new(RwLock::new(catalog)), config, factory).expect("manager"),
    )
}

fn events_of(log: &EventLog) -> Vec<String> {
    log.lock().expect("event log").clone()
}

// ---------------------------------------------------------------------------
// ModelManager
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_call_reuses_loaded_slot() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(factory.clone(), ManagerConfig::default());

    let first = manager.ensure_loaded(LLM_A).await.expect("load");
    let second = manager.ensure_loaded(LLM_A).await.expect("hit");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.spawns.load(Ordering::SeqCst), 1);
    assert_eq!(manager.list_loaded().await, vec![LLM_A.to_string()]);
}

#[tokio::test]
async fn test_unknown_model_is_rejected() {
    let events: EventLog = Arc::default();
    let manager = manager_with(
        Arc::new(MockFactory::new(events)),
        ManagerConfig::default(),
    );

    let err = manager.ensure_loaded("no-such-model").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(manager.list_loaded().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_loads_coalesce_to_one_spawn() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events));
    let manager = manager_with(factory.clone(), ManagerConfig::default());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        handles.push(tokio::spawn(
            async move { manager.ensure_loaded(LLM_A).await },
        ));
    }

    let mut servers = Vec::new();
    for handle in handles {
        servers.push(handle.await.expect("join").expect("load"));
    }

    assert_eq!(factory.spawns.load(Ordering::SeqCst), 1);
    for server in &servers[1..] {
        assert!(Arc::ptr_eq(&servers[0], server));
    }
}

#[tokio::test]
async fn test_capacity_one_evicts_before_second_load() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(factory, ManagerConfig::default());

    let first = manager.ensure_loaded(LLM_A).await.expect("load A");
    manager.ensure_loaded(LLM_B).await.expect("load B");

    // A was stopped before B's start even began
    let log = events_of(&events);
    assert_eq!(
        log,
        vec![
            format!("starting:{}", LLM_A),
            format!("start:{}", LLM_A),
            format!("stop:{}", LLM_A),
            format!("starting:{}", LLM_B),
            format!("start:{}", LLM_B),
        ]
    );
    assert!(!first.is_running().await);
    assert_eq!(manager.list_loaded().await, vec![LLM_B.to_string()]);
}

#[tokio::test]
async fn test_classes_have_independent_pools() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(factory, ManagerConfig::default());

    manager.ensure_loaded(LLM_A).await.expect("load llm");
    manager.ensure_loaded(EMBED).await.expect("load embedding");

    // No eviction: the two models occupy different class pools
    let log = events_of(&events);
    assert!(!log.iter().any(|e| e.starts_with("stop:")));
    assert_eq!(manager.list_loaded().await.len(), 2);
}

#[tokio::test]
async fn test_same_class_loads_run_in_parallel_within_capacity() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(
        factory,
        ManagerConfig {
            max_llm_models: 2,
            ..ManagerConfig::default()
        },
    );

    let (left, right) = tokio::join!(
        {
            let manager = manager.clone();
            async move { manager.ensure_loaded(LLM_A).await }
        },
        {
            let manager = manager.clone();
            async move { manager.ensure_loaded(LLM_B).await }
        }
    );
    left.expect("load A");
    right.expect("load B");

    // Both backends entered their start window before either finished:
    // with room in the pool, two different models load concurrently
    let log = events_of(&events);
    let first_completed = log
        .iter()
        .position(|e| e.starts_with("start:"))
        .expect("a completed start");
    let last_begun = log
        .iter()
        .rposition(|e| e.starts_with("starting:"))
        .expect("a begun start");
    assert!(
        last_begun < first_completed,
        "same-class loads serialized: {:?}",
        log
    );
    assert!(!log.iter().any(|e| e.starts_with("stop:")));
    assert_eq!(manager.list_loaded().await.len(), 2);
}

#[tokio::test]
async fn test_lru_eviction_with_tiebreak_on_load_time() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(
        factory,
        ManagerConfig {
            max_llm_models: 2,
            ..ManagerConfig::default()
        },
    );

    manager.ensure_loaded(LLM_A).await.expect("load A");
    manager.ensure_loaded(LLM_B).await.expect("load B");
    // Touch A so B becomes the least recently used
    manager.ensure_loaded(LLM_A).await.expect("touch A");
    manager.ensure_loaded(LLM_C).await.expect("load C");

    let loaded = manager.list_loaded().await;
    assert!(loaded.contains(&LLM_A.to_string()));
    assert!(loaded.contains(&LLM_C.to_string()));
    assert!(!loaded.contains(&LLM_B.to_string()));
    assert!(events_of(&events).contains(&format!("stop:{}", LLM_B)));
}

#[tokio::test]
async fn test_load_unload_load_spawns_fresh_backend() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events));
    let manager = manager_with(factory.clone(), ManagerConfig::default());

    let first = manager.ensure_loaded(LLM_A).await.expect("load");
    manager.unload(LLM_A).await;
    assert!(manager.list_loaded().await.is_empty());
    assert!(!first.is_running().await);

    let second = manager.ensure_loaded(LLM_A).await.expect("reload");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.spawns.load(Ordering::SeqCst), 2);
    assert_eq!(manager.list_loaded().await.len(), 1);
}

#[tokio::test]
async fn test_failed_start_leaves_no_slot_and_fans_out() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::failing(events, &[LLM_A]));
    let manager = manager_with(factory.clone(), ManagerConfig::default());

    let (left, right) = tokio::join!(
        {
            let manager = manager.clone();
            async move { manager.ensure_loaded(LLM_A).await }
        },
        {
            let manager = manager.clone();
            async move { manager.ensure_loaded(LLM_A).await }
        }
    );

    for result in [left, right] {
        match result {
            Err(Error::BackendStartFailed { exit_code, .. }) => {
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("expected BackendStartFailed, got {:?}", other.map(|_| ())),
        }
    }
    assert!(manager.list_loaded().await.is_empty());

    // After the failure is drained, a new attempt runs a fresh load
    let _ = manager.ensure_loaded(LLM_A).await;
    assert!(factory.spawns.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_unload_all_stops_everything() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events.clone()));
    let manager = manager_with(factory, ManagerConfig::default());

    manager.ensure_loaded(LLM_A).await.expect("load llm");
    manager.ensure_loaded(EMBED).await.expect("load embedding");
    manager.unload_all().await;

    assert!(manager.list_loaded().await.is_empty());
    let log = events_of(&events);
    assert_eq!(log.iter().filter(|e| e.starts_with("stop:")).count(), 2);
}

#[tokio::test]
async fn test_reap_dead_removes_dead_slots() {
    let events: EventLog = Arc::default();
    let factory = Arc::new(MockFactory::new(events));
    let manager = manager_with(factory, ManagerConfig::default());

    let server = manager.ensure_loaded(LLM_A).await.expect("load");
    // Simulate the process dying behind the manager's back
    server.stop().await;

    let dead = manager.reap_dead().await;
    assert_eq!(dead, vec![LLM_A.to_string()]);
    assert!(manager.list_loaded().await.is_empty());
}

#[tokio::test]
async fn test_zero_capacity_is_rejected() {
    let config = ManagerConfig {
        max_llm_models: 0,
        ..ManagerConfig::default()
    };
    assert!(config.validate().is_err());

    let events: EventLog = Arc::default();
    let catalog = Catalog::load_from_cache_dir(Path::new("/nonexistent")).expect("catalog");
    let result = ModelManager::new(
        Arc::new(RwLock::new(catalog)),
        config,
        Arc::new(MockFactory::new(events)),
    );
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// WrappedServer startup failure
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn test_wrapped_server_reports_exit_code_when_backend_dies() {
    use crate::WrappedServer;
    use lemonade_catalog::Recipe;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let exe_dir = dir.path().join("bin/llamacpp/vulkan");
    std::fs::create_dir_all(&exe_dir).expect("mkdir");
    let exe = exe_dir.join("llama-server");
    std::fs::write(&exe, "#!/bin/sh\nexit 9\n").expect("write script");
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let descriptor = ModelDescriptor {
        id: "dying-model".into(),
        name: None,
        recipe: Recipe::LlamaCpp,
        checkpoint: "dying/model.gguf".into(),
        mmproj: None,
        reasoning: false,
        vision: false,
        labels: vec![],
        options: serde_json::Map::new(),
    };

    let server = WrappedServer::new(
        descriptor,
        RecipeOptions::empty(Recipe::LlamaCpp),
        dir.path().join("models"),
        dir.path().join("bin"),
        true,
    )
    .expect("wrapped server");

    match server.start().await {
        Err(Error::BackendStartFailed { exit_code, .. }) => assert_eq!(exit_code, Some(9)),
        other => panic!("expected BackendStartFailed, got {:?}", other),
    }
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_wrapped_server_rejects_requests_before_start() {
    use crate::WrappedServer;
    use lemonade_catalog::Recipe;

    let descriptor = ModelDescriptor {
        id: "idle-model".into(),
        name: None,
        recipe: Recipe::LlamaCpp,
        checkpoint: "idle/model.gguf".into(),
        mmproj: None,
        reasoning: false,
        vision: false,
        labels: vec![],
        options: serde_json::Map::new(),
    };
    let server = WrappedServer::new(
        descriptor,
        RecipeOptions::empty(Recipe::LlamaCpp),
        "/m".into(),
        "/b".into(),
        true,
    )
    .expect("wrapped server");

    let response = server
        .forward_request("/v1/chat/completions", &serde_json::json!({}), None)
        .await;
    assert_eq!(response["error"]["type"], "model_not_loaded");

    let (tx, rx) = mpsc::channel::<Bytes>(8);
    server
        .forward_streaming_request("/v1/chat/completions", Bytes::from_static(b"{}"), tx, true)
        .await;
    let output = String::from_utf8(collect_sink(rx).await).expect("utf8");
    assert!(output.contains("model_not_loaded"));
}

// ---------------------------------------------------------------------------
// StreamingProxy against a mock backend server
// ---------------------------------------------------------------------------

async fn collect_sink(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut all = Vec::new();
    while let Some(chunk) = rx.recv().await {
        all.extend_from_slice(&chunk);
    }
    all
}

#[tokio::test]
async fn test_sse_forwarding_is_byte_identical_with_telemetry() {
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n\
data: [DONE]\n\n";

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&server)
        .await;

    let client = crate::http::inference_client().expect("client");
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let telemetry = Arc::new(Mutex::new(TelemetryRecord::default()));
    let telemetry_out = telemetry.clone();

    let url = format!("{}/v1/chat/completions", server.uri());
    let body = Bytes::from_static(b"{\"model\":\"m\",\"stream\":true}");

    let forward = tokio::spawn(async move {
        StreamingProxy::forward_sse_stream(&client, &url, body, &tx, true, move |record| {
            *telemetry_out.lock().expect("telemetry") = record;
        })
        .await;
    });

    let forwarded = collect_sink(rx).await;
    forward.await.expect("join");

    // Identity on forwarded bytes
    assert_eq!(forwarded, sse_body.as_bytes());

    let telemetry = telemetry.lock().expect("telemetry").clone();
    assert_eq!(telemetry.input_tokens, 3);
    assert_eq!(telemetry.output_tokens, 2);
    assert!(telemetry.time_to_first_token >= 0.0);
    assert!(telemetry.tokens_per_second >= 0.0);
}

#[tokio::test]
async fn test_byte_stream_forwarding_is_identity() {
    let payload = "{\"object\":\"list\",\"data\":[1,2,3]}";

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(payload))
        .mount(&server)
        .await;

    let client = crate::http::inference_client().expect("client");
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let url = format!("{}/v1/embeddings", server.uri());

    StreamingProxy::forward_byte_stream(&client, &url, Bytes::from_static(b"{}"), &tx).await;
    drop(tx);

    assert_eq!(collect_sink(rx).await, payload.as_bytes());
}

#[tokio::test]
async fn test_unreachable_backend_writes_streaming_error_frame() {
    let client = crate::http::inference_client().expect("client");
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    // Nothing listens here; the failure must land in the sink, not propagate
    StreamingProxy::forward_sse_stream(
        &client,
        "http://127.0.0.1:9/v1/chat/completions",
        Bytes::from_static(b"{}"),
        &tx,
        true,
        |_| {},
    )
    .await;
    drop(tx);

    let output = String::from_utf8(collect_sink(rx).await).expect("utf8");
    assert!(output.starts_with("data: "));
    assert!(output.contains("\"type\":\"streaming_error\""));
    assert!(output.ends_with("\n\n"));
}

#[tokio::test]
async fn test_closed_sink_aborts_upstream() {
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&server)
        .await;

    let client = crate::http::inference_client().expect("client");
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    drop(rx); // client disconnected before any bytes arrive

    let url = format!("{}/v1/chat/completions", server.uri());
    // Must return promptly instead of hanging on a dead sink
    tokio::time::timeout(
        Duration::from_secs(5),
        StreamingProxy::forward_sse_stream(&client, &url, Bytes::from_static(b"{}"), &tx, true, |_| {}),
    )
    .await
    .expect("proxy returned after sink closed");
}
