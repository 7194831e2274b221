use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loupe_agent::{
    Agent, AgentConfig, AuthHeader, Collaborators, DeliveryOutcome, DeliveryRequest, ErrorReport,
    FailureReason, KeyValueStore, LogMessage, MemoryStore, MessageDraft, RawException, Severity,
    StoreError, Transport, TransportResponse, AGENT_SESSION_ID_KEY, MESSAGE_KEY_PREFIX,
    MAX_REQUEST_SIZE, TRUNCATED_DETAILS,
};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::sleep;

/// Answers with scripted statuses (200 once the script runs out) and
/// records every request.
#[derive(Default)]
struct ScriptedTransport {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<DeliveryRequest>>,
    /// Holds the first request until notified.
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedTransport {
    fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            ..Self::default()
        })
    }

    fn always_ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated(statuses: impl IntoIterator<Item = u16>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            gate: Mutex::new(Some(gate)),
            ..Self::default()
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> DeliveryRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    fn body(&self, index: usize) -> Value {
        serde_json::from_str(&self.request(index).body).unwrap()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: DeliveryRequest) -> TransportResponse {
        self.requests.lock().unwrap().push(request);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        TransportResponse::new(status, "")
    }
}

struct BrokenStore;

#[async_trait]
impl KeyValueStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }
    async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }
    async fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }
    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("offline".into()))
    }
}

/// Accepts everything except the first `failures` message writes, which
/// fail with a backend error.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let failing = key.starts_with(MESSAGE_KEY_PREFIX)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(StoreError::Backend("write rejected".into()));
        }
        self.inner.set(key, value).await
    }
    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }
    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys().await
    }
}

async fn agent_with(transport: Arc<ScriptedTransport>) -> (Arc<Agent>, Arc<MemoryStore>) {
    let durable = Arc::new(MemoryStore::new());
    let agent = Agent::with_collaborators(
        AgentConfig::new("http://localhost:3500/"),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_transport(transport),
    )
    .await;
    (agent, durable)
}

async fn stored(store: &MemoryStore) -> Vec<LogMessage> {
    let mut messages: Vec<LogMessage> = store
        .snapshot()
        .await
        .into_iter()
        .filter(|(key, _)| key.starts_with(MESSAGE_KEY_PREFIX))
        .map(|(_, payload)| serde_json::from_str(&payload).unwrap())
        .collect();
    messages.sort_by_key(|m| m.sequence);
    messages
}

#[tokio::test(start_paused = true)]
async fn server_error_keeps_entry_and_backs_off() {
    let transport = ScriptedTransport::with_statuses([500, 201]);
    let (agent, durable) = agent_with(transport.clone()).await;

    agent.information("A", "B", "C").await;

    let raw: Vec<String> = durable.snapshot().await.into_values().collect();
    assert_eq!(raw.len(), 1);
    let entry: Value = serde_json::from_str(&raw[0]).unwrap();
    assert_eq!(entry["sequence"], 1);
    assert_eq!(entry["severity"], 8);
    assert_eq!(entry["category"], "A");

    // The write armed a 10ms timer; the interval update lands 500ms after the attempt.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.request_count(), 1);
    assert_eq!(stored(&durable).await.len(), 1);
    assert_eq!(agent.in_flight().await, 0);
    assert_eq!(agent.message_interval(), 100);

    assert_eq!(agent.deliver_now().await, DeliveryOutcome::Delivered);
    assert!(stored(&durable).await.is_empty());

    sleep(Duration::from_millis(600)).await;
    assert_eq!(agent.message_interval(), 10);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_entry_is_held_back_until_the_attempt_finishes() {
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::gated([401], gate.clone());
    let (agent, durable) = agent_with(transport.clone()).await;

    agent.information("auth", "cap", "desc").await;

    let first = tokio::spawn({
        let agent = agent.clone();
        async move { agent.deliver_now().await }
    });
    while transport.request_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(agent.in_flight().await, 1);
    assert_eq!(
        agent.deliver_now().await,
        DeliveryOutcome::Aborted(loupe_agent::AbortReason::NothingToSend)
    );
    assert_eq!(transport.request_count(), 1);

    gate.notify_one();
    assert_eq!(
        first.await.unwrap(),
        DeliveryOutcome::Failed(FailureReason::Unauthorized)
    );
    assert_eq!(stored(&durable).await.len(), 1);
    assert_eq!(agent.in_flight().await, 0);

    agent.deliver_now().await;
    assert!(stored(&durable).await.is_empty());
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_batch_is_deleted() {
    let transport = ScriptedTransport::with_statuses([400]);
    let (agent, durable) = agent_with(transport.clone()).await;

    agent.warning("cat", "cap", "desc").await;

    assert_eq!(
        agent.deliver_now().await,
        DeliveryOutcome::Failed(FailureReason::Rejected(400))
    );
    assert!(stored(&durable).await.is_empty());
    assert_eq!(agent.in_flight().await, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_transport_aborts_without_side_effects() {
    let durable = Arc::new(MemoryStore::new());
    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .without_transport(),
    )
    .await;

    agent.error("cat", "cap", "desc").await;

    assert_eq!(
        agent.deliver_now().await,
        DeliveryOutcome::Aborted(loupe_agent::AbortReason::NoTransport)
    );
    sleep(Duration::from_millis(600)).await;
    assert_eq!(stored(&durable).await.len(), 1);
    assert_eq!(agent.in_flight().await, 0);
    assert_eq!(agent.message_interval(), 10);
}

#[tokio::test(start_paused = true)]
async fn request_targets_collector_with_headers_and_session() {
    let transport = ScriptedTransport::always_ok();
    let (agent, _durable) = agent_with(transport.clone()).await;

    assert!(!agent.set_authorization_header(AuthHeader::new("", "token")).await);
    assert!(agent.set_authorization_header(AuthHeader::new("Authorization", "Bearer abc")).await);

    agent.information("cat", "first", "desc").await;
    agent.deliver_now().await;

    let request = transport.request(0);
    assert_eq!(request.url, "http://localhost:3500/loupe/log");
    assert_eq!(
        request.headers,
        vec![("Authorization".to_string(), "Bearer abc".to_string())]
    );

    let body = transport.body(0);
    assert_eq!(body["logMessages"][0]["caption"], "first");
    assert_eq!(body["session"]["currentAgentSessionId"], agent.agent_session_id());
    assert_eq!(body["session"]["client"]["os"], std::env::consts::OS);

    agent.set_cors_origin(Some("https://logs.example.com".into())).await;
    agent.information("cat", "second", "desc").await;
    agent.deliver_now().await;
    assert_eq!(transport.request(1).url, "https://logs.example.com/loupe/log");
}

#[tokio::test(start_paused = true)]
async fn oversized_details_are_sent_truncated() {
    let transport = ScriptedTransport::always_ok();
    let (agent, durable) = agent_with(transport.clone()).await;

    agent
        .write(
            MessageDraft::new(Severity::Information, "cat", "big", "desc")
                .with_details(json!({ "blob": "x".repeat(MAX_REQUEST_SIZE) })),
        )
        .await;

    assert_eq!(agent.deliver_now().await, DeliveryOutcome::Delivered);
    let body = transport.body(0);
    assert_eq!(body["logMessages"][0]["details"], TRUNCATED_DETAILS);
    assert!(stored(&durable).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_replaced_by_drop_notice() {
    let transport = ScriptedTransport::always_ok();
    let (agent, durable) = agent_with(transport.clone()).await;

    agent
        .information("cat", "Big", &"y".repeat(MAX_REQUEST_SIZE + 10))
        .await;

    assert_eq!(
        agent.deliver_now().await,
        DeliveryOutcome::Aborted(loupe_agent::AbortReason::NothingToSend)
    );
    let notices = stored(&durable).await;
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].caption, "Dropped message");
    assert_eq!(notices[0].severity, Severity::Error);
    assert_eq!(notices[0].parameters, Some(vec![json!("Big")]));

    assert_eq!(agent.deliver_now().await, DeliveryOutcome::Delivered);
    assert!(stored(&durable).await.is_empty());
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn memory_fallback_evicts_oldest() {
    let transport = ScriptedTransport::with_statuses([0]);
    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default().with_transport(transport.clone()),
    )
    .await;

    for n in 0..5001 {
        agent.verbose("cat", "cap", &n.to_string()).await;
    }
    assert_eq!(agent.pending_in_memory().await, 5000);

    assert_eq!(
        agent.deliver_now().await,
        DeliveryOutcome::Failed(FailureReason::Unreachable)
    );
    let body = transport.body(0);
    assert_eq!(body["logMessages"][0]["sequence"], 2);
    assert_eq!(agent.pending_in_memory().await, 5000);
}

#[tokio::test(start_paused = true)]
async fn quota_falls_back_to_memory_until_delivery_succeeds() {
    let transport = ScriptedTransport::always_ok();
    let durable = Arc::new(MemoryStore::with_quota(200));
    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_transport(transport.clone()),
    )
    .await;

    agent.information("cat", "cap", &"d".repeat(300)).await;
    assert!(agent.is_storage_full().await);
    assert_eq!(agent.pending_in_memory().await, 1);

    assert_eq!(agent.deliver_now().await, DeliveryOutcome::Delivered);
    assert!(!agent.is_storage_full().await);
    assert_eq!(agent.pending_in_memory().await, 0);
}

#[tokio::test(start_paused = true)]
async fn sequence_increases_when_session_storage_fails() {
    let durable = Arc::new(MemoryStore::new());
    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_session(Arc::new(BrokenStore))
            .without_transport(),
    )
    .await;

    for _ in 0..3 {
        agent.information("cat", "cap", "desc").await;
    }

    let sequences: Vec<i64> = stored(&durable).await.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(!agent.agent_session_id().is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_identity_is_recovered_and_attached() {
    let session = Arc::new(MemoryStore::new());
    session.set(AGENT_SESSION_ID_KEY, "agent-123").await.unwrap();
    let durable = Arc::new(MemoryStore::new());

    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_session(session)
            .without_transport(),
    )
    .await;

    let header = agent.client_session_header();
    assert_eq!(header.header_name, "loupe-agent-sessionId");
    assert_eq!(header.header_value, "agent-123");

    agent.set_session_id(Some("session-9".into())).await;
    agent.information("cat", "cap", "desc").await;

    let messages = stored(&durable).await;
    assert_eq!(messages[0].agent_session_id, "agent-123");
    assert_eq!(messages[0].session_id.as_deref(), Some("session-9"));
}

#[tokio::test(start_paused = true)]
async fn interval_reset_only_lowers() {
    // The write's own timer retries once and fails too.
    let transport = ScriptedTransport::with_statuses([0, 0]);
    let (agent, _durable) = agent_with(transport.clone()).await;

    agent.information("cat", "cap", "desc").await;
    agent.deliver_now().await;
    sleep(Duration::from_millis(600)).await;
    assert_eq!(agent.message_interval(), 100);

    assert_eq!(agent.reset_message_interval(500), 100);
    assert_eq!(agent.reset_message_interval(5), 10);
}

#[tokio::test(start_paused = true)]
async fn startup_drains_messages_from_an_earlier_run() {
    let durable = Arc::new(MemoryStore::new());
    let offline = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .without_transport(),
    )
    .await;
    offline.information("cat", "left over", "desc").await;
    offline.shutdown().await;
    drop(offline);

    let transport = ScriptedTransport::always_ok();
    let _agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_transport(transport.clone()),
    )
    .await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.request_count(), 1);
    assert!(stored(&durable).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_delivery() {
    let transport = ScriptedTransport::always_ok();
    let (agent, durable) = agent_with(transport.clone()).await;

    agent.information("cat", "cap", "desc").await;
    agent.shutdown().await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.request_count(), 0);
    assert_eq!(stored(&durable).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unhandled_errors_run_handlers_then_log() {
    let transport = ScriptedTransport::always_ok();
    let (agent, durable) = agent_with(transport).await;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    agent
        .register_error_handler(move |r| sink.lock().unwrap().push(format!("first:{}", r.message)))
        .await;
    let sink = calls.clone();
    agent
        .register_error_handler(move |r| sink.lock().unwrap().push(format!("second:{}", r.message)))
        .await;

    let report = ErrorReport::new("x is undefined")
        .with_location("https://app.example.com/main.js", 3, 7)
        .with_error(
            RawException::new("x is undefined")
                .with_name("TypeError")
                .with_stack_trace(vec!["main".into(), "render".into()]),
        );
    assert!(agent.report_unhandled_error(report).await);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["first:x is undefined", "second:x is undefined"]
    );

    let messages = stored(&durable).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].category, "Unhandled");
    assert_eq!(messages[0].caption, "TypeError");
    let exception = messages[0].exception.as_ref().unwrap();
    assert_eq!(exception.cause, "TypeError");
    assert_eq!(exception.line, Some(3));
    assert_eq!(exception.column, Some(7));
    assert_eq!(exception.stack_trace, vec!["main", "render"]);
    assert_eq!(exception.url, "https://app.example.com/main.js");

    agent.set_propagate_error(true);
    assert!(!agent.report_unhandled_error(ErrorReport::new("again")).await);
}

#[tokio::test(start_paused = true)]
async fn backend_write_error_falls_back_without_marking_storage_full() {
    let durable = FlakyStore::failing_first(1);
    let agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .without_transport(),
    )
    .await;

    agent.information("cat", "first", "desc").await;
    assert_eq!(agent.pending_in_memory().await, 1);
    assert!(!agent.is_storage_full().await);
    assert!(stored(&durable.inner).await.is_empty());

    agent.information("cat", "second", "desc").await;
    assert_eq!(agent.pending_in_memory().await, 1);
    let messages = stored(&durable.inner).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].caption, "second");
}

#[tokio::test(start_paused = true)]
async fn remaining_batches_are_sent_without_further_writes() {
    let durable = Arc::new(MemoryStore::new());
    let offline = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .without_transport(),
    )
    .await;
    for n in 0..25 {
        offline.information("cat", "backlog", &n.to_string()).await;
    }
    offline.shutdown().await;
    drop(offline);

    let transport = ScriptedTransport::always_ok();
    let _agent = Agent::with_collaborators(
        AgentConfig::default(),
        Collaborators::default()
            .with_durable(durable.clone())
            .with_transport(transport.clone()),
    )
    .await;

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.request_count(), 3);
    let sizes: Vec<usize> = (0..3)
        .map(|i| transport.body(i)["logMessages"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert!(stored(&durable).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn initial_interval_is_held_under_the_ceiling() {
    let agent = Agent::with_collaborators(
        AgentConfig::default().with_initial_interval_ms(u64::MAX),
        Collaborators::default().without_transport(),
    )
    .await;
    assert_eq!(agent.message_interval(), loupe_agent::MAX_INTERVAL_MS);

    agent.information("cat", "cap", "desc").await;
    assert_eq!(agent.pending_in_memory().await, 1);
}
