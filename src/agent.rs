use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AbortReason, DeliveryOutcome, StoreError};
use crate::hooks::{capture_stack, ErrorReport, ErrorHookChain};
use crate::message::{resolve_agent_session_id, MessageBuilder, MessageDraft, Sequencer};
use crate::platform::{HostPlatform, PlatformDetector};
use crate::queue::{drop_notice, PersistentQueue, QueueLimits, MAX_BATCH_MESSAGES, MAX_REQUEST_SIZE, MEMORY_CAPACITY};
use crate::scheduler::{
    Coalescer, DeliveryInterval, DeliveryTimer, SharedInterval, DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS,
};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::transport::{log_endpoint, DeliveryBody, DeliveryRequest, SessionInfo, Transport};
use crate::types::{AuthHeader, ExceptionInfo, SessionHeader, Severity};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Key written and removed once to check the durable store works.
pub const STORAGE_PROBE_KEY: &str = "_loupe_storage_test_";

/// Name of the header returned by [`Agent::client_session_header`].
pub const SESSION_HEADER_NAME: &str = "loupe-agent-sessionId";

/// Category of messages logged by [`Agent::report_unhandled_error`].
pub const UNHANDLED_CATEGORY: &str = "Unhandled";

type AttemptFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Origin the agent runs under; the collector lives here unless
    /// `cors_origin` says otherwise.
    pub origin: String,
    pub cors_origin: Option<String>,
    /// Reported as the `url` of exceptions. Defaults to `origin`.
    pub location: Option<String>,
    pub auth_header: Option<AuthHeader>,
    /// When set, unhandled errors are reported as not handled.
    pub propagate_error: bool,
    pub max_request_size: usize,
    pub max_batch_messages: usize,
    pub memory_capacity: usize,
    pub initial_interval_ms: u64,
    pub interval_update_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost".to_string(),
            cors_origin: None,
            location: None,
            auth_header: None,
            propagate_error: false,
            max_request_size: MAX_REQUEST_SIZE,
            max_batch_messages: MAX_BATCH_MESSAGES,
            memory_capacity: MEMORY_CAPACITY,
            initial_interval_ms: DEFAULT_INTERVAL_MS,
            interval_update_delay: Duration::from_millis(500),
        }
    }
}

impl AgentConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origin = Some(origin.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_auth_header(mut self, header: AuthHeader) -> Self {
        self.auth_header = Some(header);
        self
    }

    pub fn with_propagate_error(mut self, propagate: bool) -> Self {
        self.propagate_error = propagate;
        self
    }

    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    pub fn with_max_batch_messages(mut self, count: usize) -> Self {
        self.max_batch_messages = count.max(1);
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity.max(1);
        self
    }

    pub fn with_initial_interval_ms(mut self, millis: u64) -> Self {
        self.initial_interval_ms = millis.clamp(DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS);
        self
    }

    pub fn with_interval_update_delay(mut self, delay: Duration) -> Self {
        self.interval_update_delay = delay;
        self
    }

    fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            memory_capacity: self.memory_capacity,
            max_request_size: self.max_request_size,
            max_batch_messages: self.max_batch_messages,
        }
    }
}

/// Capabilities supplied by the host.
pub struct Collaborators {
    /// Where messages wait for delivery. `None` keeps everything in memory.
    pub durable: Option<Arc<dyn KeyValueStore>>,
    /// Holds the sequence counter and the agent session id.
    pub session: Option<Arc<dyn KeyValueStore>>,
    /// `None` means deliveries abort until the host provides one.
    pub transport: Option<Arc<dyn Transport>>,
    pub platform: Arc<dyn PlatformDetector>,
}

impl Default for Collaborators {
    fn default() -> Self {
        #[cfg(feature = "http")]
        let transport: Option<Arc<dyn Transport>> =
            Some(Arc::new(crate::transport::HttpTransport::new()));
        #[cfg(not(feature = "http"))]
        let transport: Option<Arc<dyn Transport>> = None;

        Self {
            durable: None,
            session: Some(Arc::new(MemoryStore::new())),
            transport,
            platform: Arc::new(HostPlatform),
        }
    }
}

impl Collaborators {
    pub fn with_durable(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn with_session(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn without_transport(mut self) -> Self {
        self.transport = None;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn PlatformDetector>) -> Self {
        self.platform = platform;
        self
    }
}

struct AgentState {
    builder: MessageBuilder,
    queue: PersistentQueue,
    timer: DeliveryTimer,
    /// Debounces interval updates; carries whether the attempt failed.
    coalescer: Coalescer<bool>,
    cors_origin: Option<String>,
    auth_header: Option<AuthHeader>,
    hooks: ErrorHookChain,
}

/// Client-side log agent.
///
/// Messages are sequenced, queued and delivered in batches by a
/// self-rearming timer. Delivery attempts may overlap; entries already
/// selected by an outstanding attempt are skipped by later ones.
pub struct Agent {
    config: AgentConfig,
    me: Weak<Agent>,
    agent_session_id: String,
    transport: Option<Arc<dyn Transport>>,
    platform: Arc<dyn PlatformDetector>,
    interval: SharedInterval,
    propagate_error: AtomicBool,
    state: Mutex<AgentState>,
}

impl Agent {
    /// Agent with an in-memory session store, no durable store and the
    /// default transport.
    pub async fn new(config: AgentConfig) -> Arc<Self> {
        Self::with_collaborators(config, Collaborators::default()).await
    }

    pub async fn with_collaborators(config: AgentConfig, collaborators: Collaborators) -> Arc<Self> {
        let durable = match collaborators.durable {
            Some(store) => probe_storage(store).await,
            None => None,
        };

        let sequencer = Sequencer::new(collaborators.session.clone()).await;
        let agent_session_id = resolve_agent_session_id(collaborators.session.as_ref()).await;
        let location = config.location.clone().unwrap_or_else(|| config.origin.clone());
        let builder = MessageBuilder::new(sequencer, agent_session_id.clone(), location);

        let interval = SharedInterval::new(DeliveryInterval::from_millis(config.initial_interval_ms));
        let recorder = interval.clone();
        let coalescer = Coalescer::new(config.interval_update_delay, move |failed: bool| {
            let next = recorder.record(failed);
            debug!(interval_ms = next.millis(), failed, "Delivery interval updated");
        });

        let state = AgentState {
            builder,
            queue: PersistentQueue::new(durable, config.queue_limits()),
            timer: DeliveryTimer::new(),
            coalescer,
            cors_origin: config.cors_origin.clone(),
            auth_header: config.auth_header.clone().filter(AuthHeader::is_valid),
            hooks: ErrorHookChain::new(),
        };

        let agent = Arc::new_cyclic(|me| Agent {
            propagate_error: AtomicBool::new(config.propagate_error),
            config,
            me: me.clone(),
            agent_session_id,
            transport: collaborators.transport,
            platform: collaborators.platform,
            interval,
            state: Mutex::new(state),
        });

        // Messages left over from an earlier run go out without waiting
        // for the next write.
        {
            let mut state = agent.state.lock().await;
            agent.arm_delivery(&mut state).await;
        }

        info!(agent_session_id = %agent.agent_session_id, "Loupe agent started");
        agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent_session_id(&self) -> &str {
        &self.agent_session_id
    }

    pub async fn write(&self, draft: MessageDraft) {
        let mut state = self.state.lock().await;
        self.write_locked(&mut state, draft).await;
    }

    pub async fn verbose(&self, category: &str, caption: &str, description: &str) {
        self.write(MessageDraft::new(Severity::Verbose, category, caption, description)).await;
    }

    pub async fn information(&self, category: &str, caption: &str, description: &str) {
        self.write(MessageDraft::new(Severity::Information, category, caption, description)).await;
    }

    pub async fn warning(&self, category: &str, caption: &str, description: &str) {
        self.write(MessageDraft::new(Severity::Warning, category, caption, description)).await;
    }

    pub async fn error(&self, category: &str, caption: &str, description: &str) {
        self.write(MessageDraft::new(Severity::Error, category, caption, description)).await;
    }

    pub async fn critical(&self, category: &str, caption: &str, description: &str) {
        self.write(MessageDraft::new(Severity::Critical, category, caption, description)).await;
    }

    async fn write_locked(&self, state: &mut AgentState, draft: MessageDraft) {
        let message = state.builder.build(draft).await;
        state.queue.store(&message).await;
        self.arm_delivery(state).await;
    }

    /// Arm the delivery timer if anything is waiting.
    async fn arm_delivery(&self, state: &mut AgentState) {
        if state.queue.has_pending().await {
            self.schedule(state);
        }
    }

    fn schedule(&self, state: &mut AgentState) {
        let agent = self.me.clone();
        let attempt: AttemptFuture = Box::pin(async move {
            if let Some(agent) = agent.upgrade() {
                agent.deliver_now().await;
            }
        });
        state.timer.arm(self.interval.get().as_duration(), attempt);
    }

    /// Run one delivery attempt now.
    ///
    /// The lock is released while the request is outstanding so writes and
    /// further attempts can proceed.
    pub async fn deliver_now(&self) -> DeliveryOutcome {
        let Some(transport) = self.transport.clone() else {
            warn!("No transport available; unable to send log messages");
            return DeliveryOutcome::Aborted(AbortReason::NoTransport);
        };

        let throttled = !self.interval.get().is_default();

        let (batch, request) = {
            let mut state = self.state.lock().await;
            let selection = state.queue.select_batch(throttled).await;

            for dropped in &selection.dropped {
                let notice = drop_notice(dropped, self.config.max_request_size);
                self.write_locked(&mut state, notice).await;
            }

            let batch = selection.batch;
            if batch.is_empty() {
                return DeliveryOutcome::Aborted(AbortReason::NothingToSend);
            }

            let body = DeliveryBody {
                log_messages: &batch.messages,
                session: SessionInfo {
                    client: self.platform.detect(),
                    current_agent_session_id: self.agent_session_id.clone(),
                },
            };

            let body = match serde_json::to_string(&body) {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Unable to serialize log batch");
                    state.queue.release(&batch.keys);
                    state.queue.requeue_memory(batch.memory);
                    return DeliveryOutcome::Aborted(AbortReason::Serialization);
                }
            };

            let origin = state.cors_origin.as_deref().unwrap_or(&self.config.origin);
            let request = DeliveryRequest::new(log_endpoint(origin), body, state.auth_header.as_ref());
            (batch, request)
        };

        debug!(
            url = %request.url,
            messages = batch.messages.len(),
            has_more = batch.has_more,
            "Sending log batch"
        );
        let response = transport.send(request).await;
        let outcome = DeliveryOutcome::from_status(response.status);

        let mut state = self.state.lock().await;
        let failed = match &outcome {
            DeliveryOutcome::Failed(reason) => {
                metric_inc("loupe.delivery.failure");
                if reason.is_transient() {
                    state.queue.release(&batch.keys);
                    state.queue.requeue_memory(batch.memory);
                } else {
                    state.queue.acknowledge(&batch.keys).await;
                }
                warn!(
                    status = response.status,
                    status_text = %response.status_text,
                    reason = %reason,
                    "Failed to send log messages"
                );
                true
            }
            _ => {
                metric_inc("loupe.delivery.success");
                state.queue.acknowledge(&batch.keys).await;
                state.queue.clear_storage_full();
                false
            }
        };

        state.coalescer.submit(failed);

        if batch.has_more {
            self.schedule(&mut state);
        }

        outcome
    }

    /// Header the host can add to its own requests to tie them to this
    /// agent's session.
    pub fn client_session_header(&self) -> SessionHeader {
        SessionHeader {
            header_name: SESSION_HEADER_NAME.to_string(),
            header_value: self.agent_session_id.clone(),
        }
    }

    pub async fn set_session_id(&self, session_id: Option<String>) {
        self.state.lock().await.builder.set_session_id(session_id);
    }

    pub async fn set_cors_origin(&self, origin: Option<String>) {
        self.state.lock().await.cors_origin = origin;
    }

    /// Returns `false` and keeps the current header when either part is empty.
    pub async fn set_authorization_header(&self, header: AuthHeader) -> bool {
        if !header.is_valid() {
            warn!("Authorization header requires both a name and a value; header not set");
            return false;
        }
        self.state.lock().await.auth_header = Some(header);
        true
    }

    /// Lower the delivery interval, never below the default.
    pub fn reset_message_interval(&self, millis: u64) -> u64 {
        self.interval.lower_to(millis).millis()
    }

    pub fn message_interval(&self) -> u64 {
        self.interval.get().millis()
    }

    pub fn set_propagate_error(&self, propagate: bool) {
        self.propagate_error.store(propagate, Ordering::SeqCst);
    }

    /// Handlers run, in registration order, before the agent logs an
    /// unhandled error.
    pub async fn register_error_handler(
        &self,
        handler: impl Fn(&ErrorReport) + Send + Sync + 'static,
    ) {
        self.state.lock().await.hooks.register(handler);
    }

    /// Log an unhandled error at error severity.
    ///
    /// Returns `true` when the error counts as handled, which is the case
    /// unless propagation is switched on.
    pub async fn report_unhandled_error(&self, report: ErrorReport) -> bool {
        // Handlers run without the lock so they may call back into the agent.
        let hooks = self.state.lock().await.hooks.clone();
        hooks.dispatch(&report);

        let location = self
            .config
            .location
            .clone()
            .unwrap_or_else(|| self.config.origin.clone());

        let (cause, stack_trace) = match &report.error {
            Some(error) => {
                let cause = error
                    .name
                    .clone()
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| "Exception".to_string());
                let stack = if error.stack_trace.is_empty() {
                    capture_stack()
                } else {
                    error.stack_trace.clone()
                };
                (cause, stack)
            }
            None => (String::new(), capture_stack()),
        };

        let caption = if cause.is_empty() { report.message.clone() } else { cause.clone() };
        let exception = ExceptionInfo {
            cause,
            column: report.column,
            line: report.line,
            message: report.message,
            stack_trace,
            url: report.url.unwrap_or(location),
        };

        let draft = MessageDraft::new(Severity::Error, UNHANDLED_CATEGORY, caption, "")
            .with_exception(exception);
        self.write(draft).await;

        !self.propagate_error.load(Ordering::SeqCst)
    }

    /// Cancel the pending delivery timer and apply any pending interval
    /// update. Queued messages stay where they are.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.timer.cancel();
        state.coalescer.flush();
        debug!("Loupe agent stopped");
    }

    pub async fn pending_in_memory(&self) -> usize {
        self.state.lock().await.queue.memory_len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.queue.in_flight_len()
    }

    pub async fn is_storage_full(&self) -> bool {
        self.state.lock().await.queue.is_storage_full()
    }

    pub async fn last_sequence(&self) -> i64 {
        self.state.lock().await.builder.last_sequence()
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.queue.has_pending().await
    }
}

/// Write and remove a probe key. A store that fails either step is not
/// used for the lifetime of the agent.
async fn probe_storage(store: Arc<dyn KeyValueStore>) -> Option<Arc<dyn KeyValueStore>> {
    async fn probe(store: &dyn KeyValueStore) -> Result<(), StoreError> {
        store.set(STORAGE_PROBE_KEY, STORAGE_PROBE_KEY).await?;
        store.remove(STORAGE_PROBE_KEY).await
    }

    match probe(store.as_ref()).await {
        Ok(()) => Some(store),
        Err(e) => {
            warn!(error = %e, "Durable storage unavailable; messages will be buffered in memory");
            None
        }
    }
}
