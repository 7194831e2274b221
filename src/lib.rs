//! A client-resident log agent for the Loupe collector.
//!
//! This crate provides a **bounded, best-effort** delivery engine:
//! messages are sequenced, queued in a durable key/value store (or a
//! bounded in-memory ring when the store is unavailable) and shipped in
//! size-capped batches on an adaptive schedule.
//!
//! ## Guarantees
//! - Strictly increasing sequence numbers within an agent session
//! - Bounded memory use when durable storage is unavailable
//! - Requests never exceed the collector's maximum size
//! - At-least-once delivery, except for messages dropped as oversized
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across agent instances
//! - Coordination between agents sharing one durable store
//!
//! Logging calls never fail; problems surface as `tracing` diagnostics.

mod agent;
mod error;
mod hooks;
mod message;
mod platform;
mod queue;
mod scheduler;
mod storage;
mod transport;
mod types;

#[cfg(feature = "redis")]
mod storage_redis;

pub use agent::{
    Agent, AgentConfig, Collaborators, SESSION_HEADER_NAME, STORAGE_PROBE_KEY, UNHANDLED_CATEGORY,
};
pub use error::{AbortReason, DeliveryOutcome, FailureReason, StoreError};
pub use hooks::{capture_stack, frames_from, install_panic_hook, ErrorHandler, ErrorHookChain, ErrorReport};
pub use message::{MessageDraft, AGENT_SESSION_ID_KEY, SEQUENCE_NUMBER_KEY};
pub use platform::{HostPlatform, PlatformDetector, PlatformInfo, ScreenSize, StaticPlatform};
pub use queue::{
    MAX_BATCH_MESSAGES, MAX_REQUEST_SIZE, MEMORY_CAPACITY, MESSAGE_KEY_PREFIX, TRUNCATED_DETAILS,
};
pub use scheduler::{DeliveryInterval, DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS};
pub use storage::{KeyValueStore, MemoryStore};
pub use transport::{log_endpoint, DeliveryRequest, Transport, TransportResponse, LOG_ENDPOINT_PATH};
pub use types::{
    AuthHeader, ExceptionInfo, ExceptionInput, LogMessage, MethodSourceInfo, MethodSourceInput,
    RawException, SessionHeader, Severity,
};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "redis")]
pub use storage_redis::RedisStore;
