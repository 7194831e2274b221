//! Message construction: argument normalization, sequencing and timestamps.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::KeyValueStore;
use crate::types::{
    ExceptionInfo, ExceptionInput, LogMessage, MethodSourceInfo, MethodSourceInput, Severity,
};

/// Session-store key holding the last allocated sequence number.
pub const SEQUENCE_NUMBER_KEY: &str = "LoupeSequenceNumber";

/// Session-store key holding the agent session id.
pub const AGENT_SESSION_ID_KEY: &str = "LoupeAgentSessionId";

/// Caller input for one log message, before normalization.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub severity: Severity,
    pub category: String,
    pub caption: String,
    pub description: String,
    pub parameters: Option<Vec<Value>>,
    pub exception: Option<ExceptionInput>,
    /// Free-form details; anything other than a JSON string is serialized.
    pub details: Option<Value>,
    pub method_source: Option<MethodSourceInput>,
}

impl MessageDraft {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        caption: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            caption: caption.into(),
            description: description.into(),
            parameters: None,
            exception: None,
            details: None,
            method_source: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_exception(mut self, exception: impl Into<ExceptionInput>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_method_source(mut self, source: impl Into<MethodSourceInput>) -> Self {
        self.method_source = Some(source.into());
        self
    }
}

/// Allocates strictly increasing sequence numbers.
///
/// The counter is mirrored into the session store when one is available.
/// The in-memory value always wins when it is ahead of the stored one, so a
/// failed write never makes numbers go backwards.
pub struct Sequencer {
    store: Option<Arc<dyn KeyValueStore>>,
    current: i64,
}

impl Sequencer {
    pub async fn new(store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let mut sequencer = Self { store, current: 0 };
        sequencer.current = sequencer.read().await.max(0);
        sequencer
    }

    /// Last allocated number as seen by this instance.
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Read the persisted counter. `-1` means it cannot be determined.
    pub async fn read(&self) -> i64 {
        let Some(store) = &self.store else {
            return -1;
        };

        match store.get(SEQUENCE_NUMBER_KEY).await {
            Ok(Some(value)) => match value.trim().parse::<i64>() {
                Ok(number) => number,
                Err(_) => {
                    warn!(value = %value, "Stored sequence number is not a number");
                    -1
                }
            },
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Unable to retrieve sequence number from session storage");
                -1
            }
        }
    }

    pub async fn next(&mut self) -> i64 {
        if self.store.is_some() {
            let mut stored = self.read().await;
            if stored < self.current {
                stored = self.current;
            }

            if stored != -1 {
                stored += 1;
                if self.persist(stored).await {
                    self.current = stored;
                    return stored;
                }
            }
        }

        self.current += 1;
        self.current
    }

    async fn persist(&self, number: i64) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match store.set(SEQUENCE_NUMBER_KEY, &number.to_string()).await {
            Ok(()) => true,
            Err(StoreError::QuotaExceeded) => {
                debug!("Session storage full; sequence number kept in memory");
                false
            }
            Err(e) => {
                warn!(error = %e, "Unable to store sequence number");
                false
            }
        }
    }
}

/// Recover the agent session id from the session store, or mint one.
pub async fn resolve_agent_session_id(store: Option<&Arc<dyn KeyValueStore>>) -> String {
    let Some(store) = store else {
        return Uuid::new_v4().to_string();
    };

    match store.get(AGENT_SESSION_ID_KEY).await {
        Ok(Some(id)) if !id.is_empty() => return id,
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Unable to retrieve agent session id from session storage"),
    }

    let id = Uuid::new_v4().to_string();
    match store.set(AGENT_SESSION_ID_KEY, &id).await {
        Ok(()) | Err(StoreError::QuotaExceeded) => {}
        Err(e) => warn!(error = %e, "Unable to store agent session id in session storage"),
    }
    id
}

/// Format as `YYYY-MM-DDTHH:mm:ss.SSS±HH:MM`.
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

pub fn local_timestamp() -> String {
    format_timestamp(&Local::now())
}

pub fn normalize_exception(input: ExceptionInput, location: &str) -> ExceptionInfo {
    match input {
        ExceptionInput::Canonical(info) => info,
        ExceptionInput::Text(message) => ExceptionInfo {
            cause: String::new(),
            column: None,
            line: None,
            message,
            stack_trace: Vec::new(),
            url: location.to_string(),
        },
        ExceptionInput::Raw(raw) => ExceptionInfo {
            cause: String::new(),
            column: raw.column_number.filter(|n| *n != 0),
            line: raw.line_number.filter(|n| *n != 0),
            message: raw.message,
            stack_trace: raw.stack_trace,
            url: location.to_string(),
        },
    }
}

pub fn normalize_details(details: Value) -> Option<String> {
    match details {
        Value::Null => None,
        Value::String(text) => Some(text),
        structured => Some(structured.to_string()),
    }
}

pub fn normalize_method_source(input: MethodSourceInput) -> MethodSourceInfo {
    match input {
        MethodSourceInput::Canonical(info) => info,
        MethodSourceInput::Raw(value) => MethodSourceInfo {
            file: text_field(&value, "file"),
            method: text_field(&value, "method"),
            line: number_field(&value, "line"),
            column: number_field(&value, "column"),
        },
    }
}

// Empty strings and zeroes count as absent.
fn text_field(value: &Value, name: &str) -> Option<String> {
    value
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number_field(value: &Value, name: &str) -> Option<u32> {
    value
        .get(name)
        .and_then(Value::as_u64)
        .filter(|n| *n != 0)
        .and_then(|n| u32::try_from(n).ok())
}

/// Turns drafts into sequenced, timestamped [`LogMessage`]s.
pub struct MessageBuilder {
    sequencer: Sequencer,
    agent_session_id: String,
    session_id: Option<String>,
    location: String,
}

impl MessageBuilder {
    pub fn new(sequencer: Sequencer, agent_session_id: String, location: String) -> Self {
        Self {
            sequencer,
            agent_session_id,
            session_id: None,
            location,
        }
    }

    pub fn agent_session_id(&self) -> &str {
        &self.agent_session_id
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub fn last_sequence(&self) -> i64 {
        self.sequencer.current()
    }

    pub async fn build(&mut self, draft: MessageDraft) -> LogMessage {
        let sequence = self.sequencer.next().await;
        let time_stamp = local_timestamp();

        LogMessage {
            severity: draft.severity,
            category: draft.category,
            caption: draft.caption,
            description: draft.description,
            parameters: draft.parameters,
            details: draft.details.and_then(normalize_details),
            exception: draft
                .exception
                .map(|e| normalize_exception(e, &self.location)),
            method_source_info: draft.method_source.map(normalize_method_source),
            time_stamp,
            sequence,
            agent_session_id: self.agent_session_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}
