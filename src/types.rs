use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a log message.
///
/// Serialized as the numeric code the Loupe collector expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
}

impl Severity {
    pub fn code(self) -> u8 {
        match self {
            Severity::Critical => 1,
            Severity::Error => 2,
            Severity::Warning => 4,
            Severity::Information => 8,
            Severity::Verbose => 16,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Severity::Critical),
            2 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            8 => Some(Severity::Information),
            16 => Some(Severity::Verbose),
            _ => None,
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Severity::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown severity code {}", code)))
    }
}

/// Canonical exception record as sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub cause: String,
    pub column: Option<u32>,
    pub line: Option<u32>,
    pub message: String,
    pub stack_trace: Vec<String>,
    pub url: String,
}

/// An error as the host application saw it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawException {
    /// Error type name, e.g. `"TypeError"`.
    pub name: Option<String>,
    pub message: String,
    pub line_number: Option<u32>,
    pub column_number: Option<u32>,
    pub stack_trace: Vec<String>,
}

impl RawException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Capture a Rust error, flattening its source chain into the stack.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack_trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack_trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            name: None,
            message: error.to_string(),
            line_number: None,
            column_number: None,
            stack_trace,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line_number = Some(line);
        self.column_number = Some(column);
        self
    }

    pub fn with_stack_trace(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = frames;
        self
    }
}

/// Exception argument accepted by the message builder.
///
/// The variant is decided once, at the boundary, and never re-inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionInput {
    Raw(RawException),
    Text(String),
    Canonical(ExceptionInfo),
}

impl From<RawException> for ExceptionInput {
    fn from(value: RawException) -> Self {
        ExceptionInput::Raw(value)
    }
}

impl From<ExceptionInfo> for ExceptionInput {
    fn from(value: ExceptionInfo) -> Self {
        ExceptionInput::Canonical(value)
    }
}

impl From<String> for ExceptionInput {
    fn from(value: String) -> Self {
        ExceptionInput::Text(value)
    }
}

impl From<&str> for ExceptionInput {
    fn from(value: &str) -> Self {
        ExceptionInput::Text(value.to_string())
    }
}

/// Where in the host's code a message was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSourceInfo {
    pub file: Option<String>,
    pub method: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl MethodSourceInfo {
    pub fn new(file: impl Into<String>, method: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: Some(file.into()),
            method: Some(method.into()),
            line: Some(line),
            column: Some(column),
        }
    }
}

/// Method source argument: canonical, or a loosely shaped JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodSourceInput {
    Canonical(MethodSourceInfo),
    Raw(Value),
}

impl From<MethodSourceInfo> for MethodSourceInput {
    fn from(value: MethodSourceInfo) -> Self {
        MethodSourceInput::Canonical(value)
    }
}

impl From<Value> for MethodSourceInput {
    fn from(value: Value) -> Self {
        MethodSourceInput::Raw(value)
    }
}

/// A fully built, sequenced log message.
///
/// This is both the stored envelope and the element of the wire body's
/// `logMessages` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub severity: Severity,
    pub category: String,
    pub caption: String,
    pub description: String,
    pub parameters: Option<Vec<Value>>,
    pub details: Option<String>,
    pub exception: Option<ExceptionInfo>,
    pub method_source_info: Option<MethodSourceInfo>,
    pub time_stamp: String,
    pub sequence: i64,
    pub agent_session_id: String,
    pub session_id: Option<String>,
}

/// A queued message together with where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Durable storage key; `None` for memory-resident entries.
    pub key: Option<String>,
    pub message: LogMessage,
    /// Serialized length in bytes.
    pub size: usize,
}

/// Messages chosen for one delivery attempt.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub messages: Vec<LogMessage>,
    /// Durable keys of the selected messages, now in flight.
    pub keys: Vec<String>,
    /// Serialized memory-resident messages carried by this batch,
    /// returned to the memory buffer if the attempt fails transiently.
    pub memory: Vec<String>,
    pub has_more: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Custom header attached to every delivery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHeader {
    pub name: String,
    pub value: String,
}

impl AuthHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }
}

/// Header the host can attach to its own requests to correlate them
/// with this agent's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub header_name: String,
    pub header_value: String,
}
