use std::fmt;

use thiserror::Error;

/// Errors raised by a [`KeyValueStore`](crate::KeyValueStore) backend.
///
/// None of these ever reach the caller of a logging method; the agent
/// degrades to its in-memory buffer or logs a diagnostic instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the write because it ran out of space.
    /// The agent stops writing durably until a delivery succeeds.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// The backend could not be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Final outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Aborted(AbortReason),
    Failed(FailureReason),
}

impl DeliveryOutcome {
    /// Classify a collector response status.
    pub fn from_status(status: u16) -> Self {
        if (200..=204).contains(&status) {
            DeliveryOutcome::Delivered
        } else {
            DeliveryOutcome::Failed(FailureReason::from_status(status))
        }
    }
}

/// Reasons an attempt ended *without* an HTTP exchange.
/// The delivery interval is never touched for these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Nothing was queued or every candidate was dropped.
    NothingToSend,

    /// The host offers no transport.
    NoTransport,

    /// The request body could not be serialized.
    Serialization,
}

/// Reasons the collector did not acknowledge a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No response at all (status 0).
    Unreachable,

    /// Credentials were rejected (401).
    Unauthorized,

    /// The collector failed while handling the batch (5xx).
    ServerError(u16),

    /// The collector refused the batch itself.
    Rejected(u16),
}

impl FailureReason {
    pub fn from_status(status: u16) -> Self {
        match status {
            0 => FailureReason::Unreachable,
            401 => FailureReason::Unauthorized,
            500..=599 => FailureReason::ServerError(status),
            other => FailureReason::Rejected(other),
        }
    }

    /// Transient failures keep their messages queued for a later attempt;
    /// permanent rejections delete them.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FailureReason::Rejected(_))
    }

    pub fn status(&self) -> u16 {
        match self {
            FailureReason::Unreachable => 0,
            FailureReason::Unauthorized => 401,
            FailureReason::ServerError(status) | FailureReason::Rejected(status) => *status,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Unreachable =>
                write!(f, "collector unreachable"),
            FailureReason::Unauthorized =>
                write!(f, "authorization rejected"),
            FailureReason::ServerError(status) =>
                write!(f, "collector error (status {})", status),
            FailureReason::Rejected(status) =>
                write!(f, "batch rejected (status {})", status),
        }
    }
}
