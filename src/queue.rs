//! Durable message queue with an in-memory fallback, and batch selection.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::MessageDraft;
use crate::storage::KeyValueStore;
use crate::types::{Batch, LogMessage, QueueEntry, Severity};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Prefix of every durable message key.
pub const MESSAGE_KEY_PREFIX: &str = "Loupe-message-";

/// Capacity of the in-memory fallback buffer.
pub const MEMORY_CAPACITY: usize = 5000;

/// Largest serialized request the collector accepts, in bytes.
pub const MAX_REQUEST_SIZE: usize = 204_800;

/// Most durable messages sent in one batch.
pub const MAX_BATCH_MESSAGES: usize = 10;

/// Room kept for the envelope of a "Dropped message" diagnostic.
pub const DROP_NOTICE_HEADROOM: usize = 400;

/// Replacement for details that pushed a message over the size limit.
pub const TRUNCATED_DETAILS: &str =
    r#"{"message":"User supplied details truncated as log message exceeded maximum size."}"#;

const DROP_NOTICE_CATEGORY: &str = "Loupe";
const DROP_NOTICE_CAPTION: &str = "Dropped message";

/// Caption and description of a message removed by the oversize policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedMessage {
    pub caption: String,
    pub description: String,
}

/// Result of one batch selection.
#[derive(Debug, Default)]
pub struct Selection {
    pub batch: Batch,
    /// Messages that could not be shrunk under the size limit.
    pub dropped: Vec<DroppedMessage>,
}

enum Oversize {
    Fits(QueueEntry),
    Dropped(DroppedMessage),
}

/// Queue limits.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub memory_capacity: usize,
    pub max_request_size: usize,
    pub max_batch_messages: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            memory_capacity: MEMORY_CAPACITY,
            max_request_size: MAX_REQUEST_SIZE,
            max_batch_messages: MAX_BATCH_MESSAGES,
        }
    }
}

/// Message queue owned by one agent.
///
/// Messages go to the durable store under `Loupe-message-<uuid>` when it is
/// available; otherwise they land in a bounded ring that evicts its oldest
/// entry when full. The in-flight set is local to this process, so two
/// agents sharing one durable store may select the same entry.
pub struct PersistentQueue {
    durable: Option<Arc<dyn KeyValueStore>>,
    storage_full: bool,
    memory: VecDeque<String>,
    in_flight: HashSet<String>,
    limits: QueueLimits,
}

impl PersistentQueue {
    pub fn new(durable: Option<Arc<dyn KeyValueStore>>, limits: QueueLimits) -> Self {
        Self {
            durable,
            storage_full: false,
            memory: VecDeque::new(),
            in_flight: HashSet::new(),
            limits,
        }
    }

    pub fn is_storage_full(&self) -> bool {
        self.storage_full
    }

    /// Called after a successful delivery.
    pub fn clear_storage_full(&mut self) {
        if self.storage_full {
            debug!("Durable storage writes resumed");
        }
        self.storage_full = false;
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub async fn store(&mut self, message: &LogMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unable to serialize log message; message discarded");
                return;
            }
        };

        if let Some(durable) = self.durable.as_ref().filter(|_| !self.storage_full) {
            let key = format!("{}{}", MESSAGE_KEY_PREFIX, Uuid::new_v4());
            match durable.set(&key, &payload).await {
                Ok(()) => {
                    metric_inc("loupe.queue.stored");
                    return;
                }
                Err(StoreError::QuotaExceeded) => {
                    warn!("Durable storage quota reached; buffering messages in memory");
                    self.storage_full = true;
                }
                Err(e) => {
                    warn!(error = %e, "Error occurred trying to add message to durable storage");
                }
            }
        }

        metric_inc("loupe.queue.memory_fallback");
        self.push_memory(payload);
    }

    fn push_memory(&mut self, payload: String) {
        if self.memory.len() >= self.limits.memory_capacity {
            self.memory.pop_front();
            metric_inc("loupe.queue.memory_evicted");
        }
        self.memory.push_back(payload);
    }

    /// Put the memory-resident part of a failed batch back at the head of
    /// the buffer, ahead of anything written since.
    pub fn requeue_memory(&mut self, payloads: Vec<String>) {
        for payload in payloads.into_iter().rev() {
            if self.memory.len() >= self.limits.memory_capacity {
                // The buffer refilled meanwhile; the newest arrivals win.
                break;
            }
            self.memory.push_front(payload);
        }
    }

    /// Whether anything is waiting, including entries currently in flight.
    pub async fn has_pending(&self) -> bool {
        if !self.memory.is_empty() {
            return true;
        }

        let Some(durable) = &self.durable else {
            return false;
        };

        match durable.keys().await {
            Ok(keys) => keys.iter().any(|k| k.starts_with(MESSAGE_KEY_PREFIX)),
            Err(e) => {
                debug!(error = %e, "Unable to list durable storage");
                false
            }
        }
    }

    /// Choose the next batch.
    ///
    /// `throttled` is set while deliveries are failing; only one durable
    /// message is then selected.
    pub async fn select_batch(&mut self, throttled: bool) -> Selection {
        let mut selection = Selection::default();
        let mut total = 0usize;

        self.select_memory(&mut selection, &mut total);

        let mut candidates = self.durable_candidates().await;
        candidates.sort_by(|a, b| order_key(&b.message).cmp(&order_key(&a.message)));

        if candidates.len() > self.limits.max_batch_messages {
            selection.batch.has_more = true;
            candidates.truncate(self.limits.max_batch_messages);
        }

        if throttled && candidates.len() > 1 {
            selection.batch.has_more = true;
            candidates.truncate(1);
        }

        for candidate in candidates {
            let entry = match self.apply_oversize_policy(candidate).await {
                Oversize::Fits(entry) => entry,
                Oversize::Dropped(dropped) => {
                    selection.dropped.push(dropped);
                    continue;
                }
            };

            if total + entry.size > self.limits.max_request_size {
                break;
            }
            total += entry.size;

            if let Some(key) = entry.key {
                self.in_flight.insert(key.clone());
                selection.batch.keys.push(key);
            }
            selection.batch.messages.push(entry.message);
        }

        selection
    }

    fn select_memory(&mut self, selection: &mut Selection, total: &mut usize) {
        let mut pending: VecDeque<String> = self.memory.drain(..).collect();

        while let Some(payload) = pending.pop_front() {
            let message = match serde_json::from_str::<LogMessage>(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable buffered message");
                    continue;
                }
            };

            let entry = QueueEntry {
                key: None,
                size: payload.len(),
                message,
            };

            let entry = match shrink(entry, self.limits.max_request_size) {
                Oversize::Fits(entry) => entry,
                Oversize::Dropped(dropped) => {
                    metric_inc("loupe.batch.dropped");
                    selection.dropped.push(dropped);
                    continue;
                }
            };

            if *total + entry.size > self.limits.max_request_size {
                pending.push_front(payload);
                selection.batch.has_more = true;
                break;
            }
            *total += entry.size;

            selection.batch.memory.push(payload);
            selection.batch.messages.push(entry.message);
        }

        // Whatever did not fit goes back in its original order.
        self.memory = pending;
    }

    async fn durable_candidates(&mut self) -> Vec<QueueEntry> {
        let Some(durable) = self.durable.clone() else {
            return Vec::new();
        };

        let keys = match durable.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Unable to list durable storage");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for key in keys {
            if !key.starts_with(MESSAGE_KEY_PREFIX) || self.in_flight.contains(&key) {
                continue;
            }

            let payload = match durable.get(&key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Unable to read stored message");
                    continue;
                }
            };

            match serde_json::from_str::<LogMessage>(&payload) {
                Ok(message) => candidates.push(QueueEntry {
                    key: Some(key),
                    size: payload.len(),
                    message,
                }),
                Err(e) => {
                    warn!(key = %key, error = %e, "Removing unreadable stored message");
                    self.remove_keys(std::slice::from_ref(&key)).await;
                }
            }
        }

        candidates
    }

    async fn apply_oversize_policy(&mut self, entry: QueueEntry) -> Oversize {
        let key = entry.key.clone();
        let outcome = shrink(entry, self.limits.max_request_size);

        if let (Oversize::Dropped(_), Some(key)) = (&outcome, key) {
            metric_inc("loupe.batch.dropped");
            self.remove_keys(&[key]).await;
        }
        outcome
    }

    /// Delete delivered or rejected messages and release their keys.
    pub async fn acknowledge(&mut self, keys: &[String]) {
        self.remove_keys(keys).await;
        self.release(keys);
    }

    /// Release keys so a later attempt can select them again.
    pub fn release(&mut self, keys: &[String]) {
        for key in keys {
            self.in_flight.remove(key);
        }
    }

    async fn remove_keys(&self, keys: &[String]) {
        let Some(durable) = &self.durable else {
            return;
        };

        for key in keys {
            if let Err(e) = durable.remove(key).await {
                warn!(key = %key, error = %e, "Unable to remove message from durable storage");
            }
        }
    }
}

// Most recent first; unparseable timestamps sort last.
fn order_key(message: &LogMessage) -> (Option<DateTime<FixedOffset>>, i64) {
    (
        DateTime::parse_from_rfc3339(&message.time_stamp).ok(),
        message.sequence,
    )
}

fn serialized_len(message: &LogMessage) -> usize {
    serde_json::to_string(message).map(|s| s.len()).unwrap_or(usize::MAX)
}

/// Truncate details when that is enough to fit; otherwise drop.
fn shrink(mut entry: QueueEntry, max_request_size: usize) -> Oversize {
    if entry.size <= max_request_size {
        return Oversize::Fits(entry);
    }

    if entry.message.details.is_some() {
        let original = entry.message.details.replace(TRUNCATED_DETAILS.to_string());
        let size = serialized_len(&entry.message);
        if size <= max_request_size {
            debug!(sequence = entry.message.sequence, "Truncated oversized message details");
            entry.size = size;
            return Oversize::Fits(entry);
        }
        entry.message.details = original;
    }

    warn!(
        sequence = entry.message.sequence,
        size = entry.size,
        "Dropping message that exceeds the maximum request size"
    );
    Oversize::Dropped(DroppedMessage {
        caption: entry.message.caption,
        description: entry.message.description,
    })
}

/// Diagnostic written in place of a dropped message.
///
/// Caller text is quoted only while it leaves room for the diagnostic's
/// own envelope.
pub fn drop_notice(dropped: &DroppedMessage, max_request_size: usize) -> MessageDraft {
    let budget = max_request_size.saturating_sub(DROP_NOTICE_HEADROOM);
    let caption_len = dropped.caption.len();
    let description_len = dropped.description.len();

    let (description, parameters) = if caption_len + description_len < budget {
        (
            "Message was dropped as its size exceeded our max request size. Caption was {0} and description {1}",
            Some(vec![
                Value::String(dropped.caption.clone()),
                Value::String(dropped.description.clone()),
            ]),
        )
    } else if caption_len < budget {
        (
            "Message was dropped as its size exceeded our max request size. Caption was {0}",
            Some(vec![Value::String(dropped.caption.clone())]),
        )
    } else {
        (
            "Message was dropped as its size exceeded our max request size.\nUnable to log caption or description as they exceed max request size",
            None,
        )
    };

    let draft = MessageDraft::new(
        Severity::Error,
        DROP_NOTICE_CATEGORY,
        DROP_NOTICE_CAPTION,
        description,
    );
    match parameters {
        Some(parameters) => draft.with_parameters(parameters),
        None => draft,
    }
}
