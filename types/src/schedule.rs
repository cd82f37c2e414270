//! Delayed-message envelope for the Timetable scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message to be dispatched once `trigger_time` has elapsed.
///
/// Owned exclusively by the scheduler from enqueue until dispatch; never
/// mutated after creation. Dispatch consumes and forwards it. When
/// `reply_to` is set, the scheduler awaits the destination's reply and
/// relays the reply body (not the original payload) to `reply_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub payload: Value,
    /// Trigger time, ISO-8601 on the wire.
    pub trigger_time: DateTime<Utc>,
    pub send_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl ScheduledMessage {
    #[must_use]
    pub fn new(payload: Value, trigger_time: DateTime<Utc>, send_to: impl Into<String>) -> Self {
        Self {
            payload,
            trigger_time,
            send_to: send_to.into(),
            reply_to: None,
        }
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}
