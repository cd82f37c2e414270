//! Rescheduling helpers.
//!
//! The scheduler offers no durability and no retry of its own; a caller
//! that wants "check this again later" re-registers through the schedule
//! endpoint. These helpers package that pattern for verification retries.

use chrono::{DateTime, Utc};

use gradebus_bus::{Bus, BusError};
use gradebus_types::{
    verify_address, EntityId, EntityKind, ScheduledMessage, VerifyRequest, SCHEDULE_ADDRESS,
};

/// Schedule a fresh verify of `(kind, id)` at `when`. When `reply_to` is
/// given, the scheduler forwards the eventual verification result there.
pub async fn schedule_reverify(
    bus: &Bus,
    kind: &EntityKind,
    id: EntityId,
    when: DateTime<Utc>,
    reply_to: Option<&str>,
    rpc_timeout: std::time::Duration,
) -> Result<(), BusError> {
    let payload = serde_json::to_value(VerifyRequest::new(id))
        .expect("verify request serialization is infallible");
    let mut message = ScheduledMessage::new(payload, when, verify_address(kind));
    if let Some(reply_to) = reply_to {
        message = message.with_reply_to(reply_to);
    }
    let body = serde_json::to_value(message).expect("scheduled message serialization is infallible");
    bus.request(SCHEDULE_ADDRESS, body, rpc_timeout).await.map(drop)
}
