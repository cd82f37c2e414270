//! Delay scheduler.
//!
//! Holds a time-ordered queue of pending messages and, on a periodic tick,
//! dispatches everything whose trigger time has elapsed. Exposes a
//! `schedule` endpoint on the bus; messages already due at schedule time
//! dispatch immediately instead of waiting for the next tick.
//!
//! Each item goes from pending to dispatched exactly once: the queue mutex
//! serializes pops, so overlapping ticks cannot double-dispatch. Delivery
//! is at-most-once and non-durable; a caller that needs the message to
//! survive a restart re-registers it on startup.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use gradebus_bus::{Bus, BusError, Failure};
use gradebus_types::{ScheduledMessage, SCHEDULE_ADDRESS};

use crate::codes;

struct QueueItem {
    message: ScheduledMessage,
    /// Insertion order; breaks trigger-time ties deterministically.
    seq: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // BinaryHeap is a max-heap; reverse so the earliest item is at the top.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.message.trigger_time, other.seq).cmp(&(self.message.trigger_time, self.seq))
    }
}

/// The delay scheduler.
pub struct Timetable {
    bus: Bus,
    queue: Mutex<BinaryHeap<QueueItem>>,
    seq: AtomicU64,
    rpc_timeout: Duration,
}

impl Timetable {
    #[must_use]
    pub fn new(bus: Bus, rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            rpc_timeout,
        })
    }

    /// Register the `schedule` endpoint and start the periodic tick.
    pub fn spawn(self: &Arc<Self>, tick_interval: Duration) -> Result<(), BusError> {
        let this = Arc::clone(self);
        self.bus.serve(SCHEDULE_ADDRESS, move |payload| {
            let this = Arc::clone(&this);
            async move { this.handle_schedule(payload).await }
        })?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // The first tick of `interval` fires immediately; skip it so
            // dispatch starts one interval in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.run_due(Utc::now()).await;
            }
        });

        Ok(())
    }

    /// Schedule endpoint handler. Past-due messages dispatch inline before
    /// the acknowledgement is sent.
    async fn handle_schedule(&self, payload: Value) -> Result<Value, Failure> {
        let message: ScheduledMessage = serde_json::from_value(payload).map_err(|e| {
            Failure::new(codes::BAD_REQUEST, format!("malformed schedule request: {e}"))
        })?;

        let now = Utc::now();
        tracing::trace!("schedule request for {} at {}", message.send_to, message.trigger_time);
        if message.trigger_time <= now {
            self.dispatch(message).await;
            return Ok(json!({ "scheduled": true, "dispatched": true }));
        }

        self.enqueue(message);
        Ok(json!({ "scheduled": true, "dispatched": false }))
    }

    /// Enqueue without the immediate-dispatch shortcut. Used directly by
    /// in-process callers; the endpoint goes through [`handle_schedule`].
    pub fn enqueue(&self, message: ScheduledMessage) {
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        self.queue
            .lock()
            .expect("timetable queue poisoned")
            .push(QueueItem { message, seq });
    }

    /// Pending message count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().expect("timetable queue poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch every queued message whose trigger time is at or before
    /// `now`, earliest first. The queue is only ever popped from the front;
    /// the first not-yet-due item stops the drain.
    pub async fn run_due(&self, now: DateTime<Utc>) {
        loop {
            let due = {
                let mut queue = self.queue.lock().expect("timetable queue poisoned");
                match queue.peek() {
                    Some(item) if item.message.trigger_time <= now => {
                        queue.pop().map(|item| item.message)
                    }
                    _ => None,
                }
            };
            match due {
                Some(message) => self.dispatch(message).await,
                None => return,
            }
        }
    }

    /// Consume-and-forward dispatch. Failures are logged and swallowed: the
    /// scheduler offers at-most-once delivery, and one bad destination must
    /// not stall the remaining due items.
    async fn dispatch(&self, message: ScheduledMessage) {
        let ScheduledMessage {
            payload,
            trigger_time: _,
            send_to,
            reply_to,
        } = message;
        match reply_to {
            None => {
                if let Err(e) = self.bus.send(&send_to, payload) {
                    tracing::warn!("scheduled send to {send_to} failed: {e}");
                }
            }
            Some(reply_to) => match self.bus.request(&send_to, payload, self.rpc_timeout).await {
                Ok(reply) => {
                    if let Err(e) = self.bus.send(&reply_to, reply) {
                        tracing::warn!("forwarding reply from {send_to} to {reply_to} failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!("scheduled request to {send_to} failed: {e}");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPC: Duration = Duration::from_secs(2);

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn tick_before_trigger_dispatches_nothing() {
        let bus = Bus::new();
        let mut inbox = bus.register("dest").unwrap();
        let timetable = Timetable::new(bus, RPC);

        timetable.enqueue(ScheduledMessage::new(
            json!({"n": 1}),
            at("2026-01-01T00:01:00Z"),
            "dest",
        ));
        timetable.run_due(at("2026-01-01T00:00:59Z")).await;

        assert_eq!(timetable.len(), 1);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn tick_at_or_after_trigger_dispatches_exactly_once() {
        let bus = Bus::new();
        let mut inbox = bus.register("dest").unwrap();
        let timetable = Timetable::new(bus, RPC);

        timetable.enqueue(ScheduledMessage::new(
            json!({"n": 1}),
            at("2026-01-01T00:01:00Z"),
            "dest",
        ));
        timetable.run_due(at("2026-01-01T00:01:00Z")).await;
        timetable.run_due(at("2026-01-01T00:02:00Z")).await;

        assert!(timetable.is_empty());
        assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": 1}));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_tick_dispatches_due_items_in_time_order() {
        let bus = Bus::new();
        let mut inbox = bus.register("dest").unwrap();
        let timetable = Timetable::new(bus, RPC);

        // Enqueued out of order; the later time first.
        timetable.enqueue(ScheduledMessage::new(
            json!({"n": 2}),
            at("2026-01-01T00:02:00Z"),
            "dest",
        ));
        timetable.enqueue(ScheduledMessage::new(
            json!({"n": 1}),
            at("2026-01-01T00:01:00Z"),
            "dest",
        ));
        timetable.run_due(at("2026-01-01T00:05:00Z")).await;

        assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": 1}));
        assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn equal_trigger_times_dispatch_in_insertion_order() {
        let bus = Bus::new();
        let mut inbox = bus.register("dest").unwrap();
        let timetable = Timetable::new(bus, RPC);

        for n in 1..=3 {
            timetable.enqueue(ScheduledMessage::new(
                json!({"n": n}),
                at("2026-01-01T00:01:00Z"),
                "dest",
            ));
        }
        timetable.run_due(at("2026-01-01T00:01:00Z")).await;

        for n in 1..=3 {
            assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": n}));
        }
    }

    #[tokio::test]
    async fn reply_forwarding_relays_the_reply_not_the_payload() {
        let bus = Bus::new();
        bus.serve("dest", |payload| async move {
            Ok(json!({"reply_for": payload["n"]}))
        })
        .unwrap();
        let mut reply_inbox = bus.register("reply_sink").unwrap();
        let timetable = Timetable::new(bus, RPC);

        timetable.enqueue(
            ScheduledMessage::new(json!({"n": 7}), at("2026-01-01T00:01:00Z"), "dest")
                .with_reply_to("reply_sink"),
        );
        timetable.run_due(at("2026-01-01T00:01:00Z")).await;

        let forwarded = reply_inbox.recv().await.unwrap();
        assert_eq!(forwarded.payload, json!({"reply_for": 7}));
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_stall_remaining_items() {
        let bus = Bus::new();
        let mut inbox = bus.register("alive").unwrap();
        let timetable = Timetable::new(bus, RPC);

        timetable.enqueue(ScheduledMessage::new(
            json!({}),
            at("2026-01-01T00:01:00Z"),
            "nobody_home",
        ));
        timetable.enqueue(ScheduledMessage::new(
            json!({"n": 1}),
            at("2026-01-01T00:02:00Z"),
            "alive",
        ));
        timetable.run_due(at("2026-01-01T00:05:00Z")).await;

        assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": 1}));
        assert!(timetable.is_empty());
    }

    #[tokio::test]
    async fn past_due_schedule_request_dispatches_immediately() {
        let bus = Bus::new();
        let mut inbox = bus.register("dest").unwrap();
        let timetable = Timetable::new(bus.clone(), RPC);

        let message = ScheduledMessage::new(
            json!({"n": 1}),
            at("2020-01-01T00:00:00Z"),
            "dest",
        );
        let ack = timetable
            .handle_schedule(serde_json::to_value(message).unwrap())
            .await
            .unwrap();

        assert_eq!(ack["dispatched"], json!(true));
        assert!(timetable.is_empty());
        assert_eq!(inbox.try_recv().unwrap().payload, json!({"n": 1}));
    }
}
