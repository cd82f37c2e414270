//! In-process point-to-point message bus.
//!
//! Address-keyed request/reply with bounded timeouts, modeled on the
//! event-bus contract the verification pipeline is written against: at most
//! one reply per request, no ordering guarantee across addresses, and
//! failure codes that distinguish "no handler registered" from "handler
//! executed and failed". The first is vacuous success for prerequisite
//! checks; the second is not.
//!
//! Handlers run one spawned task per delivery, so a handler awaiting a
//! request back into its own address does not deadlock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Application-level failure returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: i32,
    pub message: String,
}

impl Failure {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no handler registered at {address}")]
    NoHandler { address: String },
    #[error("request to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("recipient at {address} failed (code {code}): {message}")]
    Recipient {
        address: String,
        code: i32,
        message: String,
    },
    #[error("handler at {address} dropped the request without replying")]
    NoReply { address: String },
    #[error("duplicate handler registered at {address}")]
    DuplicateHandler { address: String },
}

type Reply = oneshot::Sender<Result<Value, Failure>>;

/// A single message delivered to a handler's inbox.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Value,
    reply: Option<Reply>,
}

impl Delivery {
    /// Whether the sender is waiting for a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Send the reply, if one is expected. A disconnected requester is not
    /// an error; the caller simply discarded the result.
    pub fn respond(self, result: Result<Value, Failure>) {
        if let Some(tx) = self.reply {
            let _ = tx.send(result);
        }
    }
}

/// Receiving half of a registered address.
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// Point-to-point message bus. Cheap to clone; clones share the handler
/// table.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    handlers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address and take ownership of its inbox.
    pub fn register(&self, address: &str) -> Result<Inbox, BusError> {
        let mut handlers = self.handlers.lock().expect("bus handler table poisoned");
        if let Some(existing) = handlers.get(address) {
            if !existing.is_closed() {
                return Err(BusError::DuplicateHandler {
                    address: address.to_string(),
                });
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        handlers.insert(address.to_string(), tx);
        Ok(rx)
    }

    fn deliver(&self, address: &str, delivery: Delivery) -> Result<(), BusError> {
        let mut handlers = self.handlers.lock().expect("bus handler table poisoned");
        let Some(tx) = handlers.get(address) else {
            return Err(BusError::NoHandler {
                address: address.to_string(),
            });
        };
        if tx.send(delivery).is_err() {
            // Inbox dropped; the registration is stale.
            handlers.remove(address);
            return Err(BusError::NoHandler {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    /// Fire-and-forget send.
    pub fn send(&self, address: &str, payload: Value) -> Result<(), BusError> {
        self.deliver(
            address,
            Delivery {
                payload,
                reply: None,
            },
        )
    }

    /// Request/reply with a bounded timeout.
    pub async fn request(
        &self,
        address: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let (tx, rx) = oneshot::channel();
        self.deliver(
            address,
            Delivery {
                payload,
                reply: Some(tx),
            },
        )?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(BusError::Timeout {
                address: address.to_string(),
                timeout,
            }),
            Ok(Err(_)) => Err(BusError::NoReply {
                address: address.to_string(),
            }),
            Ok(Ok(Err(failure))) => Err(BusError::Recipient {
                address: address.to_string(),
                code: failure.code,
                message: failure.message,
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Register an address and spawn a task draining its inbox through an
    /// async handler. Each delivery runs in its own task so a handler may
    /// issue requests back into the bus (including its own address) while
    /// later deliveries proceed.
    pub fn serve<F, Fut>(
        &self,
        address: &str,
        handler: F,
    ) -> Result<tokio::task::JoinHandle<()>, BusError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        let mut inbox = self.register(address)?;
        let address = address.to_string();
        let handler = Arc::new(handler);
        Ok(tokio::spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                let handler = Arc::clone(&handler);
                let address = address.clone();
                tokio::spawn(async move {
                    let Delivery { payload, reply } = delivery;
                    let result = handler(payload).await;
                    match reply {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => {
                            if let Err(failure) = result {
                                tracing::warn!(
                                    "unreplied handler failure at {address}: \
                                     (code {}) {}",
                                    failure.code,
                                    failure.message
                                );
                            }
                        }
                    }
                });
            }
        }))
    }
}
