//! Reply correlator: matches replies to the requests that asked for them.
//!
//! Each outstanding request owns one slot keyed by a reply id minted from the
//! connection prefix and a monotonically increasing sequence. The receive
//! path fills exactly that slot; nobody else is woken.
//!
//! Slot lifecycle: `issued -> replied | timed-out | shut-down`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use homebus_domain::error::BusError;
use homebus_domain::response::Response;

#[derive(Default)]
struct Table {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Value>>,
}

/// Table of pending replies for one connection.
pub struct Correlator {
    prefix: String,
    next: AtomicU64,
    table: Mutex<Table>,
}

impl Correlator {
    /// Create a correlator minting reply ids as `<prefix><seq>`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `reply_id` belongs to this correlator's namespace.
    #[must_use]
    pub fn owns(&self, reply_id: &str) -> bool {
        reply_id.starts_with(&self.prefix)
    }

    /// Reserve a slot for a new request.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Shutdown`] once [`close`](Self::close) was called.
    pub fn register(self: &Arc<Self>) -> Result<PendingReply, BusError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(BusError::Shutdown);
        }
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}{seq}", self.prefix);
        table.waiters.insert(id.clone(), tx);
        drop(table);

        Ok(PendingReply {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand `payload` to the request waiting on `reply_id`.
    ///
    /// Returns `false` when nobody waits for it anymore (late or foreign
    /// reply); the payload is dropped.
    pub fn deliver(&self, reply_id: &str, payload: Value) -> bool {
        let waiter = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .remove(reply_id);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                tracing::warn!(reply_id, "dropping reply without waiting request");
                false
            }
        }
    }

    /// Fail every pending request and reject new ones.
    pub fn close(&self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        let dropped = table.waiters.len();
        table.waiters.clear();
        drop(table);
        if dropped > 0 {
            tracing::debug!(dropped, "resolved pending requests on shutdown");
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .len()
    }

    fn unregister(&self, reply_id: &str) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .remove(reply_id);
    }
}

/// Guard over one pending reply slot. Dropping it frees the slot.
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Value>,
    correlator: Arc<Correlator>,
}

impl PendingReply {
    /// Reply address to publish with the request.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Response {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(payload)) => Response::from_value(&payload).unwrap_or_else(|err| {
                tracing::warn!(reply_id = %self.id, error = %err, "invalid response received");
                Response::internal(format!("Invalid response: {err}"))
            }),
            Ok(Err(_)) => Response::no_reply(BusError::Shutdown.to_string()),
            Err(_) => {
                tracing::debug!(reply_id = %self.id, ?timeout, "request timed out");
                Response::no_reply("Timeout")
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homebus_domain::response::ResponseCode;
    use serde_json::json;

    #[tokio::test]
    async fn should_deliver_reply_to_matching_request() {
        let correlator = Correlator::new("bus/c1/replies/");
        let first = correlator.register().unwrap();
        let second = correlator.register().unwrap();
        assert_ne!(first.id(), second.id());

        let delivered = correlator.deliver(
            second.id(),
            json!({"result": {"identifier": "success", "message": "second"}}),
        );
        assert!(delivered);

        let response = second.wait(Duration::from_millis(100)).await;
        assert_eq!(response.message(), Some("second"));

        let response = first.wait(Duration::from_millis(10)).await;
        assert!(response.has_code(ResponseCode::NoReply));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn should_return_no_reply_on_timeout() {
        let correlator = Correlator::new("p/");
        let pending = correlator.register().unwrap();
        let response = pending.wait(Duration::from_millis(5)).await;
        assert!(response.is_error());
        assert_eq!(response.identifier(), "no.reply");
        assert_eq!(response.message(), Some("Timeout"));
    }

    #[tokio::test]
    async fn should_map_invalid_reply_to_internal_error() {
        let correlator = Correlator::new("p/");
        let pending = correlator.register().unwrap();
        correlator.deliver(pending.id(), json!({"error": {"identifier": "x"}}));
        let response = pending.wait(Duration::from_millis(100)).await;
        assert!(response.has_code(ResponseCode::InternalError));
    }

    #[tokio::test]
    async fn should_resolve_pending_requests_on_close() {
        let correlator = Correlator::new("p/");
        let pending = correlator.register().unwrap();
        let waiter = tokio::spawn(pending.wait(Duration::from_secs(10)));

        correlator.close();

        let response = waiter.await.unwrap();
        assert!(response.has_code(ResponseCode::NoReply));
        assert_eq!(response.message(), Some("shutdown signaled"));
        assert!(matches!(correlator.register(), Err(BusError::Shutdown)));
    }

    #[test]
    fn should_drop_late_reply() {
        let correlator = Correlator::new("p/");
        let pending = correlator.register().unwrap();
        let id = pending.id().to_string();
        drop(pending);

        assert!(!correlator.deliver(&id, json!({"result": {"identifier": "success"}})));
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn should_recognise_own_namespace() {
        let correlator = Correlator::new("bus/c1/replies/");
        assert!(correlator.owns("bus/c1/replies/7"));
        assert!(!correlator.owns("bus/c2/replies/7"));
    }
}
