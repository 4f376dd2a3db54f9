use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;

use homebus_app::correlator::Correlator;
use homebus_app::inbox::Inbox;
use homebus_app::ports::{ReplyHandle, Transport, TransportMessage};
use homebus_domain::envelope::{self, Content, Envelope, MessageKind};
use homebus_domain::error::BusError;
use homebus_domain::id::ConnectionId;
use homebus_domain::response::Response;

/// One attached connection, as seen by the bus.
struct Endpoint {
    correlator: Arc<Correlator>,
    inbox: Inbox,
}

#[derive(Default)]
struct Shared {
    endpoints: Mutex<HashMap<ConnectionId, Arc<Endpoint>>>,
}

impl Shared {
    fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn owner_of(&self, reply_id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|endpoint| endpoint.correlator.owns(reply_id))
            .cloned()
    }

    fn publish(self: &Arc<Self>, envelope: &Envelope) -> Result<(), BusError> {
        let payload = envelope::encode(envelope)?;
        let endpoints = self.snapshot();
        tracing::trace!(receivers = endpoints.len(), "virtual publish");
        for endpoint in endpoints {
            let copy = envelope::decode(&payload)?;
            let message = match copy.kind() {
                MessageKind::Request => {
                    let address = copy.reply_to().unwrap_or_default().to_string();
                    let reply = self.reply_handle(address);
                    TransportMessage::request(copy, reply)
                }
                MessageKind::Message => TransportMessage::message(copy),
                MessageKind::Reply => continue,
            };
            endpoint.inbox.push(message);
        }
        Ok(())
    }

    fn reply_handle(self: &Arc<Self>, address: String) -> ReplyHandle {
        let shared = Arc::downgrade(self);
        ReplyHandle::new(address.clone(), move |response: Response| {
            Box::pin(async move {
                deliver_reply(&shared, &address, &response);
                Ok(())
            })
        })
    }
}

fn deliver_reply(shared: &Weak<Shared>, address: &str, response: &Response) {
    let Some(shared) = shared.upgrade() else {
        tracing::debug!(address, "virtual bus gone, dropping reply");
        return;
    };
    match shared.owner_of(address) {
        Some(endpoint) => {
            endpoint.correlator.deliver(address, response.to_value());
        }
        None => tracing::warn!(address, "reply for a detached connection"),
    }
}

/// In-process broker shared by every [`VirtualTransport`] it hands out.
#[derive(Clone, Default)]
pub struct VirtualBus {
    shared: Arc<Shared>,
}

impl VirtualBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport bound to this bus. It receives nothing until
    /// [`Transport::start`] is called.
    #[must_use]
    pub fn connect(&self) -> VirtualTransport {
        let id = ConnectionId::new();
        VirtualTransport {
            id,
            shared: Arc::clone(&self.shared),
            endpoint: Arc::new(Endpoint {
                correlator: Correlator::new(format!("virtual/{id}/replies/")),
                inbox: Inbox::new(),
            }),
            active: AtomicBool::new(false),
        }
    }

    /// Number of started connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One agent's connection to a [`VirtualBus`].
pub struct VirtualTransport {
    id: ConnectionId,
    shared: Arc<Shared>,
    endpoint: Arc<Endpoint>,
    active: AtomicBool,
}

impl VirtualTransport {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

impl Transport for VirtualTransport {
    async fn start(&self) -> Result<(), BusError> {
        if self.endpoint.inbox.is_closed() {
            return Err(BusError::Shutdown);
        }
        self.shared
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id, Arc::clone(&self.endpoint));
        self.active.store(true, Ordering::SeqCst);
        tracing::debug!(connection = %self.id, "virtual transport attached");
        Ok(())
    }

    async fn send_message(&self, subject: Option<String>, content: Content) -> Result<(), BusError> {
        if !self.is_active() {
            return Err(BusError::NotConnected);
        }
        self.shared.publish(&Envelope::message(subject, content))
    }

    async fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> Response {
        let deadline = Instant::now() + timeout;
        if !self.is_active() {
            return Response::no_reply(BusError::NotConnected.to_string());
        }
        let pending = match self.endpoint.correlator.register() {
            Ok(pending) => pending,
            Err(err) => return Response::no_reply(err.to_string()),
        };
        let published = Envelope::request(subject, content, pending.id())
            .map_err(BusError::from)
            .and_then(|request| self.shared.publish(&request));
        if let Err(err) = published {
            return Response::internal(err.to_string());
        }
        pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    async fn fetch_message(&self, timeout: Duration) -> Option<TransportMessage> {
        if !self.is_active() {
            return None;
        }
        self.endpoint.inbox.next(timeout).await
    }

    async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.shared
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        self.endpoint.correlator.close();
        self.endpoint.inbox.close();
        tracing::debug!(connection = %self.id, "virtual transport detached");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homebus_domain::response::ResponseCode;
    use serde_json::json;

    fn content(value: serde_json::Value) -> Content {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn started(bus: &VirtualBus) -> Arc<VirtualTransport> {
        let transport = Arc::new(bus.connect());
        transport.start().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn should_fan_out_to_every_connection_including_sender() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;
        let b = started(&bus).await;

        a.send_message(Some("event.test".to_string()), content(json!({"level": 3})))
            .await
            .unwrap();

        for transport in [&a, &b] {
            let message = transport.fetch_message(Duration::from_millis(50)).await.unwrap();
            assert_eq!(message.envelope.subject.as_deref(), Some("event.test"));
            assert_eq!(message.envelope.content["level"], json!(3));
            assert!(message.reply.is_none());
        }
    }

    #[tokio::test]
    async fn should_not_deliver_before_start() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;
        let idle = bus.connect();

        a.send_message(None, Content::new()).await.unwrap();

        assert_eq!(bus.connections(), 1);
        assert!(idle.fetch_message(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn should_route_reply_to_requester() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;
        let b = started(&bus).await;

        let responder = Arc::clone(&b);
        let answer = tokio::spawn(async move {
            let message = responder.fetch_message(Duration::from_secs(1)).await.unwrap();
            message
                .reply
                .unwrap()
                .send(Response::success_with_message("done"))
                .await
                .unwrap();
        });

        let response = a
            .send_request(None, content(json!({"command": "on"})), Duration::from_secs(1))
            .await;
        answer.await.unwrap();

        assert!(response.is_ok());
        assert_eq!(response.message(), Some("done"));
    }

    #[tokio::test]
    async fn should_time_out_without_responder() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;

        let response = a
            .send_request(None, Content::new(), Duration::from_millis(20))
            .await;

        assert!(response.has_code(ResponseCode::NoReply));
        assert_eq!(response.message(), Some("Timeout"));
    }

    #[tokio::test]
    async fn should_resolve_pending_request_on_shutdown() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;

        let requester = Arc::clone(&a);
        let waiting = tokio::spawn(async move {
            requester
                .send_request(None, Content::new(), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.shutdown().await;

        let response = waiting.await.unwrap();
        assert!(response.has_code(ResponseCode::NoReply));
        assert_eq!(response.message(), Some("shutdown signaled"));
        assert_eq!(bus.connections(), 0);
    }

    #[tokio::test]
    async fn should_refuse_to_send_after_shutdown() {
        let bus = VirtualBus::new();
        let a = started(&bus).await;
        a.shutdown().await;

        assert!(matches!(
            a.send_message(None, Content::new()).await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(a.start().await, Err(BusError::Shutdown)));
        assert!(a.fetch_message(Duration::from_millis(5)).await.is_none());
    }
}
