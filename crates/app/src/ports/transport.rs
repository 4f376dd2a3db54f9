//! Transport port: one broker session shared by a connection.
//!
//! A transport turns one-way publish/subscribe delivery into the two
//! primitives the rest of the client needs: fire-and-forget messages and
//! request/reply. Implementations live in adapter crates (MQTT, AMQP, the
//! in-process virtual bus).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use homebus_domain::envelope::{Content, Envelope};
use homebus_domain::error::BusError;
use homebus_domain::response::Response;

/// Future returned by a reply sender.
pub type ReplyFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;

type ReplyFn = Box<dyn FnOnce(Response) -> ReplyFuture + Send>;

/// Sends exactly one response back to the originator of a request.
pub struct ReplyHandle {
    address: String,
    send: ReplyFn,
}

impl ReplyHandle {
    pub fn new<F>(address: impl Into<String>, send: F) -> Self
    where
        F: FnOnce(Response) -> ReplyFuture + Send + 'static,
    {
        Self {
            address: address.into(),
            send: Box::new(send),
        }
    }

    /// Reply address this handle is bound to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Consume the handle and send `response`.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure if the reply could not be published.
    pub async fn send(self, response: Response) -> Result<(), BusError> {
        (self.send)(response).await
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// An inbound message, with a reply handle when it is a request.
#[derive(Debug)]
pub struct TransportMessage {
    pub envelope: Envelope,
    pub reply: Option<ReplyHandle>,
}

impl TransportMessage {
    #[must_use]
    pub fn message(envelope: Envelope) -> Self {
        Self {
            envelope,
            reply: None,
        }
    }

    #[must_use]
    pub fn request(envelope: Envelope, reply: ReplyHandle) -> Self {
        Self {
            envelope,
            reply: Some(reply),
        }
    }
}

/// Broker session owned by a connection.
///
/// Every method takes `&self`: the dispatcher loop fetches while callers
/// send concurrently.
pub trait Transport: Send + Sync {
    /// Establish the broker session. On failure nothing is left running.
    fn start(&self) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Publish a one-way message.
    fn send_message(
        &self,
        subject: Option<String>,
        content: Content,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Publish a request and wait up to `timeout` for its reply.
    ///
    /// Never fails: a timeout is a `no.reply` error response, a malformed
    /// reply is an `internal.error` response.
    fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> impl Future<Output = Response> + Send;

    /// Next inbound message, or `None` after `timeout` or on shutdown.
    fn fetch_message(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Option<TransportMessage>> + Send;

    /// Stop the session. Pending requests resolve as errors, pending fetches
    /// return `None`.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;

    /// Whether `start` succeeded and `shutdown` has not been called.
    fn is_active(&self) -> bool;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn start(&self) -> impl Future<Output = Result<(), BusError>> + Send {
        (**self).start()
    }

    fn send_message(
        &self,
        subject: Option<String>,
        content: Content,
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        (**self).send_message(subject, content)
    }

    fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> impl Future<Output = Response> + Send {
        (**self).send_request(subject, content, timeout)
    }

    fn fetch_message(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Option<TransportMessage>> + Send {
        (**self).fetch_message(timeout)
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        (**self).shutdown()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn should_send_response_through_reply_handle() {
        let sent: Arc<Mutex<Option<Response>>> = Arc::default();
        let sink = Arc::clone(&sent);
        let handle = ReplyHandle::new("bus/c1/replies/1", move |response| {
            *sink.lock().unwrap() = Some(response);
            Box::pin(async { Ok(()) })
        });

        assert_eq!(handle.address(), "bus/c1/replies/1");
        handle.send(Response::success()).await.unwrap();
        assert_eq!(sent.lock().unwrap().clone(), Some(Response::success()));
    }

    #[test]
    fn should_hide_closure_in_debug_output() {
        let handle = ReplyHandle::new("r/1", |_| Box::pin(async { Ok(()) }));
        assert_eq!(format!("{handle:?}"), r#"ReplyHandle { address: "r/1", .. }"#);
    }
}
