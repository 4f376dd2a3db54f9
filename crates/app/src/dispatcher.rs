//! Dispatcher: routes inbound messages to the command and event handlers.
//!
//! Handlers are plain callbacks stored behind `Arc`s. They are cloned out of
//! their slot and invoked with no lock held, each in its own task so that a
//! panicking handler only fails its own message.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use homebus_domain::command::CommandError;
use homebus_domain::envelope::{Content, MessageKind};
use homebus_domain::error::BusError;
use homebus_domain::response::Response;
use serde_json::Value;

use crate::ports::{ReplyHandle, TransportMessage, UuidStore};
use crate::registry::DeviceRegistry;

/// Boxed future returned by handlers.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback answering commands addressed to our devices.
pub type CommandHandler =
    Arc<dyn Fn(Content) -> HandlerFuture<Result<Response, HandlerError>> + Send + Sync>;

/// Callback observing events published on the bus.
pub type EventHandler =
    Arc<dyn Fn(String, Content) -> HandlerFuture<Result<(), HandlerError>> + Send + Sync>;

/// Failure of a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The command was refused with a protocol reason; sent back as is.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A bus operation issued by the handler failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Anything else; answered with `internal.error`.
    #[error("handler failed")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// What the connection should do with an inbound message.
#[derive(Debug)]
pub enum Route {
    /// Announce every live device.
    Discover,
    /// Run the command handler; reply when a handle is present.
    Command {
        content: Content,
        reply: Option<ReplyHandle>,
    },
    /// Run the event handler.
    Event { subject: String, content: Content },
    /// Not for us.
    Skip,
}

/// Holds the handlers and the command filter.
pub struct Dispatcher {
    command: Mutex<Option<CommandHandler>>,
    event: Mutex<Option<EventHandler>>,
    filter: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            command: Mutex::new(None),
            event: Mutex::new(None),
            filter: AtomicBool::new(true),
        }
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the command handler, replacing any previous one.
    pub fn set_command_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Content) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |content| Box::pin(handler(content)));
        *self.command.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Install the event handler, replacing any previous one.
    pub fn set_event_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Content) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: EventHandler =
            Arc::new(move |subject, content| Box::pin(handler(subject, content)));
        *self.event.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// When enabled (the default) only commands for our devices reach the
    /// command handler.
    pub fn set_filter(&self, enabled: bool) {
        self.filter.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn filter_enabled(&self) -> bool {
        self.filter.load(Ordering::Relaxed)
    }

    /// Decide what to do with `message`.
    pub fn route<S: UuidStore>(
        &self,
        message: TransportMessage,
        registry: &DeviceRegistry<S>,
    ) -> Route {
        let TransportMessage { envelope, reply } = message;
        if envelope.kind() == MessageKind::Reply {
            return Route::Skip;
        }
        let is_request = envelope.is_request();
        if envelope.command() == Some("discover") {
            return Route::Discover;
        }
        if !is_request && let Some(subject) = envelope.subject {
            return Route::Event {
                subject,
                content: envelope.content,
            };
        }

        let mut content = envelope.content;
        let own_device = match registry.resolve_target(&content) {
            Some(internal_id) => {
                content.insert("internalid".into(), Value::String(internal_id));
                true
            }
            None if self.filter_enabled() => {
                tracing::trace!("ignoring command for foreign device");
                return Route::Skip;
            }
            None => false,
        };
        // Only the owner answers, except the resolver answering `inventory`.
        let answers =
            own_device || content.get("command").and_then(Value::as_str) == Some("inventory");
        Route::Command {
            content,
            reply: reply.filter(|_| answers),
        }
    }

    /// Run the command handler on `content`.
    ///
    /// Returns `None` when no handler is installed. Handler failures and
    /// panics become error responses.
    pub async fn run_command(&self, content: Content) -> Option<Response> {
        let handler = self
            .command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;

        let outcome = tokio::spawn(async move { handler(content).await }).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(HandlerError::Command(err))) => err.into_response(),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "command handler failed");
                Response::internal(err.to_string())
            }
            Err(err) => {
                tracing::error!(error = %err, "command handler panicked");
                Response::internal("Command handler panicked")
            }
        };
        Some(response)
    }

    /// Run the event handler. Failures are logged, never propagated.
    pub async fn run_event(&self, subject: String, content: Content) {
        let Some(handler) = self
            .event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        let task_subject = subject.clone();
        match tokio::spawn(async move { handler(task_subject, content).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%subject, error = %err, "event handler failed"),
            Err(err) => tracing::error!(%subject, error = %err, "event handler panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homebus_domain::device::NewDevice;
    use homebus_domain::envelope::Envelope;
    use homebus_domain::response::ResponseCode;
    use homebus_domain::uuid_map::UuidMap;
    use serde_json::json;

    struct NullStore;

    impl UuidStore for NullStore {
        fn load(&self) -> Result<UuidMap, BusError> {
            Ok(UuidMap::new())
        }

        fn save(&self, _map: &UuidMap) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn registry_with(internal_id: &str) -> (DeviceRegistry<NullStore>, String) {
        let registry = DeviceRegistry::new(NullStore);
        let entry = registry
            .add(
                NewDevice::builder()
                    .internal_id(internal_id)
                    .device_type("switch")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        (registry, entry.uuid)
    }

    fn content(value: Value) -> Content {
        value.as_object().cloned().unwrap()
    }

    fn request(value: Value) -> TransportMessage {
        let envelope = Envelope::request(None, content(value), "r/1").unwrap();
        let reply = ReplyHandle::new("r/1", |_| Box::pin(async { Ok(()) }));
        TransportMessage::request(envelope, reply)
    }

    async fn refuse(_: Content) -> Result<Response, HandlerError> {
        Err(CommandError::new("unknown.command", "Command not supported").into())
    }

    async fn explode(_: Content) -> Result<Response, HandlerError> {
        panic!("boom")
    }

    async fn broken_event(_: String, _: Content) -> Result<(), HandlerError> {
        Err(HandlerError::Other("broken".into()))
    }

    #[test]
    fn should_route_command_for_own_device_and_inject_internal_id() {
        let dispatcher = Dispatcher::new();
        let (registry, uuid) = registry_with("d1");

        match dispatcher.route(request(json!({"uuid": uuid, "command": "on"})), &registry) {
            Route::Command { content, reply } => {
                assert_eq!(content["internalid"], "d1");
                assert!(reply.is_some());
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn should_skip_command_for_foreign_device_when_filtering() {
        let dispatcher = Dispatcher::new();
        let (registry, _) = registry_with("d1");
        let route = dispatcher.route(request(json!({"uuid": "other", "command": "on"})), &registry);
        assert!(matches!(route, Route::Skip));
    }

    #[test]
    fn should_pass_every_command_when_filter_disabled() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_filter(false);
        let (registry, _) = registry_with("d1");
        let route = dispatcher.route(request(json!({"command": "inventory"})), &registry);
        assert!(matches!(route, Route::Command { reply: Some(_), .. }));
    }

    #[test]
    fn should_run_foreign_command_without_answering_when_filter_disabled() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_filter(false);
        let (registry, _) = registry_with("d1");
        match dispatcher.route(request(json!({"internalid": "d2", "command": "on"})), &registry) {
            Route::Command { content, reply } => {
                assert_eq!(content["command"], "on");
                assert!(reply.is_none());
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn should_answer_own_device_request_without_command() {
        let dispatcher = Dispatcher::new();
        let (registry, _) = registry_with("d1");
        match dispatcher.route(request(json!({"internalid": "d1"})), &registry) {
            Route::Command { content, reply } => {
                assert_eq!(content["internalid"], "d1");
                assert!(reply.is_some());
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn should_route_discover_and_events() {
        let dispatcher = Dispatcher::new();
        let (registry, _) = registry_with("d1");

        let discover = TransportMessage::message(Envelope::message(
            None,
            content(json!({"command": "discover"})),
        ));
        assert!(matches!(dispatcher.route(discover, &registry), Route::Discover));

        let event = TransportMessage::message(Envelope::message(
            Some("event.environment.temperaturechanged".to_string()),
            content(json!({"level": 21.5})),
        ));
        match dispatcher.route(event, &registry) {
            Route::Event { subject, content } => {
                assert_eq!(subject, "event.environment.temperaturechanged");
                assert_eq!(content["level"], 21.5);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn should_route_subjectless_message_command_as_fire_and_forget() {
        let dispatcher = Dispatcher::new();
        let (registry, _) = registry_with("d1");
        let message = TransportMessage::message(Envelope::message(
            None,
            content(json!({"internalid": "d1", "command": "off"})),
        ));
        match dispatcher.route(message, &registry) {
            Route::Command { reply, .. } => assert!(reply.is_none()),
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_return_none_without_command_handler() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.run_command(Content::new()).await.is_none());
    }

    #[tokio::test]
    async fn should_convert_command_error_into_response() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_command_handler(refuse);
        let response = dispatcher.run_command(Content::new()).await.unwrap();
        assert!(response.has_code(ResponseCode::UnknownCommand));
    }

    #[tokio::test]
    async fn should_convert_panic_into_internal_error() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_command_handler(explode);
        let response = dispatcher.run_command(Content::new()).await.unwrap();
        assert!(response.has_code(ResponseCode::InternalError));
    }

    #[tokio::test]
    async fn should_keep_last_registered_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_command_handler(|_| async { Ok::<_, HandlerError>(Response::failed("old")) });
        dispatcher.set_command_handler(|_| async { Ok::<_, HandlerError>(Response::success()) });
        let response = dispatcher.run_command(Content::new()).await.unwrap();
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn should_swallow_event_handler_errors() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_event_handler(broken_event);
        dispatcher
            .run_event("event.x".to_string(), Content::new())
            .await;
    }
}
