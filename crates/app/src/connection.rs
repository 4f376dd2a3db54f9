//! Connection facade: the API agents program against.
//!
//! A [`Connection`] ties one [`Transport`], one [`DeviceRegistry`] and one
//! [`Dispatcher`] together. It is an explicit context object: a process may
//! hold several of them (tests routinely do).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use homebus_domain::device::{DeviceEntry, NewDevice};
use homebus_domain::envelope::Content;
use homebus_domain::error::BusError;
use homebus_domain::response::Response;
use serde_json::Value;

use crate::dispatcher::{Dispatcher, HandlerError, Route};
use crate::ports::{Transport, TransportMessage, UuidStore};
use crate::registry::DeviceRegistry;

pub const SUBJECT_ANNOUNCE: &str = "event.device.announce";
pub const SUBJECT_DISCOVER: &str = "event.device.discover";
pub const SUBJECT_REMOVE: &str = "event.device.remove";
pub const SUBJECT_STALE: &str = "event.device.stale";
pub const SUBJECT_PROCESS_STARTED: &str = "event.monitoring.processstarted";

/// Device type of the controller answering `setvariable` and
/// `setdevicename`.
pub const CONTROLLER_DEVICE_TYPE: &str = "agocontroller";

/// Tunables of a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Timeout used by [`Connection::send_request`].
    pub request_timeout: Duration,
    /// How long a single fetch in [`Connection::run`] waits before the loop
    /// checks for shutdown again.
    pub poll_interval: Duration,
    /// How long a fetched inventory may be served from cache.
    pub inventory_max_age: Duration,
    /// Attempts made by [`Connection::resolve_controller`].
    pub controller_retries: u32,
    /// Pause between two controller lookups.
    pub controller_retry_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
            inventory_max_age: Duration::from_secs(60),
            controller_retries: 10,
            controller_retry_delay: Duration::from_secs(1),
        }
    }
}

/// One agent's presence on the bus.
pub struct Connection<T, S> {
    instance: String,
    options: ConnectionOptions,
    transport: T,
    registry: DeviceRegistry<S>,
    dispatcher: Dispatcher,
    inventory: Mutex<Option<(Instant, Content)>>,
    controller: Mutex<Option<String>>,
    shutting_down: AtomicBool,
}

fn device_content(entry: &DeviceEntry, instance: &str) -> Content {
    let mut content = Content::new();
    content.insert("devicetype".into(), Value::String(entry.device_type.clone()));
    content.insert("internalid".into(), Value::String(entry.internal_id.clone()));
    content.insert("handled-by".into(), Value::String(instance.to_string()));
    content.insert("uuid".into(), Value::String(entry.uuid.clone()));
    content
}

impl<T: Transport, S: UuidStore> Connection<T, S> {
    /// Create a connection named `instance`. The persisted uuid map is
    /// loaded immediately; the transport is not started.
    pub fn new(instance: impl Into<String>, transport: T, store: S) -> Self {
        Self::with_options(instance, transport, store, ConnectionOptions::default())
    }

    pub fn with_options(
        instance: impl Into<String>,
        transport: T,
        store: S,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            instance: instance.into(),
            options,
            transport,
            registry: DeviceRegistry::new(store),
            dispatcher: Dispatcher::new(),
            inventory: Mutex::new(None),
            controller: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start the transport, announce the process and every device registered
    /// so far.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure; nothing is announced in that case.
    #[tracing::instrument(skip(self), fields(instance = %self.instance))]
    pub async fn start(&self) -> Result<(), BusError> {
        self.transport.start().await?;
        tracing::info!("connected to bus");

        let mut content = Content::new();
        content.insert("process".into(), Value::String(self.instance.clone()));
        self.emit(SUBJECT_PROCESS_STARTED, content).await;

        for entry in self.registry.entries() {
            self.announce(&entry).await;
        }
        Ok(())
    }

    /// Process inbound messages until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        tracing::debug!(instance = %self.instance, "waiting for messages");
        while !self.is_shutting_down() && self.transport.is_active() {
            if let Some(message) = self.transport.fetch_message(self.options.poll_interval).await {
                self.handle_message(message).await;
            }
        }
        tracing::debug!(instance = %self.instance, "message loop stopped");
    }

    /// Stop the message loop and the transport. Pending requests resolve as
    /// `no.reply` errors.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(instance = %self.instance, "shutting down");
        self.transport.shutdown().await;
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn handle_message(&self, message: TransportMessage) {
        match self.dispatcher.route(message, &self.registry) {
            Route::Discover => self.report_devices().await,
            Route::Command { content, reply } => {
                let Some(response) = self.dispatcher.run_command(content).await else {
                    tracing::debug!("no command handler installed, dropping command");
                    return;
                };
                match reply {
                    Some(reply) => {
                        let address = reply.address().to_string();
                        if let Err(err) = reply.send(response).await {
                            tracing::warn!(%address, error = %err, "unable to send reply");
                        }
                    }
                    None => tracing::trace!(?response, "dropping response to one-way command"),
                }
            }
            Route::Event { subject, content } => self.dispatcher.run_event(subject, content).await,
            Route::Skip => {}
        }
    }

    async fn emit(&self, subject: &str, content: Content) {
        if let Err(err) = self
            .transport
            .send_message(Some(subject.to_string()), content)
            .await
        {
            tracing::warn!(subject, error = %err, "unable to publish event");
        }
    }

    async fn announce(&self, entry: &DeviceEntry) {
        let mut content = device_content(entry, &self.instance);
        if let Some(name) = &entry.initial_name {
            content.insert("initial_name".into(), Value::String(name.clone()));
        }
        self.emit(SUBJECT_ANNOUNCE, content).await;
    }

    async fn emit_stale(&self, uuid: String, stale: bool) {
        let mut content = Content::new();
        content.insert("uuid".into(), Value::String(uuid));
        content.insert("stale".into(), Value::from(u8::from(stale)));
        self.emit(SUBJECT_STALE, content).await;
    }

    async fn emit_remove(&self, uuid: String) {
        let mut content = Content::new();
        content.insert("uuid".into(), Value::String(uuid));
        self.emit(SUBJECT_REMOVE, content).await;
    }

    /// Register a device with a generated uuid and announce it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] for empty ids or types.
    pub async fn add_device(
        &self,
        internal_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Result<String, BusError> {
        let device = NewDevice::builder()
            .internal_id(internal_id)
            .device_type(device_type)
            .build()?;
        self.add_device_with(device).await.map(|entry| entry.uuid)
    }

    /// Register a device described by `device` and announce it.
    ///
    /// The mapping is persisted before the announcement goes out. A failed
    /// announcement is logged; the device stays registered and is announced
    /// again on `discover`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] or [`BusError::UuidMap`].
    #[tracing::instrument(skip(self, device), fields(internal_id = %device.internal_id))]
    pub async fn add_device_with(&self, device: NewDevice) -> Result<DeviceEntry, BusError> {
        let entry = self.registry.add(device)?;
        self.announce(&entry).await;
        Ok(entry)
    }

    /// Unregister a device and announce its removal. The uuid is kept for a
    /// later re-add. Returns `false` for unknown devices.
    #[tracing::instrument(skip(self))]
    pub async fn remove_device(&self, internal_id: &str) -> bool {
        let Some(entry) = self.registry.remove(internal_id) else {
            return false;
        };
        self.emit_remove(entry.uuid).await;
        true
    }

    /// Unregister a device and forget its uuid for good.
    #[tracing::instrument(skip(self))]
    pub async fn purge_device(&self, internal_id: &str) -> bool {
        let registered = self.registry.get(internal_id).is_some();
        let Some(uuid) = self.registry.purge(internal_id) else {
            return false;
        };
        if registered {
            self.emit_remove(uuid).await;
        }
        true
    }

    /// Flag a device as stale and announce it.
    pub async fn suspend_device(&self, internal_id: &str) -> bool {
        let Some(uuid) = self.registry.suspend(internal_id) else {
            return false;
        };
        self.emit_stale(uuid, true).await;
        true
    }

    /// Clear the stale flag of a device and announce it.
    pub async fn resume_device(&self, internal_id: &str) -> bool {
        let Some(uuid) = self.registry.resume(internal_id) else {
            return false;
        };
        self.emit_stale(uuid, false).await;
        true
    }

    #[must_use]
    pub fn is_device_stale(&self, internal_id: &str) -> bool {
        self.registry.is_stale(internal_id)
    }

    #[must_use]
    pub fn device_type(&self, internal_id: &str) -> Option<String> {
        self.registry.device_type(internal_id)
    }

    #[must_use]
    pub fn uuid_to_internal_id(&self, uuid: &str) -> Option<String> {
        self.registry.uuid_to_internal_id(uuid)
    }

    #[must_use]
    pub fn internal_id_to_uuid(&self, internal_id: &str) -> Option<String> {
        self.registry.internal_id_to_uuid(internal_id)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.registry.entries()
    }

    /// Announce every non-stale device with `event.device.discover`.
    pub async fn report_devices(&self) {
        let entries: Vec<DeviceEntry> = self
            .registry
            .entries()
            .into_iter()
            .filter(|entry| !entry.stale)
            .collect();
        tracing::debug!(count = entries.len(), "reporting devices");
        for entry in entries {
            self.emit(SUBJECT_DISCOVER, device_content(&entry, &self.instance))
                .await;
        }
    }

    /// Install the command handler. The last registration wins.
    pub fn add_command_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Content) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.dispatcher.set_command_handler(handler);
    }

    /// Install the event handler. The last registration wins.
    pub fn add_event_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Content) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.dispatcher.set_event_handler(handler);
    }

    /// Disable to receive every command on the bus, not only those for our
    /// devices.
    pub fn set_filter(&self, enabled: bool) {
        self.dispatcher.set_filter(enabled);
    }

    /// Publish a one-way message.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn send_message(&self, subject: Option<&str>, content: Content) -> Result<(), BusError> {
        self.transport
            .send_message(subject.map(str::to_string), content)
            .await
    }

    /// Send a request with the default timeout.
    pub async fn send_request(&self, subject: Option<&str>, content: Content) -> Response {
        self.send_request_with_timeout(subject, content, self.options.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for the reply.
    pub async fn send_request_with_timeout(
        &self,
        subject: Option<&str>,
        content: Content,
        timeout: Duration,
    ) -> Response {
        self.transport
            .send_request(subject.map(str::to_string), content, timeout)
            .await
    }

    /// Publish `content` as event `subject` on behalf of a local device.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownDevice`] if the device is not registered.
    pub async fn emit_event(
        &self,
        internal_id: &str,
        subject: &str,
        mut content: Content,
    ) -> Result<(), BusError> {
        let uuid = self
            .registry
            .internal_id_to_uuid(internal_id)
            .ok_or_else(|| BusError::UnknownDevice(internal_id.to_string()))?;
        content.insert("uuid".into(), Value::String(uuid));
        self.send_message(Some(subject), content).await
    }

    /// Publish a `{level, unit}` event on behalf of a local device.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownDevice`] if the device is not registered.
    pub async fn emit_level_event(
        &self,
        internal_id: &str,
        subject: &str,
        level: impl Into<Value>,
        unit: &str,
    ) -> Result<(), BusError> {
        let mut content = Content::new();
        content.insert("level".into(), level.into());
        content.insert("unit".into(), Value::String(unit.to_string()));
        self.emit_event(internal_id, subject, content).await
    }

    /// Fetch the resolver inventory, optionally from cache.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Remote`] when the resolver answers with an error
    /// or does not answer at all.
    pub async fn get_inventory(&self, allow_cached: bool) -> Result<Content, BusError> {
        if allow_cached {
            let cached = self
                .inventory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some((fetched_at, inventory)) = cached
                && fetched_at.elapsed() < self.options.inventory_max_age
            {
                return Ok(inventory);
            }
        }

        let mut content = Content::new();
        content.insert("command".into(), Value::String("inventory".into()));
        let response = self.send_request(None, content).await;
        let mut cache = self.inventory.lock().unwrap_or_else(PoisonError::into_inner);
        if response.is_error() {
            *cache = None;
            return Err(BusError::Remote {
                identifier: response.identifier().to_string(),
                message: response.message().unwrap_or_default().to_string(),
            });
        }
        let inventory = response.data().cloned().unwrap_or_default();
        *cache = Some((Instant::now(), inventory.clone()));
        Ok(inventory)
    }

    /// Find the uuid of the controller device in the inventory.
    ///
    /// Retries a bounded number of times, bypassing the cache after the first
    /// attempt, and gives up early on shutdown.
    pub async fn resolve_controller(&self, allow_cached: bool) -> Option<String> {
        if let Some(uuid) = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Some(uuid);
        }

        let mut allow_cached = allow_cached;
        for attempt in 1..=self.options.controller_retries {
            if self.is_shutting_down() {
                break;
            }
            match self.get_inventory(allow_cached).await {
                Ok(inventory) => {
                    if let Some(uuid) = find_controller(&inventory) {
                        tracing::debug!(%uuid, "controller found");
                        *self.controller.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(uuid.clone());
                        return Some(uuid);
                    }
                    tracing::warn!(attempt, "controller not in inventory, retrying");
                }
                Err(err) => tracing::warn!(attempt, error = %err, "unable to resolve controller, retrying"),
            }
            allow_cached = false;
            tokio::time::sleep(self.options.controller_retry_delay).await;
        }
        tracing::warn!("failed to resolve controller, giving up");
        None
    }

    async fn send_to_controller(&self, command: &str, mut content: Content) -> Result<(), BusError> {
        let controller = self
            .resolve_controller(true)
            .await
            .ok_or(BusError::ControllerUnavailable)?;
        content.insert("uuid".into(), Value::String(controller));
        content.insert("command".into(), Value::String(command.to_string()));
        self.send_message(None, content).await
    }

    /// Ask the controller to store a global variable.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ControllerUnavailable`] if no controller could be
    /// found, or a transport failure.
    pub async fn set_global_variable(&self, variable: &str, value: impl Into<Value>) -> Result<(), BusError> {
        let mut content = Content::new();
        content.insert("variable".into(), Value::String(variable.to_string()));
        content.insert("value".into(), value.into());
        self.send_to_controller("setvariable", content).await
    }

    /// Ask the controller to name one of our devices.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownDevice`], [`BusError::ControllerUnavailable`]
    /// or a transport failure.
    pub async fn set_device_name(&self, internal_id: &str, name: &str) -> Result<(), BusError> {
        let uuid = self
            .registry
            .internal_id_to_uuid(internal_id)
            .ok_or_else(|| BusError::UnknownDevice(internal_id.to_string()))?;
        let mut content = Content::new();
        content.insert("device".into(), Value::String(uuid));
        content.insert("name".into(), Value::String(name.to_string()));
        self.send_to_controller("setdevicename", content).await
    }
}

fn find_controller(inventory: &Content) -> Option<String> {
    inventory
        .get("devices")?
        .as_object()?
        .iter()
        .find(|(_, device)| {
            device.get("devicetype").and_then(Value::as_str) == Some(CONTROLLER_DEVICE_TYPE)
        })
        .map(|(uuid, _)| uuid.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use homebus_domain::command::CommandError;
    use homebus_domain::envelope::Envelope;
    use homebus_domain::response::ResponseCode;
    use homebus_domain::uuid_map::UuidMap;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Records published messages and answers requests from a script.
    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(Option<String>, Content)>>,
        replies: Mutex<VecDeque<Response>>,
        inbound: Mutex<VecDeque<TransportMessage>>,
        started: AtomicBool,
    }

    impl FakeTransport {
        fn subjects(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(subject, _)| subject.clone())
                .collect()
        }

        fn last(&self, subject: &str) -> Option<Content> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(s, _)| s.as_deref() == Some(subject))
                .map(|(_, content)| content.clone())
        }
    }

    impl Transport for FakeTransport {
        fn start(&self) -> impl Future<Output = Result<(), BusError>> + Send {
            self.started.store(true, Ordering::SeqCst);
            async { Ok(()) }
        }

        fn send_message(
            &self,
            subject: Option<String>,
            content: Content,
        ) -> impl Future<Output = Result<(), BusError>> + Send {
            self.sent.lock().unwrap().push((subject, content));
            async { Ok(()) }
        }

        fn send_request(
            &self,
            subject: Option<String>,
            content: Content,
            _timeout: Duration,
        ) -> impl Future<Output = Response> + Send {
            self.sent.lock().unwrap().push((subject, content));
            let response = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Response::no_reply("Timeout"));
            async { response }
        }

        fn fetch_message(
            &self,
            _timeout: Duration,
        ) -> impl Future<Output = Option<TransportMessage>> + Send {
            let message = self.inbound.lock().unwrap().pop_front();
            async { message }
        }

        fn shutdown(&self) -> impl Future<Output = ()> + Send {
            self.started.store(false, Ordering::SeqCst);
            async {}
        }

        fn is_active(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct InMemoryUuidStore {
        map: Mutex<UuidMap>,
    }

    impl UuidStore for InMemoryUuidStore {
        fn load(&self) -> Result<UuidMap, BusError> {
            Ok(self.map.lock().unwrap().clone())
        }

        fn save(&self, map: &UuidMap) -> Result<(), BusError> {
            *self.map.lock().unwrap() = map.clone();
            Ok(())
        }
    }

    type TestConnection = Connection<Arc<FakeTransport>, Arc<InMemoryUuidStore>>;

    fn make_connection() -> (TestConnection, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let options = ConnectionOptions {
            controller_retries: 2,
            controller_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let connection = Connection::with_options(
            "testagent",
            Arc::clone(&transport),
            Arc::new(InMemoryUuidStore::default()),
            options,
        );
        (connection, transport)
    }

    #[tokio::test]
    async fn should_announce_process_and_devices_on_start() {
        let (connection, transport) = make_connection();
        connection.add_device("d1", "switch").await.unwrap();
        connection.start().await.unwrap();

        let process = transport.last(SUBJECT_PROCESS_STARTED).unwrap();
        assert_eq!(process["process"], "testagent");
        assert_eq!(
            transport.subjects(),
            [SUBJECT_ANNOUNCE, SUBJECT_PROCESS_STARTED, SUBJECT_ANNOUNCE]
        );
    }

    #[tokio::test]
    async fn should_announce_added_device_with_name() {
        let (connection, transport) = make_connection();
        let entry = connection
            .add_device_with(
                NewDevice::builder()
                    .internal_id("d1")
                    .device_type("dimmer")
                    .initial_name("Kitchen")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let announce = transport.last(SUBJECT_ANNOUNCE).unwrap();
        assert_eq!(announce["devicetype"], "dimmer");
        assert_eq!(announce["internalid"], "d1");
        assert_eq!(announce["handled-by"], "testagent");
        assert_eq!(announce["uuid"], entry.uuid.as_str());
        assert_eq!(announce["initial_name"], "Kitchen");
    }

    #[tokio::test]
    async fn should_emit_remove_and_forget_lookup() {
        let (connection, transport) = make_connection();
        let uuid = connection.add_device("d1", "switch").await.unwrap();

        assert!(connection.remove_device("d1").await);
        assert_eq!(transport.last(SUBJECT_REMOVE).unwrap()["uuid"], uuid.as_str());
        assert_eq!(connection.uuid_to_internal_id(&uuid), None);
        assert!(!connection.remove_device("d1").await);
    }

    #[tokio::test]
    async fn should_emit_stale_events() {
        let (connection, transport) = make_connection();
        connection.add_device("d1", "switch").await.unwrap();

        assert!(connection.suspend_device("d1").await);
        assert!(connection.is_device_stale("d1"));
        assert_eq!(transport.last(SUBJECT_STALE).unwrap()["stale"], 1);

        assert!(connection.resume_device("d1").await);
        assert!(!connection.is_device_stale("d1"));
        assert_eq!(transport.last(SUBJECT_STALE).unwrap()["stale"], 0);
    }

    #[tokio::test]
    async fn should_report_only_live_devices() {
        let (connection, transport) = make_connection();
        connection.add_device("d1", "switch").await.unwrap();
        connection.add_device("d2", "switch").await.unwrap();
        connection.suspend_device("d2").await;

        connection.report_devices().await;

        let discovered: Vec<Content> = transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s.as_deref() == Some(SUBJECT_DISCOVER))
            .map(|(_, c)| c.clone())
            .collect();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0]["internalid"], "d1");
    }

    #[tokio::test]
    async fn should_reply_to_command_for_own_device() {
        let (connection, transport) = make_connection();
        connection.add_device("d1", "switch").await.unwrap();
        connection.add_command_handler(|content| async move {
            match content.get("command").and_then(Value::as_str) {
                Some("on") => Ok(Response::success()),
                _ => Err(HandlerError::from(CommandError::new(
                    "unknown.command",
                    "Command not supported",
                ))),
            }
        });

        let replies: Arc<Mutex<Vec<Response>>> = Arc::default();
        for command in ["on", "bogus"] {
            let sink = Arc::clone(&replies);
            let envelope = Envelope::request(
                None,
                json!({"internalid": "d1", "command": command})
                    .as_object()
                    .cloned()
                    .unwrap(),
                "r/1",
            )
            .unwrap();
            let reply = crate::ports::ReplyHandle::new("r/1", move |response| {
                sink.lock().unwrap().push(response);
                Box::pin(async { Ok(()) })
            });
            transport
                .inbound
                .lock()
                .unwrap()
                .push_back(TransportMessage::request(envelope, reply));
        }

        connection.start().await.unwrap();
        connection.handle_message(transport.fetch_message(Duration::ZERO).await.unwrap()).await;
        connection.handle_message(transport.fetch_message(Duration::ZERO).await.unwrap()).await;

        let replies = replies.lock().unwrap();
        assert!(replies[0].is_ok());
        assert!(replies[1].has_code(ResponseCode::UnknownCommand));
    }

    #[tokio::test]
    async fn should_reject_event_for_unknown_device() {
        let (connection, _) = make_connection();
        let result = connection
            .emit_level_event("ghost", "event.environment.temperaturechanged", 21.5, "degC")
            .await;
        assert!(matches!(result, Err(BusError::UnknownDevice(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn should_add_uuid_to_emitted_event() {
        let (connection, transport) = make_connection();
        let uuid = connection.add_device("t1", "temperaturesensor").await.unwrap();
        connection
            .emit_level_event("t1", "event.environment.temperaturechanged", 21.5, "degC")
            .await
            .unwrap();
        let event = transport.last("event.environment.temperaturechanged").unwrap();
        assert_eq!(event["uuid"], uuid.as_str());
        assert_eq!(event["level"], 21.5);
        assert_eq!(event["unit"], "degC");
    }

    #[tokio::test]
    async fn should_forward_request_subject() {
        let (connection, transport) = make_connection();
        transport.replies.lock().unwrap().push_back(Response::success());

        let response = connection
            .send_request(Some("event.security.alarm"), Content::new())
            .await;

        assert!(response.is_ok());
        assert_eq!(transport.subjects(), ["event.security.alarm"]);
    }

    #[tokio::test]
    async fn should_cache_inventory() {
        let (connection, transport) = make_connection();
        let data = json!({"devices": {}}).as_object().cloned().unwrap();
        transport
            .replies
            .lock()
            .unwrap()
            .push_back(Response::success_with_data(data.clone()));

        assert_eq!(connection.get_inventory(true).await.unwrap(), data);
        // served from cache, the scripted replies are exhausted
        assert_eq!(connection.get_inventory(true).await.unwrap(), data);
        assert!(connection.get_inventory(false).await.is_err());
    }

    #[tokio::test]
    async fn should_send_global_variable_to_controller() {
        let (connection, transport) = make_connection();
        let inventory = json!({"devices": {
            "c-uuid": {"devicetype": "agocontroller"},
            "other": {"devicetype": "switch"},
        }});
        transport
            .replies
            .lock()
            .unwrap()
            .push_back(Response::success_with_data(
                inventory.as_object().cloned().unwrap(),
            ));

        connection.set_global_variable("mode", "away").await.unwrap();

        let (_, message) = transport.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(message["uuid"], "c-uuid");
        assert_eq!(message["command"], "setvariable");
        assert_eq!(message["variable"], "mode");
        assert_eq!(message["value"], "away");
    }

    #[tokio::test]
    async fn should_give_up_resolving_controller() {
        let (connection, _) = make_connection();
        assert_eq!(connection.resolve_controller(false).await, None);
        assert!(matches!(
            connection.set_global_variable("mode", "away").await,
            Err(BusError::ControllerUnavailable)
        ));
    }

    #[tokio::test]
    async fn should_stop_run_loop_on_shutdown() {
        let (connection, _) = make_connection();
        connection.start().await.unwrap();
        connection.shutdown().await;
        connection.run().await;
        assert!(connection.is_shutting_down());
    }
}
