//! [`Transport`] implementation over an MQTT broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use homebus_app::correlator::Correlator;
use homebus_app::inbox::Inbox;
use homebus_app::ports::{ReplyHandle, Transport, TransportMessage};
use homebus_domain::envelope::{self, Content, Envelope, MessageKind};
use homebus_domain::error::BusError;
use homebus_domain::id::ConnectionId;
use homebus_domain::response::Response;

use crate::config::MqttConfig;
use crate::error::MqttError;
use crate::topics::Topics;

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// MQTT-backed transport for one connection.
pub struct MqttTransport {
    config: MqttConfig,
    connection: ConnectionId,
    topics: Topics,
    correlator: Arc<Correlator>,
    inbox: Arc<Inbox>,
    session: Mutex<Option<Session>>,
    active: AtomicBool,
}

impl MqttTransport {
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        let connection = ConnectionId::new();
        let topics = Topics::new(&config.base_topic, connection);
        let correlator = Correlator::new(topics.reply_prefix());
        Self {
            config,
            connection,
            topics,
            correlator,
            inbox: Arc::new(Inbox::new()),
            session: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn client(&self) -> Result<AsyncClient, MqttError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(MqttError::NotConnected)
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.config.client_id, self.connection);
        let mut options = MqttOptions::new(
            client_id,
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);
        if let Some((username, password)) = self.config.credentials() {
            options.set_credentials(username, password);
        }
        options
    }

    async fn connect(&self) -> Result<(), MqttError> {
        let (client, eventloop) = AsyncClient::new(self.options(), self.config.channel_capacity);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let demux = Demux {
            topics: self.topics.clone(),
            correlator: Arc::clone(&self.correlator),
            inbox: Arc::clone(&self.inbox),
            client: client.clone(),
        };
        let task = tokio::spawn(receive_loop(
            eventloop,
            demux,
            ready_tx,
            self.config.reconnect_delay(),
        ));

        let ready = tokio::time::timeout(
            self.config.connect_timeout(),
            ready_rx.wait_for(|ready| *ready),
        )
        .await
        .is_ok_and(|subscribed| subscribed.is_ok());
        if !ready {
            task.abort();
            return Err(MqttError::ConnectTimeout {
                host: self.config.broker_host.clone(),
                port: self.config.broker_port,
            });
        }

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session { client, task });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let client = self.client()?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

impl Transport for MqttTransport {
    #[tracing::instrument(skip(self), fields(broker = %self.config.broker_host, port = self.config.broker_port))]
    async fn start(&self) -> Result<(), BusError> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.connect().await?;
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(connection = %self.connection, "MQTT transport ready");
        Ok(())
    }

    async fn send_message(&self, subject: Option<String>, content: Content) -> Result<(), BusError> {
        let payload = envelope::encode(&Envelope::message(subject, content))?;
        self.publish(self.topics.bus(), payload).await?;
        Ok(())
    }

    async fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> Response {
        let deadline = Instant::now() + timeout;
        let pending = match self.correlator.register() {
            Ok(pending) => pending,
            Err(err) => return Response::no_reply(err.to_string()),
        };
        let payload = Envelope::request(subject, content, pending.id())
            .map_err(BusError::from)
            .and_then(|request| envelope::encode(&request).map_err(BusError::from));
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => return Response::internal(err.to_string()),
        };
        if let Err(err) = self.publish(self.topics.bus(), payload).await {
            tracing::warn!(error = %err, "unable to publish request");
            return Response::no_reply(format!("Unable to send request: {err}"));
        }
        pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    async fn fetch_message(&self, timeout: Duration) -> Option<TransportMessage> {
        if !self.is_active() {
            return None;
        }
        self.inbox.next(timeout).await
    }

    async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.correlator.close();
        self.inbox.close();

        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Session { client, task }) = session {
            if let Err(err) = client.disconnect().await {
                tracing::debug!(error = %err, "MQTT disconnect failed");
            }
            task.abort();
            let _ = task.await;
        }
        tracing::debug!(connection = %self.connection, "MQTT transport stopped");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Routes incoming publishes to the correlator or the inbox.
struct Demux {
    topics: Topics,
    correlator: Arc<Correlator>,
    inbox: Arc<Inbox>,
    client: AsyncClient,
}

impl Demux {
    fn handle(&self, topic: &str, payload: &[u8]) {
        if self.topics.is_reply(topic) {
            self.handle_reply(topic, payload);
        } else if topic == self.topics.bus() {
            self.handle_bus(payload);
        } else {
            tracing::warn!(topic, "message on unexpected topic");
        }
    }

    fn handle_reply(&self, topic: &str, payload: &[u8]) {
        let value = match serde_json::from_slice::<Value>(payload) {
            Ok(value) => unwrap_reply(value),
            Err(err) => {
                tracing::warn!(topic, error = %err, "malformed reply payload");
                Value::Null
            }
        };
        self.correlator.deliver(topic, value);
    }

    fn handle_bus(&self, payload: &[u8]) {
        let envelope = match envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed bus message");
                return;
            }
        };
        let message = match envelope.kind() {
            MessageKind::Message => TransportMessage::message(envelope),
            MessageKind::Request => {
                let address = envelope.reply_to().unwrap_or_default().to_string();
                let reply = reply_handle(self.client.clone(), address);
                TransportMessage::request(envelope, reply)
            }
            MessageKind::Reply => {
                tracing::debug!("ignoring reply published on the bus topic");
                return;
            }
        };
        if !self.inbox.push(message) {
            tracing::debug!("inbox closed, dropping message");
        }
    }
}

/// Replies are plain response maps; peers that wrap them in a reply
/// envelope are accepted too.
fn unwrap_reply(value: Value) -> Value {
    match value {
        Value::Object(mut map)
            if map.get("type").and_then(Value::as_str) == Some("reply")
                && map.get("content").is_some_and(Value::is_object) =>
        {
            map.remove("content").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn reply_handle(client: AsyncClient, address: String) -> ReplyHandle {
    ReplyHandle::new(address.clone(), move |response: Response| {
        Box::pin(async move {
            let payload = serde_json::to_vec(&response.to_value())
                .map_err(|err| BusError::Codec(err.into()))?;
            client
                .publish(address, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(MqttError::from)?;
            Ok(())
        })
    })
}

async fn receive_loop(
    mut eventloop: EventLoop,
    demux: Demux,
    ready: watch::Sender<bool>,
    reconnect_delay: Duration,
) {
    let mut pending_subscriptions = 0_u8;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                ready.send_replace(false);
                tracing::debug!("connected to MQTT broker, subscribing");
                pending_subscriptions = 0;
                for filter in [demux.topics.bus().to_string(), demux.topics.reply_filter()] {
                    match demux.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => pending_subscriptions += 1,
                        Err(err) => tracing::warn!(%filter, error = %err, "unable to subscribe"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                pending_subscriptions = pending_subscriptions.saturating_sub(1);
                if pending_subscriptions == 0 {
                    tracing::debug!("all MQTT topics subscribed, ready");
                    ready.send_replace(true);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                demux.handle(publish.topic.as_str(), &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                ready.send_replace(false);
                tracing::warn!(error = %err, "MQTT connection error, retrying");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}
