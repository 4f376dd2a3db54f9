//! [`Transport`] implementation over an AMQP 0-9-1 broker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use homebus_app::correlator::Correlator;
use homebus_app::inbox::Inbox;
use homebus_app::ports::{ReplyHandle, Transport, TransportMessage};
use homebus_domain::envelope::{CodecError, Content, Envelope};
use homebus_domain::error::BusError;
use homebus_domain::id::ConnectionId;
use homebus_domain::response::Response;

use crate::config::AmqpConfig;
use crate::error::AmqpError;

const CLOSE_OK: u16 = 200;

/// Broker connection plus the channel carrying the bus consumer.
struct Link {
    connection: Arc<Connection>,
    channel: Channel,
}

type SharedLink = Arc<Mutex<Option<Arc<Link>>>>;

/// AMQP-backed transport for one connection.
pub struct AmqpTransport {
    config: AmqpConfig,
    connection: ConnectionId,
    link: SharedLink,
    correlator: Arc<Correlator>,
    inbox: Arc<Inbox>,
    task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl AmqpTransport {
    #[must_use]
    pub fn new(config: AmqpConfig) -> Self {
        let connection = ConnectionId::new();
        Self {
            config,
            connection,
            link: Arc::new(Mutex::new(None)),
            correlator: Correlator::new(format!("{connection}-")),
            inbox: Arc::new(Inbox::new()),
            task: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    fn current_link(&self) -> Result<Arc<Link>, AmqpError> {
        current_link(&self.link)
    }

    async fn open(&self) -> Result<Consumer, AmqpError> {
        let connection = Arc::new(
            Connection::connect(&self.config.uri(), ConnectionProperties::default()).await?,
        );
        match bind_bus(&connection, &self.config.exchange, self.connection).await {
            Ok((channel, consumer)) => {
                *self.link.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::new(Link { connection, channel }));
                Ok(consumer)
            }
            Err(err) => {
                if let Err(close_err) = connection.close(CLOSE_OK, "setup failed").await {
                    tracing::debug!(error = %close_err, "AMQP connection close failed");
                }
                Err(err)
            }
        }
    }

    async fn publish(
        &self,
        routing_key: &str,
        content: &Content,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let link = self.current_link()?;
        let payload = serde_json::to_vec(content)?;
        link.channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> Result<Response, AmqpError> {
        let deadline = Instant::now() + timeout;
        let link = self.current_link()?;
        let pending = match self.correlator.register() {
            Ok(pending) => pending,
            Err(err) => return Ok(Response::no_reply(err.to_string())),
        };
        let correlation_id = pending.id().to_string();

        let channel = link.connection.create_channel().await?;
        let (reply_queue, consumer) = close_on_error(
            reply_consumer(&channel, &correlation_id).await,
            close_channel(&channel, "reply queue setup failed"),
        )
        .await?;

        let properties = BasicProperties::default()
            .with_reply_to(reply_queue.as_str().into())
            .with_correlation_id(correlation_id.as_str().into());
        let published = self
            .publish(subject.as_deref().unwrap_or_default(), &content, properties)
            .await;

        let response = match published {
            Ok(()) => {
                tracing::trace!(%correlation_id, reply_queue, "request published");
                let listen = listen_for_reply(consumer, &correlation_id, &self.correlator);
                tokio::select! {
                    response = pending.wait(deadline.saturating_duration_since(Instant::now())) => response,
                    () = listen => Response::no_reply("Timeout"),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "unable to publish request");
                Response::no_reply(format!("Unable to send request: {err}"))
            }
        };

        close_channel(&channel, "reply received").await;
        Ok(response)
    }
}

impl Transport for AmqpTransport {
    #[tracing::instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn start(&self) -> Result<(), BusError> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = tokio::time::timeout(self.config.connect_timeout(), self.open())
            .await
            .map_err(|_| AmqpError::ConnectTimeout {
                host: self.config.host.clone(),
                port: self.config.port,
            })??;

        let task = tokio::spawn(receive_loop(
            consumer,
            self.config.clone(),
            self.connection,
            Arc::clone(&self.link),
            Arc::clone(&self.inbox),
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(connection = %self.connection, "AMQP transport ready");
        Ok(())
    }

    async fn send_message(&self, subject: Option<String>, content: Content) -> Result<(), BusError> {
        self.publish(
            subject.as_deref().unwrap_or_default(),
            &content,
            BasicProperties::default(),
        )
        .await?;
        Ok(())
    }

    async fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> Response {
        if !self.is_active() {
            return Response::no_reply(BusError::NotConnected.to_string());
        }
        match self.request(subject, content, timeout).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "request failed");
                Response::no_reply(format!("Unable to send request: {err}"))
            }
        }
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

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            close_channel(&link.channel, "shutdown").await;
            if let Err(err) = link.connection.close(CLOSE_OK, "shutdown").await {
                tracing::debug!(error = %err, "AMQP connection close failed");
            }
        }
        tracing::debug!(connection = %self.connection, "AMQP transport stopped");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

fn current_link(link: &SharedLink) -> Result<Arc<Link>, AmqpError> {
    link.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(AmqpError::NotConnected)
}

async fn close_channel(channel: &Channel, reason: &str) {
    if let Err(err) = channel.close(CLOSE_OK, reason).await {
        tracing::debug!(reason, error = %err, "unable to close AMQP channel");
    }
}

/// Awaits `cleanup` only when `result` failed, then hands `result` back.
async fn close_on_error<T, F>(result: Result<T, AmqpError>, cleanup: F) -> Result<T, AmqpError>
where
    F: Future<Output = ()>,
{
    if result.is_err() {
        cleanup.await;
    }
    result
}

/// Declares a private reply queue on `channel` and consumes it.
async fn reply_consumer(
    channel: &Channel,
    correlation_id: &str,
) -> Result<(String, Consumer), AmqpError> {
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    let reply_queue = queue.name().as_str().to_string();
    let consumer = channel
        .basic_consume(
            &reply_queue,
            &format!("{correlation_id}-reply"),
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok((reply_queue, consumer))
}

/// Declares the exchange and this connection's bus queue, then starts
/// consuming it.
async fn bind_bus(
    connection: &Connection,
    exchange: &str,
    id: ConnectionId,
) -> Result<(Channel, Consumer), AmqpError> {
    let channel = connection.create_channel().await?;
    let consumer = close_on_error(
        declare_bus(&channel, exchange, id).await,
        close_channel(&channel, "bus setup failed"),
    )
    .await?;
    Ok((channel, consumer))
}

async fn declare_bus(
    channel: &Channel,
    exchange: &str,
    id: ConnectionId,
) -> Result<Consumer, AmqpError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let consumer = channel
        .basic_consume(
            queue.name().as_str(),
            &format!("homebus-{id}"),
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(consumer)
}

/// Recreates the bus channel and consumer, reconnecting when the broker
/// connection itself is gone.
async fn recover(
    config: &AmqpConfig,
    id: ConnectionId,
    link: &SharedLink,
) -> Result<Consumer, AmqpError> {
    let previous = current_link(link).ok();
    let connection = match previous {
        Some(previous) if previous.connection.status().connected() => {
            Arc::clone(&previous.connection)
        }
        _ => Arc::new(Connection::connect(&config.uri(), ConnectionProperties::default()).await?),
    };
    let (channel, consumer) = bind_bus(&connection, &config.exchange, id).await?;
    *link.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Link { connection, channel }));
    Ok(consumer)
}

async fn receive_loop(
    consumer: Consumer,
    config: AmqpConfig,
    id: ConnectionId,
    link: SharedLink,
    inbox: Arc<Inbox>,
) {
    let mut consumer = Some(consumer);
    loop {
        let Some(current) = consumer.as_mut() else {
            match recover(&config, id, &link).await {
                Ok(recovered) => {
                    tracing::info!(connection = %id, "AMQP bus consumer recreated");
                    consumer = Some(recovered);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unable to recreate AMQP session");
                    tokio::time::sleep(config.reconnect_delay()).await;
                }
            }
            continue;
        };

        match current.next().await {
            Some(Ok(delivery)) => {
                let reply_to = delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string());
                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string());
                match inbound(delivery.routing_key.as_str(), &delivery.data, reply_to) {
                    Ok((envelope, None)) => {
                        inbox.push(TransportMessage::message(envelope));
                    }
                    Ok((envelope, Some(address))) => {
                        let reply = reply_handle(Arc::clone(&link), address, correlation_id);
                        inbox.push(TransportMessage::request(envelope, reply));
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping malformed bus message"),
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "AMQP consumer error, recreating session");
                consumer = None;
                tokio::time::sleep(config.reconnect_delay()).await;
            }
            None => {
                tracing::warn!("AMQP consumer cancelled, recreating session");
                consumer = None;
                tokio::time::sleep(config.reconnect_delay()).await;
            }
        }
    }
}

/// Builds the envelope of one bus delivery. Returns the reply address
/// alongside when the delivery is a request.
fn inbound(
    routing_key: &str,
    data: &[u8],
    reply_to: Option<String>,
) -> Result<(Envelope, Option<String>), AmqpError> {
    let content: Content = serde_json::from_slice(data)?;
    let subject = Some(routing_key.to_string()).filter(|key| !key.is_empty());
    match reply_to.filter(|address| !address.is_empty()) {
        Some(address) => {
            let envelope = Envelope::request(subject, content, address.clone())
                .map_err(|_| CodecError::MissingReplyAddress { kind: "request" })?;
            Ok((envelope, Some(address)))
        }
        None => Ok((Envelope::message(subject, content), None)),
    }
}

fn reply_handle(link: SharedLink, address: String, correlation_id: Option<String>) -> ReplyHandle {
    ReplyHandle::new(address.clone(), move |response: Response| {
        Box::pin(async move {
            let link = current_link(&link)?;
            let payload = serde_json::to_vec(&response.to_value()).map_err(AmqpError::from)?;
            let mut properties = BasicProperties::default();
            if let Some(correlation_id) = correlation_id {
                properties = properties.with_correlation_id(correlation_id.into());
            }
            link.channel
                .basic_publish(
                    "",
                    &address,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
                .map_err(AmqpError::from)?;
            Ok(())
        })
    })
}

/// Feeds the reply with the expected correlation id into the correlator.
/// Never completes, so the caller's wait decides when to stop.
async fn listen_for_reply(mut consumer: Consumer, correlation_id: &str, correlator: &Correlator) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::warn!(error = %err, "reply consumer failed");
                break;
            }
        };
        let matches = delivery
            .properties
            .correlation_id()
            .as_ref()
            .is_some_and(|id| id.as_str() == correlation_id);
        if !matches {
            tracing::debug!(correlation_id, "discarding reply with foreign correlation id");
            continue;
        }
        let payload = serde_json::from_slice::<Value>(&delivery.data).unwrap_or_else(|err| {
            tracing::warn!(correlation_id, error = %err, "malformed reply payload");
            Value::Null
        });
        correlator.deliver(correlation_id, payload);
        break;
    }
    std::future::pending::<()>().await;
}
