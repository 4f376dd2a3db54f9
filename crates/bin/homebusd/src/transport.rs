//! Transport selected by configuration.

use std::time::Duration;

use homebus_adapter_amqp::AmqpTransport;
use homebus_adapter_mqtt::MqttTransport;
use homebus_app::ports::{Transport, TransportMessage};
use homebus_domain::envelope::Content;
use homebus_domain::error::BusError;
use homebus_domain::response::Response;

use crate::config::{Backend, Config};

/// One of the supported broker transports.
pub enum BusTransport {
    Mqtt(MqttTransport),
    Amqp(AmqpTransport),
}

impl BusTransport {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        match config.messaging.backend {
            Backend::Mqtt => Self::Mqtt(MqttTransport::new(config.mqtt.clone())),
            Backend::Amqp => Self::Amqp(AmqpTransport::new(config.amqp.clone())),
        }
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        match self {
            Self::Mqtt(_) => Backend::Mqtt,
            Self::Amqp(_) => Backend::Amqp,
        }
    }
}

impl Transport for BusTransport {
    async fn start(&self) -> Result<(), BusError> {
        match self {
            Self::Mqtt(inner) => inner.start().await,
            Self::Amqp(inner) => inner.start().await,
        }
    }

    async fn send_message(&self, subject: Option<String>, content: Content) -> Result<(), BusError> {
        match self {
            Self::Mqtt(inner) => inner.send_message(subject, content).await,
            Self::Amqp(inner) => inner.send_message(subject, content).await,
        }
    }

    async fn send_request(
        &self,
        subject: Option<String>,
        content: Content,
        timeout: Duration,
    ) -> Response {
        match self {
            Self::Mqtt(inner) => inner.send_request(subject, content, timeout).await,
            Self::Amqp(inner) => inner.send_request(subject, content, timeout).await,
        }
    }

    async fn fetch_message(&self, timeout: Duration) -> Option<TransportMessage> {
        match self {
            Self::Mqtt(inner) => inner.fetch_message(timeout).await,
            Self::Amqp(inner) => inner.fetch_message(timeout).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Mqtt(inner) => inner.shutdown().await,
            Self::Amqp(inner) => inner.shutdown().await,
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Self::Mqtt(inner) => inner.is_active(),
            Self::Amqp(inner) => inner.is_active(),
        }
    }
}
