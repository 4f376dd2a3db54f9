//! AMQP transport configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the AMQP transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Virtual host, `/` being the broker default.
    pub vhost: String,
    /// Topic exchange shared by every agent.
    pub exchange: String,
    /// How long `start` waits for the broker session, in seconds.
    pub connect_timeout_secs: u16,
    /// Back-off before the bus consumer is recreated, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "agocontrol".to_string(),
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

impl AmqpConfig {
    /// Broker URI as understood by lapin.
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
