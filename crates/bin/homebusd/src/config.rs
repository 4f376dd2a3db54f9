//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `homebus.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use homebus_adapter_amqp::AmqpConfig;
use homebus_adapter_mqtt::MqttConfig;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub messaging: MessagingConfig,
    pub mqtt: MqttConfig,
    pub amqp: AmqpConfig,
    pub logging: LoggingConfig,
}

/// Identity and local state of this agent.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Instance name, announced as the device `handled-by` value.
    pub instance: String,
    /// Directory holding the persisted uuid map.
    pub state_dir: PathBuf,
}

/// Broker family selection.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub backend: Backend,
}

/// Supported broker families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mqtt,
    Amqp,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "amqp" | "qpid" => Ok(Self::Amqp),
            other => Err(ConfigError::Validation(format!(
                "unknown messaging backend {other:?}"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `homebus.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("homebus.toml")?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup("HOMEBUS_INSTANCE") {
            self.agent.instance = val;
        }
        if let Some(val) = lookup("HOMEBUS_STATE_DIR") {
            self.agent.state_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("HOMEBUS_MESSAGING") {
            self.messaging.backend = val.parse()?;
        }
        if let Some(val) = lookup("HOMEBUS_BROKER") {
            self.set_broker(&val)?;
        }
        if let Some(val) = lookup("HOMEBUS_USERNAME") {
            match self.messaging.backend {
                Backend::Mqtt => self.mqtt.username = Some(val),
                Backend::Amqp => self.amqp.username = val,
            }
        }
        if let Some(val) = lookup("HOMEBUS_PASSWORD") {
            match self.messaging.backend {
                Backend::Mqtt => self.mqtt.password = Some(val),
                Backend::Amqp => self.amqp.password = val,
            }
        }
        if let Some(val) = lookup("HOMEBUS_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = lookup("RUST_LOG") {
            self.logging.filter = val;
        }
        Ok(())
    }

    /// Point the selected backend at `host` or `host:port`.
    fn set_broker(&mut self, broker: &str) -> Result<(), ConfigError> {
        let (host, port) = match broker.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::Validation(format!("invalid broker port in {broker:?}"))
                })?;
                (host, Some(port))
            }
            None => (broker, None),
        };
        match self.messaging.backend {
            Backend::Mqtt => {
                self.mqtt.broker_host = host.to_string();
                if let Some(port) = port {
                    self.mqtt.broker_port = port;
                }
            }
            Backend::Amqp => {
                self.amqp.host = host.to_string();
                if let Some(port) = port {
                    self.amqp.port = port;
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.instance.trim().is_empty() {
            return Err(ConfigError::Validation("instance must not be empty".to_string()));
        }
        match self.messaging.backend {
            Backend::Mqtt if self.mqtt.broker_host.is_empty() || self.mqtt.broker_port == 0 => Err(
                ConfigError::Validation("mqtt broker address is incomplete".to_string()),
            ),
            Backend::Mqtt if self.mqtt.base_topic.is_empty() => Err(ConfigError::Validation(
                "mqtt base topic must not be empty".to_string(),
            )),
            Backend::Amqp if self.amqp.host.is_empty() || self.amqp.port == 0 => Err(
                ConfigError::Validation("amqp broker address is incomplete".to_string()),
            ),
            Backend::Amqp if self.amqp.exchange.is_empty() => Err(ConfigError::Validation(
                "amqp exchange must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Path of the persisted uuid map of this instance.
    #[must_use]
    pub fn uuid_map_path(&self) -> PathBuf {
        self.agent
            .state_dir
            .join("uuidmap")
            .join(format!("{}.json", self.agent.instance))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance: "event".to_string(),
            state_dir: PathBuf::from("."),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "homebusd=info,homebus=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
