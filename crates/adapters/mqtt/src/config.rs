//! MQTT transport configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the MQTT transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address.
    pub broker_host: String,
    /// MQTT broker port.
    pub broker_port: u16,
    /// MQTT client identifier prefix; the connection id is appended.
    pub client_id: String,
    /// Base topic prefix shared by every agent on the bus.
    pub base_topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// How long `start` waits for the broker session, in seconds.
    pub connect_timeout_secs: u16,
    /// Back-off between reconnection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Capacity of the rumqttc request channel.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "homebus".to_string(),
            base_topic: "com.agocontrol".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
            channel_capacity: 64,
        }
    }
}

impl MqttConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Credentials, when both parts are set and non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_have_sensible_defaults() {
        let config = MqttConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.client_id, "homebus");
        assert_eq!(config.base_topic, "com.agocontrol");
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.credentials().is_none());
    }

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            broker_host = "mqtt.example.com"
            broker_port = 8883
            client_id = "kitchen"
            base_topic = "home"
            username = "agent"
            password = "secret"
            keep_alive_secs = 60
            connect_timeout_secs = 3
        "#;
        let config: MqttConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_host, "mqtt.example.com");
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.client_id, "kitchen");
        assert_eq!(config.base_topic, "home");
        assert_eq!(config.credentials(), Some(("agent", "secret")));
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.connect_timeout_secs, 3);
    }

    #[test]
    fn should_use_defaults_for_missing_fields() {
        let toml = r#"broker_host = "192.168.1.100""#;
        let config: MqttConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_host, "192.168.1.100");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
    }

    #[test]
    fn should_ignore_partial_credentials() {
        let config = MqttConfig {
            username: Some("agent".to_string()),
            ..Default::default()
        };
        assert!(config.credentials().is_none());
    }
}
