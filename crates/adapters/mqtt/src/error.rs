//! MQTT adapter error types.

use homebus_domain::envelope::CodecError;
use homebus_domain::error::BusError;

/// Errors specific to the MQTT transport.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The MQTT client has not been started yet.
    #[error("MQTT client not connected")]
    NotConnected,

    /// The rumqttc client returned an error.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The broker session was not ready in time.
    #[error("MQTT broker {host}:{port} not ready in time")]
    ConnectTimeout { host: String, port: u16 },

    /// Failed to encode or decode a payload.
    #[error("failed to process MQTT payload")]
    Codec(#[source] CodecError),
}

impl MqttError {
    /// Convert into a [`BusError`] for propagation across port boundaries.
    pub fn into_domain(self) -> BusError {
        match self {
            Self::NotConnected => BusError::NotConnected,
            Self::Codec(err) => BusError::Codec(err),
            other => BusError::Transport(Box::new(other)),
        }
    }
}

impl From<MqttError> for BusError {
    fn from(err: MqttError) -> Self {
        err.into_domain()
    }
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Client(err)
    }
}

impl From<CodecError> for MqttError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_connected_error() {
        let err = MqttError::NotConnected;
        assert_eq!(err.to_string(), "MQTT client not connected");
    }

    #[test]
    fn should_convert_not_connected_to_bus_error() {
        let err: BusError = MqttError::NotConnected.into();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[test]
    fn should_convert_timeout_to_transport_error() {
        let err: BusError = MqttError::ConnectTimeout {
            host: "localhost".to_string(),
            port: 1883,
        }
        .into();
        assert!(matches!(err, BusError::Transport(_)));
    }

    #[test]
    fn should_keep_codec_error_typed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad").unwrap_err();
        let err: BusError = MqttError::Codec(CodecError::Json(json_err)).into();
        assert!(matches!(err, BusError::Codec(CodecError::Json(_))));
    }
}
