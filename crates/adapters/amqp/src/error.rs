//! AMQP adapter error types.

use homebus_domain::envelope::CodecError;
use homebus_domain::error::BusError;

#[derive(Debug, thiserror::Error)]
pub enum AmqpError {
    #[error("AMQP transport not connected")]
    NotConnected,

    /// The broker or the lapin client reported an error.
    #[error("AMQP broker error")]
    Broker(#[source] lapin::Error),

    #[error("AMQP broker {host}:{port} not ready in time")]
    ConnectTimeout { host: String, port: u16 },

    #[error("failed to process AMQP payload")]
    Codec(#[source] CodecError),
}

impl AmqpError {
    /// Convert into a [`BusError`] for propagation across port boundaries.
    pub fn into_domain(self) -> BusError {
        match self {
            Self::NotConnected => BusError::NotConnected,
            Self::Codec(err) => BusError::Codec(err),
            other => BusError::Transport(Box::new(other)),
        }
    }
}

impl From<AmqpError> for BusError {
    fn from(err: AmqpError) -> Self {
        err.into_domain()
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err)
    }
}

impl From<CodecError> for AmqpError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(CodecError::Json(err))
    }
}
