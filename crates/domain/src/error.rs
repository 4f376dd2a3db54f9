//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`BusError`]
//! at port boundaries, boxing adapter-specific sources.

use crate::envelope::CodecError;
use crate::response::ResponseError;
use crate::uuid_map::UuidMapError;

/// Base error for every operation crossing a port boundary.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport was used before `start()` succeeded.
    #[error("transport not connected")]
    NotConnected,

    /// The connection is shutting down.
    #[error("shutdown signaled")]
    Shutdown,

    /// Domain invariant violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A payload could not be encoded or decoded.
    #[error("codec error")]
    Codec(#[from] CodecError),

    /// A response did not follow the response protocol.
    #[error("invalid response")]
    InvalidResponse(#[from] ResponseError),

    /// The uuid map rejected a mutation.
    #[error("uuid map error")]
    UuidMap(#[from] UuidMapError),

    /// The internal id does not name a registered device.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// A peer answered a request with an error response.
    #[error("remote error {identifier}: {message}")]
    Remote { identifier: String, message: String },

    /// No controller device could be found on the bus.
    #[error("controller unavailable")]
    ControllerUnavailable,

    /// A broker-level failure reported by a transport adapter.
    #[error("transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A failure reported by a persistence adapter.
    #[error("storage error")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Invariant violations detected while building domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A device needs a non-empty internal id.
    #[error("internal id must not be empty")]
    EmptyInternalId,

    /// A device needs a non-empty device type.
    #[error("device type must not be empty")]
    EmptyDeviceType,

    /// A request needs somewhere to send the reply.
    #[error("reply address must not be empty")]
    EmptyReplyAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_connected_error() {
        assert_eq!(BusError::NotConnected.to_string(), "transport not connected");
    }

    #[test]
    fn should_wrap_validation_error() {
        let err: BusError = ValidationError::EmptyInternalId.into();
        assert!(matches!(
            err,
            BusError::Validation(ValidationError::EmptyInternalId)
        ));
    }

    #[test]
    fn should_expose_boxed_transport_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BusError::Transport(Box::new(io));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "refused");
    }
}
