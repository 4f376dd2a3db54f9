//! Command failures and parameter checks used by command handlers.

use serde_json::Value;

use crate::envelope::Content;
use crate::response::{Response, ResponseCode};

/// A command that could not be carried out, with a protocol identifier and
/// a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{identifier}: {message}")]
pub struct CommandError {
    pub identifier: String,
    pub message: String,
}

impl CommandError {
    #[must_use]
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::Failed.as_str(), message)
    }

    #[must_use]
    pub fn parameter_missing(key: &str) -> Self {
        Self::new(
            ResponseCode::ParameterMissing.as_str(),
            format!("Parameter {key} is required"),
        )
    }

    #[must_use]
    pub fn parameter_invalid(key: &str, reason: &str) -> Self {
        Self::new(
            ResponseCode::ParameterInvalid.as_str(),
            format!("Parameter {key} {reason}"),
        )
    }

    /// Convert into the error response sent back to the requester.
    ///
    /// Empty identifiers or messages fall back to `failed` / the identifier so
    /// the response always honours the protocol.
    #[must_use]
    pub fn into_response(self) -> Response {
        let identifier = if self.identifier.is_empty() {
            ResponseCode::Failed.as_str().to_string()
        } else {
            self.identifier
        };
        let message = if self.message.is_empty() {
            identifier.clone()
        } else {
            self.message
        };
        Response::error(identifier, message)
    }
}

impl From<CommandError> for Response {
    fn from(err: CommandError) -> Self {
        err.into_response()
    }
}

/// Require `key` to be present in `content`.
///
/// # Errors
///
/// Returns a `parameter.missing` [`CommandError`] when the key is absent.
pub fn require<'a>(content: &'a Content, key: &str) -> Result<&'a Value, CommandError> {
    content
        .get(key)
        .ok_or_else(|| CommandError::parameter_missing(key))
}

/// Require `key` to be a string, non-empty unless `allow_empty`.
///
/// # Errors
///
/// Returns `parameter.missing` or `parameter.invalid`.
pub fn require_str<'a>(
    content: &'a Content,
    key: &str,
    allow_empty: bool,
) -> Result<&'a str, CommandError> {
    let value = require(content, key)?
        .as_str()
        .ok_or_else(|| CommandError::parameter_invalid(key, "has invalid type"))?;
    if value.is_empty() && !allow_empty {
        return Err(CommandError::parameter_invalid(key, "must not be empty"));
    }
    Ok(value)
}

/// Require `key` to be a map.
///
/// # Errors
///
/// Returns `parameter.missing` or `parameter.invalid`.
pub fn require_object<'a>(content: &'a Content, key: &str) -> Result<&'a Content, CommandError> {
    require(content, key)?
        .as_object()
        .ok_or_else(|| CommandError::parameter_invalid(key, "has invalid type"))
}

/// Require `key` to be a non-negative integer.
///
/// # Errors
///
/// Returns `parameter.missing` or `parameter.invalid`.
pub fn require_u64(content: &Content, key: &str) -> Result<u64, CommandError> {
    require(content, key)?
        .as_u64()
        .ok_or_else(|| CommandError::parameter_invalid(key, "has invalid type"))
}

/// Require `key` to be a signed integer.
///
/// # Errors
///
/// Returns `parameter.missing` or `parameter.invalid`.
pub fn require_i64(content: &Content, key: &str) -> Result<i64, CommandError> {
    require(content, key)?
        .as_i64()
        .ok_or_else(|| CommandError::parameter_invalid(key, "has invalid type"))
}

/// Require `key` to be a boolean.
///
/// # Errors
///
/// Returns `parameter.missing` or `parameter.invalid`.
pub fn require_bool(content: &Content, key: &str) -> Result<bool, CommandError> {
    require(content, key)?
        .as_bool()
        .ok_or_else(|| CommandError::parameter_invalid(key, "has invalid type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(value: Value) -> Content {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn should_report_missing_parameter() {
        let err = require(&Content::new(), "eventmap").unwrap_err();
        assert_eq!(err.identifier, "parameter.missing");
        assert_eq!(err.message, "Parameter eventmap is required");
    }

    #[test]
    fn should_reject_empty_string_unless_allowed() {
        let c = content(json!({"name": ""}));
        let err = require_str(&c, "name", false).unwrap_err();
        assert_eq!(err.identifier, "parameter.invalid");
        assert_eq!(require_str(&c, "name", true).unwrap(), "");
    }

    #[test]
    fn should_reject_wrong_types() {
        let c = content(json!({"level": "high", "map": [], "on": 1, "delta": -3}));
        assert!(require_u64(&c, "level").is_err());
        assert!(require_object(&c, "map").is_err());
        assert!(require_bool(&c, "on").is_err());
        assert!(require_u64(&c, "delta").is_err());
        assert_eq!(require_i64(&c, "delta").unwrap(), -3);
    }

    #[test]
    fn should_convert_into_error_response() {
        let response = CommandError::failed("device busy").into_response();
        assert!(response.is_error());
        assert_eq!(response.identifier(), "failed");
        assert_eq!(response.message(), Some("device busy"));
    }

    #[test]
    fn should_fill_in_empty_message_on_conversion() {
        let response: Response = CommandError::new("custom.code", "").into();
        assert_eq!(response.identifier(), "custom.code");
        assert_eq!(response.message(), Some("custom.code"));
    }
}
