//! Response protocol exchanged as the reply to every request.
//!
//! A response is a JSON map holding exactly one of:
//!
//! ```json
//! {"result": {"identifier": "success", "message": "...", "data": {...}}}
//! {"error":  {"identifier": "failed",  "message": "...", "data": {...}}}
//! ```
//!
//! An error always has a non-empty identifier and message. `data`, when
//! present, is a map. Keys other than `result` / `error` are ignored on
//! decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Content;

/// Identifiers defined by the core protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    Failed,
    UnknownCommand,
    NoDeviceCommands,
    NoReply,
    ParameterMissing,
    ParameterInvalid,
    InternalError,
}

impl ResponseCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::UnknownCommand => "unknown.command",
            Self::NoDeviceCommands => "no.device.commands",
            Self::NoReply => "no.reply",
            Self::ParameterMissing => "parameter.missing",
            Self::ParameterInvalid => "parameter.invalid",
            Self::InternalError => "internal.error",
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a foreign value is not a valid response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("response must be a map")]
    NotAMap,
    #[error("response must contain either result or error")]
    MissingBody,
    #[error("response must not contain both result and error")]
    BothBodies,
    #[error("{0} body must be a map")]
    BodyNotAMap(&'static str),
    #[error("{0} body requires a non-empty identifier")]
    MissingIdentifier(&'static str),
    #[error("error body requires a non-empty message")]
    MissingMessage,
    #[error("{0} field must be a string")]
    NotAString(&'static str),
    #[error("data must be a map")]
    DataNotAMap,
}

/// Payload shared by both result and error responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    identifier: String,
    message: Option<String>,
    data: Option<Content>,
}

/// A validated protocol response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Response {
    Result(ResponseBody),
    Error(ResponseBody),
}

impl Response {
    /// Successful result with a custom identifier.
    ///
    /// # Panics
    ///
    /// Panics if `identifier` is empty.
    #[must_use]
    pub fn result(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        assert!(!identifier.is_empty(), "result identifier must not be empty");
        Self::Result(ResponseBody {
            identifier,
            message: None,
            data: None,
        })
    }

    /// Error response.
    ///
    /// # Panics
    ///
    /// Panics if `identifier` or `message` is empty; an error without a reason
    /// is a programming error.
    #[must_use]
    pub fn error(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let message = message.into();
        assert!(!identifier.is_empty(), "error identifier must not be empty");
        assert!(!message.is_empty(), "error message must not be empty");
        Self::Error(ResponseBody {
            identifier,
            message: Some(message),
            data: None,
        })
    }

    #[must_use]
    pub fn success() -> Self {
        Self::result(ResponseCode::Success.as_str())
    }

    #[must_use]
    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self::success().with_message(message)
    }

    #[must_use]
    pub fn success_with_data(data: Content) -> Self {
        Self::success().with_data(data)
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::error(ResponseCode::Failed.as_str(), message)
    }

    #[must_use]
    pub fn unknown_command() -> Self {
        Self::error(ResponseCode::UnknownCommand.as_str(), "Command not supported")
    }

    #[must_use]
    pub fn no_device_commands() -> Self {
        Self::error(
            ResponseCode::NoDeviceCommands.as_str(),
            "Device does not have any commands",
        )
    }

    #[must_use]
    pub fn no_reply(message: impl Into<String>) -> Self {
        Self::error(ResponseCode::NoReply.as_str(), message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(ResponseCode::InternalError.as_str(), message)
    }

    /// Attach a human readable message. An empty message is ignored on
    /// results and keeps the existing one on errors.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.is_empty() {
            self.body_mut().message = Some(message);
        }
        self
    }

    /// Attach structured data. An empty map clears it.
    #[must_use]
    pub fn with_data(mut self, data: Content) -> Self {
        self.body_mut().data = (!data.is_empty()).then_some(data);
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.body().identifier
    }

    /// Whether the identifier equals a core [`ResponseCode`].
    #[must_use]
    pub fn has_code(&self, code: ResponseCode) -> bool {
        self.identifier() == code.as_str()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.body().message.as_deref()
    }

    #[must_use]
    pub fn data(&self) -> Option<&Content> {
        self.body().data.as_ref()
    }

    fn body(&self) -> &ResponseBody {
        match self {
            Self::Result(body) | Self::Error(body) => body,
        }
    }

    fn body_mut(&mut self) -> &mut ResponseBody {
        match self {
            Self::Result(body) | Self::Error(body) => body,
        }
    }

    /// Render the wire map.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_content())
    }

    /// Render the wire map as envelope content.
    #[must_use]
    pub fn to_content(&self) -> Content {
        let (key, body) = match self {
            Self::Result(body) => ("result", body),
            Self::Error(body) => ("error", body),
        };
        let mut inner = Content::new();
        inner.insert("identifier".into(), Value::String(body.identifier.clone()));
        if let Some(message) = &body.message {
            inner.insert("message".into(), Value::String(message.clone()));
        }
        if let Some(data) = &body.data {
            inner.insert("data".into(), Value::Object(data.clone()));
        }
        let mut outer = Content::new();
        outer.insert(key.into(), Value::Object(inner));
        outer
    }

    /// Parse and validate a foreign response map.
    ///
    /// # Errors
    ///
    /// Returns a [`ResponseError`] describing the first violated invariant.
    pub fn from_value(value: &Value) -> Result<Self, ResponseError> {
        let map = value.as_object().ok_or(ResponseError::NotAMap)?;
        match (map.get("result"), map.get("error")) {
            (Some(_), Some(_)) => Err(ResponseError::BothBodies),
            (None, None) => Err(ResponseError::MissingBody),
            (Some(body), None) => parse_body(body, "result").map(Self::Result),
            (None, Some(body)) => {
                let body = parse_body(body, "error")?;
                if body.message.is_none() {
                    return Err(ResponseError::MissingMessage);
                }
                Ok(Self::Error(body))
            }
        }
    }
}

fn parse_body(value: &Value, kind: &'static str) -> Result<ResponseBody, ResponseError> {
    let map = value.as_object().ok_or(ResponseError::BodyNotAMap(kind))?;

    let identifier = match map.get("identifier") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) | None => return Err(ResponseError::MissingIdentifier(kind)),
        Some(_) => return Err(ResponseError::NotAString("identifier")),
    };

    let message = match map.get("message") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::String(_) | Value::Null) | None => None,
        Some(_) => return Err(ResponseError::NotAString("message")),
    };

    let data = match map.get("data") {
        Some(Value::Object(data)) if !data.is_empty() => Some(data.clone()),
        Some(Value::Object(_) | Value::Null) | None => None,
        Some(_) => return Err(ResponseError::DataNotAMap),
    };

    Ok(ResponseBody {
        identifier,
        message,
        data,
    })
}

impl TryFrom<Value> for Response {
    type Error = ResponseError;

    fn try_from(value: Value) -> Result<Self, ResponseError> {
        Self::from_value(&value)
    }
}

impl From<Response> for Value {
    fn from(response: Response) -> Self {
        response.to_value()
    }
}
