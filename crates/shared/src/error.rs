use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("topic '{0}' is outside the portrait namespace")]
    UnknownTopic(String),
    #[error("topic '{topic}' carries an invalid group id")]
    InvalidGroupId { topic: String },
    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),
    #[error("unexpected payload on '{topic}': {payload:?}")]
    UnexpectedPayload { topic: String, payload: String },
    #[error("topic '{0}' is not accepted in this direction")]
    WrongDirection(String),
    #[error("malformed login result: {0}")]
    MalformedLoginResult(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Upstream,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
