//! Transport-neutral error vocabulary.
//!
//! Typed errors stay typed inside the crate. At the processor boundary and in
//! error records they are flattened into an [`ErrorInfo`], which is what a
//! command caller sees in a [`CommandResult`](crate::command::CommandResult).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes.
pub mod codes {
    pub const SUCCEEDED: &str = "Ok";
    pub const BAD_REQUEST: &str = "BadRequest";
    pub const ILLEGAL_ARGUMENT: &str = "IllegalArgument";
    pub const COMMAND_VERSION_CONFLICT: &str = "CommandVersionConflict";
    pub const AGGREGATE_CREATED_BEFORE: &str = "AggregateCreatedBefore";
    pub const AGGREGATE_NOT_FOUND: &str = "AggregateNotFound";
    pub const AGGREGATE_DELETED: &str = "AggregateDeleted";
    pub const COMMAND_NOT_SUPPORTED: &str = "CommandNotSupported";
    pub const EVENT_VERSION_CONFLICT: &str = "EventVersionConflict";
    pub const DUPLICATE_REQUEST_ID: &str = "DuplicateRequestId";
    pub const CONCURRENCY_EXHAUSTED: &str = "ConcurrencyExhausted";
    pub const UNSUPPORTED_EVENT_TYPE: &str = "UnsupportedEventType";
    pub const SOURCING_VERSION_CONFLICT: &str = "SourcingVersionConflict";
    pub const ILLEGAL_EVENT_STREAM: &str = "IllegalEventStream";
    pub const WAIT_TIMEOUT: &str = "WaitTimeout";
    pub const HANDLER_FAILED: &str = "HandlerFailed";
    pub const BUS_UNAVAILABLE: &str = "BusUnavailable";
    pub const STORE_UNAVAILABLE: &str = "StoreUnavailable";
    pub const CODEC: &str = "Codec";
}

/// Whether retrying the same request may succeed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoverableType {
    Recoverable,
    Unrecoverable,
    #[default]
    Unknown,
}

/// Errors that know how they should be reported to a command caller.
pub trait ErrorCode {
    fn error_code(&self) -> &str;

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unknown
    }
}

/// Flattened error carried in command results and error records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_code: String,
    pub error_msg: String,
    #[serde(default)]
    pub recoverable: RecoverableType,
    /// Full source chain, kept for operators. Never shown as the result itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            error_code: codes::SUCCEEDED.to_string(),
            error_msg: String::new(),
            recoverable: RecoverableType::Unknown,
            details: None,
        }
    }

    #[must_use]
    pub fn new(error_code: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            error_msg: error_msg.into(),
            recoverable: RecoverableType::Unknown,
            details: None,
        }
    }

    /// Build from any typed error, capturing its source chain in `details`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: ErrorCode + std::error::Error + ?Sized,
    {
        Self {
            error_code: error.error_code().to_string(),
            error_msg: error.to_string(),
            recoverable: error.recoverable(),
            details: source_chain(error),
        }
    }

    #[must_use]
    pub fn with_recoverable(mut self, recoverable: RecoverableType) -> Self {
        self.recoverable = recoverable;
        self
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.error_code == codes::SUCCEEDED
    }
}

impl Default for ErrorInfo {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.error_msg)
    }
}

fn source_chain<E: std::error::Error + ?Sized>(error: &E) -> Option<String> {
    let mut chain = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    if chain.is_empty() {
        None
    } else {
        Some(chain.join(": "))
    }
}

/// General purpose business error for aggregates.
///
/// Aggregates may use their own error enums instead, as long as they
/// implement [`ErrorCode`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DomainError {
    code: String,
    message: String,
    recoverable: RecoverableType,
}

impl DomainError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable: RecoverableType::Unknown,
        }
    }

    /// A rejected request with [`codes::BAD_REQUEST`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, message).with_recoverable(RecoverableType::Unrecoverable)
    }

    #[must_use]
    pub const fn with_recoverable(mut self, recoverable: RecoverableType) -> Self {
        self.recoverable = recoverable;
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ErrorCode for DomainError {
    fn error_code(&self) -> &str {
        &self.code
    }

    fn recoverable(&self) -> RecoverableType {
        self.recoverable
    }
}
