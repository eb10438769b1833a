//! Commands and command results.

use std::{
    any::{Any, TypeId, type_name},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorCode, ErrorInfo},
    id::{AggregateId, generate_id},
    message::{Header, Message},
};

/// A command addressed to one aggregate.
///
/// The body is type-erased so commands for every aggregate can share one bus;
/// the processor routes it back to a handler by its runtime type.
#[derive(Clone)]
pub struct CommandMessage {
    pub id: String,
    /// Caller-chosen idempotency key. Defaults to the command id.
    pub request_id: String,
    pub aggregate_id: AggregateId,
    /// Expected current version of the aggregate, for optimistic checks.
    pub aggregate_version: Option<u64>,
    pub header: Header,
    pub create_time: DateTime<Utc>,
    name: &'static str,
    body: Arc<dyn Any + Send + Sync>,
}

impl CommandMessage {
    pub fn new<C>(aggregate_id: AggregateId, body: C) -> Self
    where
        C: Send + Sync + 'static,
    {
        let id = generate_id();
        Self {
            request_id: id.clone(),
            id,
            aggregate_id,
            aggregate_version: None,
            header: Header::new(),
            create_time: Utc::now(),
            name: type_name::<C>(),
            body: Arc::new(body),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub const fn with_aggregate_version(mut self, version: u64) -> Self {
        self.aggregate_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Rust type name of the body.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn body_type_id(&self) -> TypeId {
        (*self.body).type_id()
    }

    #[must_use]
    pub fn body_any(&self) -> &(dyn Any + Send + Sync) {
        &*self.body
    }

    /// Typed access to the body.
    #[must_use]
    pub fn body<C: 'static>(&self) -> Option<&C> {
        self.body.downcast_ref::<C>()
    }
}

impl fmt::Debug for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandMessage")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_version", &self.aggregate_version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Message for CommandMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn command_id(&self) -> &str {
        &self.id
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn aggregate_version(&self) -> Option<u64> {
        self.aggregate_version
    }
}

/// Propagation stages of a command, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStage {
    /// Accepted by the command bus.
    Sent,
    /// Events appended (or the command rejected) by the processor.
    Processed,
    Snapshot,
    Projected,
    EventHandled,
    SagaHandled,
}

impl CommandStage {
    pub const ALL: [Self; 6] = [
        Self::Sent,
        Self::Processed,
        Self::Snapshot,
        Self::Projected,
        Self::EventHandled,
        Self::SagaHandled,
    ];

    /// Stages strictly before `self`.
    pub fn previous(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |stage| *stage < self)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Processed => "PROCESSED",
            Self::Snapshot => "SNAPSHOT",
            Self::Projected => "PROJECTED",
            Self::EventHandled => "EVENT_HANDLED",
            Self::SagaHandled => "SAGA_HANDLED",
        }
    }
}

impl fmt::Display for CommandStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a command at one stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub stage: CommandStage,
    pub context_name: String,
    pub aggregate_name: String,
    pub tenant_id: String,
    pub aggregate_id: String,
    /// Aggregate version after the command, when known.
    pub aggregate_version: Option<u64>,
    pub request_id: String,
    pub command_id: String,
    /// Name of the component that reported this stage.
    pub processor: String,
    pub error: ErrorInfo,
    /// The command had already been applied; this reports the earlier
    /// outcome.
    #[serde(default)]
    pub duplicate: bool,
    pub signal_time: DateTime<Utc>,
}

impl CommandResult {
    /// A successful result for `stage`.
    pub fn succeeded<M: Message>(
        stage: CommandStage,
        processor: impl Into<String>,
        message: &M,
    ) -> Self {
        let aggregate_id = message.aggregate_id();
        Self {
            id: generate_id(),
            stage,
            context_name: aggregate_id.context_name().to_string(),
            aggregate_name: aggregate_id.aggregate_name().to_string(),
            tenant_id: aggregate_id.tenant_id.clone(),
            aggregate_id: aggregate_id.id.clone(),
            aggregate_version: message.aggregate_version(),
            request_id: message.request_id().to_string(),
            command_id: message.command_id().to_string(),
            processor: processor.into(),
            error: ErrorInfo::ok(),
            duplicate: false,
            signal_time: Utc::now(),
        }
    }

    /// A failed result for `stage`.
    pub fn failed<M, E>(
        stage: CommandStage,
        processor: impl Into<String>,
        message: &M,
        error: &E,
    ) -> Self
    where
        M: Message,
        E: ErrorCode + std::error::Error + ?Sized,
    {
        Self::succeeded(stage, processor, message).with_error(ErrorInfo::from_error(error))
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub const fn with_aggregate_version(mut self, version: Option<u64>) -> Self {
        self.aggregate_version = version;
        self
    }

    #[must_use]
    pub const fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.error.is_succeeded()
    }
}
