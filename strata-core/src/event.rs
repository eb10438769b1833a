//! Domain events and the event stream model.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Command handlers raise events as [`RaisedEvent`]s; the
//! processor turns them into a versioned [`DomainEventStream`], which is the
//! unit of atomic persistence.

use std::{any::Any, fmt};

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    error::{ErrorCode, RecoverableType, codes},
    id::{AggregateId, generate_id},
    message::{Header, Message},
};

/// Marker trait for events that can be persisted.
///
/// Each event carries a unique [`Self::NAME`] so stored bodies can be routed
/// back to the right apply function when an aggregate is rebuilt.
pub trait DomainEvent: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Instance-level access to [`DomainEvent::NAME`].
///
/// Blanket-implemented for every `DomainEvent`; never implement it yourself.
pub trait EventName {
    fn name(&self) -> &'static str;
}

impl<T: DomainEvent> EventName for T {
    fn name(&self) -> &'static str {
        T::NAME
    }
}

trait ErasedEvent: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn to_body(&self) -> Result<serde_json::Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<E: DomainEvent> ErasedEvent for E {
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn to_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An event produced by a command handler, not yet versioned.
///
/// ```ignore
/// Ok(vec![OrderCreated { id: cmd.id.clone() }.into()])
/// ```
pub struct RaisedEvent(Box<dyn ErasedEvent>);

impl RaisedEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Serialise the event body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the event cannot be represented as
    /// JSON.
    pub fn to_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        self.0.to_body()
    }

    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.0.as_any().downcast_ref::<E>()
    }
}

impl<E: DomainEvent> From<E> for RaisedEvent {
    fn from(event: E) -> Self {
        Self(Box::new(event))
    }
}

impl fmt::Debug for RaisedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Error returned when a stored body does not decode into the requested type.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("expected event `{expected}`, found `{actual}`")]
    UnexpectedName {
        expected: &'static str,
        actual: String,
    },
    #[error("failed to decode event body: {0}")]
    Body(#[source] serde_json::Error),
}

/// One persisted state transition.
///
/// Identity is `(aggregate_id, version)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub aggregate_id: AggregateId,
    pub version: u64,
    /// 1-based position inside the owning stream.
    pub sequence: u32,
    pub is_last: bool,
    pub name: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub header: Header,
    pub create_time: DateTime<Utc>,
}

impl StoredEvent {
    /// Decode the body into a concrete event type.
    ///
    /// # Errors
    ///
    /// Fails if the stored name is not `E::NAME` or the body does not match
    /// `E`.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, EventDecodeError> {
        if self.name != E::NAME {
            return Err(EventDecodeError::UnexpectedName {
                expected: E::NAME,
                actual: self.name.clone(),
            });
        }
        serde_json::from_value(self.body.clone()).map_err(EventDecodeError::Body)
    }
}

impl PartialEq for StoredEvent {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_id == other.aggregate_id && self.version == other.version
    }
}

impl Eq for StoredEvent {}

/// A stream that violates the stream invariants.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IllegalEventStreamError {
    #[error("an event stream must contain at least one event")]
    Empty,
    #[error("event stream version must start at 1 or later, got {version}")]
    InvalidVersion { version: u64 },
    #[error("event #{index} has version {actual}, expected {expected}")]
    NonConsecutive {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("event #{index} belongs to {actual}, expected {expected}")]
    AggregateMismatch {
        index: usize,
        expected: AggregateId,
        actual: AggregateId,
    },
}

impl ErrorCode for IllegalEventStreamError {
    fn error_code(&self) -> &str {
        codes::ILLEGAL_EVENT_STREAM
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unrecoverable
    }
}

/// Failure building a stream from raised events.
#[derive(Debug, Error)]
pub enum BuildStreamError {
    #[error(transparent)]
    Illegal(#[from] IllegalEventStreamError),
    #[error("failed to encode event `{name}`: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ErrorCode for BuildStreamError {
    fn error_code(&self) -> &str {
        match self {
            Self::Illegal(e) => e.error_code(),
            Self::Encode { .. } => codes::CODEC,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unrecoverable
    }
}

/// Ordered, non-empty batch of events produced by exactly one command.
///
/// Invariant: `events[i].version == version + i`. Identity is
/// `(aggregate_id, version)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainEventStream {
    pub id: String,
    pub request_id: String,
    pub command_id: String,
    pub aggregate_id: AggregateId,
    #[serde(default)]
    pub owner_id: String,
    /// Version of the first event.
    pub version: u64,
    #[serde(default)]
    pub header: Header,
    pub create_time: DateTime<Utc>,
    events: NonEmpty<StoredEvent>,
}

impl DomainEventStream {
    /// Start building a stream whose first event gets `version`.
    #[must_use]
    pub fn builder(aggregate_id: AggregateId, version: u64) -> StreamBuilder {
        StreamBuilder {
            aggregate_id,
            version,
            command_id: None,
            request_id: None,
            owner_id: String::new(),
            header: Header::new(),
            create_time: None,
        }
    }

    #[must_use]
    pub const fn events(&self) -> &NonEmpty<StoredEvent> {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredEvent> {
        self.events.iter()
    }

    #[must_use]
    pub fn into_events(self) -> NonEmpty<StoredEvent> {
        self.events
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    /// Version of the last event in the stream.
    #[must_use]
    pub fn tail_version(&self) -> u64 {
        self.version + self.events.len() as u64 - 1
    }

    /// Re-check the stream invariants, e.g. after loading from storage.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), IllegalEventStreamError> {
        if self.version == 0 {
            return Err(IllegalEventStreamError::InvalidVersion {
                version: self.version,
            });
        }
        for (index, event) in self.events.iter().enumerate() {
            let expected = self.version + index as u64;
            if event.version != expected {
                return Err(IllegalEventStreamError::NonConsecutive {
                    index,
                    expected,
                    actual: event.version,
                });
            }
            if event.aggregate_id != self.aggregate_id {
                return Err(IllegalEventStreamError::AggregateMismatch {
                    index,
                    expected: self.aggregate_id.clone(),
                    actual: event.aggregate_id.clone(),
                });
            }
        }
        Ok(())
    }
}

impl PartialEq for DomainEventStream {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_id == other.aggregate_id && self.version == other.version
    }
}

impl Eq for DomainEventStream {}

impl Message for DomainEventStream {
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
        &self.command_id
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn aggregate_version(&self) -> Option<u64> {
        Some(self.tail_version())
    }

    fn version_range(&self) -> Option<(u64, u64)> {
        Some((self.version, self.tail_version()))
    }
}

/// Builder returned by [`DomainEventStream::builder`].
#[derive(Debug)]
pub struct StreamBuilder {
    aggregate_id: AggregateId,
    version: u64,
    command_id: Option<String>,
    request_id: Option<String>,
    owner_id: String,
    header: Header,
    create_time: Option<DateTime<Utc>>,
}

impl StreamBuilder {
    #[must_use]
    pub fn command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// Defaults to the command id.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    #[must_use]
    pub fn header(mut self, header: Header) -> Self {
        self.header = header;
        self
    }

    #[must_use]
    pub const fn create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = Some(create_time);
        self
    }

    /// Assign consecutive versions to `bodies` (`(name, body)` pairs).
    ///
    /// # Errors
    ///
    /// Returns [`IllegalEventStreamError::Empty`] for an empty list and
    /// [`IllegalEventStreamError::InvalidVersion`] for version 0.
    pub fn build(
        self,
        bodies: Vec<(String, serde_json::Value)>,
    ) -> Result<DomainEventStream, IllegalEventStreamError> {
        if self.version == 0 {
            return Err(IllegalEventStreamError::InvalidVersion { version: 0 });
        }
        let count = bodies.len();
        let create_time = self.create_time.unwrap_or_else(Utc::now);
        let events: Vec<StoredEvent> = bodies
            .into_iter()
            .enumerate()
            .map(|(index, (name, body))| StoredEvent {
                id: generate_id(),
                aggregate_id: self.aggregate_id.clone(),
                version: self.version + index as u64,
                sequence: u32::try_from(index + 1).unwrap_or(u32::MAX),
                is_last: index + 1 == count,
                name,
                body,
                header: self.header.clone(),
                create_time,
            })
            .collect();
        let events = NonEmpty::from_vec(events).ok_or(IllegalEventStreamError::Empty)?;

        let command_id = self.command_id.unwrap_or_else(generate_id);
        let request_id = self.request_id.unwrap_or_else(|| command_id.clone());
        Ok(DomainEventStream {
            id: generate_id(),
            request_id,
            command_id,
            aggregate_id: self.aggregate_id,
            owner_id: self.owner_id,
            version: self.version,
            header: self.header,
            create_time,
            events,
        })
    }

    /// Serialise raised events, then [`build`](Self::build).
    ///
    /// # Errors
    ///
    /// Fails if an event body cannot be encoded or the stream is illegal.
    pub fn build_raised(self, events: &[RaisedEvent]) -> Result<DomainEventStream, BuildStreamError> {
        let mut bodies = Vec::with_capacity(events.len());
        for event in events {
            let body = event.to_body().map_err(|source| BuildStreamError::Encode {
                name: event.name(),
                source,
            })?;
            bodies.push((event.name().to_string(), body));
        }
        Ok(self.build(bodies)?)
    }
}
