//! Materialised aggregate state.
//!
//! A [`StateAggregate`] is the runtime wrapper the processor owns for one
//! command cycle: the domain state plus the version, last event id, operators
//! and lifecycle flags folded from the event history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateMetadata, EventKind},
    error::{ErrorCode, RecoverableType, codes},
    event::{DomainEventStream, EventDecodeError},
    id::AggregateId,
    message::{Header, Message, OPERATOR_HEADER},
    snapshot::Snapshot,
};

/// Failure folding a stream into a [`StateAggregate`].
#[derive(Debug, Error)]
pub enum SourcingError {
    /// The stream does not continue the state's history.
    #[error("cannot source stream version {actual} into {aggregate_id}: expected version {expected}")]
    VersionConflict {
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },
    #[error("stream for {actual} cannot be sourced into {expected}")]
    AggregateMismatch {
        expected: AggregateId,
        actual: AggregateId,
    },
    /// No apply function is registered for the event name.
    #[error("{aggregate} has no handler for event `{name}`")]
    UnsupportedEventType { aggregate: String, name: String },
    #[error("failed to decode event `{name}` at version {version}: {source}")]
    Decode {
        name: String,
        version: u64,
        #[source]
        source: EventDecodeError,
    },
}

impl ErrorCode for SourcingError {
    fn error_code(&self) -> &str {
        match self {
            Self::VersionConflict { .. } => codes::SOURCING_VERSION_CONFLICT,
            Self::AggregateMismatch { .. } => codes::ILLEGAL_ARGUMENT,
            Self::UnsupportedEventType { .. } => codes::UNSUPPORTED_EVENT_TYPE,
            Self::Decode { .. } => codes::CODEC,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unrecoverable
    }
}

/// Domain state plus tracking fields.
#[derive(Clone, Debug)]
pub struct StateAggregate<A> {
    aggregate_id: AggregateId,
    state: A,
    version: u64,
    event_id: String,
    first_operator: String,
    operator: String,
    first_event_time: Option<DateTime<Utc>>,
    event_time: Option<DateTime<Utc>>,
    deleted: bool,
}

impl<A: Aggregate> StateAggregate<A> {
    /// A not-yet-created aggregate at version 0.
    #[must_use]
    pub fn uninitialized(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            state: A::default(),
            version: 0,
            event_id: String::new(),
            first_operator: String::new(),
            operator: String::new(),
            first_event_time: None,
            event_time: None,
            deleted: false,
        }
    }

    /// Rehydrate from a snapshot; streams above its version still need to be
    /// sourced.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot<A>) -> Self {
        Self {
            aggregate_id: snapshot.aggregate_id,
            state: snapshot.state,
            version: snapshot.version,
            event_id: snapshot.event_id,
            first_operator: snapshot.first_operator,
            operator: snapshot.operator,
            first_event_time: Some(snapshot.first_event_time),
            event_time: Some(snapshot.event_time),
            deleted: snapshot.deleted,
        }
    }

    #[must_use]
    pub const fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    #[must_use]
    pub fn into_state(self) -> A {
        self.state
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn expected_next_version(&self) -> u64 {
        self.version + 1
    }

    /// Whether at least one event has been folded.
    #[must_use]
    pub const fn initialized(&self) -> bool {
        self.version > 0
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    #[must_use]
    pub fn first_operator(&self) -> &str {
        &self.first_operator
    }

    #[must_use]
    pub fn operator(&self) -> &str {
        &self.operator
    }

    #[must_use]
    pub const fn first_event_time(&self) -> Option<DateTime<Utc>> {
        self.first_event_time
    }

    #[must_use]
    pub const fn event_time(&self) -> Option<DateTime<Utc>> {
        self.event_time
    }

    #[must_use]
    pub const fn deleted(&self) -> bool {
        self.deleted
    }

    /// Fold one stream into the state.
    ///
    /// On error the state may be partially updated and must be discarded.
    ///
    /// # Errors
    ///
    /// Fails if the stream belongs to another aggregate, does not start at
    /// [`expected_next_version`](Self::expected_next_version), or contains an
    /// event the metadata cannot apply.
    pub fn on_sourcing(
        &mut self,
        stream: &DomainEventStream,
        metadata: &AggregateMetadata<A>,
    ) -> Result<(), SourcingError> {
        if stream.aggregate_id != self.aggregate_id {
            return Err(SourcingError::AggregateMismatch {
                expected: self.aggregate_id.clone(),
                actual: stream.aggregate_id.clone(),
            });
        }
        if stream.version != self.expected_next_version() {
            return Err(SourcingError::VersionConflict {
                aggregate_id: self.aggregate_id.clone(),
                expected: self.expected_next_version(),
                actual: stream.version,
            });
        }

        for event in stream.iter() {
            let route = metadata.event_route(&event.name).ok_or_else(|| {
                SourcingError::UnsupportedEventType {
                    aggregate: metadata.named_aggregate().to_string(),
                    name: event.name.clone(),
                }
            })?;
            route
                .apply(&mut self.state, event)
                .map_err(|source| SourcingError::Decode {
                    name: event.name.clone(),
                    version: event.version,
                    source,
                })?;
            match route.kind() {
                EventKind::Deleted => self.deleted = true,
                EventKind::Recovered => self.deleted = false,
                EventKind::Regular => {}
            }
            self.version = event.version;
            self.event_id.clone_from(&event.id);
        }

        let operator = stream.header.get(OPERATOR_HEADER).cloned().unwrap_or_default();
        if self.first_event_time.is_none() {
            self.first_operator.clone_from(&operator);
            self.first_event_time = Some(stream.create_time);
        }
        self.operator = operator;
        self.event_time = Some(stream.create_time);
        tracing::trace!(
            aggregate_id = %self.aggregate_id,
            version = self.version,
            deleted = self.deleted,
            "stream sourced"
        );
        Ok(())
    }

    /// Capture the current state as a snapshot. `None` before the first event.
    #[must_use]
    pub fn to_snapshot(&self, snapshot_time: DateTime<Utc>) -> Option<Snapshot<A>> {
        Some(Snapshot {
            aggregate_id: self.aggregate_id.clone(),
            version: self.version,
            state: self.state.clone(),
            event_id: self.event_id.clone(),
            first_operator: self.first_operator.clone(),
            operator: self.operator.clone(),
            first_event_time: self.first_event_time?,
            event_time: self.event_time?,
            snapshot_time,
            deleted: self.deleted,
        })
    }

    /// Pair a freshly persisted stream with this (already sourced) state.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the state cannot be encoded.
    pub fn to_state_event(&self, stream: DomainEventStream) -> Result<StateEvent, serde_json::Error> {
        Ok(StateEvent {
            state: serde_json::to_value(&self.state)?,
            first_operator: self.first_operator.clone(),
            first_event_time: self.first_event_time.unwrap_or(stream.create_time),
            deleted: self.deleted,
            stream,
        })
    }
}

/// A persisted stream together with the state it produced.
///
/// Published on the state-event bus so consumers (for example the
/// snapshotter) do not have to replay history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateEvent {
    pub stream: DomainEventStream,
    pub state: serde_json::Value,
    #[serde(default)]
    pub first_operator: String,
    pub first_event_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl StateEvent {
    /// Version of the state carried by this event.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.stream.tail_version()
    }

    /// Build the snapshot this event describes.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the state does not decode as `A`.
    pub fn to_snapshot<A: Aggregate>(
        &self,
        snapshot_time: DateTime<Utc>,
    ) -> Result<Snapshot<A>, serde_json::Error> {
        let last = self.stream.events().last();
        Ok(Snapshot {
            aggregate_id: self.stream.aggregate_id.clone(),
            version: self.version(),
            state: serde_json::from_value(self.state.clone())?,
            event_id: last.id.clone(),
            first_operator: self.first_operator.clone(),
            operator: self
                .stream
                .header
                .get(OPERATOR_HEADER)
                .cloned()
                .unwrap_or_default(),
            first_event_time: self.first_event_time,
            event_time: self.stream.create_time,
            snapshot_time,
            deleted: self.deleted,
        })
    }
}

impl Message for StateEvent {
    fn message_id(&self) -> &str {
        self.stream.message_id()
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.stream.aggregate_id
    }

    fn header(&self) -> &Header {
        &self.stream.header
    }

    fn command_id(&self) -> &str {
        &self.stream.command_id
    }

    fn request_id(&self) -> &str {
        &self.stream.request_id
    }

    fn aggregate_version(&self) -> Option<u64> {
        Some(self.version())
    }

    fn version_range(&self) -> Option<(u64, u64)> {
        self.stream.version_range()
    }
}
