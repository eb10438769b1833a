//! Persistence layer abstractions.
//!
//! This module describes the storage contract (`EventStore`), the range types
//! used to query it, and a reference in-memory implementation. Backends only
//! need an atomic conditional insert keyed by `(aggregate_id, version)` and
//! `(aggregate_id, request_id)` plus ordered range scans.
use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use thiserror::Error;
use tokio_stream::StreamExt as _;

pub use nonempty::NonEmpty;

use crate::{
    concurrency::ConcurrencyConflict,
    error::{ErrorCode, RecoverableType, codes},
    event::DomainEventStream,
    id::AggregateId,
};

pub mod inmemory;

/// Open upper bound for version ranges.
pub const UNBOUNDED: u64 = u64::MAX;

/// Inclusive range of stream versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    head: u64,
    tail: u64,
}

impl VersionRange {
    /// # Errors
    ///
    /// Returns [`RangeError::Version`] if `tail < head`.
    pub const fn new(head: u64, tail: u64) -> Result<Self, RangeError> {
        if tail < head {
            return Err(RangeError::Version { head, tail });
        }
        Ok(Self { head, tail })
    }

    /// Every version from `head` onwards.
    #[must_use]
    pub const fn from(head: u64) -> Self {
        Self {
            head,
            tail: UNBOUNDED,
        }
    }

    /// The whole history.
    #[must_use]
    pub const fn all() -> Self {
        Self::from(1)
    }

    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    #[must_use]
    pub const fn tail(&self) -> u64 {
        self.tail
    }

    #[must_use]
    pub const fn contains(&self, version: u64) -> bool {
        self.head <= version && version <= self.tail
    }
}

/// Inclusive range of stream creation times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    head: DateTime<Utc>,
    tail: DateTime<Utc>,
}

impl TimeRange {
    /// # Errors
    ///
    /// Returns [`RangeError::Time`] if `tail < head`.
    pub fn new(head: DateTime<Utc>, tail: DateTime<Utc>) -> Result<Self, RangeError> {
        if tail < head {
            return Err(RangeError::Time { head, tail });
        }
        Ok(Self { head, tail })
    }

    #[must_use]
    pub const fn head(&self) -> DateTime<Utc> {
        self.head
    }

    #[must_use]
    pub const fn tail(&self) -> DateTime<Utc> {
        self.tail
    }

    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.head <= time && time <= self.tail
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("tail version {tail} is before head version {head}")]
    Version { head: u64, tail: u64 },
    #[error("tail time {tail} is before head time {head}")]
    Time {
        head: DateTime<Utc>,
        tail: DateTime<Utc>,
    },
}

impl ErrorCode for RangeError {
    fn error_code(&self) -> &str {
        codes::ILLEGAL_ARGUMENT
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unrecoverable
    }
}

/// Error from [`EventStore::append`].
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// A stream already exists at this `(aggregate_id, version)`.
    #[error(transparent)]
    VersionConflict(#[from] ConcurrencyConflict),
    /// This request was already appended for the aggregate.
    #[error("request `{request_id}` was already applied to {aggregate_id}")]
    DuplicateRequestId {
        aggregate_id: AggregateId,
        request_id: String,
    },
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl<StoreError: std::error::Error> ErrorCode for AppendError<StoreError> {
    fn error_code(&self) -> &str {
        match self {
            Self::VersionConflict(conflict) => conflict.error_code(),
            Self::DuplicateRequestId { .. } => codes::DUPLICATE_REQUEST_ID,
            Self::Store(_) => codes::STORE_UNAVAILABLE,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::VersionConflict(_) => RecoverableType::Recoverable,
            Self::DuplicateRequestId { .. } => RecoverableType::Unrecoverable,
            Self::Store(_) => RecoverableType::Unknown,
        }
    }
}

/// Lazy, finite sequence of streams ordered by ascending version (or time).
///
/// Calling the load method again restarts from the beginning.
pub type EventStreams<'a, E> =
    Pin<Box<dyn Stream<Item = Result<DomainEventStream, E>> + Send + 'a>>;

/// Append-only per-aggregate log with optimistic concurrency.
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist a stream atomically.
    ///
    /// The stream's version must be exactly one past the aggregate's current
    /// tail version. Concurrent appends at the same version yield exactly one
    /// success; the rest fail with [`AppendError::VersionConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::VersionConflict`],
    /// [`AppendError::DuplicateRequestId`] or [`AppendError::Store`].
    fn append<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Streams of one aggregate whose version lies in `range`, ascending.
    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error>;

    /// Streams of one aggregate created within `range`, ordered by time.
    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error>;

    /// The highest-version stream, if any.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<DomainEventStream>, Self::Error>> + Send + 'a;
}
// ANCHOR_END: event_store_trait

/// Drain an [`EventStreams`] into a vector.
///
/// # Errors
///
/// Returns the first error yielded by the sequence.
pub async fn collect_streams<E>(
    mut streams: EventStreams<'_, E>,
) -> Result<Vec<DomainEventStream>, E> {
    let mut out = Vec::new();
    while let Some(stream) = streams.next().await {
        out.push(stream?);
    }
    Ok(out)
}

impl<T> EventStore for std::sync::Arc<T>
where
    T: EventStore,
{
    type Error = T::Error;

    fn append<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a {
        (**self).append(stream)
    }

    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error> {
        (**self).load(aggregate_id, range)
    }

    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error> {
        (**self).load_by_time(aggregate_id, range)
    }

    fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<DomainEventStream>, Self::Error>> + Send + 'a {
        (**self).last(aggregate_id)
    }
}
