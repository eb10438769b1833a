//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and examples.
//!
//! # Example
//!
//! ```
//! use strata_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use crate::{
    concurrency::ConcurrencyConflict,
    event::{DomainEventStream, IllegalEventStreamError},
    id::AggregateId,
    store::{AppendError, EventStore, EventStreams, TimeRange, VersionRange},
};

/// In-memory event store that keeps one ordered list of streams per
/// aggregate.
///
/// Appends and request-id bookkeeping happen under a single write lock, so
/// the version check and the insert are atomic.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<AggregateId, Vec<DomainEventStream>>,
    request_ids: HashSet<(AggregateId, String)>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of streams across all aggregates.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        inner.streams.values().map(Vec::len).sum()
    }
}

/// Error type for in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("refusing to store illegal event stream: {0}")]
    IllegalStream(#[source] IllegalEventStreamError),
}

impl EventStore for Store {
    type Error = InMemoryError;

    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = stream.version, size = stream.size())
    )]
    fn append<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a {
        let result: Result<(), AppendError<InMemoryError>> = (|| {
            stream
                .validate()
                .map_err(|e| AppendError::store(InMemoryError::IllegalStream(e)))?;

            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let current = inner
                .streams
                .get(&stream.aggregate_id)
                .and_then(|s| s.last().map(DomainEventStream::tail_version))
                .unwrap_or(0);

            if stream.version != current + 1 {
                tracing::debug!(current, "version mismatch, rejecting append");
                return Err(ConcurrencyConflict {
                    aggregate_id: stream.aggregate_id.clone(),
                    expected: stream.version - 1,
                    actual: current,
                }
                .into());
            }

            let request_key = (stream.aggregate_id.clone(), stream.request_id.clone());
            if inner.request_ids.contains(&request_key) {
                tracing::debug!(request_id = %stream.request_id, "duplicate request, rejecting append");
                return Err(AppendError::DuplicateRequestId {
                    aggregate_id: stream.aggregate_id.clone(),
                    request_id: stream.request_id.clone(),
                });
            }

            inner.request_ids.insert(request_key);
            inner
                .streams
                .entry(stream.aggregate_id.clone())
                .or_default()
                .push(stream.clone());
            drop(inner);
            tracing::debug!(tail_version = stream.tail_version(), "stream appended");
            Ok(())
        })();

        std::future::ready(result)
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error> {
        let streams: Vec<_> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(aggregate_id)
                .map(|streams| {
                    streams
                        .iter()
                        .filter(|s| range.contains(s.version))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        tracing::trace!(streams_loaded = streams.len(), "loaded streams by version");
        Box::pin(tokio_stream::iter(streams.into_iter().map(Ok)))
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error> {
        let mut streams: Vec<_> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(aggregate_id)
                .map(|streams| {
                    streams
                        .iter()
                        .filter(|s| range.contains(s.create_time))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        streams.sort_by_key(|s| (s.create_time, s.version));
        tracing::trace!(streams_loaded = streams.len(), "loaded streams by time");
        Box::pin(tokio_stream::iter(streams.into_iter().map(Ok)))
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<DomainEventStream>, Self::Error>> + Send + 'a {
        let last = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(aggregate_id)
                .and_then(|s| s.last().cloned())
        };
        tracing::trace!(version = ?last.as_ref().map(DomainEventStream::tail_version), "retrieved last stream");
        std::future::ready(Ok(last))
    }
}
