//! Logging middleware for stores.
//!
//! [`Instrumented`] wraps an [`EventStore`] or [`SnapshotRepository`] and
//! forwards every call, emitting a `tracing` event with the outcome and the
//! latency. Layers compose by nesting, e.g.
//! `Instrumented::new(Instrumented::new(store, "inner"), "outer")`.

use std::time::Instant;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    event::DomainEventStream,
    id::AggregateId,
    snapshot::{Snapshot, SnapshotOffer, SnapshotRepository},
    store::{AppendError, EventStore, EventStreams, TimeRange, VersionRange},
};

/// Forwarding wrapper that logs calls and their latency.
#[derive(Clone, Debug)]
pub struct Instrumented<T> {
    inner: T,
    name: &'static str,
}

impl<T> Instrumented<T> {
    /// `name` identifies the layer in log output.
    pub const fn new(inner: T, name: &'static str) -> Self {
        Self { inner, name }
    }

    pub const fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

impl<T: EventStore> EventStore for Instrumented<T> {
    type Error = T::Error;

    async fn append<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Result<(), AppendError<Self::Error>> {
        let start = Instant::now();
        let result = self.inner.append(stream).await;
        match &result {
            Ok(()) => tracing::debug!(
                layer = self.name,
                aggregate_id = %stream.aggregate_id,
                version = stream.version,
                elapsed_us = elapsed_micros(start),
                "append succeeded"
            ),
            Err(AppendError::Store(e)) => tracing::error!(
                layer = self.name,
                aggregate_id = %stream.aggregate_id,
                version = stream.version,
                error = %e,
                elapsed_us = elapsed_micros(start),
                "append failed"
            ),
            Err(e) => tracing::debug!(
                layer = self.name,
                aggregate_id = %stream.aggregate_id,
                version = stream.version,
                error = %e,
                elapsed_us = elapsed_micros(start),
                "append rejected"
            ),
        }
        result
    }

    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error> {
        tracing::debug!(
            layer = self.name,
            aggregate_id = %aggregate_id,
            head = range.head(),
            tail = range.tail(),
            "load by version"
        );
        self.inner.load(aggregate_id, range)
    }

    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error> {
        tracing::debug!(
            layer = self.name,
            aggregate_id = %aggregate_id,
            head = %range.head(),
            tail = %range.tail(),
            "load by time"
        );
        self.inner.load_by_time(aggregate_id, range)
    }

    async fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> Result<Option<DomainEventStream>, Self::Error> {
        let start = Instant::now();
        let result = self.inner.last(aggregate_id).await;
        tracing::debug!(
            layer = self.name,
            aggregate_id = %aggregate_id,
            ok = result.is_ok(),
            elapsed_us = elapsed_micros(start),
            "last"
        );
        result
    }
}

impl<T: SnapshotRepository> SnapshotRepository for Instrumented<T> {
    type Error = T::Error;

    async fn load<'a, S>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> Result<Option<Snapshot<S>>, Self::Error>
    where
        S: DeserializeOwned + Send + 'a,
    {
        let start = Instant::now();
        let result = self.inner.load::<S>(aggregate_id).await;
        tracing::debug!(
            layer = self.name,
            aggregate_id = %aggregate_id,
            found = matches!(result, Ok(Some(_))),
            ok = result.is_ok(),
            elapsed_us = elapsed_micros(start),
            "snapshot load"
        );
        result
    }

    async fn save<'a, S>(&'a self, snapshot: &'a Snapshot<S>) -> Result<SnapshotOffer, Self::Error>
    where
        S: Serialize + Sync + 'a,
    {
        let start = Instant::now();
        let result = self.inner.save(snapshot).await;
        tracing::debug!(
            layer = self.name,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            offer = ?result.as_ref().ok(),
            elapsed_us = elapsed_micros(start),
            "snapshot save"
        );
        result
    }

    async fn version<'a>(&'a self, aggregate_id: &'a AggregateId) -> Result<Option<u64>, Self::Error> {
        self.inner.version(aggregate_id).await
    }
}
