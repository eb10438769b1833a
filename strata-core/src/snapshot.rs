//! Snapshot support for optimised aggregate loading.
//!
//! Snapshots persist aggregate state at a version, reducing the number of
//! streams that need to be replayed when loading an aggregate. This module
//! provides:
//!
//! - [`Snapshot`] - Point-in-time aggregate state
//! - [`SnapshotRepository`] - Trait for snapshot persistence
//! - [`NoSnapshots`] - No-op implementation
//! - [`SnapshotPolicy`] - When the [`Snapshotter`](crate::snapshotter::Snapshotter)
//!   should write
//! - [`inmemory`] - In-memory reference implementation
//!
//! Snapshots are never transactionally coupled to the event store. A stale
//! snapshot is always safe: loading tops up from the event store above the
//! snapshot's version.

use std::{
    convert::Infallible,
    future::{Future, ready},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::id::AggregateId;

pub mod inmemory;

/// Point-in-time snapshot of aggregate state.
///
/// `version` is the version of the last event folded into `state`. When
/// loading, only streams with a version above it are replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub state: S,
    /// Id of the last event folded into `state`.
    pub event_id: String,
    #[serde(default)]
    pub first_operator: String,
    #[serde(default)]
    pub operator: String,
    pub first_event_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    pub snapshot_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl<S: Serialize> Snapshot<S> {
    /// Re-encode the state as JSON, keeping all tracking fields.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the state cannot be encoded.
    pub fn to_json(&self) -> Result<Snapshot<serde_json::Value>, serde_json::Error> {
        Ok(Snapshot {
            aggregate_id: self.aggregate_id.clone(),
            version: self.version,
            state: serde_json::to_value(&self.state)?,
            event_id: self.event_id.clone(),
            first_operator: self.first_operator.clone(),
            operator: self.operator.clone(),
            first_event_time: self.first_event_time,
            event_time: self.event_time,
            snapshot_time: self.snapshot_time,
            deleted: self.deleted,
        })
    }
}

impl Snapshot<serde_json::Value> {
    /// Decode the JSON state into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the stored state does not match `S`.
    pub fn decode<S: DeserializeOwned>(self) -> Result<Snapshot<S>, serde_json::Error> {
        Ok(Snapshot {
            state: serde_json::from_value(self.state)?,
            aggregate_id: self.aggregate_id,
            version: self.version,
            event_id: self.event_id,
            first_operator: self.first_operator,
            operator: self.operator,
            first_event_time: self.first_event_time,
            event_time: self.event_time,
            snapshot_time: self.snapshot_time,
            deleted: self.deleted,
        })
    }
}

/// Result of offering a snapshot to a repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    /// Not stored: the repository already holds a snapshot at this version or
    /// later, or it does not store snapshots at all.
    Declined,
    /// The snapshot was persisted.
    Stored,
}

/// Trait for snapshot persistence.
///
/// Saving is "last write wins by version": a save whose version is not newer
/// than the stored one is a harmless no-op reported as
/// [`SnapshotOffer::Declined`].
// ANCHOR: snapshot_repository_trait
pub trait SnapshotRepository: Send + Sync {
    /// Error type for snapshot operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the most recent snapshot for an aggregate.
    ///
    /// Returns `Ok(None)` if no snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the stored state
    /// cannot be decoded as `S`.
    fn load<'a, S>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<Snapshot<S>>, Self::Error>> + Send + 'a
    where
        S: DeserializeOwned + Send + 'a;

    /// Persist a snapshot unless a newer or equal version is already stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be encoded or persistence fails.
    fn save<'a, S>(
        &'a self,
        snapshot: &'a Snapshot<S>,
    ) -> impl Future<Output = Result<SnapshotOffer, Self::Error>> + Send + 'a
    where
        S: Serialize + Sync + 'a;

    /// Version of the stored snapshot, without decoding its state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn version<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;
}
// ANCHOR_END: snapshot_repository_trait

impl<T> SnapshotRepository for std::sync::Arc<T>
where
    T: SnapshotRepository,
{
    type Error = T::Error;

    fn load<'a, S>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<Snapshot<S>>, Self::Error>> + Send + 'a
    where
        S: DeserializeOwned + Send + 'a,
    {
        (**self).load(aggregate_id)
    }

    fn save<'a, S>(
        &'a self,
        snapshot: &'a Snapshot<S>,
    ) -> impl Future<Output = Result<SnapshotOffer, Self::Error>> + Send + 'a
    where
        S: Serialize + Sync + 'a,
    {
        (**self).save(snapshot)
    }

    fn version<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        (**self).version(aggregate_id)
    }
}

/// No-op snapshot repository.
///
/// This implementation:
/// - Always returns `None` from `load()` and `version()`
/// - Declines all saves
///
/// Use this when replay cost does not matter.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl SnapshotRepository for NoSnapshots {
    type Error = Infallible;

    fn load<'a, S>(
        &'a self,
        _aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<Snapshot<S>>, Self::Error>> + Send + 'a
    where
        S: DeserializeOwned + Send + 'a,
    {
        ready(Ok(None))
    }

    fn save<'a, S>(
        &'a self,
        _snapshot: &'a Snapshot<S>,
    ) -> impl Future<Output = Result<SnapshotOffer, Self::Error>> + Send + 'a
    where
        S: Serialize + Sync + 'a,
    {
        ready(Ok(SnapshotOffer::Declined))
    }

    fn version<'a>(
        &'a self,
        _aggregate_id: &'a AggregateId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        ready(Ok(None))
    }
}

/// Policy deciding when a snapshot is written.
///
/// - [`SnapshotPolicy::Always`]: Snapshot after every stream (high storage
///   cost, minimal replay)
/// - [`SnapshotPolicy::EveryNEvents`]: Snapshot once at least N events
///   accumulated since the stored snapshot
/// - [`SnapshotPolicy::Never`]: Don't persist snapshots (load-only mode)
///
/// ## Use `Always` when:
/// - Event replay is expensive (complex business logic per event)
/// - Storage cost is less important than read performance
///
/// ## Use `EveryNEvents(n)` when:
/// - Balancing storage cost vs. replay cost
/// - Start with n=50-100 and tune based on profiling
///
/// ## Use `Never` when:
/// - Running a read replica that consumes snapshots created elsewhere
/// - Testing without snapshot overhead
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Create a snapshot after every stream.
    #[default]
    Always,
    /// Create a snapshot every N events.
    EveryNEvents(u64),
    /// Never create snapshots (load-only mode).
    Never,
}

impl SnapshotPolicy {
    /// Check if a snapshot should be created based on events since last
    /// snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => events_since >= *threshold,
            Self::Never => false,
        }
    }

    /// `0` means never, `1` means always.
    #[must_use]
    pub const fn every(n: u64) -> Self {
        match n {
            0 => Self::Never,
            1 => Self::Always,
            n => Self::EveryNEvents(n),
        }
    }
}
