//! State aggregate loading.
//!
//! `StateAggregateRepository` rebuilds the current [`StateAggregate`] of an
//! aggregate: it restores the latest snapshot (if any) and tops up from the
//! event store above the snapshot's version.
//!
//! Snapshot support is opt-in via
//! [`with_snapshots`](StateAggregateRepository::with_snapshots). A snapshot
//! that cannot be loaded is logged and ignored; the aggregate is then rebuilt
//! by full replay.

use thiserror::Error;
use tokio_stream::StreamExt as _;

use crate::{
    aggregate::{Aggregate, AggregateMetadata},
    error::{ErrorCode, RecoverableType, codes},
    id::AggregateId,
    snapshot::{NoSnapshots, SnapshotRepository},
    state::{SourcingError, StateAggregate},
    store::{EventStore, UNBOUNDED, VersionRange},
};

/// Error returned when an aggregate cannot be rebuilt.
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load event streams: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Sourcing(#[from] SourcingError),
}

impl<StoreError: std::error::Error + 'static> ErrorCode for LoadError<StoreError> {
    fn error_code(&self) -> &str {
        match self {
            Self::Store(_) => codes::STORE_UNAVAILABLE,
            Self::Sourcing(e) => e.error_code(),
        }
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::Store(_) => RecoverableType::Unknown,
            Self::Sourcing(e) => e.recoverable(),
        }
    }
}

/// Loads [`StateAggregate`]s from a snapshot repository and an event store.
#[derive(Clone, Debug)]
pub struct StateAggregateRepository<ES, SR = NoSnapshots> {
    store: ES,
    snapshots: SR,
}

impl<ES> StateAggregateRepository<ES>
where
    ES: EventStore,
{
    #[must_use]
    pub const fn new(store: ES) -> Self {
        Self {
            store,
            snapshots: NoSnapshots,
        }
    }
}

impl<ES, SR> StateAggregateRepository<ES, SR>
where
    ES: EventStore,
    SR: SnapshotRepository,
{
    #[must_use]
    pub fn with_snapshots<SR2>(self, snapshots: SR2) -> StateAggregateRepository<ES, SR2>
    where
        SR2: SnapshotRepository,
    {
        StateAggregateRepository {
            store: self.store,
            snapshots,
        }
    }

    #[must_use]
    pub const fn event_store(&self) -> &ES {
        &self.store
    }

    #[must_use]
    pub const fn snapshot_repository(&self) -> &SR {
        &self.snapshots
    }

    /// Rebuild the current state.
    ///
    /// An aggregate with neither snapshot nor events comes back
    /// uninitialised (version 0); see [`find`](Self::find) for an
    /// `Option`-returning variant.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if the event store fails and
    /// [`LoadError::Sourcing`] if a stream cannot be folded (for example an
    /// event without a registered apply function).
    pub async fn load<A: Aggregate>(
        &self,
        metadata: &AggregateMetadata<A>,
        aggregate_id: &AggregateId,
    ) -> Result<StateAggregate<A>, LoadError<ES::Error>> {
        self.load_until(metadata, aggregate_id, UNBOUNDED).await
    }

    /// Rebuild the state as of `tail_version`.
    ///
    /// A snapshot newer than `tail_version` is ignored.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    #[tracing::instrument(
        skip(self, metadata, aggregate_id),
        fields(aggregate_id = %aggregate_id)
    )]
    pub async fn load_until<A: Aggregate>(
        &self,
        metadata: &AggregateMetadata<A>,
        aggregate_id: &AggregateId,
        tail_version: u64,
    ) -> Result<StateAggregate<A>, LoadError<ES::Error>> {
        let snapshot = self
            .snapshots
            .load::<A>(aggregate_id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten()
            .filter(|snapshot| snapshot.version <= tail_version);

        let mut state = match snapshot {
            Some(snapshot) => {
                tracing::trace!(snapshot_version = snapshot.version, "restored snapshot");
                StateAggregate::from_snapshot(snapshot)
            }
            None => StateAggregate::uninitialized(aggregate_id.clone()),
        };

        if state.version() >= tail_version {
            return Ok(state);
        }

        let range = VersionRange::new(state.expected_next_version(), tail_version)
            .unwrap_or_else(|_| VersionRange::from(state.expected_next_version()));
        let mut streams = self.store.load(aggregate_id, range);
        let mut sourced = 0_usize;
        while let Some(stream) = streams.next().await {
            let stream = stream.map_err(LoadError::Store)?;
            state.on_sourcing(&stream, metadata)?;
            sourced += 1;
        }

        tracing::debug!(version = state.version(), sourced, "aggregate loaded");
        Ok(state)
    }

    /// Like [`load`](Self::load), but `None` for an aggregate that was never
    /// created.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub async fn find<A: Aggregate>(
        &self,
        metadata: &AggregateMetadata<A>,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StateAggregate<A>>, LoadError<ES::Error>> {
        let state = self.load(metadata, aggregate_id).await?;
        Ok(state.initialized().then_some(state))
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error as _, io};

    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        aggregate::Apply,
        error::DomainError,
        event::{DomainEvent, DomainEventStream},
        id::NamedAggregate,
        snapshot::{Snapshot, inmemory as snapshot_inmemory},
        store::inmemory,
    };

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
        applied: Vec<u64>,
    }

    impl Aggregate for Counter {
        type Error = DomainError;

        const CONTEXT: &'static str = "test";
        const NAME: &'static str = "counter";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Added {
        amount: i64,
        seq: u64,
    }

    impl DomainEvent for Added {
        const NAME: &'static str = "added";
    }

    impl Apply<Added> for Counter {
        fn apply(&mut self, event: &Added) {
            self.value += event.amount;
            self.applied.push(event.seq);
        }
    }

    fn metadata() -> AggregateMetadata<Counter> {
        AggregateMetadata::builder().event::<Added>().build()
    }

    fn id() -> AggregateId {
        NamedAggregate::new("test", "counter").aggregate_id("c-1")
    }

    async fn seed(store: &inmemory::Store, versions: std::ops::RangeInclusive<u64>) {
        for version in versions {
            let stream = DomainEventStream::builder(id(), version)
                .build(vec![(
                    "added".into(),
                    json!({ "amount": 1, "seq": version }),
                )])
                .unwrap();
            store.append(&stream).await.unwrap();
        }
    }

    #[test]
    fn load_error_store_has_source() {
        let error: LoadError<io::Error> = LoadError::Store(io::Error::other("down"));
        assert!(error.source().is_some());
        assert_eq!(error.error_code(), codes::STORE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn missing_aggregate_is_uninitialized() {
        let repo = StateAggregateRepository::new(inmemory::Store::new());
        let state = repo.load(&metadata(), &id()).await.unwrap();
        assert_eq!(state.version(), 0);
        assert!(repo.find(&metadata(), &id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_replay_folds_every_stream() {
        let store = inmemory::Store::new();
        seed(&store, 1..=4).await;
        let repo = StateAggregateRepository::new(store);

        let state = repo.load(&metadata(), &id()).await.unwrap();
        assert_eq!(state.version(), 4);
        assert_eq!(state.state().applied, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn snapshot_is_topped_up_from_event_store() {
        let store = inmemory::Store::new();
        seed(&store, 1..=8).await;
        let snapshots = snapshot_inmemory::Store::new();

        let at_five = StateAggregateRepository::new(store.clone())
            .load_until(&metadata(), &id(), 5)
            .await
            .unwrap();
        snapshots
            .save(&at_five.to_snapshot(Utc::now()).unwrap())
            .await
            .unwrap();

        let repo = StateAggregateRepository::new(store).with_snapshots(snapshots);
        let state = repo.load(&metadata(), &id()).await.unwrap();
        assert_eq!(state.version(), 8);
        assert_eq!(state.state().value, 8);
        assert_eq!(state.state().applied, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn load_until_ignores_newer_snapshot() {
        let store = inmemory::Store::new();
        seed(&store, 1..=6).await;
        let repo = StateAggregateRepository::new(store.clone());
        let latest = repo.load(&metadata(), &id()).await.unwrap();

        let snapshots = snapshot_inmemory::Store::new();
        snapshots
            .save(&latest.to_snapshot(Utc::now()).unwrap())
            .await
            .unwrap();
        let repo = repo.with_snapshots(snapshots);

        let historical = repo.load_until(&metadata(), &id(), 3).await.unwrap();
        assert_eq!(historical.version(), 3);
        assert_eq!(historical.state().applied, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_full_replay() {
        let store = inmemory::Store::new();
        seed(&store, 1..=3).await;
        let snapshots = snapshot_inmemory::Store::new();
        let now = Utc::now();
        snapshots
            .save(&Snapshot {
                aggregate_id: id(),
                version: 2,
                state: json!("not a counter"),
                event_id: String::new(),
                first_operator: String::new(),
                operator: String::new(),
                first_event_time: now,
                event_time: now,
                snapshot_time: now,
                deleted: false,
            })
            .await
            .unwrap();

        let repo = StateAggregateRepository::new(store).with_snapshots(snapshots);
        let state = repo.load(&metadata(), &id()).await.unwrap();
        assert_eq!(state.version(), 3);
        assert_eq!(state.state().value, 3);
    }

    #[tokio::test]
    async fn unregistered_event_fails_fast() {
        let store = inmemory::Store::new();
        let stream = DomainEventStream::builder(id(), 1)
            .build(vec![("mystery".into(), json!({}))])
            .unwrap();
        store.append(&stream).await.unwrap();

        let repo = StateAggregateRepository::new(store);
        let err = repo.load(&metadata(), &id()).await.unwrap_err();
        assert_eq!(err.error_code(), codes::UNSUPPORTED_EVENT_TYPE);
    }
}
