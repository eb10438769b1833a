//! Snapshot maintenance.
//!
//! The [`Snapshotter`] consumes either state events (which already carry the
//! folded state) or plain event streams, and refreshes the snapshot of the
//! affected aggregate according to its [`SnapshotPolicy`]. It runs after the
//! append, so a failure here never affects command outcomes; the next stream
//! simply tries again.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_stream::StreamExt as _;

use crate::{
    aggregate::{Aggregate, AggregateMetadata},
    bus::{HandlerError, MessageHandler},
    error::{ErrorCode, RecoverableType, codes},
    event::DomainEventStream,
    repository::{LoadError, StateAggregateRepository},
    snapshot::{SnapshotOffer, SnapshotPolicy, SnapshotRepository},
    state::{SourcingError, StateAggregate, StateEvent},
    store::{EventStore, VersionRange},
};

#[derive(Debug, Error)]
pub enum SnapshotterError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    #[error("failed to load event streams: {0}")]
    Store(#[source] StoreError),
    #[error("failed to access snapshots: {0}")]
    Snapshot(#[source] SnapshotError),
    #[error(transparent)]
    Sourcing(#[from] SourcingError),
    #[error("state does not decode: {0}")]
    Codec(#[from] serde_json::Error),
}

impl<StoreError, SnapshotError> From<LoadError<StoreError>>
    for SnapshotterError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    fn from(error: LoadError<StoreError>) -> Self {
        match error {
            LoadError::Store(e) => Self::Store(e),
            LoadError::Sourcing(e) => Self::Sourcing(e),
        }
    }
}

impl<StoreError, SnapshotError> ErrorCode for SnapshotterError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    fn error_code(&self) -> &str {
        match self {
            Self::Store(_) | Self::Snapshot(_) => codes::STORE_UNAVAILABLE,
            Self::Sourcing(e) => e.error_code(),
            Self::Codec(_) => codes::CODEC,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::Sourcing(e) => e.recoverable(),
            _ => RecoverableType::Unknown,
        }
    }
}

/// What the snapshotter did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Stored,
    /// The repository already held an equal or newer snapshot.
    Declined,
    /// The stored snapshot already covers the message.
    Covered,
    /// The policy asked to wait for more events.
    Deferred,
}

impl From<SnapshotOffer> for SnapshotOutcome {
    fn from(offer: SnapshotOffer) -> Self {
        match offer {
            SnapshotOffer::Stored => Self::Stored,
            SnapshotOffer::Declined => Self::Declined,
        }
    }
}

/// Keeps the snapshots of one aggregate type fresh.
pub struct Snapshotter<A: Aggregate, ES, SR> {
    repository: StateAggregateRepository<ES, SR>,
    metadata: Arc<AggregateMetadata<A>>,
    policy: SnapshotPolicy,
}

impl<A: Aggregate, ES: Clone, SR: Clone> Clone for Snapshotter<A, ES, SR> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            metadata: Arc::clone(&self.metadata),
            policy: self.policy,
        }
    }
}

impl<A, ES, SR> Snapshotter<A, ES, SR>
where
    A: Aggregate,
    ES: EventStore,
    SR: SnapshotRepository,
{
    pub fn new(
        repository: StateAggregateRepository<ES, SR>,
        metadata: Arc<AggregateMetadata<A>>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            repository,
            metadata,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Store the state carried by a state event.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot repository fails or the state does not decode
    /// as `A`.
    #[tracing::instrument(
        skip(self, event),
        fields(aggregate_id = %event.stream.aggregate_id, version = event.version())
    )]
    pub async fn on_state_event(
        &self,
        event: &StateEvent,
    ) -> Result<SnapshotOutcome, SnapshotterError<ES::Error, SR::Error>> {
        let stored = self
            .repository
            .snapshot_repository()
            .version(&event.stream.aggregate_id)
            .await
            .map_err(SnapshotterError::Snapshot)?;
        if stored.is_some_and(|version| version >= event.version()) {
            tracing::trace!(?stored, "snapshot already covers state event");
            return Ok(SnapshotOutcome::Covered);
        }
        if !self
            .policy
            .should_snapshot(event.version() - stored.unwrap_or(0))
        {
            return Ok(SnapshotOutcome::Deferred);
        }

        let snapshot = event.to_snapshot::<A>(Utc::now())?;
        self.save(&snapshot).await
    }

    /// Fold an event stream into the stored snapshot.
    ///
    /// Streams already covered by the snapshot are ignored. A stream that
    /// does not directly follow the snapshot is preceded by the missing
    /// streams from the event store.
    ///
    /// # Errors
    ///
    /// Fails if a store fails or the streams cannot be sourced.
    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = stream.version)
    )]
    pub async fn on_event_stream(
        &self,
        stream: &DomainEventStream,
    ) -> Result<SnapshotOutcome, SnapshotterError<ES::Error, SR::Error>> {
        let aggregate_id = &stream.aggregate_id;
        let snapshot = self
            .repository
            .snapshot_repository()
            .load::<A>(aggregate_id)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "ignoring unreadable snapshot"))
            .ok()
            .flatten();
        let mut state = match snapshot {
            Some(snapshot) => StateAggregate::from_snapshot(snapshot),
            None => StateAggregate::uninitialized(aggregate_id.clone()),
        };
        let base_version = state.version();

        if base_version >= stream.tail_version() {
            tracing::trace!(base_version, "snapshot already covers stream");
            return Ok(SnapshotOutcome::Covered);
        }

        let next = state.expected_next_version();
        if stream.version == next {
            state.on_sourcing(stream, &self.metadata)?;
        } else if stream.version > next {
            tracing::debug!(from = next, to = stream.version - 1, "loading gap before stream");
            let range = VersionRange::new(next, stream.version - 1)
                .unwrap_or_else(|_| VersionRange::from(next));
            let mut gap = self.repository.event_store().load(aggregate_id, range);
            while let Some(missing) = gap.next().await {
                let missing = missing.map_err(SnapshotterError::Store)?;
                state.on_sourcing(&missing, &self.metadata)?;
            }
            state.on_sourcing(stream, &self.metadata)?;
        } else {
            tracing::warn!(
                base_version,
                "stream overlaps stored snapshot, rebuilding from event store"
            );
            state = self
                .repository
                .load_until(&self.metadata, aggregate_id, stream.tail_version())
                .await?;
        }

        if !self.policy.should_snapshot(state.version() - base_version) {
            return Ok(SnapshotOutcome::Deferred);
        }
        let Some(snapshot) = state.to_snapshot(Utc::now()) else {
            return Ok(SnapshotOutcome::Deferred);
        };
        self.save(&snapshot).await
    }

    async fn save(
        &self,
        snapshot: &crate::snapshot::Snapshot<A>,
    ) -> Result<SnapshotOutcome, SnapshotterError<ES::Error, SR::Error>> {
        let offer = self
            .repository
            .snapshot_repository()
            .save(snapshot)
            .await
            .map_err(SnapshotterError::Snapshot)?;
        tracing::debug!(version = snapshot.version, ?offer, "snapshot offered");
        Ok(offer.into())
    }
}

impl<A, ES, SR> Snapshotter<A, ES, SR>
where
    A: Aggregate,
    ES: EventStore + Clone + 'static,
    SR: SnapshotRepository + Clone + 'static,
{
    /// Bus handler consuming state events.
    pub fn state_event_handler(&self) -> impl MessageHandler<StateEvent> {
        let snapshotter = self.clone();
        move |event: StateEvent| {
            let snapshotter = snapshotter.clone();
            async move {
                snapshotter
                    .on_state_event(&event)
                    .await
                    .map(|_| ())
                    .map_err(|e| HandlerError::from_error(&e))
            }
        }
    }

    /// Bus handler consuming event streams.
    pub fn event_stream_handler(&self) -> impl MessageHandler<DomainEventStream> {
        let snapshotter = self.clone();
        move |stream: DomainEventStream| {
            let snapshotter = snapshotter.clone();
            async move {
                snapshotter
                    .on_event_stream(&stream)
                    .await
                    .map(|_| ())
                    .map_err(|e| HandlerError::from_error(&e))
            }
        }
    }
}
