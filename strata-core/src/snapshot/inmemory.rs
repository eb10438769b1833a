//! In-memory snapshot repository implementation.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};

use super::{Snapshot, SnapshotOffer, SnapshotRepository};
use crate::id::AggregateId;

/// Error type for in-memory snapshot repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// In-memory snapshot repository.
///
/// This is a reference implementation suitable for testing and development.
/// States are kept as JSON so one repository can serve every aggregate type.
///
/// ```
/// use strata_core::snapshot::inmemory;
///
/// let snapshots = inmemory::Store::new();
/// ```
#[derive(Clone, Debug, Default)]
pub struct Store {
    snapshots: Arc<RwLock<HashMap<AggregateId, Snapshot<serde_json::Value>>>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotRepository for Store {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load<'a, S>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> Result<Option<Snapshot<S>>, Self::Error>
    where
        S: DeserializeOwned + Send + 'a,
    {
        let stored = {
            let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
            snapshots.get(aggregate_id).cloned()
        };
        let snapshot = stored
            .map(Snapshot::decode)
            .transpose()
            .map_err(Error::Deserialization)?;
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version)
    )]
    async fn save<'a, S>(&'a self, snapshot: &'a Snapshot<S>) -> Result<SnapshotOffer, Self::Error>
    where
        S: Serialize + Sync + 'a,
    {
        let stored = snapshot.to_json().map_err(Error::Serialization)?;

        let offer = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            match snapshots.get(&stored.aggregate_id) {
                Some(existing) if existing.version >= stored.version => SnapshotOffer::Declined,
                _ => {
                    snapshots.insert(stored.aggregate_id.clone(), stored);
                    SnapshotOffer::Stored
                }
            }
        };

        tracing::debug!(?offer, "snapshot save evaluated");
        Ok(offer)
    }

    async fn version<'a>(&'a self, aggregate_id: &'a AggregateId) -> Result<Option<u64>, Self::Error> {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        Ok(snapshots.get(aggregate_id).map(|s| s.version))
    }
}
