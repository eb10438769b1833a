//! PostgreSQL-backed snapshot repository.
//!
//! This module provides [`SnapshotStore`], an implementation of
//! [`strata_core::snapshot::SnapshotRepository`] for `PostgreSQL`.

use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgPool, types::Json};
use strata_core::{
    id::AggregateId,
    snapshot::{Snapshot, SnapshotOffer, SnapshotRepository},
};

use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

/// A PostgreSQL-backed snapshot repository.
///
/// This implementation stores one snapshot per aggregate in a dedicated
/// `PostgreSQL` table (`snapshot`), using the same database as the event
/// store. When to write a snapshot is decided upstream by the
/// [`Snapshotter`](strata_core::snapshotter::Snapshotter) policy; the
/// repository only guarantees that an older snapshot never replaces a newer
/// one.
///
/// # Schema
///
/// The store uses the following table schema (created by [`migrate()`](Self::migrate)):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS snapshot (
///     context_name   TEXT NOT NULL,
///     aggregate_name TEXT NOT NULL,
///     aggregate_id   TEXT NOT NULL,
///     tenant_id      TEXT NOT NULL,
///     version        BIGINT NOT NULL,
///     snapshot       JSONB NOT NULL,
///     snapshot_time  TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (context_name, aggregate_name, tenant_id, aggregate_id)
/// )
/// ```
///
/// # Example
///
/// ```ignore
/// use strata_postgres::{SnapshotStore, Store};
/// use strata_core::repository::StateAggregateRepository;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let event_store = Store::new(pool.clone());
/// let snapshot_store = SnapshotStore::new(pool);
///
/// // Run migrations
/// event_store.migrate().await?;
/// snapshot_store.migrate().await?;
///
/// let repository = StateAggregateRepository::new(event_store).with_snapshots(snapshot_store);
/// ```
#[derive(Clone)]
pub struct SnapshotStore {
    pool: PgPool,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

impl SnapshotStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the snapshot table schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS snapshot (
                context_name   TEXT NOT NULL,
                aggregate_name TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                tenant_id      TEXT NOT NULL,
                version        BIGINT NOT NULL,
                snapshot       JSONB NOT NULL,
                snapshot_time  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (context_name, aggregate_name, tenant_id, aggregate_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl SnapshotRepository for SnapshotStore {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load<'a, S>(&'a self, aggregate_id: &'a AggregateId) -> Result<Option<Snapshot<S>>, Error>
    where
        S: DeserializeOwned + Send + 'a,
    {
        let stored: Option<Json<Snapshot<serde_json::Value>>> = sqlx::query_scalar(
            r"
            SELECT snapshot FROM snapshot
            WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
            ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_optional(&self.pool)
        .await?;

        let snapshot = stored.map(|Json(snapshot)| snapshot.decode::<S>()).transpose()?;
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version)
    )]
    async fn save<'a, S>(&'a self, snapshot: &'a Snapshot<S>) -> Result<SnapshotOffer, Error>
    where
        S: Serialize + Sync + 'a,
    {
        let version = to_db_version(snapshot.version)?;
        let encoded = snapshot.to_json()?;

        // Upsert only when the stored version is older.
        let result = sqlx::query(
            r"
            INSERT INTO snapshot (
                context_name, aggregate_name, aggregate_id, tenant_id, version, snapshot, snapshot_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (context_name, aggregate_name, tenant_id, aggregate_id)
            DO UPDATE SET
                version = EXCLUDED.version,
                snapshot = EXCLUDED.snapshot,
                snapshot_time = EXCLUDED.snapshot_time
            WHERE snapshot.version < EXCLUDED.version
            ",
        )
        .bind(snapshot.aggregate_id.context_name())
        .bind(snapshot.aggregate_id.aggregate_name())
        .bind(&snapshot.aggregate_id.id)
        .bind(&snapshot.aggregate_id.tenant_id)
        .bind(version)
        .bind(Json(&encoded))
        .bind(snapshot.snapshot_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!("snapshot stored");
            Ok(SnapshotOffer::Stored)
        } else {
            tracing::debug!("stored snapshot is as new or newer, declining");
            Ok(SnapshotOffer::Declined)
        }
    }

    async fn version<'a>(&'a self, aggregate_id: &'a AggregateId) -> Result<Option<u64>, Error> {
        let version: Option<i64> = sqlx::query_scalar(
            r"
            SELECT version FROM snapshot
            WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
            ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_optional(&self.pool)
        .await?;

        version.map(from_db_version).transpose()
    }
}
