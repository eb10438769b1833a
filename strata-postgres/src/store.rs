mod commit;
mod load;

use sqlx::PgPool;
use strata_core::{
    concurrency::ConcurrencyConflict,
    event::DomainEventStream,
    id::AggregateId,
    store::{AppendError, EventStore, EventStreams, TimeRange, VersionRange},
};

use crate::Error;

/// A PostgreSQL-backed [`EventStore`].
///
/// Each stream is one row of `event_stream`, stored whole as `jsonb` next to
/// the columns needed to look it up:
/// - `(context_name, aggregate_name, tenant_id, aggregate_id, version)` is
///   the primary key, so two writers can never both store the same version.
/// - `(context_name, aggregate_name, tenant_id, aggregate_id, request_id)` is
///   unique, which rejects a replayed request.
/// - Every key includes `tenant_id`: the same id under two tenants names two
///   independent aggregates.
/// - `event_stream_head` holds the tail version per aggregate and is locked
///   `FOR UPDATE` during an append, so a stream with a version gap is
///   rejected rather than stored.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Construct a `PostgreSQL` event store from a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS event_stream_head (
                context_name   TEXT NOT NULL,
                aggregate_name TEXT NOT NULL,
                tenant_id      TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                tail_version   BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (context_name, aggregate_name, tenant_id, aggregate_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS event_stream (
                context_name   TEXT NOT NULL,
                aggregate_name TEXT NOT NULL,
                tenant_id      TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                version        BIGINT NOT NULL,
                tail_version   BIGINT NOT NULL,
                request_id     TEXT NOT NULL,
                stream_id      TEXT NOT NULL,
                stream         JSONB NOT NULL,
                create_time    TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (context_name, aggregate_name, tenant_id, aggregate_id, version),
                CONSTRAINT event_stream_request_id_key
                    UNIQUE (context_name, aggregate_name, tenant_id, aggregate_id, request_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS event_stream_by_create_time ON event_stream(context_name, aggregate_name, tenant_id, aggregate_id, create_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl EventStore for Store {
    type Error = Error;

    #[tracing::instrument(
        skip(self, stream),
        fields(aggregate_id = %stream.aggregate_id, version = stream.version, size = stream.size())
    )]
    async fn append<'a>(&'a self, stream: &'a DomainEventStream) -> Result<(), AppendError<Error>> {
        stream
            .validate()
            .map_err(|e| AppendError::store(Error::IllegalStream(e)))?;
        let row = commit::StreamRow::encode(stream).map_err(AppendError::store)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppendError::store(Error::Database(e)))?;

        Self::ensure_head_row(&mut tx, &stream.aggregate_id)
            .await
            .map_err(AppendError::store)?;
        let current = Self::lock_head(&mut tx, &stream.aggregate_id)
            .await
            .map_err(AppendError::store)?;

        if stream.version != current + 1 {
            tracing::debug!(current, "version mismatch, rejecting append");
            return Err(ConcurrencyConflict {
                aggregate_id: stream.aggregate_id.clone(),
                expected: stream.version - 1,
                actual: current,
            }
            .into());
        }

        Self::insert_stream(&mut tx, stream, &row, current).await?;
        Self::advance_head(&mut tx, &stream.aggregate_id, row.tail_version)
            .await
            .map_err(AppendError::store)?;

        tx.commit()
            .await
            .map_err(|e| AppendError::store(Error::Database(e)))?;
        tracing::debug!(tail_version = stream.tail_version(), "stream appended");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error> {
        self.load_by_version(aggregate_id, range)
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error> {
        self.load_by_create_time(aggregate_id, range)
    }

    #[tracing::instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> Result<Option<DomainEventStream>, Self::Error> {
        let last: Option<sqlx::types::Json<DomainEventStream>> = sqlx::query_scalar(
            r"
            SELECT stream FROM event_stream
            WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
            ORDER BY version DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_optional(&self.pool)
        .await?;

        let last = last.map(|stream| stream.0);
        tracing::trace!(version = ?last.as_ref().map(DomainEventStream::tail_version), "retrieved last stream");
        Ok(last)
    }
}
