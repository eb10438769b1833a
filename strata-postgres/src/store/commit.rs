use chrono::{DateTime, Utc};
use sqlx::{Postgres, types::Json};
use strata_core::{
    concurrency::ConcurrencyConflict, event::DomainEventStream, id::AggregateId,
    store::AppendError,
};

use super::Store;
use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

const REQUEST_ID_CONSTRAINT: &str = "event_stream_request_id_key";

/// Column values of one `event_stream` row, encoded before the transaction
/// opens.
pub(in crate::store) struct StreamRow {
    pub(in crate::store) version: i64,
    pub(in crate::store) tail_version: i64,
    pub(in crate::store) create_time: DateTime<Utc>,
    pub(in crate::store) stream: serde_json::Value,
}

impl StreamRow {
    pub(in crate::store) fn encode(stream: &DomainEventStream) -> Result<Self, Error> {
        Ok(Self {
            version: to_db_version(stream.version)?,
            tail_version: to_db_version(stream.tail_version())?,
            create_time: stream.create_time,
            stream: serde_json::to_value(stream)?,
        })
    }
}

impl Store {
    /// Insert an `event_stream_head` row for the aggregate, doing nothing if
    /// one already exists.
    ///
    /// Must be called inside an open transaction before locking the head.
    pub(in crate::store) async fn ensure_head_row(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        aggregate_id: &AggregateId,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
                INSERT INTO event_stream_head (context_name, aggregate_name, tenant_id, aggregate_id, tail_version)
                VALUES ($1, $2, $3, $4, 0)
                ON CONFLICT (context_name, aggregate_name, tenant_id, aggregate_id) DO NOTHING
                ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    /// Lock the aggregate's head row and return its tail version.
    ///
    /// The lock is held until the transaction ends, so concurrent appends to
    /// one aggregate queue up here and see each other's tail.
    pub(in crate::store) async fn lock_head(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        aggregate_id: &AggregateId,
    ) -> Result<u64, Error> {
        let tail: i64 = sqlx::query_scalar(
            r"
                SELECT tail_version FROM event_stream_head
                WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
                FOR UPDATE
                ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .fetch_one(&mut **tx)
        .await?;

        from_db_version(tail)
    }

    /// Insert the stream row, translating unique violations into
    /// [`AppendError`] variants.
    pub(in crate::store) async fn insert_stream(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        stream: &DomainEventStream,
        row: &StreamRow,
        current: u64,
    ) -> Result<(), AppendError<Error>> {
        let inserted = sqlx::query(
            r"
                INSERT INTO event_stream (
                    context_name, aggregate_name, tenant_id, aggregate_id, version,
                    tail_version, request_id, stream_id, stream, create_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
        )
        .bind(stream.aggregate_id.context_name())
        .bind(stream.aggregate_id.aggregate_name())
        .bind(&stream.aggregate_id.tenant_id)
        .bind(&stream.aggregate_id.id)
        .bind(row.version)
        .bind(row.tail_version)
        .bind(&stream.request_id)
        .bind(&stream.id)
        .bind(Json(&row.stream))
        .bind(row.create_time)
        .execute(&mut **tx)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if db.constraint() == Some(REQUEST_ID_CONSTRAINT) {
                    tracing::debug!(request_id = %stream.request_id, "duplicate request, rejecting append");
                    Err(AppendError::DuplicateRequestId {
                        aggregate_id: stream.aggregate_id.clone(),
                        request_id: stream.request_id.clone(),
                    })
                } else {
                    Err(ConcurrencyConflict {
                        aggregate_id: stream.aggregate_id.clone(),
                        expected: current,
                        actual: current.max(stream.version),
                    }
                    .into())
                }
            }
            Err(e) => Err(AppendError::store(Error::Database(e))),
        }
    }

    pub(in crate::store) async fn advance_head(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        aggregate_id: &AggregateId,
        tail_version: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
                UPDATE event_stream_head
                SET tail_version = $5
                WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
                ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .bind(tail_version)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
