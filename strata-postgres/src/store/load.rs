use sqlx::types::Json;
use strata_core::{
    event::DomainEventStream,
    id::AggregateId,
    store::{EventStreams, TimeRange, VersionRange},
};
use tokio_stream::StreamExt;

use super::Store;
use crate::{Error, error::clamp_db_version};

impl Store {
    /// Streams whose first version lies in `range`, ascending.
    ///
    /// Rows are pulled from the database as the caller polls.
    pub(in crate::store) fn load_by_version<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Error> {
        let rows = sqlx::query_scalar::<_, Json<DomainEventStream>>(
            r"
            SELECT stream FROM event_stream
            WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
              AND version >= $5 AND version <= $6
            ORDER BY version ASC
            ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .bind(clamp_db_version(range.head()))
        .bind(clamp_db_version(range.tail()))
        .fetch(&self.pool);

        Box::pin(rows.map(decode_row))
    }

    /// Streams created within `range`, ordered by creation time and then
    /// version.
    pub(in crate::store) fn load_by_create_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Error> {
        let rows = sqlx::query_scalar::<_, Json<DomainEventStream>>(
            r"
            SELECT stream FROM event_stream
            WHERE context_name = $1 AND aggregate_name = $2 AND tenant_id = $3 AND aggregate_id = $4
              AND create_time >= $5 AND create_time <= $6
            ORDER BY create_time ASC, version ASC
            ",
        )
        .bind(aggregate_id.context_name())
        .bind(aggregate_id.aggregate_name())
        .bind(&aggregate_id.tenant_id)
        .bind(&aggregate_id.id)
        .bind(range.head())
        .bind(range.tail())
        .fetch(&self.pool);

        Box::pin(rows.map(decode_row))
    }
}

fn decode_row(row: Result<Json<DomainEventStream>, sqlx::Error>) -> Result<DomainEventStream, Error> {
    let Json(stream) = row?;
    Ok(stream)
}
