//! PostgreSQL-backed unique-key claims.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgPool, types::Json};
use strata_core::prepare::{PrepareKey, PrepareOutcome, PreparedValue};

use crate::Error;

/// A [`PrepareKey`] whose claims live in the `prepare_key` table.
///
/// Several named key sets share one table; `name` is part of the primary
/// key. Values are stored as `jsonb` and compared with `jsonb` equality.
pub struct PgPrepareKey<V> {
    pool: PgPool,
    name: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for PgPrepareKey<V> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            name: self.name.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for PgPrepareKey<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPrepareKey")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<V> PgPrepareKey<V> {
    #[must_use]
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            _value: PhantomData,
        }
    }

    /// Apply the `prepare_key` table schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self), fields(prepare_key = %self.name))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS prepare_key (
                name    TEXT NOT NULL,
                key     TEXT NOT NULL,
                value   JSONB NOT NULL,
                ttl_at  TIMESTAMPTZ NULL,
                PRIMARY KEY (name, key)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl<V> PrepareKey<V> for PgPrepareKey<V>
where
    V: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, value), fields(prepare_key = %self.name))]
    async fn try_prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> Result<PrepareOutcome, Error> {
        let encoded = serde_json::to_value(&value.value)?;

        // Take the key when it is free or its claim has lapsed.
        let claimed = sqlx::query(
            r"
            INSERT INTO prepare_key (name, key, value, ttl_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, key)
            DO UPDATE SET value = EXCLUDED.value, ttl_at = EXCLUDED.ttl_at
            WHERE prepare_key.ttl_at IS NOT NULL AND prepare_key.ttl_at < now()
            ",
        )
        .bind(&self.name)
        .bind(key)
        .bind(Json(&encoded))
        .bind(value.ttl_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        let outcome = if claimed {
            PrepareOutcome::Claimed
        } else {
            let held = sqlx::query_scalar::<_, bool>(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM prepare_key
                    WHERE name = $1 AND key = $2 AND value = $3
                      AND (ttl_at IS NULL OR ttl_at >= now())
                )
                ",
            )
            .bind(&self.name)
            .bind(key)
            .bind(Json(&encoded))
            .fetch_one(&self.pool)
            .await?;
            if held {
                PrepareOutcome::AlreadyHeld
            } else {
                PrepareOutcome::Taken
            }
        };

        tracing::trace!(?outcome, "prepare");
        Ok(outcome)
    }

    async fn get_value<'a>(&'a self, key: &'a str) -> Result<Option<PreparedValue<V>>, Error> {
        let row: Option<(Json<serde_json::Value>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r"SELECT value, ttl_at FROM prepare_key WHERE name = $1 AND key = $2",
        )
        .bind(&self.name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(Json(value), ttl_at)| {
            Ok(PreparedValue {
                value: serde_json::from_value(value)?,
                ttl_at,
            })
        })
        .transpose()
    }

    #[tracing::instrument(skip(self), fields(prepare_key = %self.name))]
    async fn rollback<'a>(&'a self, key: &'a str) -> Result<bool, Error> {
        let released = sqlx::query(
            r"
            DELETE FROM prepare_key
            WHERE name = $1 AND key = $2 AND (ttl_at IS NULL OR ttl_at >= now())
            ",
        )
        .bind(&self.name)
        .bind(key)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        Ok(released)
    }

    #[tracing::instrument(skip(self, value), fields(prepare_key = %self.name))]
    async fn rollback_value<'a>(&'a self, key: &'a str, value: &'a V) -> Result<bool, Error> {
        let encoded = serde_json::to_value(value)?;
        let released = sqlx::query(r"DELETE FROM prepare_key WHERE name = $1 AND key = $2 AND value = $3")
            .bind(&self.name)
            .bind(key)
            .bind(Json(&encoded))
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        Ok(released)
    }

    #[tracing::instrument(skip(self, old_value, new_value), fields(prepare_key = %self.name))]
    async fn reprepare<'a>(
        &'a self,
        key: &'a str,
        old_value: &'a V,
        new_value: PreparedValue<V>,
    ) -> Result<bool, Error> {
        let old = serde_json::to_value(old_value)?;
        let new = serde_json::to_value(&new_value.value)?;
        let replaced = sqlx::query(
            r"
            UPDATE prepare_key SET value = $4, ttl_at = $5
            WHERE name = $1 AND key = $2 AND value = $3
            ",
        )
        .bind(&self.name)
        .bind(key)
        .bind(Json(&old))
        .bind(Json(&new))
        .bind(new_value.ttl_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        Ok(replaced)
    }

    #[tracing::instrument(skip(self, value), fields(prepare_key = %self.name))]
    async fn reprepare_value<'a>(&'a self, key: &'a str, value: PreparedValue<V>) -> Result<bool, Error> {
        let encoded = serde_json::to_value(&value.value)?;
        let replaced = sqlx::query(
            r"UPDATE prepare_key SET value = $3, ttl_at = $4 WHERE name = $1 AND key = $2",
        )
        .bind(&self.name)
        .bind(key)
        .bind(Json(&encoded))
        .bind(value.ttl_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        Ok(replaced)
    }
}
