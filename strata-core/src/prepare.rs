//! Unique-key reservation.
//!
//! A [`PrepareKey`] claims a string key for a value: the first writer wins,
//! and the claim holds until it is rolled back or its TTL passes. It guards
//! uniqueness that the event store cannot see, such as "one account per
//! e-mail address", around the command that creates the owning aggregate.
//!
//! ```ignore
//! let emails = InMemoryPrepareKey::<String>::new("email");
//! let created = emails
//!     .with_prepared("ada@example.com", PreparedValue::forever(user_id.clone()), |claimed| async move {
//!         if !claimed {
//!             return Err(RegisterError::EmailTaken);
//!         }
//!         gateway.send(register_command).await.map_err(RegisterError::from)
//!     })
//!     .await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod inmemory;

pub use inmemory::InMemoryPrepareKey;

/// A claimed value and when the claim lapses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedValue<V> {
    pub value: V,
    /// `None` holds the claim until it is rolled back.
    pub ttl_at: Option<DateTime<Utc>>,
}

impl<V> PreparedValue<V> {
    pub const fn forever(value: V) -> Self {
        Self {
            value,
            ttl_at: None,
        }
    }

    pub const fn until(value: V, ttl_at: DateTime<Utc>) -> Self {
        Self {
            value,
            ttl_at: Some(ttl_at),
        }
    }

    /// Claim for `ttl` from now. A TTL beyond the representable range
    /// claims forever.
    pub fn expiring_in(value: V, ttl: std::time::Duration) -> Self {
        let ttl_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        Self { value, ttl_at }
    }

    #[must_use]
    pub const fn is_forever(&self) -> bool {
        self.ttl_at.is_none()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl_at.is_some_and(|ttl_at| ttl_at < now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Result of an attempt to claim a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The key was free (or its claim had expired) and is now held.
    Claimed,
    /// The same value already held the key.
    AlreadyHeld,
    /// Another value holds the key.
    Taken,
}

impl PrepareOutcome {
    /// Whether the key is held by the requested value after the attempt.
    #[must_use]
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Claimed | Self::AlreadyHeld)
    }
}

/// Failure of the composite operations built on [`PrepareKey`].
#[derive(Debug, Error)]
pub enum PrepareError<StoreError, OperationError = std::convert::Infallible>
where
    StoreError: std::error::Error + 'static,
    OperationError: std::error::Error + 'static,
{
    #[error("old and new key are both `{0}`")]
    SameKey(String),
    /// The new key was claimed (and released again) but the old claim did
    /// not hold the expected value.
    #[error("`{old_key}` is not held by the expected value; `{new_key}` was released")]
    RollbackFailed { old_key: String, new_key: String },
    #[error("prepare key store failed: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Operation(OperationError),
}

// ANCHOR: prepare_key_trait
/// Named set of unique key claims.
///
/// All operations are atomic per key. A claim whose TTL has passed behaves as
/// if absent for [`prepare`](Self::prepare) and [`get`](Self::get), but is
/// still visible through [`get_value`](Self::get_value).
pub trait PrepareKey<V>: Send + Sync
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Claim `key` for `value`, reporting whether this call took the claim.
    fn try_prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<PrepareOutcome, Self::Error>> + Send + 'a;

    /// Claim `key`. `true` if the key is now held by `value`, including when
    /// `value` already held it; `false` if another value holds it.
    fn prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        async move { Ok(self.try_prepare(key, value).await?.is_held()) }
    }

    /// The stored claim, expired or not.
    fn get_value<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<PreparedValue<V>>, Self::Error>> + Send + 'a;

    /// The value holding `key`, ignoring expired claims.
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<V>, Self::Error>> + Send + 'a {
        async move {
            Ok(self
                .get_value(key)
                .await?
                .filter(|prepared| !prepared.is_expired())
                .map(|prepared| prepared.value))
        }
    }

    /// Release an unexpired claim on `key`, whatever its value.
    fn rollback<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Release `key` only if `value` holds it.
    fn rollback_value<'a>(
        &'a self,
        key: &'a str,
        value: &'a V,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Replace the claim on `key` if `old_value` holds it.
    fn reprepare<'a>(
        &'a self,
        key: &'a str,
        old_value: &'a V,
        new_value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Replace the claim on `key`, whatever its value. `false` if the key was
    /// never claimed.
    fn reprepare_value<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Move a claim from `old_key` to `new_key`.
    ///
    /// The new key is claimed first; the old one is then released if
    /// `old_value` holds it. `Ok(false)` if `new_key` is held by someone
    /// else, or if the move already happened.
    ///
    /// # Errors
    ///
    /// [`PrepareError::SameKey`] if the keys are equal, and
    /// [`PrepareError::RollbackFailed`] if `old_value` did not hold
    /// `old_key`; the new claim is released again in that case.
    fn reprepare_key<'a>(
        &'a self,
        old_key: &'a str,
        old_value: &'a V,
        new_key: &'a str,
        new_value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, PrepareError<Self::Error>>> + Send + 'a {
        async move {
            if old_key == new_key {
                return Err(PrepareError::SameKey(old_key.to_string()));
            }
            let claimed = new_value.value.clone();
            let outcome = self
                .try_prepare(new_key, new_value)
                .await
                .map_err(PrepareError::Store)?;
            if outcome == PrepareOutcome::Taken {
                return Ok(false);
            }
            if self
                .rollback_value(old_key, old_value)
                .await
                .map_err(PrepareError::Store)?
            {
                return Ok(true);
            }
            if outcome == PrepareOutcome::AlreadyHeld {
                return Ok(false);
            }
            tracing::warn!(
                prepare_key = self.name(),
                old_key,
                new_key,
                "old claim not held by expected value, releasing new claim"
            );
            self.rollback_value(new_key, &claimed)
                .await
                .map_err(PrepareError::Store)?;
            Err(PrepareError::RollbackFailed {
                old_key: old_key.to_string(),
                new_key: new_key.to_string(),
            })
        }
    }

    /// Claim `key`, run `operation` with whether `value` holds it, and
    /// release the claim if `operation` fails.
    ///
    /// Only a claim taken by this call is released; a key `value` already
    /// held stays held.
    ///
    /// # Errors
    ///
    /// [`PrepareError::Store`] if claiming fails, otherwise the error of
    /// `operation` as [`PrepareError::Operation`].
    fn with_prepared<'a, F, Fut, R, E>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
        operation: F,
    ) -> impl Future<Output = Result<R, PrepareError<Self::Error, E>>> + Send + 'a
    where
        F: FnOnce(bool) -> Fut + Send + 'a,
        Fut: Future<Output = Result<R, E>> + Send + 'a,
        R: Send + 'a,
        E: std::error::Error + Send + 'static,
    {
        async move {
            let claimed = value.value.clone();
            let outcome = self
                .try_prepare(key, value)
                .await
                .map_err(PrepareError::Store)?;
            match operation(outcome.is_held()).await {
                Ok(result) => Ok(result),
                Err(error) => {
                    if outcome == PrepareOutcome::Claimed {
                        tracing::debug!(prepare_key = self.name(), key, "operation failed, releasing claim");
                        self.rollback_value(key, &claimed)
                            .await
                            .map_err(PrepareError::Store)?;
                    }
                    Err(PrepareError::Operation(error))
                }
            }
        }
    }
}
// ANCHOR_END: prepare_key_trait

impl<V, T> PrepareKey<V> for std::sync::Arc<T>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    T: PrepareKey<V>,
{
    type Error = T::Error;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn try_prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<PrepareOutcome, Self::Error>> + Send + 'a {
        (**self).try_prepare(key, value)
    }

    fn prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        (**self).prepare(key, value)
    }

    fn get_value<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<PreparedValue<V>>, Self::Error>> + Send + 'a {
        (**self).get_value(key)
    }

    fn rollback<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        (**self).rollback(key)
    }

    fn rollback_value<'a>(
        &'a self,
        key: &'a str,
        value: &'a V,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        (**self).rollback_value(key, value)
    }

    fn reprepare<'a>(
        &'a self,
        key: &'a str,
        old_value: &'a V,
        new_value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        (**self).reprepare(key, old_value, new_value)
    }

    fn reprepare_value<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        (**self).reprepare_value(key, value)
    }
}
