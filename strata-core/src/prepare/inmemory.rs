//! In-memory [`PrepareKey`](super::PrepareKey) for tests and single-process
//! deployments.

use std::{
    collections::HashMap,
    convert::Infallible,
    future::ready,
    sync::{Arc, RwLock},
};

use chrono::Utc;

use super::{PrepareKey, PrepareOutcome, PreparedValue};

/// Claims kept in a map behind one lock; every operation is a single
/// critical section.
#[derive(Clone, Debug)]
pub struct InMemoryPrepareKey<V> {
    name: Arc<str>,
    claims: Arc<RwLock<HashMap<String, PreparedValue<V>>>>,
}

impl<V> InMemoryPrepareKey<V> {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            claims: Arc::default(),
        }
    }

    /// Stored claims, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.read().expect("prepare key lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_claims<R>(&self, f: impl FnOnce(&mut HashMap<String, PreparedValue<V>>) -> R) -> R {
        let mut claims = self.claims.write().expect("prepare key lock poisoned");
        f(&mut claims)
    }
}

impl<V> PrepareKey<V> for InMemoryPrepareKey<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    type Error = Infallible;

    fn name(&self) -> &str {
        &self.name
    }

    fn try_prepare<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<PrepareOutcome, Self::Error>> + Send + 'a {
        let now = Utc::now();
        let outcome = self.with_claims(|claims| {
            match claims.get(key).filter(|held| !held.is_expired_at(now)) {
                Some(held) if held.value == value.value => PrepareOutcome::AlreadyHeld,
                Some(_) => PrepareOutcome::Taken,
                None => {
                    claims.insert(key.to_string(), value);
                    PrepareOutcome::Claimed
                }
            }
        });
        tracing::trace!(prepare_key = %self.name, key, ?outcome, "prepare");
        ready(Ok(outcome))
    }

    fn get_value<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<PreparedValue<V>>, Self::Error>> + Send + 'a {
        let claims = self.claims.read().expect("prepare key lock poisoned");
        ready(Ok(claims.get(key).cloned()))
    }

    fn rollback<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let now = Utc::now();
        let released = self.with_claims(|claims| {
            claims.get(key).is_some_and(|held| !held.is_expired_at(now))
                && claims.remove(key).is_some()
        });
        ready(Ok(released))
    }

    fn rollback_value<'a>(
        &'a self,
        key: &'a str,
        value: &'a V,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let released = self.with_claims(|claims| {
            claims.get(key).is_some_and(|held| held.value == *value)
                && claims.remove(key).is_some()
        });
        ready(Ok(released))
    }

    fn reprepare<'a>(
        &'a self,
        key: &'a str,
        old_value: &'a V,
        new_value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let replaced = self.with_claims(|claims| match claims.get_mut(key) {
            Some(held) if held.value == *old_value => {
                *held = new_value;
                true
            }
            _ => false,
        });
        ready(Ok(replaced))
    }

    fn reprepare_value<'a>(
        &'a self,
        key: &'a str,
        value: PreparedValue<V>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let replaced = self.with_claims(|claims| match claims.get_mut(key) {
            Some(held) => {
                *held = value;
                true
            }
            None => false,
        });
        ready(Ok(replaced))
    }
}
