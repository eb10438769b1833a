//! Optimistic concurrency vocabulary.
//!
//! The event store is the only serialisation point for an aggregate: an append
//! at a version that is not exactly one past the current tail is rejected with
//! a [`ConcurrencyConflict`]. Processors react by reloading and retrying, up to
//! a [`RetryBound`].

use thiserror::Error;

use crate::{
    error::{ErrorCode, RecoverableType, codes},
    id::AggregateId,
};

/// Another writer got to the aggregate first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.aggregate_id, *.expected, *.actual))]
pub struct ConcurrencyConflict {
    pub aggregate_id: AggregateId,
    /// The tail version the writer built on (0 for a new aggregate).
    pub expected: u64,
    /// The tail version found in the store.
    pub actual: u64,
}

impl ConcurrencyConflict {
    /// The writer tried to create an aggregate that already exists.
    #[must_use]
    pub const fn is_creation(&self) -> bool {
        self.expected == 0
    }
}

impl ErrorCode for ConcurrencyConflict {
    fn error_code(&self) -> &str {
        codes::EVENT_VERSION_CONFLICT
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Recoverable
    }
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(aggregate_id: &AggregateId, expected: u64, actual: u64) -> String {
    if expected == 0 {
        format!(
            "concurrency conflict on {aggregate_id}: expected new aggregate, found version \
             {actual} (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on {aggregate_id}: expected version {expected}, found \
             {actual} (hint: stream was modified; reload and retry)"
        )
    }
}

/// Number of load/apply/append attempts a processor makes per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBound(usize);

impl RetryBound {
    pub const DEFAULT: Self = Self(3);
    pub const MAX: usize = 10;

    /// Clamp `attempts` into `1..=RetryBound::MAX`.
    #[must_use]
    pub const fn new(attempts: usize) -> Self {
        if attempts == 0 {
            Self(1)
        } else if attempts > Self::MAX {
            Self(Self::MAX)
        } else {
            Self(attempts)
        }
    }

    #[must_use]
    pub const fn attempts(self) -> usize {
        self.0
    }
}

impl Default for RetryBound {
    fn default() -> Self {
        Self::DEFAULT
    }
}
