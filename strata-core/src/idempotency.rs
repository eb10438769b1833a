//! Request de-duplication in front of the command bus.
//!
//! The event store rejects a request id it has already appended, but only
//! after the command has been loaded and handled. An [`IdempotencyChecker`]
//! turns most duplicates away at the gateway instead. The Bloom filter used
//! here has no false negatives within one TTL window and a bounded rate of
//! false positives, so a fresh request is occasionally refused as a
//! duplicate; the event store remains the authority.

use std::{
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

use crate::{config::IdempotencyConfig, id::NamedAggregate};

/// Remembers request ids.
pub trait IdempotencyChecker: Send + Sync + 'static {
    /// Record `request_id`. `true` if it was not seen before, `false` for a
    /// (probable) duplicate.
    fn check(&self, request_id: &str) -> bool;
}

/// Accepts every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopIdempotencyChecker;

impl IdempotencyChecker for NoopIdempotencyChecker {
    fn check(&self, _: &str) -> bool {
        true
    }
}

struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Standard sizing: `m = -n ln p / ln² 2` bits and `k = m/n ln 2` hashes.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn with_rate(expected_insertions: usize, false_positive_rate: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;
        let words = usize::try_from(num_bits.div_ceil(64)).unwrap_or(usize::MAX);
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
        }
    }

    fn hashes(item: &str) -> (u64, u64) {
        let hash = |seed: u8| {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            item.hash(&mut hasher);
            hasher.finish()
        };
        (hash(0), hash(1) | 1)
    }

    /// Insert `item`; `true` if it was definitely absent.
    #[allow(clippy::cast_possible_truncation)]
    fn insert(&mut self, item: &str) -> bool {
        let (h1, h2) = Self::hashes(item);
        let mut absent = false;
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            let (word, mask) = ((bit / 64) as usize, 1_u64 << (bit % 64));
            if self.bits[word] & mask == 0 {
                absent = true;
                self.bits[word] |= mask;
            }
        }
        absent
    }

    fn clear(&mut self) {
        self.bits.fill(0);
    }
}

struct Window {
    filter: BloomFilter,
    reset_at: Instant,
}

/// Bloom-filter checker that forgets everything every `ttl`.
pub struct BloomFilterIdempotencyChecker {
    ttl: Duration,
    window: Mutex<Window>,
}

impl BloomFilterIdempotencyChecker {
    #[must_use]
    pub fn new(ttl: Duration, expected_insertions: usize, false_positive_rate: f64) -> Self {
        let filter = BloomFilter::with_rate(expected_insertions, false_positive_rate);
        tracing::debug!(
            ttl = ?ttl,
            bits = filter.num_bits,
            hashes = filter.num_hashes,
            "idempotency filter sized"
        );
        Self {
            ttl,
            window: Mutex::new(Window {
                filter,
                reset_at: Instant::now() + ttl,
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(
            config.ttl(),
            config.expected_insertions,
            config.false_positive_rate,
        )
    }
}

impl IdempotencyChecker for BloomFilterIdempotencyChecker {
    fn check(&self, request_id: &str) -> bool {
        let mut window = self.window.lock().expect("idempotency filter poisoned");
        let now = Instant::now();
        if now >= window.reset_at {
            tracing::trace!("idempotency window elapsed, resetting filter");
            window.filter.clear();
            window.reset_at = now + self.ttl;
        }
        window.filter.insert(request_id)
    }
}

impl fmt::Debug for BloomFilterIdempotencyChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilterIdempotencyChecker")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// One checker per aggregate type, created on first use.
#[derive(Clone)]
pub struct IdempotencyCheckers {
    config: Option<IdempotencyConfig>,
    checkers: Arc<Mutex<HashMap<NamedAggregate, Arc<dyn IdempotencyChecker>>>>,
}

impl IdempotencyCheckers {
    /// Bloom-filter checkers sized by `config`.
    #[must_use]
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            config: Some(config),
            checkers: Arc::default(),
        }
    }

    /// Accept every request unless a checker is set explicitly.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: None,
            checkers: Arc::default(),
        }
    }

    /// Use `checker` for `named_aggregate`.
    #[must_use]
    pub fn with_checker(self, named_aggregate: NamedAggregate, checker: impl IdempotencyChecker) -> Self {
        self.checkers
            .lock()
            .expect("idempotency checkers poisoned")
            .insert(named_aggregate, Arc::new(checker));
        self
    }

    #[must_use]
    pub fn checker(&self, named_aggregate: &NamedAggregate) -> Arc<dyn IdempotencyChecker> {
        let mut checkers = self.checkers.lock().expect("idempotency checkers poisoned");
        if let Some(checker) = checkers.get(named_aggregate) {
            return Arc::clone(checker);
        }
        let checker: Arc<dyn IdempotencyChecker> = match &self.config {
            Some(config) => Arc::new(BloomFilterIdempotencyChecker::from_config(config)),
            None => Arc::new(NoopIdempotencyChecker),
        };
        checkers.insert(named_aggregate.clone(), Arc::clone(&checker));
        checker
    }
}

impl Default for IdempotencyCheckers {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}

impl fmt::Debug for IdempotencyCheckers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyCheckers")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
