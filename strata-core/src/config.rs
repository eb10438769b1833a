//! Runtime configuration.
//!
//! Every section has sensible defaults and deserialises with
//! `#[serde(default)]`, so host applications can embed [`Config`] in their
//! own configuration files and only spell out what they change.
//! [`Config::from_env`] overlays `STRATA_*` environment variables.

use std::{str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{concurrency::RetryBound, snapshot::SnapshotPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub processor: ProcessorConfig,
    pub bus: BusConfig,
    pub idempotency: IdempotencyConfig,
    pub snapshot: SnapshotConfig,
    pub wait: WaitConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Load/apply/append attempts per command; clamped to `1..=10`.
    pub max_attempts: usize,
    /// Serialise commands per aggregate id inside this process.
    pub serialize_locally: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: RetryBound::DEFAULT.attempts(),
            serialize_locally: false,
        }
    }
}

impl ProcessorConfig {
    #[must_use]
    pub const fn retry_bound(&self) -> RetryBound {
        RetryBound::new(self.max_attempts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Channel capacity per partition.
    pub buffer: usize,
    /// Ordered workers per subscriber.
    pub partitions: usize,
    pub max_redeliveries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            partitions: 1,
            max_redeliveries: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub expected_insertions: usize,
    pub false_positive_rate: f64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            expected_insertions: 100_000,
            false_positive_rate: 0.000_01,
        }
    }
}

impl IdempotencyConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Minimum number of new events before a snapshot is written; `0`
    /// disables snapshotting.
    pub every: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { every: 1 }
    }
}

impl SnapshotConfig {
    #[must_use]
    pub const fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::every(self.every)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl WaitConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Defaults overlaid with `STRATA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        set(&lookup, "STRATA_PROCESSOR_MAX_ATTEMPTS", &mut self.processor.max_attempts)?;
        set(
            &lookup,
            "STRATA_PROCESSOR_SERIALIZE_LOCALLY",
            &mut self.processor.serialize_locally,
        )?;
        set(&lookup, "STRATA_BUS_BUFFER", &mut self.bus.buffer)?;
        set(&lookup, "STRATA_BUS_PARTITIONS", &mut self.bus.partitions)?;
        set(&lookup, "STRATA_BUS_MAX_REDELIVERIES", &mut self.bus.max_redeliveries)?;
        set(&lookup, "STRATA_IDEMPOTENCY_TTL_SECS", &mut self.idempotency.ttl_secs)?;
        set(
            &lookup,
            "STRATA_IDEMPOTENCY_EXPECTED_INSERTIONS",
            &mut self.idempotency.expected_insertions,
        )?;
        set(
            &lookup,
            "STRATA_IDEMPOTENCY_FALSE_POSITIVE_RATE",
            &mut self.idempotency.false_positive_rate,
        )?;
        set(&lookup, "STRATA_SNAPSHOT_EVERY", &mut self.snapshot.every)?;
        set(&lookup, "STRATA_WAIT_TIMEOUT_MS", &mut self.wait.timeout_ms)?;
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.buffer == 0 {
            return Err(invalid("STRATA_BUS_BUFFER", "0", "must be positive"));
        }
        if self.bus.partitions == 0 {
            return Err(invalid("STRATA_BUS_PARTITIONS", "0", "must be positive"));
        }
        let rate = self.idempotency.false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(invalid(
                "STRATA_IDEMPOTENCY_FALSE_POSITIVE_RATE",
                &rate.to_string(),
                "must be between 0 and 1 exclusive",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn set<T, F>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &raw, &e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.processor.retry_bound().attempts(), 3);
        assert!(!config.processor.serialize_locally);
        assert_eq!(config.bus.buffer, 1024);
        assert_eq!(config.bus.partitions, 1);
        assert_eq!(config.bus.max_redeliveries, 2);
        assert_eq!(config.idempotency.ttl(), Duration::from_secs(60));
        assert_eq!(config.snapshot.policy(), SnapshotPolicy::Always);
        assert_eq!(config.wait.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn overlay_reads_variables() {
        let config = Config::default()
            .overlay(lookup(&[
                ("STRATA_PROCESSOR_MAX_ATTEMPTS", "5"),
                ("STRATA_PROCESSOR_SERIALIZE_LOCALLY", "true"),
                ("STRATA_BUS_PARTITIONS", "4"),
                ("STRATA_SNAPSHOT_EVERY", "50"),
                ("STRATA_WAIT_TIMEOUT_MS", " 250 "),
            ]))
            .unwrap();
        assert_eq!(config.processor.max_attempts, 5);
        assert!(config.processor.serialize_locally);
        assert_eq!(config.bus.partitions, 4);
        assert_eq!(config.snapshot.policy(), SnapshotPolicy::EveryNEvents(50));
        assert_eq!(config.wait.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let err = Config::default()
            .overlay(lookup(&[("STRATA_BUS_BUFFER", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STRATA_BUS_BUFFER", .. }));
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let err = Config::default()
            .overlay(lookup(&[("STRATA_BUS_PARTITIONS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn retry_bound_is_clamped() {
        let config = Config::default()
            .overlay(lookup(&[("STRATA_PROCESSOR_MAX_ATTEMPTS", "99")]))
            .unwrap();
        assert_eq!(config.processor.retry_bound().attempts(), RetryBound::MAX);
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: Config =
            serde_json::from_str(r#"{ "bus": { "partitions": 8 }, "snapshot": { "every": 0 } }"#)
                .unwrap();
        assert_eq!(config.bus.partitions, 8);
        assert_eq!(config.bus.buffer, 1024);
        assert_eq!(config.snapshot.policy(), SnapshotPolicy::Never);
        assert_eq!(config.processor, ProcessorConfig::default());
    }
}
