//! Environment-driven configuration.
//!
//! Parsing goes through a lookup function rather than `std::env` directly so
//! callers (and tests) can supply their own source.

use std::time::Duration;

use crate::store::{SlotPolicy, StoreConfig};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Settings for [`AdmissionController`](crate::AdmissionController).
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum number of tasks holding a slot at once, across all instances.
    pub max_concurrent: usize,
    /// Grant lifetime; holders renew at a third of it. `None` disables leases.
    pub lease_ttl: Option<Duration>,
    /// How often a waiter re-checks the store without a notification.
    pub recheck_interval: Duration,
    /// Lifetime of per-task metadata records.
    pub metadata_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            lease_ttl: Some(Duration::from_secs(60)),
            recheck_interval: Duration::from_secs(1),
            metadata_ttl: Duration::from_secs(3600),
        }
    }
}

impl AdmissionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent = match lookup("MAX_CONCURRENT_EVALUATIONS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "MAX_CONCURRENT_EVALUATIONS",
                        expected: "a positive integer",
                        value: raw,
                    });
                }
            },
            None => defaults.max_concurrent,
        };

        let lease_ttl = match parse_u64(&lookup, "SLOT_LEASE_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.lease_ttl,
        };

        let recheck_interval = match parse_u64(&lookup, "SLOT_RECHECK_MS")? {
            Some(ms) => Duration::from_millis(ms.max(10)),
            None => defaults.recheck_interval,
        };

        let metadata_ttl = parse_u64(&lookup, "TASK_METADATA_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.metadata_ttl);

        Ok(Self {
            max_concurrent,
            lease_ttl,
            recheck_interval,
            metadata_ttl,
        })
    }

    pub fn policy(&self) -> SlotPolicy {
        SlotPolicy {
            capacity: self.max_concurrent,
            lease: self.lease_ttl,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("SLOTGATE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            ..defaults
        }
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                key,
                expected: "a non-negative integer",
                value: raw,
            })
        })
        .transpose()
}
