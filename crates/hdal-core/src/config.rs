use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DalError, DalResult};

/// Tunables of the persistence layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    /// Prefix of every key the DAL writes.
    pub namespace: String,
    /// Total save/delete attempts before giving up with a race condition.
    pub max_attempts: u32,
    /// Upper bound of the randomized sleep between conflicting attempts.
    pub retry_backoff_max: Duration,
    /// How long to wait for a distributed mutex.
    pub lock_timeout: Duration,
    /// Base lifetime of a cached query result.
    pub list_cache_ttl: Duration,
    /// Random extra lifetime added to each cached query result, so that
    /// results cached together do not expire together.
    pub list_cache_jitter: Duration,
    /// Expiry of a mutex entry whose holder vanished.
    pub mutex_ttl: Duration,
}

impl Default for DalConfig {
    fn default() -> Self {
        Self {
            namespace: "dal".into(),
            max_attempts: 5,
            retry_backoff_max: Duration::from_millis(250),
            lock_timeout: Duration::from_secs(30),
            list_cache_ttl: Duration::from_secs(300),
            list_cache_jitter: Duration::from_secs(300),
            mutex_ttl: Duration::from_secs(60),
        }
    }
}

impl DalConfig {
    pub fn from_toml_str(raw: &str) -> DalResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| DalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> DalResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> DalResult<()> {
        if self.max_attempts == 0 {
            return Err(DalError::Config("max_attempts must be at least 1".into()));
        }
        if self.namespace.is_empty() {
            return Err(DalError::Config("namespace must not be empty".into()));
        }
        Ok(())
    }

    /// Lifetime for one freshly cached query result.
    pub(crate) fn list_ttl(&self) -> Duration {
        let jitter = self.list_cache_jitter.as_millis() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        self.list_cache_ttl + Duration::from_millis(extra)
    }

    /// Randomized pause before retrying a conflicting transaction.
    pub(crate) fn backoff(&self) -> Duration {
        let max = self.retry_backoff_max.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
