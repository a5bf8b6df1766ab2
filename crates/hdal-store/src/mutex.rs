use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::traits::VolatileStore;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Cross-process mutex built on the volatile store's `add` primitive.
///
/// The lock entry carries a random token and a TTL, so a crashed holder
/// releases it eventually. Release only deletes the entry while it still
/// holds this mutex's token.
pub struct VolatileMutex {
    store: Arc<dyn VolatileStore>,
    key: String,
    ttl: Duration,
}

impl VolatileMutex {
    pub fn new(store: Arc<dyn VolatileStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try once without waiting.
    pub fn try_acquire(&self) -> StoreResult<Option<MutexGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        if self
            .store
            .add(&self.key, Value::String(token.clone()), Some(self.ttl))?
        {
            Ok(Some(MutexGuard {
                store: Arc::clone(&self.store),
                key: self.key.clone(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Poll until acquired or `wait` elapses.
    pub fn acquire(&self, wait: Duration) -> StoreResult<MutexGuard> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                tracing::debug!(key = %self.key, ?wait, "mutex wait exceeded");
                return Err(StoreError::LockUnavailable(self.key.clone()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for VolatileMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileMutex")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Held lock. Released on drop.
pub struct MutexGuard {
    store: Arc<dyn VolatileStore>,
    key: String,
    token: String,
}

impl MutexGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        match self.store.get(&self.key) {
            Ok(Some(Value::String(current))) if current == self.token => {
                if let Err(e) = self.store.delete(&self.key) {
                    tracing::warn!(key = %self.key, error = %e, "failed to release mutex");
                }
            }
            Ok(_) => {
                tracing::debug!(key = %self.key, "mutex expired before release");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to read mutex on release");
            }
        }
    }
}
