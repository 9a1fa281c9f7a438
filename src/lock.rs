use std::time::Duration;

use rand::RngCore;
use tracing::{trace, warn};

use crate::errors::Result;
use crate::store::Store;

/// Cluster-wide mutual exclusion for the background loops.
///
/// Acquisition is a single `SET NX PX`: a process that loses simply skips its tick.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Store,
    key: String,
    ttl: Duration,
}

/// Proof of holding a [`DistributedLock`]. The lock expires on its own if never released.
#[derive(Debug)]
#[must_use = "the lock should be released once the work is done"]
pub struct LockGuard {
    store: Store,
    key: String,
    token: String,
}

impl DistributedLock {
    pub fn new(store: Store, name: &str, ttl: Duration) -> Self {
        let key = store.keys().lock(name);
        DistributedLock { store, key, ttl }
    }

    /// Takes the lock if nobody holds it.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let mut random_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut random_bytes);
        let token = hex::encode(random_bytes);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis().max(1) as u64)
            .query_async(&mut self.store.conn())
            .await?;

        if acquired.is_none() {
            trace!(lock = self.key, "Lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(LockGuard {
            store: self.store.clone(),
            key: self.key.clone(),
            token,
        }))
    }
}

impl LockGuard {
    /// Releases the lock, unless it expired and someone else took it meanwhile.
    pub async fn release(self) -> Result<bool> {
        let deleted: i64 = self
            .store
            .scripts()
            .release_lock
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.store.conn())
            .await?;

        if deleted == 0 {
            warn!(lock = self.key, "Lock expired before it was released");
        }
        Ok(deleted == 1)
    }
}
