use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Result, TrellisError};

/// One lightweight async mutex per chain id, created on first use.
/// Serializes all mutations to one chain while leaving unrelated
/// chains fully parallel. The guard must never be held across a venue
/// or webhook call.
pub struct ChainLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChainLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, chain_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(chain_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Enter the chain's exclusive section, waiting if it is busy.
    pub async fn guard(&self, chain_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(chain_id).lock_owned().await
    }

    /// Non-blocking acquire for user-initiated paths. Fails with
    /// Conflict when the chain is mid-mutation; the caller retries.
    pub fn try_guard(&self, chain_id: &str) -> Result<OwnedMutexGuard<()>> {
        self.lock_for(chain_id).try_lock_owned().map_err(|_| {
            TrellisError::conflict(format!("chain {} is busy, retry shortly", chain_id))
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for ChainLocks {
    fn default() -> Self {
        Self::new()
    }
}
