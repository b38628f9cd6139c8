//! Per-account async locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Keyed mutexes, one per account id. Distinct accounts never contend.
///
/// An entry lives only while someone holds or waits for it.
#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<LockMap>,
}

/// Held lock of one account. Dropping it releases the lock.
pub struct AccountGuard {
    guard: Option<OwnedMutexGuard<()>>,
    account_id: String,
    locks: Arc<LockMap>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `account_id`.
    pub async fn lock(&self, account_id: &str) -> AccountGuard {
        let lock = self
            .locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        AccountGuard {
            guard: Some(lock.lock_owned().await),
            account_id: account_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Number of accounts with a live entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are taken under the shard lock, so a count of one means
        // no holder or waiter is left.
        self.locks
            .remove_if(&self.account_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
