//! Read-mostly index of live worker and user aggregates.
//!
//! The maps live under one `RwLock`; every entry is an `Arc<WorkerShares>`
//! with its own mutex, so share processing takes the read lock only to
//! resolve the entry and the write lock only to insert or expire. No lock
//! is ever held across sink I/O: flushers snapshot `(key, Arc)` pairs under
//! the read lock and work from the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sharelog::{Share, WorkerKey};
use tracing::debug;

use crate::worker_shares::{WorkerShares, WorkerStatus, SLIDING_WINDOW_SECONDS};

#[derive(Debug, Default)]
struct RegistryInner {
    workers: HashMap<WorkerKey, Arc<WorkerShares>>,
    users: HashMap<i32, Arc<WorkerShares>>,
    user_worker_count: HashMap<i32, u32>,
}

/// Live aggregates for every active worker and user, plus the pool total.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
    pool: Arc<WorkerShares>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            pool: Arc::new(WorkerShares::new()),
        }
    }

    /// Fold one share into the pool, worker and user aggregates, creating
    /// missing entries. Shares older than the horizon are skipped.
    pub fn process_share(&self, share: &Share, now: u64) {
        if now > u64::from(share.timestamp) + SLIDING_WINDOW_SECONDS {
            return;
        }

        self.pool.process_share(share, now);

        let key = WorkerKey::from(share);
        let found = {
            let inner = self.inner.read().unwrap();
            let worker = inner.workers.get(&key).cloned();
            let user = inner.users.get(&share.user_id).cloned();
            match (worker, user) {
                (Some(w), Some(u)) => Some((w, u)),
                _ => None,
            }
        };

        let (worker, user) = match found {
            Some(pair) => pair,
            // Miss on either map: insert under the write lock with a
            // re-check, so two tasks racing on the same new key converge
            // on a single aggregate.
            None => {
                let mut guard = self.inner.write().unwrap();
                let inner = &mut *guard;
                let worker = match inner.workers.entry(key) {
                    std::collections::hash_map::Entry::Occupied(e) => e.get().clone(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let created = e.insert(Arc::new(WorkerShares::new())).clone();
                        *inner.user_worker_count.entry(key.user_id).or_insert(0) += 1;
                        created
                    }
                };
                let user = inner
                    .users
                    .entry(share.user_id)
                    .or_insert_with(|| Arc::new(WorkerShares::new()))
                    .clone();
                (worker, user)
            }
        };

        worker.process_share(share, now);
        user.process_share(share, now);
    }

    /// Status snapshots for a batch of keys. A key with worker_id 0 is
    /// resolved against the users map; unknown keys yield a zero status.
    pub fn status_batch(&self, keys: &[WorkerKey], now: u64) -> Vec<WorkerStatus> {
        let entries: Vec<Option<Arc<WorkerShares>>> = {
            let inner = self.inner.read().unwrap();
            keys.iter()
                .map(|key| {
                    if key.is_user_row() {
                        inner.users.get(&key.user_id).cloned()
                    } else {
                        inner.workers.get(key).cloned()
                    }
                })
                .collect()
        };

        entries
            .into_iter()
            .map(|entry| entry.map(|e| e.status(now)).unwrap_or_default())
            .collect()
    }

    /// Status of the pool aggregate.
    pub fn pool_status(&self, now: u64) -> WorkerStatus {
        self.pool.status(now)
    }

    /// Remove every aggregate whose newest share is a full horizon old.
    /// Worker-count bookkeeping happens under the same write lock as the
    /// removal so concurrent readers never observe a half-applied sweep.
    pub fn expire(&self, now: u64) -> (usize, usize) {
        let mut inner = self.inner.write().unwrap();

        let mut expired_workers = 0usize;
        let expired_keys: Vec<WorkerKey> = inner
            .workers
            .iter()
            .filter(|(_, shares)| shares.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        for key in expired_keys {
            inner.workers.remove(&key);
            expired_workers += 1;
            let user_emptied = match inner.user_worker_count.get_mut(&key.user_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if user_emptied {
                inner.user_worker_count.remove(&key.user_id);
            }
        }

        let before_users = inner.users.len();
        inner.users.retain(|_, shares| !shares.is_expired(now));
        let expired_users = before_users - inner.users.len();

        debug!(expired_workers, expired_users, "removed expired aggregates");
        (expired_workers, expired_users)
    }

    /// `(total_workers, total_users)`.
    pub fn counts(&self) -> (u64, u64) {
        let inner = self.inner.read().unwrap();
        (inner.workers.len() as u64, inner.users.len() as u64)
    }

    pub fn worker_count_of_user(&self, user_id: i32) -> u32 {
        let inner = self.inner.read().unwrap();
        inner.user_worker_count.get(&user_id).copied().unwrap_or(0)
    }

    /// Snapshot of all worker entries, taken under one read-lock hold so
    /// shard assignment by position is stable for the whole flush.
    pub fn snapshot_workers(&self) -> Vec<(WorkerKey, Arc<WorkerShares>)> {
        let inner = self.inner.read().unwrap();
        inner
            .workers
            .iter()
            .map(|(key, shares)| (*key, shares.clone()))
            .collect()
    }

    /// Snapshot of all user entries with their live worker counts.
    pub fn snapshot_users(&self) -> Vec<(i32, u32, Arc<WorkerShares>)> {
        let inner = self.inner.read().unwrap();
        inner
            .users
            .iter()
            .map(|(user_id, shares)| {
                let workers = inner.user_worker_count.get(user_id).copied().unwrap_or(0);
                (*user_id, workers, shares.clone())
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
