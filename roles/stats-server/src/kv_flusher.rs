//! Sharded fan-out of live worker and user statuses to Redis.
//!
//! Each flush snapshots the registry under one read-lock hold, splits the
//! entries into `kv_concurrency` shards by position, and runs one task per
//! shard against that shard's dedicated connection. Updates are buffered
//! first and drained after the snapshot, so no registry lock is held
//! across socket I/O. Per-entry failures are logged and the batch
//! continues; a shard whose connection fails its ping is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sharestats_redis::{index_key, user_entry_key, worker_entry_key, EntryUpdate, KvClient};
use stats_core::{unix_timestamp, WorkerStatus};
use tracing::{error, info, warn};

use crate::policy::{IndexBuffer, INDEX_NONE, PUBLISH_USER_UPDATE, PUBLISH_WORKER_UPDATE};
use crate::server::StatsServer;

/// How entry updates are written: key prefix, TTL, and the publish/index
/// policy bits. Split from the flusher so the update shapes are testable
/// without a live connection.
#[derive(Debug, Clone)]
pub struct KvWritePolicy {
    pub prefix: String,
    pub key_ttl_s: u64,
    pub publish_policy: u32,
    pub index_policy: u32,
}

impl KvWritePolicy {
    /// Buffered update for one worker row. The PUBLISH notification is
    /// gated on the policy bit alone: every flush tick notifies, whether
    /// or not the content changed since the last one.
    pub fn worker_update(
        &self,
        user_id: i32,
        worker_id: i64,
        status: &WorkerStatus,
        now: u64,
    ) -> EntryUpdate {
        EntryUpdate {
            key: worker_entry_key(&self.prefix, user_id, worker_id),
            fields: status_fields(status, None, now),
            ttl_secs: (self.key_ttl_s > 0).then_some(self.key_ttl_s),
            publish: (self.publish_policy & PUBLISH_WORKER_UPDATE != 0).then(|| "1".to_string()),
        }
    }

    /// Buffered update for one user row; the PUBLISH payload is the live
    /// worker count.
    pub fn user_update(
        &self,
        user_id: i32,
        worker_count: u32,
        status: &WorkerStatus,
        now: u64,
    ) -> EntryUpdate {
        EntryUpdate {
            key: user_entry_key(&self.prefix, user_id),
            fields: status_fields(status, Some(worker_count), now),
            ttl_secs: (self.key_ttl_s > 0).then_some(self.key_ttl_s),
            publish: (self.publish_policy & PUBLISH_USER_UPDATE != 0)
                .then(|| worker_count.to_string()),
        }
    }
}

pub struct KvFlusher {
    clients: Vec<Arc<KvClient>>,
    policy: KvWritePolicy,
}

impl KvFlusher {
    pub fn new(clients: Vec<Arc<KvClient>>, policy: KvWritePolicy) -> Self {
        assert!(!clients.is_empty());
        Self { clients, policy }
    }

    pub fn concurrency(&self) -> usize {
        self.clients.len()
    }

    /// Run one full flush: fan out shard tasks and join them all.
    pub async fn flush(self: &Arc<Self>, server: &Arc<StatsServer>) {
        let began = Instant::now();
        let workers = Arc::new(server.registry.snapshot_workers());
        let users = Arc::new(server.registry.snapshot_users());

        let mut tasks = Vec::with_capacity(self.concurrency());
        for shard in 0..self.concurrency() {
            let flusher = self.clone();
            let workers = workers.clone();
            let users = users.clone();
            tasks.push(tokio::spawn(async move {
                flusher.flush_shard(shard, &workers, &users).await;
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("kv flush shard panicked: {e}");
            }
        }

        info!(
            workers = workers.len(),
            users = users.len(),
            elapsed_ms = began.elapsed().as_millis() as u64,
            "flush to kv done"
        );
    }

    async fn flush_shard(
        &self,
        shard: usize,
        workers: &[(sharelog::WorkerKey, Arc<stats_core::WorkerShares>)],
        users: &[(i32, u32, Arc<stats_core::WorkerShares>)],
    ) {
        let client = &self.clients[shard];
        if let Err(e) = client.ping().await {
            error!(shard, "can't reach kv sink, skipping shard: {e}");
            return;
        }

        let now = unix_timestamp();
        let mut index_buffers: HashMap<i32, IndexBuffer> = HashMap::new();

        // phase 1: buffer updates from the snapshot
        let mut updates = Vec::new();
        for (key, shares) in shard_slice(workers, shard, self.concurrency()) {
            let status = shares.status(now);
            updates.push(
                self.policy
                    .worker_update(key.user_id, key.worker_id, &status, now),
            );
            if self.policy.index_policy != INDEX_NONE {
                index_buffers
                    .entry(key.user_id)
                    .or_default()
                    .add(self.policy.index_policy, key.worker_id, &status);
            }
        }
        for (user_id, worker_count, shares) in shard_slice(users, shard, self.concurrency()) {
            let status = shares.status(now);
            updates.push(self.policy.user_update(*user_id, *worker_count, &status, now));
        }

        if updates.is_empty() {
            info!(shard, "no active entries in shard");
            return;
        }

        // phase 2: drain
        let mut failed = 0usize;
        for update in &updates {
            if let Err(e) = client.write_entry(update).await {
                failed += 1;
                warn!(shard, key = %update.key, "kv entry update failed: {e}");
            }
        }

        for (user_id, buffer) in &index_buffers {
            for (index_name, pairs) in buffer.batches() {
                let key = index_key(&self.policy.prefix, *user_id, index_name);
                if let Err(e) = client.zadd_batch(&key, pairs).await {
                    warn!(shard, key = %key, "kv index update failed: {e}");
                }
            }
        }

        info!(
            shard,
            entries = updates.len(),
            failed,
            "flushed shard to kv"
        );
    }
}

/// Positions `[shard * step, (shard + 1) * step)` of the snapshot, step
/// rounded up so the tail entries are not lost to truncation.
fn shard_slice<T>(entries: &[T], shard: usize, concurrency: usize) -> &[T] {
    let mut step = entries.len() / concurrency;
    if entries.len() % concurrency != 0 {
        step += 1;
    }
    let begin = (shard * step).min(entries.len());
    let end = ((shard + 1) * step).min(entries.len());
    &entries[begin..end]
}

/// HMSET field list in sink order; user rows lead with `worker_count`.
fn status_fields(
    status: &WorkerStatus,
    worker_count: Option<u32>,
    now: u64,
) -> Vec<(&'static str, String)> {
    let mut fields = Vec::with_capacity(11);
    if let Some(count) = worker_count {
        fields.push(("worker_count", count.to_string()));
    }
    fields.push(("accept_1m", status.accept_1m.to_string()));
    fields.push(("accept_5m", status.accept_5m.to_string()));
    fields.push(("accept_15m", status.accept_15m.to_string()));
    fields.push(("reject_15m", status.reject_15m.to_string()));
    fields.push(("accept_1h", status.accept_1h.to_string()));
    fields.push(("reject_1h", status.reject_1h.to_string()));
    fields.push(("accept_count", status.accept_count.to_string()));
    fields.push(("last_share_ip", status.ip_string()));
    fields.push(("last_share_time", status.last_share_time.to_string()));
    fields.push(("updated_at", now.to_string()));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_slices_cover_everything_once() {
        let entries: Vec<u32> = (0..5).collect();
        let mut seen = Vec::new();
        for shard in 0..2 {
            seen.extend_from_slice(shard_slice(&entries, shard, 2));
        }
        assert_eq!(seen, entries);

        // more shards than entries: tail shards are empty, nothing repeats
        let mut seen = Vec::new();
        for shard in 0..8 {
            seen.extend_from_slice(shard_slice(&entries, shard, 8));
        }
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_shard_slice_empty_input() {
        let entries: Vec<u32> = Vec::new();
        for shard in 0..3 {
            assert!(shard_slice(&entries, shard, 3).is_empty());
        }
    }

    #[test]
    fn test_status_field_names_and_order() {
        let status = WorkerStatus {
            accept_1m: 1,
            accept_5m: 2,
            accept_15m: 3,
            accept_1h: 4,
            reject_15m: 5,
            reject_1h: 6,
            accept_count: 7,
            last_share_ip: sharelog::Share::ip_from(std::net::Ipv4Addr::new(10, 0, 0, 9)),
            last_share_time: 1234,
        };

        let fields = status_fields(&status, None, 2000);
        let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "accept_1m",
                "accept_5m",
                "accept_15m",
                "reject_15m",
                "accept_1h",
                "reject_1h",
                "accept_count",
                "last_share_ip",
                "last_share_time",
                "updated_at"
            ]
        );
        assert_eq!(fields[7].1, "10.0.0.9");
        assert_eq!(fields[9].1, "2000");

        let user_fields = status_fields(&status, Some(3), 2000);
        assert_eq!(user_fields[0], ("worker_count", "3".to_string()));
        assert_eq!(user_fields.len(), 11);
    }

    #[test]
    fn test_publish_gated_by_policy_bits() {
        let status = WorkerStatus::default();
        let noisy = KvWritePolicy {
            prefix: "pool/".to_string(),
            key_ttl_s: 3600,
            publish_policy: PUBLISH_WORKER_UPDATE | PUBLISH_USER_UPDATE,
            index_policy: 0,
        };
        let worker = noisy.worker_update(1, 5, &status, 0);
        assert_eq!(worker.publish.as_deref(), Some("1"));
        assert_eq!(worker.ttl_secs, Some(3600));
        assert_eq!(noisy.user_update(1, 3, &status, 0).publish.as_deref(), Some("3"));

        let quiet = KvWritePolicy {
            publish_policy: 0,
            key_ttl_s: 0,
            ..noisy
        };
        let worker = quiet.worker_update(1, 5, &status, 0);
        assert!(worker.publish.is_none());
        assert!(worker.ttl_secs.is_none());
        assert!(quiet.user_update(1, 3, &status, 0).publish.is_none());
    }
}
