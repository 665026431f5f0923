//! Process-wide state of the live aggregation daemon: the registry plus
//! the flush re-entrance flags and the initialization barrier.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use sharelog::{Share, ShareCodecError};
use stats_core::{unix_timestamp, Registry, WorkerStatus};
use tracing::error;

/// While replaying backlog after a restart, SQL flushes are suppressed so
/// half-filled windows cannot overwrite live hashrates with zeros. The
/// barrier clears once a consumed share is this close to wall-clock now.
pub const INITIALIZING_SLACK_SECONDS: u64 = 60;

pub struct StatsServer {
    pub registry: Registry,
    started_at: u64,
    last_share_time: AtomicU32,
    initializing: AtomicBool,
    flushing_kv: AtomicBool,
    flushing_sql: AtomicBool,
    last_flush_time: AtomicI64,
    malformed_shares: AtomicU64,
    request_count: AtomicU64,
    response_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub uptime_secs: u64,
    pub request_count: u64,
    pub response_bytes: u64,
    pub worker_count: u64,
    pub user_count: u64,
    pub pool: WorkerStatus,
}

impl StatsServer {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            started_at: unix_timestamp(),
            last_share_time: AtomicU32::new(0),
            initializing: AtomicBool::new(true),
            flushing_kv: AtomicBool::new(false),
            flushing_sql: AtomicBool::new(false),
            last_flush_time: AtomicI64::new(0),
            malformed_shares: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
        }
    }

    /// Decode and fold one bus record. Malformed records are counted and
    /// logged, never fatal.
    pub fn consume_share_record(&self, payload: &[u8], now: u64) {
        let share = match Share::decode(payload) {
            Ok(share) => share,
            Err(ShareCodecError::InvalidLength { actual }) => {
                self.malformed_shares.fetch_add(1, Ordering::Relaxed);
                error!(actual, "sharelog record has wrong size");
                return;
            }
            Err(e) => {
                self.malformed_shares.fetch_add(1, Ordering::Relaxed);
                error!("undecodable share: {e}");
                return;
            }
        };
        if !share.is_valid() {
            self.malformed_shares.fetch_add(1, Ordering::Relaxed);
            error!("invalid share: {share}");
            return;
        }

        self.last_share_time.store(share.timestamp, Ordering::Relaxed);
        self.registry.process_share(&share, now);
    }

    pub fn last_share_time(&self) -> u64 {
        u64::from(self.last_share_time.load(Ordering::Relaxed))
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Relaxed)
    }

    pub fn finish_initializing(&self) {
        self.initializing.store(false, Ordering::Relaxed);
    }

    /// Claim the KV flush slot; `false` means the previous flush is still
    /// running and this tick should be skipped.
    pub fn try_begin_kv_flush(&self) -> bool {
        !self.flushing_kv.swap(true, Ordering::AcqRel)
    }

    pub fn end_kv_flush(&self) {
        self.flushing_kv.store(false, Ordering::Release);
    }

    pub fn try_begin_sql_flush(&self) -> bool {
        !self.flushing_sql.swap(true, Ordering::AcqRel)
    }

    pub fn end_sql_flush(&self) {
        self.flushing_sql.store(false, Ordering::Release);
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flushing_kv.load(Ordering::Acquire) || self.flushing_sql.load(Ordering::Acquire)
    }

    pub fn set_last_flush_time(&self, epoch: i64) {
        self.last_flush_time.store(epoch, Ordering::Relaxed);
    }

    pub fn last_flush_time(&self) -> i64 {
        self.last_flush_time.load(Ordering::Relaxed)
    }

    pub fn count_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_response_bytes(&self, bytes: u64) {
        self.response_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn server_status(&self, now: u64) -> ServerStatus {
        let (worker_count, user_count) = self.registry.counts();
        ServerStatus {
            uptime_secs: now.saturating_sub(self.started_at),
            request_count: self.request_count.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            worker_count,
            user_count,
            pool: self.registry.pool_status(now),
        }
    }
}

impl Default for StatsServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::{ShareResult, WorkerKey, SHARE_RECORD_SIZE};
    use std::net::Ipv4Addr;

    fn record(user_id: i32, worker_id: i64, timestamp: u32) -> Vec<u8> {
        Share {
            user_id,
            worker_hash_id: worker_id,
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
            timestamp,
            share_weight: 1,
            score: 0.0,
            result: ShareResult::Accept,
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn test_consume_updates_registry_and_share_time() {
        let server = StatsServer::new();
        server.consume_share_record(&record(1, 5, 1000), 1000);

        assert_eq!(server.last_share_time(), 1000);
        assert_eq!(server.registry.counts(), (1, 1));
        let status = server.registry.status_batch(&[WorkerKey::new(1, 5)], 1000);
        assert_eq!(status[0].accept_count, 1);
    }

    #[test]
    fn test_malformed_record_is_dropped() {
        let server = StatsServer::new();
        server.consume_share_record(&[0u8; SHARE_RECORD_SIZE - 1], 1000);
        server.consume_share_record(&[0u8; SHARE_RECORD_SIZE], 1000);

        assert_eq!(server.registry.counts(), (0, 0));
        assert_eq!(server.last_share_time(), 0);
    }

    #[test]
    fn test_flush_flags_are_exclusive() {
        let server = StatsServer::new();

        assert!(server.try_begin_kv_flush());
        assert!(!server.try_begin_kv_flush());
        server.end_kv_flush();
        assert!(server.try_begin_kv_flush());

        assert!(server.try_begin_sql_flush());
        assert!(!server.try_begin_sql_flush());
        server.end_sql_flush();
        assert!(server.try_begin_sql_flush());
    }

    #[test]
    fn test_server_status_counts_pool() {
        let server = StatsServer::new();
        for ts in 1000..1010u32 {
            server.consume_share_record(&record(1, 5, ts), 1010);
            server.consume_share_record(&record(2, 9, ts), 1010);
        }

        let status = server.server_status(stats_core::unix_timestamp());
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.user_count, 2);
        assert_eq!(status.pool.accept_count, 20);
    }
}
