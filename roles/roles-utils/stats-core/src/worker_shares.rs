//! Per-key share aggregates and their immutable status snapshots.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sharelog::{Share, ShareResult};

use crate::windowing::SlidingCounter;

/// Horizon of the live counters: the widest window any status query can
/// ask for, and the staleness threshold for expiring idle aggregates.
pub const SLIDING_WINDOW_SECONDS: u64 = 3600;

/// Live aggregate for one worker, user or the pool. Mutation and snapshot
/// are serialized by the internal mutex; the registry hands out
/// `Arc<WorkerShares>` so updates never hold the registry lock.
#[derive(Debug)]
pub struct WorkerShares {
    inner: Mutex<SharesInner>,
}

#[derive(Debug)]
struct SharesInner {
    accept_count: u64,
    last_share_ip: u32,
    last_share_time: u32,
    accept_by_second: SlidingCounter,
    reject_by_minute: SlidingCounter,
}

impl WorkerShares {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SharesInner {
                accept_count: 0,
                last_share_ip: 0,
                last_share_time: 0,
                accept_by_second: SlidingCounter::new(1, SLIDING_WINDOW_SECONDS),
                reject_by_minute: SlidingCounter::new(60, SLIDING_WINDOW_SECONDS),
            }),
        }
    }

    /// Fold one share into the counters. Shares older than the horizon are
    /// skipped. `last_share_time` is clamped monotone non-decreasing since
    /// bus delivery order is not guaranteed to follow timestamps.
    pub fn process_share(&self, share: &Share, now: u64) {
        if now > u64::from(share.timestamp) + SLIDING_WINDOW_SECONDS {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        match share.result {
            ShareResult::Accept => {
                inner.accept_count += 1;
                inner
                    .accept_by_second
                    .insert(u64::from(share.timestamp), share.share_weight);
            }
            ShareResult::Reject => {
                inner
                    .reject_by_minute
                    .insert(u64::from(share.timestamp), share.share_weight);
            }
        }
        if share.timestamp >= inner.last_share_time {
            inner.last_share_ip = share.ip;
            inner.last_share_time = share.timestamp;
        }
    }

    /// Snapshot the windowed sums as of `now`.
    pub fn status(&self, now: u64) -> WorkerStatus {
        let inner = self.inner.lock().unwrap();
        WorkerStatus {
            accept_1m: inner.accept_by_second.sum(now, 60),
            accept_5m: inner.accept_by_second.sum(now, 300),
            accept_15m: inner.accept_by_second.sum(now, 900),
            accept_1h: inner.accept_by_second.sum(now, 3600),
            reject_15m: inner.reject_by_minute.sum(now, 900),
            reject_1h: inner.reject_by_minute.sum(now, 3600),
            accept_count: inner.accept_count,
            last_share_ip: inner.last_share_ip,
            last_share_time: inner.last_share_time,
        }
    }

    /// An aggregate expires once its newest share is a full horizon old.
    pub fn is_expired(&self, now: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        u64::from(inner.last_share_time) + SLIDING_WINDOW_SECONDS < now
    }
}

impl Default for WorkerShares {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of one aggregate's windowed sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub accept_1m: u64,
    pub accept_5m: u64,
    pub accept_15m: u64,
    pub accept_1h: u64,
    pub reject_15m: u64,
    pub reject_1h: u64,
    pub accept_count: u64,
    pub last_share_ip: u32,
    pub last_share_time: u32,
}

impl WorkerStatus {
    pub fn ip_string(&self) -> String {
        Ipv4Addr::from(self.last_share_ip.to_le_bytes()).to_string()
    }

    /// Component-wise sum; `last_share_ip` follows the status with the
    /// greatest `last_share_time`.
    pub fn merge(statuses: &[WorkerStatus]) -> WorkerStatus {
        let mut merged = WorkerStatus::default();
        for status in statuses {
            merged.accept_1m += status.accept_1m;
            merged.accept_5m += status.accept_5m;
            merged.accept_15m += status.accept_15m;
            merged.accept_1h += status.accept_1h;
            merged.reject_15m += status.reject_15m;
            merged.reject_1h += status.reject_1h;
            merged.accept_count += status.accept_count;
            if status.last_share_time > merged.last_share_time {
                merged.last_share_time = status.last_share_time;
                merged.last_share_ip = status.last_share_ip;
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::Share;

    fn share_at(timestamp: u32, weight: u64, result: ShareResult) -> Share {
        Share {
            user_id: 1,
            worker_hash_id: 5,
            ip: Share::ip_from(Ipv4Addr::new(127, 0, 0, 1)),
            timestamp,
            share_weight: weight,
            score: 1.0,
            result,
        }
    }

    #[test]
    fn test_minute_of_accepts() {
        let shares = WorkerShares::new();
        for ts in 1000..1060u32 {
            shares.process_share(&share_at(ts, 1, ShareResult::Accept), 1060);
        }

        let status = shares.status(1060);
        assert_eq!(status.accept_1m, 60);
        assert_eq!(status.accept_5m, 60);
        assert_eq!(status.accept_15m, 60);
        assert_eq!(status.accept_1h, 60);
        assert_eq!(status.reject_15m, 0);
        assert_eq!(status.accept_count, 60);
        assert_eq!(status.last_share_time, 1059);
    }

    #[test]
    fn test_rejects_do_not_touch_accept_count() {
        let shares = WorkerShares::new();
        for ts in 1000..1060u32 {
            shares.process_share(&share_at(ts, 1, ShareResult::Accept), 1060);
        }
        shares.process_share(&share_at(1055, 10, ShareResult::Reject), 1060);
        shares.process_share(&share_at(1057, 10, ShareResult::Reject), 1060);

        let status = shares.status(1060);
        assert_eq!(status.reject_15m, 20);
        assert_eq!(status.reject_1h, 20);
        assert_eq!(status.accept_count, 60);
    }

    #[test]
    fn test_horizon_boundary() {
        let shares = WorkerShares::new();
        let now = 10_000u64;

        // exactly one horizon old: accepted
        shares.process_share(&share_at(6400, 1, ShareResult::Accept), now);
        // one second past the horizon: silently skipped
        shares.process_share(&share_at(6399, 1, ShareResult::Accept), now);

        let status = shares.status(now);
        assert_eq!(status.accept_count, 1);
        assert_eq!(status.accept_1h, 1);
    }

    #[test]
    fn test_last_share_time_monotone() {
        let shares = WorkerShares::new();
        let late = Share {
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 2)),
            ..share_at(2000, 1, ShareResult::Accept)
        };
        shares.process_share(&late, 2000);
        // out-of-order delivery must not move last_share_time backwards
        shares.process_share(&share_at(1990, 1, ShareResult::Accept), 2000);

        let status = shares.status(2000);
        assert_eq!(status.last_share_time, 2000);
        assert_eq!(status.ip_string(), "10.0.0.2");
    }

    #[test]
    fn test_expiry() {
        let shares = WorkerShares::new();
        shares.process_share(&share_at(1000, 1, ShareResult::Accept), 1000);

        assert!(!shares.is_expired(1000 + 3600));
        assert!(shares.is_expired(1000 + 3601));
    }

    #[test]
    fn test_merge_follows_latest_ip() {
        let a = WorkerStatus {
            accept_1m: 10,
            last_share_time: 100,
            last_share_ip: 1,
            ..WorkerStatus::default()
        };
        let b = WorkerStatus {
            accept_1m: 5,
            last_share_time: 200,
            last_share_ip: 2,
            ..WorkerStatus::default()
        };

        let merged = WorkerStatus::merge(&[a, b]);
        assert_eq!(merged.accept_1m, 15);
        assert_eq!(merged.last_share_time, 200);
        assert_eq!(merged.last_share_ip, 2);
    }

    #[test]
    fn test_merge_empty_is_zero() {
        assert_eq!(WorkerStatus::merge(&[]), WorkerStatus::default());
    }
}
