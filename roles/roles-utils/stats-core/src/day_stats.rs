//! Per-calendar-day, per-key hour and day accumulators for the rollup
//! pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use sharelog::{Share, ShareResult, WorkerKey};

/// Reward multiplier: `earn = score * BLOCK_REWARD`, truncated to integer.
pub const BLOCK_REWARD: u64 = 1_250_000_000;

/// Hour/day totals for one key, guarded by an internal mutex so the rollup
/// feeder and the flusher can run concurrently.
#[derive(Debug, Default)]
pub struct DayStats {
    inner: Mutex<DayStatsInner>,
}

#[derive(Debug, Default)]
struct DayStatsInner {
    accept_by_hour: [u64; 24],
    reject_by_hour: [u64; 24],
    score_by_hour: [f64; 24],
    accept_day: u64,
    reject_day: u64,
    score_day: f64,
    /// Bit i set means hour i changed since the last successful DB flush.
    dirty_hours: u32,
}

/// One hour's (or the whole day's) totals, ready for a SQL row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShareStats {
    pub share_accept: u64,
    pub share_reject: u64,
    pub reject_rate: f64,
    pub score: f64,
    pub earn: i64,
}

impl ShareStats {
    fn from_buckets(accept: u64, reject: u64, score: f64) -> Self {
        let reject_rate = if reject > 0 {
            reject as f64 / (accept + reject) as f64
        } else {
            0.0
        };
        ShareStats {
            share_accept: accept,
            share_reject: reject,
            reject_rate,
            score,
            earn: (score * BLOCK_REWARD as f64) as i64,
        }
    }
}

/// Flush-time snapshot of one entry's dirty hours and day totals. The
/// captured `dirty_hours` mask is handed back to `clear_dirty` after the
/// DB commit, so bits set during the flush survive to the next one.
#[derive(Debug, Clone)]
pub struct DaySnapshot {
    pub dirty_hours: u32,
    pub hours: [ShareStats; 24],
    pub day: ShareStats,
}

impl DayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_share(&self, hour_idx: u32, share: &Share) {
        let hour = hour_idx as usize;
        let mut inner = self.inner.lock().unwrap();
        match share.result {
            ShareResult::Accept => {
                inner.accept_by_hour[hour] += share.share_weight;
                inner.accept_day += share.share_weight;
                inner.score_by_hour[hour] += share.score;
                inner.score_day += share.score;
            }
            ShareResult::Reject => {
                inner.reject_by_hour[hour] += share.share_weight;
                inner.reject_day += share.share_weight;
            }
        }
        inner.dirty_hours |= 1 << hour;
    }

    pub fn hour_stats(&self, hour_idx: u32) -> ShareStats {
        let inner = self.inner.lock().unwrap();
        if hour_idx > 23 {
            return ShareStats::default();
        }
        let hour = hour_idx as usize;
        ShareStats::from_buckets(
            inner.accept_by_hour[hour],
            inner.reject_by_hour[hour],
            inner.score_by_hour[hour],
        )
    }

    pub fn day_stats(&self) -> ShareStats {
        let inner = self.inner.lock().unwrap();
        ShareStats::from_buckets(inner.accept_day, inner.reject_day, inner.score_day)
    }

    /// Snapshot for the flusher; `None` when nothing changed since the
    /// last flush.
    pub fn snapshot_if_dirty(&self) -> Option<DaySnapshot> {
        let inner = self.inner.lock().unwrap();
        if inner.dirty_hours == 0 {
            return None;
        }
        let mut hours = [ShareStats::default(); 24];
        for (hour, stats) in hours.iter_mut().enumerate() {
            *stats = ShareStats::from_buckets(
                inner.accept_by_hour[hour],
                inner.reject_by_hour[hour],
                inner.score_by_hour[hour],
            );
        }
        Some(DaySnapshot {
            dirty_hours: inner.dirty_hours,
            hours,
            day: ShareStats::from_buckets(inner.accept_day, inner.reject_day, inner.score_day),
        })
    }

    /// Clear exactly the bits captured by a successfully flushed snapshot.
    pub fn clear_dirty(&self, flushed_mask: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty_hours &= !flushed_mask;
    }

    #[cfg(test)]
    fn totals(&self) -> (u64, u64, f64) {
        let inner = self.inner.lock().unwrap();
        (inner.accept_day, inner.reject_day, inner.score_day)
    }

    #[cfg(test)]
    fn hour_sums(&self) -> (u64, u64, f64) {
        let inner = self.inner.lock().unwrap();
        (
            inner.accept_by_hour.iter().sum(),
            inner.reject_by_hour.iter().sum(),
            inner.score_by_hour.iter().sum(),
        )
    }
}

/// Rollup accumulators for one UTC day, keyed by worker key. The pool
/// entry `(0, 0)` always exists.
#[derive(Debug)]
pub struct DayStatsMap {
    inner: RwLock<HashMap<WorkerKey, Arc<DayStats>>>,
}

impl DayStatsMap {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(WorkerKey::pool(), Arc::new(DayStats::new()));
        Self {
            inner: RwLock::new(map),
        }
    }

    /// Fold one share into the pool, user and worker entries.
    pub fn process_share(&self, share: &Share) {
        let worker_key = WorkerKey::from(share);
        let user_key = WorkerKey::new(share.user_id, 0);
        let hour_idx = share.hour_index();

        let (worker, user, pool) = {
            let hit = {
                let inner = self.inner.read().unwrap();
                match (inner.get(&worker_key), inner.get(&user_key)) {
                    (Some(w), Some(u)) => {
                        Some((w.clone(), u.clone(), inner[&WorkerKey::pool()].clone()))
                    }
                    _ => None,
                }
            };
            match hit {
                Some(entries) => entries,
                None => {
                    let mut inner = self.inner.write().unwrap();
                    let worker = inner
                        .entry(worker_key)
                        .or_insert_with(|| Arc::new(DayStats::new()))
                        .clone();
                    let user = inner
                        .entry(user_key)
                        .or_insert_with(|| Arc::new(DayStats::new()))
                        .clone();
                    let pool = inner[&WorkerKey::pool()].clone();
                    (worker, user, pool)
                }
            }
        };

        worker.process_share(hour_idx, share);
        user.process_share(hour_idx, share);
        pool.process_share(hour_idx, share);
    }

    pub fn get(&self, key: &WorkerKey) -> Option<Arc<DayStats>> {
        self.inner.read().unwrap().get(key).cloned()
    }

    /// `(key, entry)` pairs with unflushed changes.
    pub fn dirty_entries(&self) -> Vec<(WorkerKey, Arc<DayStats>)> {
        let inner = self.inner.read().unwrap();
        inner
            .iter()
            .filter(|(_, stats)| stats.snapshot_if_dirty().is_some())
            .map(|(key, stats)| (*key, stats.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DayStatsMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn share(user_id: i32, worker_id: i64, timestamp: u32, result: ShareResult) -> Share {
        Share {
            user_id,
            worker_hash_id: worker_id,
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
            timestamp,
            share_weight: 1,
            score: 0.0,
            result,
        }
    }

    #[test]
    fn test_hour_sums_equal_day_totals() {
        let stats = DayStats::new();
        let mut s = share(1, 5, 86400, ShareResult::Accept);
        s.score = 0.5;
        s.share_weight = 3;

        for hour in [0u32, 5, 23] {
            stats.process_share(hour, &s);
        }
        let mut r = share(1, 5, 86400, ShareResult::Reject);
        r.share_weight = 7;
        stats.process_share(12, &r);

        assert_eq!(stats.totals(), (9, 7, 1.5));
        assert_eq!(stats.hour_sums(), (9, 7, 1.5));
    }

    #[test]
    fn test_dirty_mask_tracks_touched_hours() {
        let stats = DayStats::new();
        stats.process_share(0, &share(1, 5, 86400, ShareResult::Accept));
        stats.process_share(23, &share(1, 5, 86400 + 23 * 3600, ShareResult::Accept));

        let snapshot = stats.snapshot_if_dirty().unwrap();
        assert_eq!(snapshot.dirty_hours, (1 << 0) | (1 << 23));
        assert_eq!(snapshot.hours[0].share_accept, 1);
        assert_eq!(snapshot.hours[23].share_accept, 1);

        stats.clear_dirty(snapshot.dirty_hours);
        assert!(stats.snapshot_if_dirty().is_none());
    }

    #[test]
    fn test_clear_dirty_spares_bits_set_during_flush() {
        let stats = DayStats::new();
        stats.process_share(1, &share(1, 5, 86400 + 3600, ShareResult::Accept));
        let snapshot = stats.snapshot_if_dirty().unwrap();

        // a share lands while the flush is in flight
        stats.process_share(2, &share(1, 5, 86400 + 7200, ShareResult::Accept));
        stats.clear_dirty(snapshot.dirty_hours);

        let next = stats.snapshot_if_dirty().unwrap();
        assert_eq!(next.dirty_hours, 1 << 2);
    }

    #[test]
    fn test_reject_rate() {
        let stats = DayStats::new();
        let mut a = share(1, 5, 86400, ShareResult::Accept);
        a.share_weight = 60;
        stats.process_share(0, &a);

        // no rejects: rate is zero
        assert_eq!(stats.day_stats().reject_rate, 0.0);

        let mut r = share(1, 5, 86400, ShareResult::Reject);
        r.share_weight = 20;
        stats.process_share(0, &r);

        let day = stats.day_stats();
        assert!((day.reject_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_earn_scales_score() {
        let stats = DayStats::new();
        let mut s = share(1, 5, 86400, ShareResult::Accept);
        s.score = 2.0;
        stats.process_share(0, &s);

        assert_eq!(stats.hour_stats(0).earn, 2 * BLOCK_REWARD as i64);
        assert_eq!(stats.day_stats().earn, 2 * BLOCK_REWARD as i64);
    }

    #[test]
    fn test_map_updates_pool_user_worker() {
        let map = DayStatsMap::new();
        for k in 0..60u32 {
            map.process_share(&share(1, 5, 86400 + k, ShareResult::Accept));
        }

        // pool, user and worker rows plus nothing else
        assert_eq!(map.len(), 3);
        let pool = map.get(&WorkerKey::pool()).unwrap();
        let hour = pool.hour_stats(0);
        assert_eq!(hour.share_accept, 60);
        assert_eq!(hour.share_reject, 0);
        assert_eq!(hour.reject_rate, 0.0);
        assert_eq!(hour.earn, 0);

        let worker = map.get(&WorkerKey::new(1, 5)).unwrap();
        assert_eq!(worker.day_stats().share_accept, 60);
        let user = map.get(&WorkerKey::new(1, 0)).unwrap();
        assert_eq!(user.day_stats().share_accept, 60);
    }

    #[test]
    fn test_dirty_entries_lists_only_changed() {
        let map = DayStatsMap::new();
        map.process_share(&share(1, 5, 86400, ShareResult::Accept));

        let dirty = map.dirty_entries();
        assert_eq!(dirty.len(), 3);

        for (_, stats) in &dirty {
            let snapshot = stats.snapshot_if_dirty().unwrap();
            stats.clear_dirty(snapshot.dirty_hours);
        }
        assert!(map.dirty_entries().is_empty());
    }
}
