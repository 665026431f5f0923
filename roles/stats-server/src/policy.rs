//! Publish and sorted-set index policy bitmasks, and the per-user index
//! buffer accumulated during a flush.

use stats_core::WorkerStatus;

pub const PUBLISH_WORKER_UPDATE: u32 = 1 << 0;
pub const PUBLISH_USER_UPDATE: u32 = 1 << 1;

pub const INDEX_NONE: u32 = 0;
pub const INDEX_ACCEPT_1M: u32 = 1 << 0;
pub const INDEX_ACCEPT_5M: u32 = 1 << 1;
pub const INDEX_ACCEPT_15M: u32 = 1 << 2;
pub const INDEX_REJECT_15M: u32 = 1 << 3;
pub const INDEX_ACCEPT_1H: u32 = 1 << 4;
pub const INDEX_REJECT_1H: u32 = 1 << 5;
pub const INDEX_ACCEPT_COUNT: u32 = 1 << 6;
pub const INDEX_LAST_SHARE_IP: u32 = 1 << 7;
pub const INDEX_LAST_SHARE_TIME: u32 = 1 << 8;
pub const INDEX_WORKER_NAME: u32 = 1 << 9;
pub const INDEX_MINER_AGENT: u32 = 1 << 10;

/// `(score, worker_id)` pairs per index dimension, buffered for one user
/// while the registry lock is held and flushed as ZADDs afterwards.
#[derive(Debug, Default)]
pub struct IndexBuffer {
    accept_1m: Vec<(u64, String)>,
    accept_5m: Vec<(u64, String)>,
    accept_15m: Vec<(u64, String)>,
    reject_15m: Vec<(u64, String)>,
    accept_1h: Vec<(u64, String)>,
    reject_1h: Vec<(u64, String)>,
    accept_count: Vec<(u64, String)>,
    last_share_ip: Vec<(u64, String)>,
    last_share_time: Vec<(u64, String)>,
}

impl IndexBuffer {
    pub fn add(&mut self, policy: u32, worker_id: i64, status: &WorkerStatus) {
        let member = worker_id.to_string();
        let mut push = |bit: u32, bucket: &mut Vec<(u64, String)>, score: u64| {
            if policy & bit != 0 {
                bucket.push((score, member.clone()));
            }
        };
        push(INDEX_ACCEPT_1M, &mut self.accept_1m, status.accept_1m);
        push(INDEX_ACCEPT_5M, &mut self.accept_5m, status.accept_5m);
        push(INDEX_ACCEPT_15M, &mut self.accept_15m, status.accept_15m);
        push(INDEX_REJECT_15M, &mut self.reject_15m, status.reject_15m);
        push(INDEX_ACCEPT_1H, &mut self.accept_1h, status.accept_1h);
        push(INDEX_REJECT_1H, &mut self.reject_1h, status.reject_1h);
        push(INDEX_ACCEPT_COUNT, &mut self.accept_count, status.accept_count);
        push(
            INDEX_LAST_SHARE_IP,
            &mut self.last_share_ip,
            u64::from(status.last_share_ip),
        );
        push(
            INDEX_LAST_SHARE_TIME,
            &mut self.last_share_time,
            u64::from(status.last_share_time),
        );
    }

    /// Non-empty `(index_name, pairs)` batches.
    pub fn batches(&self) -> Vec<(&'static str, &[(u64, String)])> {
        [
            ("accept_1m", &self.accept_1m),
            ("accept_5m", &self.accept_5m),
            ("accept_15m", &self.accept_15m),
            ("reject_15m", &self.reject_15m),
            ("accept_1h", &self.accept_1h),
            ("reject_1h", &self.reject_1h),
            ("accept_count", &self.accept_count),
            ("last_share_ip", &self.last_share_ip),
            ("last_share_time", &self.last_share_time),
        ]
        .into_iter()
        .filter(|(_, pairs)| !pairs.is_empty())
        .map(|(name, pairs)| (name, pairs.as_slice()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> WorkerStatus {
        WorkerStatus {
            accept_1m: 1,
            accept_5m: 5,
            accept_15m: 15,
            accept_1h: 60,
            reject_15m: 2,
            reject_1h: 8,
            accept_count: 100,
            last_share_ip: 7,
            last_share_time: 99,
        }
    }

    #[test]
    fn test_policy_gates_dimensions() {
        let mut buffer = IndexBuffer::default();
        buffer.add(INDEX_ACCEPT_1M | INDEX_ACCEPT_COUNT, 5, &status());

        let batches = buffer.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "accept_1m");
        assert_eq!(batches[0].1, &[(1, "5".to_string())]);
        assert_eq!(batches[1].0, "accept_count");
        assert_eq!(batches[1].1, &[(100, "5".to_string())]);
    }

    #[test]
    fn test_no_policy_no_batches() {
        let mut buffer = IndexBuffer::default();
        buffer.add(INDEX_NONE, 5, &status());
        assert!(buffer.batches().is_empty());
    }

    #[test]
    fn test_members_accumulate_in_order() {
        let mut buffer = IndexBuffer::default();
        buffer.add(INDEX_ACCEPT_1H, 5, &status());
        buffer.add(INDEX_ACCEPT_1H, 6, &status());

        let batches = buffer.batches();
        assert_eq!(
            batches[0].1,
            &[(60, "5".to_string()), (60, "6".to_string())]
        );
    }
}
