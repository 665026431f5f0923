use core::fmt;
use std::convert::TryFrom;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one share record on the wire and in the binary log.
///
/// The record is the little-endian image of the share struct with natural
/// alignment: 4 bytes of padding after `user_id` and 4 bytes of tail
/// padding, both written as zero.
pub const SHARE_RECORD_SIZE: usize = 48;

/// Pool judgement of a submitted share. Only `Accept` contributes to
/// hashrate counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ShareResult {
    Accept = 1,
    Reject = 2,
}

impl TryFrom<u32> for ShareResult {
    type Error = ShareCodecError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(ShareResult::Accept),
            2 => Ok(ShareResult::Reject),
            other => Err(ShareCodecError::InvalidResultTag { tag: other }),
        }
    }
}

/// One work unit submitted by a mining worker; the unit of aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub user_id: i32,
    /// 0 means "aggregated user row".
    pub worker_hash_id: i64,
    /// IPv4 address of the submitter, network byte order.
    pub ip: u32,
    /// UNIX seconds.
    pub timestamp: u32,
    /// Difficulty-normalized credit of the share.
    pub share_weight: u64,
    /// Reward weight.
    pub score: f64,
    pub result: ShareResult,
}

impl Share {
    /// A share is valid iff the result tag decoded, the timestamp is set
    /// and the weight is positive.
    pub fn is_valid(&self) -> bool {
        self.timestamp != 0 && self.share_weight > 0
    }

    /// UTC midnight of the day this share belongs to.
    pub fn day_start(&self) -> u32 {
        self.timestamp - self.timestamp % 86400
    }

    /// Hour slot within the share's UTC day, 0..=23.
    pub fn hour_index(&self) -> u32 {
        (self.timestamp % 86400) / 3600
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.to_le_bytes())
    }

    /// Pack an address into the network-order `ip` field.
    pub fn ip_from(addr: Ipv4Addr) -> u32 {
        u32::from_le_bytes(addr.octets())
    }

    /// Serialize to the fixed 48-byte wire image.
    pub fn encode(&self) -> [u8; SHARE_RECORD_SIZE] {
        let mut buf = [0u8; SHARE_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.user_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.worker_hash_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.ip.to_le_bytes());
        buf[20..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.share_weight.to_le_bytes());
        buf[32..40].copy_from_slice(&self.score.to_le_bytes());
        buf[40..44].copy_from_slice(&(self.result as u32).to_le_bytes());
        buf
    }

    /// Deserialize from one wire image. The buffer must be exactly one
    /// record long.
    pub fn decode(buf: &[u8]) -> Result<Self, ShareCodecError> {
        if buf.len() != SHARE_RECORD_SIZE {
            return Err(ShareCodecError::InvalidLength { actual: buf.len() });
        }
        let result = ShareResult::try_from(u32::from_le_bytes(buf[40..44].try_into().unwrap()))?;
        Ok(Share {
            user_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            worker_hash_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            ip: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            timestamp: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            share_weight: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            score: f64::from_le_bytes(buf[32..40].try_into().unwrap()),
            result,
        })
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "share(uid: {}, worker: {}, ip: {}, time: {}, weight: {}, score: {}, result: {:?})",
            self.user_id,
            self.worker_hash_id,
            self.ip_addr(),
            self.timestamp,
            self.share_weight,
            self.score,
            self.result,
        )
    }
}

/// Identity under which aggregates are keyed. `worker_id` 0 is the user
/// aggregate; `(0, 0)` is the pool aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    pub user_id: i32,
    pub worker_id: i64,
}

impl WorkerKey {
    pub const fn new(user_id: i32, worker_id: i64) -> Self {
        Self { user_id, worker_id }
    }

    pub const fn pool() -> Self {
        Self::new(0, 0)
    }

    pub fn is_user_row(&self) -> bool {
        self.worker_id == 0
    }
}

impl From<&Share> for WorkerKey {
    fn from(share: &Share) -> Self {
        WorkerKey::new(share.user_id, share.worker_hash_id)
    }
}

/// Errors that can occur while decoding share records.
#[derive(Debug, Error)]
pub enum ShareCodecError {
    #[error("share record must be {SHARE_RECORD_SIZE} bytes, got {actual}")]
    InvalidLength { actual: usize },
    #[error("unknown share result tag {tag}")]
    InvalidResultTag { tag: u32 },
}
