//! Share-aggregation cores shared by the stats engine roles.
//!
//! `windowing` and `worker_shares` hold the live sliding-window counters,
//! `registry` the concurrent worker/user index they live in, and
//! `day_stats` the hour/day rollup accumulators fed by binary-log replay.

pub mod day_stats;
pub mod registry;
pub mod windowing;
pub mod worker_shares;

pub use day_stats::{DaySnapshot, DayStats, DayStatsMap, ShareStats, BLOCK_REWARD};
pub use registry::Registry;
pub use windowing::SlidingCounter;
pub use worker_shares::{WorkerShares, WorkerStatus, SLIDING_WINDOW_SECONDS};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
