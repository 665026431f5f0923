//! Share log replay and hour/day rollups.
//!
//! `replayer` tails the per-day binary files, `rollup` accumulates the
//! hour/day stats and flushes them to MySQL, `api` serves the current
//! day's rollups over HTTP.

pub mod api;
pub mod config;
pub mod replayer;
pub mod rollup;
