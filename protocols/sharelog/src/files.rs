use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};

/// Path of the binary share log for the UTC day containing `timestamp`,
/// e.g. `sharelog-2016-07-12.bin`.
pub fn sharelog_file_path(data_dir: &Path, timestamp: u32) -> PathBuf {
    let date = Utc
        .timestamp_opt(i64::from(timestamp), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    data_dir.join(format!("sharelog-{}.bin", date.format("%Y-%m-%d")))
}
