//! Buffered append-only writer for the per-day binary share logs.
//!
//! Records are kept verbatim: the bytes that arrived from the bus are the
//! bytes that hit the disk, so a replay reads back the exact upstream
//! stream. Shares are buffered in memory and flushed on a short cadence;
//! each flush appends every buffered record to its day file and flushes
//! every file it touched.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;

use sharelog::{sharelog_file_path, Share, SHARE_RECORD_SIZE};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Day files stay open across flushes; beyond this many the oldest handle
/// is closed.
const MAX_OPEN_DAY_FILES: usize = 3;

struct BufferedShare {
    day_start: u32,
    record: [u8; SHARE_RECORD_SIZE],
}

pub struct ShareLogWriter {
    data_dir: PathBuf,
    // keyed by day-bucket timestamp; sorted, so the first entry is oldest
    handles: BTreeMap<u32, File>,
    buffer: Vec<BufferedShare>,
    malformed_count: u64,
}

impl ShareLogWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            handles: BTreeMap::new(),
            buffer: Vec::new(),
            malformed_count: 0,
        }
    }

    /// Buffer one bus record. Records of the wrong size or failing the
    /// validity predicate are dropped and logged.
    pub fn consume_record(&mut self, payload: &[u8]) {
        if payload.len() != SHARE_RECORD_SIZE {
            self.malformed_count += 1;
            error!(
                actual = payload.len(),
                "sharelog record size is not {SHARE_RECORD_SIZE}"
            );
            return;
        }
        let share = match Share::decode(payload) {
            Ok(share) => share,
            Err(e) => {
                self.malformed_count += 1;
                error!("undecodable share: {e}");
                return;
            }
        };
        if !share.is_valid() {
            self.malformed_count += 1;
            error!("invalid share: {share}");
            return;
        }

        let mut record = [0u8; SHARE_RECORD_SIZE];
        record.copy_from_slice(payload);
        self.buffer.push(BufferedShare {
            day_start: share.day_start(),
            record,
        });
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    /// Append every buffered record to its day file and flush each file
    /// written to. An open failure is fatal for the writer.
    pub async fn flush_to_disk(&mut self) -> io::Result<()> {
        let buffer = std::mem::take(&mut self.buffer);
        let mut used_days: BTreeSet<u32> = BTreeSet::new();

        for share in &buffer {
            let file = self.file_handle(share.day_start).await?;
            file.write_all(&share.record).await?;
            used_days.insert(share.day_start);
        }

        for day in used_days {
            if let Some(file) = self.handles.get_mut(&day) {
                file.flush().await?;
            }
        }

        self.close_old_handles().await;
        Ok(())
    }

    async fn file_handle(&mut self, day_start: u32) -> io::Result<&mut File> {
        if !self.handles.contains_key(&day_start) {
            let path = sharelog_file_path(&self.data_dir, day_start);
            info!(path = %path.display(), "open sharelog file");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| {
                    error!(path = %path.display(), "open sharelog file failed: {e}");
                    e
                })?;
            self.handles.insert(day_start, file);
        }
        Ok(self.handles.get_mut(&day_start).expect("inserted above"))
    }

    async fn close_old_handles(&mut self) {
        while self.handles.len() > MAX_OPEN_DAY_FILES {
            if let Some((day, mut file)) = self.handles.pop_first() {
                info!(day_start = day, "close sharelog file handle");
                let _ = file.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::ShareResult;
    use std::net::Ipv4Addr;

    fn record(timestamp: u32) -> Vec<u8> {
        Share {
            user_id: 1,
            worker_hash_id: 5,
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
            timestamp,
            share_weight: 1,
            score: 0.0,
            result: ShareResult::Accept,
        }
        .encode()
        .to_vec()
    }

    #[tokio::test]
    async fn test_day_bucketing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        for ts in [1000u32, 90_000, 100_000] {
            writer.consume_record(&record(ts));
        }
        assert_eq!(writer.buffered(), 3);
        writer.flush_to_disk().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let day0 = std::fs::read(dir.path().join("sharelog-1970-01-01.bin")).unwrap();
        let day1 = std::fs::read(dir.path().join("sharelog-1970-01-02.bin")).unwrap();
        assert_eq!(day0.len(), SHARE_RECORD_SIZE);
        assert_eq!(day1.len(), 2 * SHARE_RECORD_SIZE);
    }

    #[tokio::test]
    async fn test_written_bytes_are_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        let records: Vec<Vec<u8>> = (1000..1010u32).map(record).collect();
        for r in &records {
            writer.consume_record(r);
        }
        writer.flush_to_disk().await.unwrap();

        let bytes = std::fs::read(dir.path().join("sharelog-1970-01-01.bin")).unwrap();
        assert_eq!(bytes.len(), records.len() * SHARE_RECORD_SIZE);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&bytes[i * SHARE_RECORD_SIZE..(i + 1) * SHARE_RECORD_SIZE], &r[..]);
        }
    }

    #[tokio::test]
    async fn test_appends_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        writer.consume_record(&record(1000));
        writer.flush_to_disk().await.unwrap();
        writer.consume_record(&record(1001));
        writer.flush_to_disk().await.unwrap();

        let bytes = std::fs::read(dir.path().join("sharelog-1970-01-01.bin")).unwrap();
        assert_eq!(bytes.len(), 2 * SHARE_RECORD_SIZE);
    }

    #[tokio::test]
    async fn test_malformed_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        writer.consume_record(&[0u8; 10]);
        writer.consume_record(&[0u8; SHARE_RECORD_SIZE]); // zero timestamp
        let mut zero_weight = record(1000);
        zero_weight[24..32].copy_from_slice(&0u64.to_le_bytes());
        writer.consume_record(&zero_weight);

        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.malformed_count(), 3);
    }

    #[tokio::test]
    async fn test_old_handles_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        for day in 0..5u32 {
            writer.consume_record(&record(day * 86_400 + 100));
        }
        writer.flush_to_disk().await.unwrap();

        assert!(writer.handles.len() <= MAX_OPEN_DAY_FILES);
        // the newest days stay open
        assert!(writer.handles.contains_key(&(4 * 86_400)));
    }
}
