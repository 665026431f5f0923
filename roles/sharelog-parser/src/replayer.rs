//! Binary share log reader: initial bulk replay plus a growing-file
//! tailer for the current day.
//!
//! The byte cursor is the authoritative read position. It is advanced by
//! exactly the complete records consumed and the file is re-seeked to it
//! on every read, because after a failed read the OS file position is
//! undefined. A trailing partial record stays un-consumed until the
//! writer completes it.

use std::io;
use std::path::{Path, PathBuf};

use sharelog::{sharelog_file_path, Share, SHARE_RECORD_SIZE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{error, info, warn};

/// Records per read chunk; 2,000,000 * 48 keeps one chunk under 100 MB.
pub const MAX_CHUNK_RECORDS: usize = 2_000_000;

pub struct ShareLogReplayer {
    file_path: PathBuf,
    day_start: u32,
    file: Option<File>,
    cursor: u64,
    chunk_records: usize,
}

impl ShareLogReplayer {
    pub fn new(data_dir: &Path, day_start: u32) -> Self {
        Self {
            file_path: sharelog_file_path(data_dir, day_start),
            day_start,
            file: None,
            cursor: 0,
            chunk_records: MAX_CHUNK_RECORDS,
        }
    }

    /// Smaller read chunks, for tests and memory-constrained replays.
    pub fn with_chunk_records(mut self, chunk_records: usize) -> Self {
        self.chunk_records = chunk_records.max(1);
        self
    }

    pub fn day_start(&self) -> u32 {
        self.day_start
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Make sure the replay target exists; a missing file is created
    /// empty so tailing can start before the writer's first flush.
    pub async fn init(&self) -> io::Result<()> {
        match File::open(&self.file_path).await {
            Ok(_) => {
                info!(path = %self.file_path.display(), "open sharelog file success");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.file_path.display(), "sharelog file missing, creating it");
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.file_path)
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(path = %self.file_path.display(), "open sharelog file failed: {e}");
                Err(e)
            }
        }
    }

    /// Read the whole file to EOF in chunks, for days the writer has
    /// finished with. Does not move the tail cursor.
    pub async fn replay_bulk(
        &mut self,
        mut on_share: impl FnMut(&Share),
    ) -> io::Result<u64> {
        let mut file = File::open(&self.file_path).await?;
        let mut buf = vec![0u8; self.chunk_records * SHARE_RECORD_SIZE];
        let mut total = 0u64;

        loop {
            let filled = fill_buf(&mut file, &mut buf).await?;
            if filled == 0 {
                break;
            }
            total += parse_records(&buf[..filled], &mut on_share);
            if filled < buf.len() {
                break; // EOF
            }
        }
        info!(path = %self.file_path.display(), records = total, "bulk replay done");
        Ok(total)
    }

    /// One tail read from the tracked cursor. Returns the number of
    /// complete records consumed; zero means no new data.
    pub async fn replay_growing(
        &mut self,
        mut on_share: impl FnMut(&Share),
    ) -> io::Result<u64> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.file_path).await.map_err(|e| {
                error!(path = %self.file_path.display(), "open sharelog file failed: {e}");
                e
            })?);
        }
        let file = self.file.as_mut().expect("opened above");

        file.seek(SeekFrom::Start(self.cursor)).await?;

        let mut buf = vec![0u8; self.chunk_records * SHARE_RECORD_SIZE];
        let filled = fill_buf(file, &mut buf).await?;
        let complete = filled - filled % SHARE_RECORD_SIZE;
        if complete == 0 {
            return Ok(0);
        }

        self.cursor += complete as u64;
        parse_records(&buf[..complete], &mut on_share);
        Ok((complete / SHARE_RECORD_SIZE) as u64)
    }

    /// Whether the cursor has caught up with the file size on disk.
    pub async fn is_eof(&self) -> bool {
        match tokio::fs::metadata(&self.file_path).await {
            Ok(meta) => self.cursor == meta.len(),
            // if the file cannot be stat'ed, treat it as consumed
            Err(_) => true,
        }
    }
}

async fn fill_buf(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn parse_records(buf: &[u8], on_share: &mut impl FnMut(&Share)) -> u64 {
    debug_assert_eq!(buf.len() % SHARE_RECORD_SIZE, 0);
    let mut count = 0u64;
    for record in buf.chunks_exact(SHARE_RECORD_SIZE) {
        match Share::decode(record) {
            Ok(share) if share.is_valid() => {
                on_share(&share);
                count += 1;
            }
            Ok(share) => error!("invalid share: {share}"),
            Err(e) => error!("undecodable share record: {e}"),
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::ShareResult;
    use std::net::Ipv4Addr;

    fn share(timestamp: u32, weight: u64) -> Share {
        Share {
            user_id: 1,
            worker_hash_id: 5,
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
            timestamp,
            share_weight: weight,
            score: 0.0,
            result: ShareResult::Accept,
        }
    }

    fn write_shares(path: &Path, shares: &[Share]) {
        let mut bytes = Vec::new();
        for s in shares {
            bytes.extend_from_slice(&s.encode());
        }
        append_bytes(path, &bytes);
    }

    fn append_bytes(path: &Path, bytes: &[u8]) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn test_init_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let replayer = ShareLogReplayer::new(dir.path(), 86_400);

        replayer.init().await.unwrap();
        assert!(replayer.file_path().exists());
        assert!(replayer.is_eof().await);
    }

    #[tokio::test]
    async fn test_bulk_replay_reads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = ShareLogReplayer::new(dir.path(), 0).with_chunk_records(4);
        let shares: Vec<Share> = (1000..1010u32).map(|ts| share(ts, 2)).collect();
        write_shares(replayer.file_path(), &shares);

        let mut seen = Vec::new();
        let total = replayer
            .replay_bulk(|s| seen.push(*s))
            .await
            .unwrap();

        assert_eq!(total, 10);
        assert_eq!(seen, shares);
    }

    #[tokio::test]
    async fn test_growing_replay_tails_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = ShareLogReplayer::new(dir.path(), 0).with_chunk_records(8);
        replayer.init().await.unwrap();

        write_shares(replayer.file_path(), &[share(1000, 1), share(1001, 1)]);
        let mut seen = Vec::new();
        assert_eq!(replayer.replay_growing(|s| seen.push(*s)).await.unwrap(), 2);
        assert_eq!(replayer.cursor(), 2 * SHARE_RECORD_SIZE as u64);
        assert!(replayer.is_eof().await);

        // nothing new
        assert_eq!(replayer.replay_growing(|_| {}).await.unwrap(), 0);

        // the file grows; only the new records are consumed
        write_shares(replayer.file_path(), &[share(1002, 1)]);
        assert!(!replayer.is_eof().await);
        assert_eq!(replayer.replay_growing(|s| seen.push(*s)).await.unwrap(), 1);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].timestamp, 1002);
    }

    #[tokio::test]
    async fn test_partial_trailing_record_waits() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = ShareLogReplayer::new(dir.path(), 0).with_chunk_records(4);
        replayer.init().await.unwrap();

        let full = share(1000, 1).encode();
        append_bytes(replayer.file_path(), &full);
        append_bytes(replayer.file_path(), &full[..20]); // torn write

        assert_eq!(replayer.replay_growing(|_| {}).await.unwrap(), 1);
        assert_eq!(replayer.cursor(), SHARE_RECORD_SIZE as u64);

        // writer completes the record
        append_bytes(replayer.file_path(), &full[20..]);
        assert_eq!(replayer.replay_growing(|_| {}).await.unwrap(), 1);
        assert_eq!(replayer.cursor(), 2 * SHARE_RECORD_SIZE as u64);
    }

    #[tokio::test]
    async fn test_writer_to_replayer_round_trip() {
        // what goes through the writer comes back identical, in order
        let dir = tempfile::tempdir().unwrap();
        let shares: Vec<Share> = (2000..2100u32).map(|ts| share(ts, ts as u64)).collect();

        let mut replayer = ShareLogReplayer::new(dir.path(), 0).with_chunk_records(16);
        write_shares(replayer.file_path(), &shares);

        let mut seen = Vec::new();
        replayer.replay_growing(|s| seen.push(*s)).await.unwrap();
        while !replayer.is_eof().await {
            replayer.replay_growing(|s| seen.push(*s)).await.unwrap();
        }
        assert_eq!(seen, shares);
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped_but_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = ShareLogReplayer::new(dir.path(), 0).with_chunk_records(4);
        replayer.init().await.unwrap();

        let mut zero_ts = share(1000, 1);
        zero_ts.timestamp = 0;
        write_shares(replayer.file_path(), &[zero_ts, share(1001, 1)]);

        let mut seen = Vec::new();
        // both records are consumed, only the valid one is surfaced
        assert_eq!(replayer.replay_growing(|s| seen.push(*s)).await.unwrap(), 2);
        assert_eq!(replayer.cursor(), 2 * SHARE_RECORD_SIZE as u64);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].timestamp, 1001);
    }
}
