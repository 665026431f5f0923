use redis::{aio::ConnectionManager, Client};
use tracing::debug;

use crate::error::KvError;

/// One buffered hash-key update: the HMSET plus its optional EXPIRE and
/// PUBLISH companions, sent as a single pipeline.
///
/// Flushers build these while holding the registry read lock and drain
/// them afterwards, so no lock is ever held across socket I/O.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    pub key: String,
    pub fields: Vec<(&'static str, String)>,
    pub ttl_secs: Option<u64>,
    pub publish: Option<String>,
}

pub struct KvClient {
    manager: ConnectionManager,
}

impl KvClient {
    pub async fn new(redis_url: &str) -> Result<Self, KvError> {
        let client =
            Client::open(redis_url).map_err(|e| KvError::ConnectionError(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::ConnectionError(e.to_string()))?;

        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<(), KvError> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.manager.clone())
            .await?;
        Ok(())
    }

    /// Drain one buffered entry update.
    pub async fn write_entry(&self, update: &EntryUpdate) -> Result<(), KvError> {
        let mut pipe = redis::pipe();

        let mut hmset = redis::cmd("HMSET");
        hmset.arg(&update.key);
        for (field, value) in &update.fields {
            hmset.arg(*field).arg(value);
        }
        pipe.add_command(hmset).ignore();

        if let Some(ttl) = update.ttl_secs {
            pipe.cmd("EXPIRE").arg(&update.key).arg(ttl).ignore();
        }
        if let Some(payload) = &update.publish {
            pipe.cmd("PUBLISH").arg(&update.key).arg(payload).ignore();
        }

        pipe.query_async::<_, ()>(&mut self.manager.clone()).await?;
        debug!(key = %update.key, "kv entry updated");
        Ok(())
    }

    /// One ZADD carrying a whole `(score, member)` batch.
    pub async fn zadd_batch(&self, key: &str, pairs: &[(u64, String)]) -> Result<(), KvError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (score, member) in pairs {
            cmd.arg(*score).arg(member);
        }
        cmd.query_async::<_, ()>(&mut self.manager.clone()).await?;
        Ok(())
    }
}

/// `<prefix>mining_workers/pu/<user_id>/wk/<worker_id>`
pub fn worker_entry_key(prefix: &str, user_id: i32, worker_id: i64) -> String {
    format!("{prefix}mining_workers/pu/{user_id}/wk/{worker_id}")
}

/// `<prefix>mining_workers/pu/<user_id>/all`
pub fn user_entry_key(prefix: &str, user_id: i32) -> String {
    format!("{prefix}mining_workers/pu/{user_id}/all")
}

/// `<prefix>mining_workers/pu/<user_id>/sort/<index_name>`
pub fn index_key(prefix: &str, user_id: i32, index_name: &str) -> String {
    format!("{prefix}mining_workers/pu/{user_id}/sort/{index_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(
            worker_entry_key("pool/", 42, 7),
            "pool/mining_workers/pu/42/wk/7"
        );
        assert_eq!(user_entry_key("", 42), "mining_workers/pu/42/all");
        assert_eq!(
            index_key("pool/", 42, "accept_1m"),
            "pool/mining_workers/pu/42/sort/accept_1m"
        );
    }
}
