//! Worker-identity side channel: `worker_update` events carrying names and
//! agent strings are reflected into both sinks without touching counters.

use std::sync::Arc;

use serde::Deserialize;
use sharestats_redis::{index_key, worker_entry_key, EntryUpdate, KvClient};
use sqlx::MySqlConnection;
use stats_core::unix_timestamp;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::policy::{INDEX_MINER_AGENT, INDEX_WORKER_NAME, PUBLISH_WORKER_UPDATE};
use crate::sql_flusher::{mysql_datetime, SqlFlusher};

/// Longest worker name / agent string kept after sanitizing.
const MAX_NAME_LEN: usize = 20;
const DEFAULT_NAME: &str = "__default__";

#[derive(Debug, Deserialize)]
struct MetaEvent {
    #[serde(rename = "type")]
    kind: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WorkerUpdate {
    user_id: i32,
    worker_id: i64,
    worker_name: String,
    miner_agent: String,
}

pub struct MetaUpdater {
    db_url: Option<String>,
    db_conn: Mutex<Option<MySqlConnection>>,
    kv: Option<Arc<KvClient>>,
    kv_prefix: String,
    kv_key_ttl_s: u64,
    publish_policy: u32,
    index_policy: u32,
}

impl MetaUpdater {
    pub fn new(
        db_url: Option<String>,
        kv: Option<Arc<KvClient>>,
        kv_prefix: String,
        kv_key_ttl_s: u64,
        publish_policy: u32,
        index_policy: u32,
    ) -> Self {
        Self {
            db_url,
            db_conn: Mutex::new(None),
            kv,
            kv_prefix,
            kv_key_ttl_s,
            publish_policy,
            index_policy,
        }
    }

    /// Decode and apply one meta-event record. Unknown event types are
    /// ignored; sink failures are logged and the consumer keeps running.
    pub async fn handle_record(&self, payload: &[u8]) {
        let event: MetaEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("decode meta event failure: {e}");
                return;
            }
        };
        if event.kind != "worker_update" {
            debug!(kind = %event.kind, "ignoring meta event");
            return;
        }
        let update: WorkerUpdate = match serde_json::from_value(event.content) {
            Ok(update) => update,
            Err(e) => {
                error!("meta event `worker_update` missing some fields: {e}");
                return;
            }
        };

        let worker_name = filter_worker_name(&update.worker_name);
        let miner_agent = filter_worker_name(&update.miner_agent);

        if self.db_url.is_some() {
            if let Err(e) = self
                .update_db(update.user_id, update.worker_id, &worker_name, &miner_agent)
                .await
            {
                error!("update worker name to db failure: {e}");
            }
        }
        if self.kv.is_some() {
            self.update_kv(update.user_id, update.worker_id, &worker_name, &miner_agent)
                .await;
        }
    }

    /// UPSERT names into `mining_workers`, preserving the current group
    /// unless it is 0, the "deleted" marker, which resets to the default
    /// group `-user_id`.
    async fn update_db(
        &self,
        user_id: i32,
        worker_id: i64,
        worker_name: &str,
        miner_agent: &str,
    ) -> Result<(), sqlx::Error> {
        let url = self.db_url.as_ref().expect("checked by caller");
        let mut guard = self.db_conn.lock().await;
        let conn = match SqlFlusher::ensure_conn(url, &mut guard).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("can't connect to common events db: {e}");
                return Err(e);
            }
        };

        let now_str = mysql_datetime(unix_timestamp());
        let existing_group: Option<i32> = sqlx::query_scalar(
            "SELECT `group_id` FROM `mining_workers` WHERE `puid` = ? AND `worker_id` = ?",
        )
        .bind(user_id)
        .bind(worker_id)
        .fetch_optional(&mut *conn)
        .await?;

        let result = match existing_group {
            Some(group_id) => {
                sqlx::query(
                    "UPDATE `mining_workers` SET `group_id` = ?, `worker_name` = ?, \
                     `miner_agent` = ?, `updated_at` = ? WHERE `puid` = ? AND `worker_id` = ?",
                )
                .bind(if group_id == 0 { -user_id } else { group_id })
                .bind(worker_name)
                .bind(miner_agent)
                .bind(&now_str)
                .bind(user_id)
                .bind(worker_id)
                .execute(&mut *conn)
                .await
            }
            None => {
                // the stats flusher may insert this row between our select
                // and insert, hence the upsert
                sqlx::query(
                    "INSERT INTO `mining_workers` (`puid`,`worker_id`,`group_id`,\
                     `worker_name`,`miner_agent`,`created_at`,`updated_at`) \
                     VALUES (?,?,?,?,?,?,?) \
                     ON DUPLICATE KEY UPDATE \
                     `worker_name` = ?, `miner_agent` = ?, `updated_at` = ?",
                )
                .bind(user_id)
                .bind(worker_id)
                .bind(-user_id)
                .bind(worker_name)
                .bind(miner_agent)
                .bind(&now_str)
                .bind(&now_str)
                .bind(worker_name)
                .bind(miner_agent)
                .bind(&now_str)
                .execute(&mut *conn)
                .await
            }
        };

        if let Err(e) = result {
            // force a clean session for the next event
            *guard = None;
            return Err(e);
        }
        Ok(())
    }

    async fn update_kv(&self, user_id: i32, worker_id: i64, worker_name: &str, miner_agent: &str) {
        let kv = self.kv.as_ref().expect("checked by caller");
        let now = unix_timestamp();

        let update = EntryUpdate {
            key: worker_entry_key(&self.kv_prefix, user_id, worker_id),
            fields: vec![
                ("worker_name", worker_name.to_string()),
                ("miner_agent", miner_agent.to_string()),
                ("updated_at", now.to_string()),
            ],
            ttl_secs: (self.kv_key_ttl_s > 0).then_some(self.kv_key_ttl_s),
            publish: (self.publish_policy & PUBLISH_WORKER_UPDATE != 0).then(|| "0".to_string()),
        };
        if let Err(e) = kv.write_entry(&update).await {
            warn!(key = %update.key, "kv meta update failed: {e}");
            if kv.ping().await.is_err() {
                error!("meta updater: can't connect to pool kv");
            }
            return;
        }

        let member = worker_id.to_string();
        for (bit, index_name, value) in [
            (INDEX_WORKER_NAME, "worker_name", worker_name),
            (INDEX_MINER_AGENT, "miner_agent", miner_agent),
        ] {
            if self.index_policy & bit == 0 {
                continue;
            }
            let key = index_key(&self.kv_prefix, user_id, index_name);
            let rank = alpha_num_rank(value);
            if let Err(e) = kv.zadd_batch(&key, &[(rank, member.clone())]).await {
                warn!(key = %key, "kv name index update failed: {e}");
            }
        }
    }
}

/// Strip everything outside the pool's worker naming alphabet and cap the
/// length. An empty result becomes the default worker name.
pub fn filter_worker_name(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "._:|^/-".contains(*c))
        .take(MAX_NAME_LEN)
        .collect();
    if filtered.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        filtered
    }
}

/// Left-align the first 8 bytes of the lowercased value into a big-endian
/// u64, so lexicographic order of names matches numeric order of ranks.
pub fn alpha_num_rank(value: &str) -> u64 {
    let mut bytes = [0u8; 8];
    for (i, b) in value
        .bytes()
        .map(|b| b.to_ascii_lowercase())
        .take(8)
        .enumerate()
    {
        bytes[i] = b;
    }
    u64::from_be_bytes(bytes)
}
