//! Periodic snapshot of the registry into `mining_workers`.
//!
//! All rows of one flush go through a connection-scoped TEMPORARY staging
//! table and land in the target with a single `INSERT ... ON DUPLICATE KEY
//! UPDATE` merge, so readers never observe a half-written flush. Any SQL
//! error aborts the run and forces a reconnect; the next tick starts from
//! a fresh staging table.

use std::sync::Arc;
use std::time::Instant;

use sqlx::{Connection, MySqlConnection};
use stats_core::{unix_timestamp, WorkerStatus};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::server::StatsServer;

const MIN_ALLOWED_PACKET: u64 = 16 * 1024 * 1024;

const MINING_WORKERS_FIELDS: &str = "`worker_id`,`puid`,`group_id`,\
     `accept_1m`,`accept_5m`,`accept_15m`,`reject_15m`,`accept_1h`,`reject_1h`,\
     `accept_count`,`last_share_ip`,`last_share_time`,`created_at`,`updated_at`";

const MINING_WORKERS_MERGE: &str = "INSERT INTO `mining_workers` \
     SELECT * FROM `mining_workers_tmp` \
     ON DUPLICATE KEY UPDATE \
      `mining_workers`.`accept_1m`      =`mining_workers_tmp`.`accept_1m`, \
      `mining_workers`.`accept_5m`      =`mining_workers_tmp`.`accept_5m`, \
      `mining_workers`.`accept_15m`     =`mining_workers_tmp`.`accept_15m`, \
      `mining_workers`.`reject_15m`     =`mining_workers_tmp`.`reject_15m`, \
      `mining_workers`.`accept_1h`      =`mining_workers_tmp`.`accept_1h`, \
      `mining_workers`.`reject_1h`      =`mining_workers_tmp`.`reject_1h`, \
      `mining_workers`.`accept_count`   =`mining_workers_tmp`.`accept_count`, \
      `mining_workers`.`last_share_ip`  =`mining_workers_tmp`.`last_share_ip`, \
      `mining_workers`.`last_share_time`=`mining_workers_tmp`.`last_share_time`, \
      `mining_workers`.`updated_at`     =`mining_workers_tmp`.`updated_at`";

pub struct SqlFlusher {
    url: String,
    conn: Mutex<Option<MySqlConnection>>,
    last_flush_file: Option<String>,
}

impl SqlFlusher {
    pub fn new(url: String, last_flush_file: Option<String>) -> Self {
        Self {
            url,
            conn: Mutex::new(None),
            last_flush_file,
        }
    }

    /// Connectivity and `max_allowed_packet` preflight, plus the target
    /// table when it does not exist yet.
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        let mut guard = self.conn.lock().await;
        let conn = Self::ensure_conn(&self.url, &mut guard).await?;

        let packet: u64 = sqlx::query_scalar("SELECT @@max_allowed_packet")
            .fetch_one(&mut *conn)
            .await?;
        if packet < MIN_ALLOWED_PACKET {
            error!(
                packet,
                "db conf 'max_allowed_packet' is less than 16*1024*1024"
            );
            return Err(sqlx::Error::Configuration(
                "max_allowed_packet too small".into(),
            ));
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS `mining_workers` (
                `worker_id` BIGINT NOT NULL,
                `puid` INT NOT NULL,
                `group_id` INT NOT NULL,
                `accept_1m` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `accept_5m` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `accept_15m` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `reject_15m` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `accept_1h` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `reject_1h` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `accept_count` BIGINT UNSIGNED NOT NULL DEFAULT 0,
                `last_share_ip` VARCHAR(20) NOT NULL DEFAULT '',
                `last_share_time` DATETIME DEFAULT NULL,
                `worker_name` VARCHAR(24) NOT NULL DEFAULT '',
                `miner_agent` VARCHAR(36) NOT NULL DEFAULT '',
                `created_at` DATETIME NOT NULL,
                `updated_at` DATETIME NOT NULL,
                PRIMARY KEY (`puid`, `worker_id`)
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Flush every live worker and user row. Returns the number of rows
    /// merged. Skipped while the initialization barrier is up (handled by
    /// the caller).
    pub async fn flush(&self, server: &Arc<StatsServer>) -> Result<usize, sqlx::Error> {
        let began = Instant::now();
        let now = unix_timestamp();

        // snapshot rows first; the registry lock is never held across SQL
        let mut values = Vec::new();
        for (key, shares) in server.registry.snapshot_workers() {
            values.push(mining_worker_row(
                key.worker_id,
                key.user_id,
                &shares.status(now),
                now,
            ));
        }
        for (user_id, _, shares) in server.registry.snapshot_users() {
            values.push(mining_worker_row(0, user_id, &shares.status(now), now));
        }

        if values.is_empty() {
            info!("flush to db: no active workers");
            return Ok(0);
        }

        let mut guard = self.conn.lock().await;
        let conn = match Self::ensure_conn(&self.url, &mut guard).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("can't connect to pool db: {e}");
                return Err(e);
            }
        };

        let result = Self::merge_rows(conn, &values).await;
        if result.is_err() {
            // drop the connection; next tick reconnects with a clean
            // session and therefore a fresh staging table
            *guard = None;
            return result.map(|_| 0);
        }

        server.set_last_flush_time(now as i64);
        if let Some(path) = &self.last_flush_file {
            if let Err(e) = tokio::fs::write(path, format!("{now}")).await {
                error!(path = %path, "failed to write last flush time: {e}");
            }
        }

        info!(
            rows = values.len(),
            elapsed_ms = began.elapsed().as_millis() as u64,
            "flush to db done"
        );
        Ok(values.len())
    }

    async fn merge_rows(conn: &mut MySqlConnection, values: &[String]) -> Result<(), sqlx::Error> {
        sqlx::query("DROP TEMPORARY TABLE IF EXISTS `mining_workers_tmp`")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE TEMPORARY TABLE `mining_workers_tmp` LIKE `mining_workers`")
            .execute(&mut *conn)
            .await?;

        let insert = format!(
            "INSERT INTO `mining_workers_tmp` ({MINING_WORKERS_FIELDS}) VALUES {}",
            values.join(",")
        );
        sqlx::query(&insert).execute(&mut *conn).await?;

        sqlx::query(MINING_WORKERS_MERGE).execute(&mut *conn).await?;
        Ok(())
    }

    pub(crate) async fn ensure_conn<'a>(
        url: &str,
        guard: &'a mut Option<MySqlConnection>,
    ) -> Result<&'a mut MySqlConnection, sqlx::Error> {
        let alive = match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        if !alive {
            *guard = Some(MySqlConnection::connect(url).await?);
        }
        Ok(guard.as_mut().expect("connected above"))
    }
}

/// `YYYY-MM-DD HH:MM:SS`, UTC.
pub fn mysql_datetime(epoch: u64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// One staged `mining_workers` value tuple. User rows carry worker_id 0;
/// `group_id` defaults to the negated user id.
pub fn mining_worker_row(worker_id: i64, user_id: i32, status: &WorkerStatus, now: u64) -> String {
    let now_str = mysql_datetime(now);
    format!(
        "({},{},{},{},{},{},{},{},{},{},'{}','{}','{}','{}')",
        worker_id,
        user_id,
        -user_id,
        status.accept_1m,
        status.accept_5m,
        status.accept_15m,
        status.reject_15m,
        status.accept_1h,
        status.reject_1h,
        status.accept_count,
        status.ip_string(),
        mysql_datetime(u64::from(status.last_share_time)),
        now_str,
        now_str,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_datetime() {
        assert_eq!(mysql_datetime(0), "1970-01-01 00:00:00");
        assert_eq!(mysql_datetime(1_468_281_601), "2016-07-12 00:00:01");
    }

    #[test]
    fn test_worker_row_shape() {
        let status = WorkerStatus {
            accept_1m: 1,
            accept_5m: 2,
            accept_15m: 3,
            accept_1h: 4,
            reject_15m: 5,
            reject_1h: 6,
            accept_count: 7,
            last_share_ip: sharelog::Share::ip_from(std::net::Ipv4Addr::new(10, 0, 0, 9)),
            last_share_time: 1_468_281_601,
        };

        let row = mining_worker_row(77, 42, &status, 1_468_281_700);
        assert_eq!(
            row,
            "(77,42,-42,1,2,3,5,4,6,7,'10.0.0.9',\
             '2016-07-12 00:00:01','2016-07-12 00:01:40','2016-07-12 00:01:40')"
        );
    }

    #[test]
    fn test_user_row_negates_group_id() {
        let row = mining_worker_row(0, 9, &WorkerStatus::default(), 0);
        assert!(row.starts_with("(0,9,-9,"));
    }
}
