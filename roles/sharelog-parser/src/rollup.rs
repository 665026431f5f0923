//! Hour/day rollups for one UTC day and their MySQL flusher.
//!
//! Every dirty hour becomes one row in the matching `stats_*_hour` table
//! and every dirty entry one row in the `_day` table, staged through a
//! pid-suffixed TEMPORARY table and merged with an upsert. Retention
//! pruning of old rows piggybacks on the flush, at most once per hour.

use std::process;
use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeZone, Timelike, Utc};
use sharelog::{Share, WorkerKey};
use sqlx::{Connection, MySqlConnection};
use stats_core::{unix_timestamp, DayStats, DayStatsMap, ShareStats};
use tokio::sync::Mutex;
use tracing::{error, info};

const PRUNE_INTERVAL_SECONDS: u64 = 3600;
const WORKER_DAY_KEEP_DAYS: u64 = 90;
const WORKER_HOUR_KEEP_HOURS: u64 = 72;
const USER_HOUR_KEEP_DAYS: u64 = 30;

/// Per-day accumulators fed by the replayer.
pub struct RollupAggregator {
    day_start: u32,
    stats: DayStatsMap,
}

impl RollupAggregator {
    pub fn new(day_start: u32) -> Self {
        Self {
            day_start,
            stats: DayStatsMap::new(),
        }
    }

    pub fn day_start(&self) -> u32 {
        self.day_start
    }

    pub fn stats(&self) -> &DayStatsMap {
        &self.stats
    }

    pub fn process_share(&self, share: &Share) {
        self.stats.process_share(share);
    }

    pub fn get(&self, key: &WorkerKey) -> Option<Arc<DayStats>> {
        self.stats.get(key)
    }
}

pub struct RollupSqlSink {
    url: String,
    conn: Mutex<Option<MySqlConnection>>,
    last_prune: std::sync::Mutex<u64>,
}

impl RollupSqlSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            conn: Mutex::new(None),
            last_prune: std::sync::Mutex::new(0),
        }
    }

    /// Connectivity preflight plus the six target tables when missing.
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        let mut guard = self.conn.lock().await;
        let conn = ensure_conn(&self.url, &mut guard).await?;

        for (table, extra_cols, key_cols) in [
            (
                "stats_workers_hour",
                "`worker_id` BIGINT NOT NULL, `puid` INT NOT NULL, `hour` BIGINT NOT NULL,",
                "`puid`,`worker_id`,`hour`",
            ),
            (
                "stats_users_hour",
                "`puid` INT NOT NULL, `hour` BIGINT NOT NULL,",
                "`puid`,`hour`",
            ),
            ("stats_pool_hour", "`hour` BIGINT NOT NULL,", "`hour`"),
            (
                "stats_workers_day",
                "`worker_id` BIGINT NOT NULL, `puid` INT NOT NULL, `day` INT NOT NULL,",
                "`puid`,`worker_id`,`day`",
            ),
            (
                "stats_users_day",
                "`puid` INT NOT NULL, `day` INT NOT NULL,",
                "`puid`,`day`",
            ),
            ("stats_pool_day", "`day` INT NOT NULL,", "`day`"),
        ] {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS `{table}` ( {extra_cols} \
                 `share_accept` BIGINT UNSIGNED NOT NULL DEFAULT 0, \
                 `share_reject` BIGINT UNSIGNED NOT NULL DEFAULT 0, \
                 `reject_rate` DOUBLE NOT NULL DEFAULT 0, \
                 `score` DOUBLE NOT NULL DEFAULT 0, \
                 `earn` BIGINT NOT NULL DEFAULT 0, \
                 `created_at` DATETIME NOT NULL, \
                 `updated_at` DATETIME NOT NULL, \
                 PRIMARY KEY ({key_cols}) )"
            );
            sqlx::query(&ddl).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Flush every dirty entry's hours and day totals. Dirty masks are
    /// cleared only after all six merges committed.
    pub async fn flush(&self, rollup: &RollupAggregator) -> Result<usize, sqlx::Error> {
        let began = Instant::now();
        let now = unix_timestamp();
        let day_start = rollup.day_start();

        // snapshot dirty entries; no map lock is held across SQL
        let mut snapshots = Vec::new();
        for (key, stats) in rollup.stats().dirty_entries() {
            if let Some(snapshot) = stats.snapshot_if_dirty() {
                snapshots.push((key, stats, snapshot));
            }
        }
        if snapshots.is_empty() {
            info!("flush rollups: no new data");
            return Ok(0);
        }

        let mut workers_hour = Vec::new();
        let mut users_hour = Vec::new();
        let mut pool_hour = Vec::new();
        let mut workers_day = Vec::new();
        let mut users_day = Vec::new();
        let mut pool_day = Vec::new();

        for (key, _, snapshot) in &snapshots {
            for hour in 0..24u32 {
                if snapshot.dirty_hours & (1 << hour) == 0 {
                    continue;
                }
                let row = &snapshot.hours[hour as usize];
                let hour_key = hour_key(day_start, hour);
                match row_kind(key) {
                    RowKind::Worker => workers_hour.push(format!(
                        "({},{},{},{})",
                        key.worker_id,
                        key.user_id,
                        hour_key,
                        stats_values(row, now)
                    )),
                    RowKind::User => users_hour.push(format!(
                        "({},{},{})",
                        key.user_id,
                        hour_key,
                        stats_values(row, now)
                    )),
                    RowKind::Pool => {
                        pool_hour.push(format!("({},{})", hour_key, stats_values(row, now)))
                    }
                }
            }

            let day = day_key(day_start);
            match row_kind(key) {
                RowKind::Worker => workers_day.push(format!(
                    "({},{},{},{})",
                    key.worker_id,
                    key.user_id,
                    day,
                    stats_values(&snapshot.day, now)
                )),
                RowKind::User => users_day.push(format!(
                    "({},{},{})",
                    key.user_id,
                    day,
                    stats_values(&snapshot.day, now)
                )),
                RowKind::Pool => {
                    pool_day.push(format!("({},{})", day, stats_values(&snapshot.day, now)))
                }
            }
        }

        let mut guard = self.conn.lock().await;
        let conn = match ensure_conn(&self.url, &mut guard).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("can't connect to pool db: {e}");
                return Err(e);
            }
        };

        let batches = [
            ("stats_workers_hour", "`worker_id`,`puid`,`hour`,", &workers_hour),
            ("stats_users_hour", "`puid`,`hour`,", &users_hour),
            ("stats_pool_hour", "`hour`,", &pool_hour),
            ("stats_workers_day", "`worker_id`,`puid`,`day`,", &workers_day),
            ("stats_users_day", "`puid`,`day`,", &users_day),
            ("stats_pool_day", "`day`,", &pool_day),
        ];
        let mut rows = 0usize;
        let mut failed = None;
        for (table, extra_fields, values) in batches {
            match merge_table(&mut *conn, table, extra_fields, values).await {
                Ok(()) => rows += values.len(),
                Err(e) => {
                    error!(table, "flush rollups failed: {e}");
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            // next run reconnects and starts from a fresh staging table
            *guard = None;
            return Err(e);
        }

        for (_, stats, snapshot) in &snapshots {
            stats.clear_dirty(snapshot.dirty_hours);
        }

        info!(
            rows,
            entries = snapshots.len(),
            elapsed_ms = began.elapsed().as_millis() as u64,
            "flush rollups done"
        );

        drop(guard);
        self.maybe_prune(now).await;
        Ok(rows)
    }

    /// Delete rows past their retention, at most once per hour.
    async fn maybe_prune(&self, now: u64) {
        {
            let mut last = self.last_prune.lock().unwrap();
            if *last + PRUNE_INTERVAL_SECONDS > now {
                return;
            }
            *last = now;
        }

        let mut guard = self.conn.lock().await;
        let conn = match ensure_conn(&self.url, &mut guard).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("prune: can't connect to pool db: {e}");
                return;
            }
        };

        let prunes = [
            (
                "DELETE FROM `stats_workers_day` WHERE `day` < ?",
                day_key_at(now.saturating_sub(WORKER_DAY_KEEP_DAYS * 86_400)),
            ),
            (
                "DELETE FROM `stats_workers_hour` WHERE `hour` < ?",
                hour_key_at(now.saturating_sub(WORKER_HOUR_KEEP_HOURS * 3_600)),
            ),
            (
                "DELETE FROM `stats_users_hour` WHERE `hour` < ?",
                hour_key_at(now.saturating_sub(USER_HOUR_KEEP_DAYS * 86_400)),
            ),
        ];
        for (sql, cutoff) in prunes {
            match sqlx::query(sql).bind(cutoff).execute(&mut *conn).await {
                Ok(result) => info!(cutoff, deleted = result.rows_affected(), "{sql}"),
                Err(e) => error!(cutoff, "prune failed: {e}"),
            }
        }
    }
}

enum RowKind {
    Worker,
    User,
    Pool,
}

fn row_kind(key: &WorkerKey) -> RowKind {
    if key.user_id == 0 && key.worker_id == 0 {
        RowKind::Pool
    } else if key.worker_id == 0 {
        RowKind::User
    } else {
        RowKind::Worker
    }
}

async fn merge_table(
    conn: &mut MySqlConnection,
    table: &str,
    extra_fields: &str,
    values: &[String],
) -> Result<(), sqlx::Error> {
    if values.is_empty() {
        return Ok(());
    }
    // the temp table name embeds the pid so concurrent parser instances
    // sharing one database never collide
    let tmp_table = format!("{table}_tmp_{}", process::id());

    sqlx::query(&format!("DROP TEMPORARY TABLE IF EXISTS `{tmp_table}`"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMPORARY TABLE `{tmp_table}` LIKE `{table}`"
    ))
    .execute(&mut *conn)
    .await?;

    let insert = format!(
        "INSERT INTO `{tmp_table}` ({extra_fields}\
         `share_accept`,`share_reject`,`reject_rate`,`score`,`earn`,`created_at`,`updated_at`) \
         VALUES {}",
        values.join(",")
    );
    sqlx::query(&insert).execute(&mut *conn).await?;

    let merge = format!(
        "INSERT INTO `{table}` SELECT * FROM `{tmp_table}` AS `t2` \
         ON DUPLICATE KEY UPDATE \
          `share_accept` = `t2`.`share_accept`, \
          `share_reject` = `t2`.`share_reject`, \
          `reject_rate`  = `t2`.`reject_rate`, \
          `score`        = `t2`.`score`, \
          `earn`         = `t2`.`earn`, \
          `updated_at`   = `t2`.`updated_at`"
    );
    sqlx::query(&merge).execute(&mut *conn).await?;

    sqlx::query(&format!("DROP TEMPORARY TABLE IF EXISTS `{tmp_table}`"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn ensure_conn<'a>(
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

/// `YYYYMMDD` of the UTC day containing `ts`.
pub fn day_key_at(ts: u64) -> i64 {
    let date = Utc
        .timestamp_opt(ts as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    date.format("%Y%m%d").to_string().parse().unwrap_or(0)
}

/// `YYYYMMDDHH` of the UTC hour containing `ts`.
pub fn hour_key_at(ts: u64) -> i64 {
    let date = Utc
        .timestamp_opt(ts as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    day_key_at(ts) * 100 + i64::from(date.hour())
}

pub fn day_key(day_start: u32) -> i64 {
    day_key_at(u64::from(day_start))
}

pub fn hour_key(day_start: u32, hour: u32) -> i64 {
    day_key(day_start) * 100 + i64::from(hour)
}

/// The shared column tail of every stats row.
fn stats_values(stats: &ShareStats, now: u64) -> String {
    let now_str = mysql_datetime(now);
    format!(
        "{},{},{},{},{},'{}','{}'",
        stats.share_accept,
        stats.share_reject,
        stats.reject_rate,
        stats.score,
        stats.earn,
        now_str,
        now_str,
    )
}

/// `YYYY-MM-DD HH:MM:SS`, UTC.
pub fn mysql_datetime(epoch: u64) -> String {
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::ShareResult;
    use std::net::Ipv4Addr;

    fn share(user_id: i32, worker_id: i64, timestamp: u32, score: f64) -> Share {
        Share {
            user_id,
            worker_hash_id: worker_id,
            ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
            timestamp,
            share_weight: 1,
            score,
            result: ShareResult::Accept,
        }
    }

    #[test]
    fn test_day_and_hour_keys() {
        // 2016-07-12 00:00:00 UTC
        assert_eq!(day_key_at(1_468_281_600), 20_160_712);
        assert_eq!(hour_key_at(1_468_281_600), 2_016_071_200);
        // 23:59:59 the same day
        assert_eq!(hour_key_at(1_468_281_600 + 86_399), 2_016_071_223);

        assert_eq!(hour_key(86_400, 0), 1_970_010_200);
        assert_eq!(hour_key(86_400, 23), 1_970_010_223);
    }

    #[test]
    fn test_rollup_first_hour_of_day() {
        // replays a minute of shares into hour 00 of day-start 86400
        let rollup = RollupAggregator::new(86_400);
        for k in 0..60u32 {
            rollup.process_share(&share(1, 5, 86_400 + k, 0.0));
        }

        let pool = rollup.get(&WorkerKey::pool()).unwrap();
        let hour = pool.hour_stats(0);
        assert_eq!(hour.share_accept, 60);
        assert_eq!(hour.share_reject, 0);
        assert_eq!(hour.reject_rate, 0.0);
        assert_eq!(hour.earn, 0);
    }

    #[test]
    fn test_stats_values_row() {
        let stats = ShareStats {
            share_accept: 60,
            share_reject: 20,
            reject_rate: 0.25,
            score: 1.5,
            earn: 42,
        };
        assert_eq!(
            stats_values(&stats, 1_468_281_600),
            "60,20,0.25,1.5,42,'2016-07-12 00:00:00','2016-07-12 00:00:00'"
        );
    }

    #[test]
    fn test_row_kind() {
        assert!(matches!(row_kind(&WorkerKey::pool()), RowKind::Pool));
        assert!(matches!(row_kind(&WorkerKey::new(1, 0)), RowKind::User));
        assert!(matches!(row_kind(&WorkerKey::new(1, 5)), RowKind::Worker));
    }
}
