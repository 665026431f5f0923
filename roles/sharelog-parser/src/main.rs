use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use sharelog::sharelog_file_path;
use stats_core::unix_timestamp;
use tracing::{debug, error, info};

use sharelog_parser::api::{self, ParserState};
use sharelog_parser::config::Config;
use sharelog_parser::replayer::ShareLogReplayer;
use sharelog_parser::rollup::{RollupAggregator, RollupSqlSink};

/// A new day's file is only adopted once midnight is comfortably past,
/// the old file is fully consumed, and the new file exists.
const FILE_SWITCH_SLACK_SECONDS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("starting sharelog-parser");
    info!("data dir: {}", config.data_dir);

    let sink = Arc::new(RollupSqlSink::new(config.db_url.clone()));
    sink.init().await?;

    if let Some(date) = &config.run_date {
        return run_single_day(&config, &sink, date).await;
    }

    let state = Arc::new(ParserState::new());
    let http_address = config.http_listen_address.clone();
    let http_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_http_server(http_address, http_state).await {
            error!("http server error: {e}");
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let running_signal = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        running_signal.store(false, Ordering::Relaxed);
    });

    let data_dir = Path::new(&config.data_dir);
    let now = unix_timestamp();
    let day_start = (now - now % 86_400) as u32;
    let mut replayer = ShareLogReplayer::new(data_dir, day_start);
    replayer.init().await?;
    let mut rollup = Arc::new(RollupAggregator::new(day_start));
    state.set_current(rollup.clone());

    info!("start sharelog parse loop");
    let mut last_flush = 0u64;
    while running.load(Ordering::Relaxed) {
        // drain whatever the writer appended since the last tick
        loop {
            match replayer.replay_growing(|share| rollup.process_share(share)).await {
                Ok(0) => break,
                Ok(records) => debug!(records, "replayed shares"),
                Err(e) => {
                    error!("replay failed: {e}");
                    break;
                }
            }
            if !running.load(Ordering::Relaxed) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let now = unix_timestamp();
        if now > last_flush + config.flush_db_interval_s {
            if let Err(e) = sink.flush(&rollup).await {
                error!("flush rollups to db failed: {e}");
            }
            last_flush = now;
        }

        // midnight file switch
        let today_start = (now - now % 86_400) as u32;
        if today_start != rollup.day_start()
            && now > u64::from(today_start) + FILE_SWITCH_SLACK_SECONDS
            && replayer.is_eof().await
            && sharelog_file_path(data_dir, today_start).exists()
        {
            if let Err(e) = sink.flush(&rollup).await {
                error!("flush before file switch failed: {e}");
            }

            let next = ShareLogReplayer::new(data_dir, today_start);
            if let Err(e) = next.init().await {
                error!("switch sharelog file failed: {e}");
                continue;
            }
            replayer = next;
            rollup = Arc::new(RollupAggregator::new(today_start));
            state.set_current(rollup.clone());
            info!(day_start = today_start, "switched to new sharelog file");
        }
    }

    info!("stopping sharelog-parser, flushing rollups");
    if let Err(e) = sink.flush(&rollup).await {
        error!("final flush failed: {e}");
    }
    info!("sharelog-parser stopped");
    Ok(())
}

/// Bulk-parse one past day and flush it, then exit.
async fn run_single_day(
    config: &Config,
    sink: &Arc<RollupSqlSink>,
    date: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;
    let day_start = day
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
        .timestamp() as u32;

    let mut replayer = ShareLogReplayer::new(Path::new(&config.data_dir), day_start);
    replayer.init().await?;

    let rollup = RollupAggregator::new(day_start);
    let records = replayer
        .replay_bulk(|share| rollup.process_share(share))
        .await?;
    info!(date, records, "single day replay done");

    sink.flush(&rollup).await?;
    Ok(())
}
