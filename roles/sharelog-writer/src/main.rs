use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::time::{SystemTime, UNIX_EPOCH};

use share_bus::{BusConsumer, StartOffset, TcpBusConsumer};
use tracing::{error, info, warn};

mod config;
mod writer;

use config::Config;
use writer::ShareLogWriter;

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("starting sharelog-writer");
    info!("data dir: {}", config.data_dir);

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let running = Arc::new(AtomicBool::new(true));
    let running_signal = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        running_signal.store(false, Ordering::Relaxed);
    });

    let mut bus = TcpBusConsumer::new(config.share_bus_address.clone());
    bus.setup(StartOffset::Committed(config.share_tail_records))
        .await?;

    let mut writer = ShareLogWriter::new(&config.data_dir);
    let mut last_flush = unix_timestamp();

    info!("start sharelog consume loop");
    while running.load(Ordering::Relaxed) {
        if writer.buffered() > 0 && unix_timestamp() > last_flush + config.flush_disk_interval_s {
            if let Err(e) = writer.flush_to_disk().await {
                // an unwritable day file means every retry loses shares
                error!("flush sharelog to disk failed: {e}");
                return Err(e.into());
            }
            last_flush = unix_timestamp();
        }

        match bus.consume(Duration::from_secs(1)).await {
            Ok(Some(payload)) => writer.consume_record(&payload),
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                error!("share bus consume fatal: {e}");
                break;
            }
            Err(e) => warn!("share bus consume error: {e}"),
        }
    }

    // drain the buffer so no share is lost on shutdown
    if writer.buffered() > 0 {
        info!(buffered = writer.buffered(), "flushing remaining shares");
        writer.flush_to_disk().await?;
    }
    info!("sharelog-writer stopped");
    Ok(())
}
