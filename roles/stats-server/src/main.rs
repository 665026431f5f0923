use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use share_bus::{BusConsumer, StartOffset, TcpBusConsumer};
use sharestats_redis::KvClient;
use stats_core::unix_timestamp;
use tracing::{error, info, warn};

use stats_server::api;
use stats_server::config::Config;
use stats_server::kv_flusher::{KvFlusher, KvWritePolicy};
use stats_server::meta::MetaUpdater;
use stats_server::server::{StatsServer, INITIALIZING_SLACK_SECONDS};
use stats_server::sql_flusher::SqlFlusher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("starting stats-server");
    info!("share bus: {}", config.share_bus_address);
    info!("http server: {}", config.http_listen_address);

    let server = Arc::new(StatsServer::new());
    let running = Arc::new(AtomicBool::new(true));

    let sql_flusher = match &config.db_url {
        Some(url) => {
            let flusher = Arc::new(SqlFlusher::new(url.clone(), config.last_flush_file.clone()));
            flusher.init().await?;
            info!("db sink ready");
            Some(flusher)
        }
        None => None,
    };

    let kv_flusher = match &config.redis_url {
        Some(url) => {
            let mut clients = Vec::with_capacity(config.kv_concurrency);
            for _ in 0..config.kv_concurrency {
                let client = KvClient::new(url).await?;
                client.ping().await?;
                clients.push(Arc::new(client));
            }
            info!(concurrency = config.kv_concurrency, "kv sink ready");
            Some(Arc::new(KvFlusher::new(
                clients,
                KvWritePolicy {
                    prefix: config.kv_prefix.clone(),
                    key_ttl_s: config.kv_key_ttl_s,
                    publish_policy: config.kv_publish_policy,
                    index_policy: config.kv_index_policy,
                },
            )))
        }
        None => None,
    };

    if let Some(meta_address) = config.meta_bus_address.clone() {
        let meta_kv = match &config.redis_url {
            Some(url) => Some(Arc::new(KvClient::new(url).await?)),
            None => None,
        };
        let updater = Arc::new(MetaUpdater::new(
            config.db_url.clone(),
            meta_kv,
            config.kv_prefix.clone(),
            config.kv_key_ttl_s,
            config.kv_publish_policy,
            config.kv_index_policy,
        ));
        let running = running.clone();
        let tail = config.meta_tail_records;
        tokio::spawn(async move {
            run_meta_consumer(meta_address, tail, updater, running).await;
        });
    }

    let http_address = config.http_listen_address.clone();
    let http_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_http_server(http_address, http_server).await {
            error!("http server error: {e}");
        }
    });

    let running_signal = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        running_signal.store(false, Ordering::Relaxed);
    });

    let mut share_bus = TcpBusConsumer::new(config.share_bus_address.clone());
    share_bus
        .setup(StartOffset::Tail(config.share_tail_records))
        .await?;

    info!("start sharelog consume loop");
    let mut last_clean = unix_timestamp();
    let mut last_flush = unix_timestamp();

    while running.load(Ordering::Relaxed) {
        let no_new_shares = match share_bus.consume(Duration::from_secs(1)).await {
            Ok(Some(payload)) => {
                server.consume_share_record(&payload, unix_timestamp());
                false
            }
            Ok(None) => true,
            Err(e) if e.is_fatal() => {
                error!("share bus consume fatal: {e}");
                break;
            }
            Err(e) => {
                warn!("share bus consume error: {e}");
                true
            }
        };
        let now = unix_timestamp();

        if server.is_initializing() {
            // don't flush while replaying backlog, or hashrates would be
            // written out as zero after a restart
            if last_flush + config.flush_db_interval_s < now {
                if !no_new_shares && server.last_share_time() + INITIALIZING_SLACK_SECONDS < now {
                    info!(
                        last_share_time = server.last_share_time(),
                        "consuming history shares"
                    );
                    last_flush = now;
                } else {
                    server.finish_initializing();
                    info!("initialization finished");
                }
            }
            continue;
        }

        if last_clean + config.expire_interval_s < now {
            server.registry.expire(now);
            last_clean = now;
        }

        if last_flush + config.flush_db_interval_s < now {
            if let Some(flusher) = &sql_flusher {
                if server.try_begin_sql_flush() {
                    let flusher = flusher.clone();
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = flusher.flush(&server).await {
                            error!("flush to db failed: {e}");
                        }
                        server.end_sql_flush();
                    });
                } else {
                    warn!("last db flush is not finished yet, ignore");
                }
            }
            if let Some(flusher) = &kv_flusher {
                if server.try_begin_kv_flush() {
                    let flusher = flusher.clone();
                    let server = server.clone();
                    tokio::spawn(async move {
                        flusher.flush(&server).await;
                        server.end_kv_flush();
                    });
                } else {
                    warn!("last kv flush is not finished yet, ignore");
                }
            }
            last_flush = now;
        }
    }

    info!("stopping stats-server, waiting for in-flight flushes");
    while server.flush_in_progress() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("stats-server stopped");
    Ok(())
}

async fn run_meta_consumer(
    address: String,
    tail_records: u64,
    updater: Arc<MetaUpdater>,
    running: Arc<AtomicBool>,
) {
    let mut bus = TcpBusConsumer::new(address);
    if let Err(e) = bus.setup(StartOffset::Tail(tail_records)).await {
        error!("meta bus setup failed: {e}");
        return;
    }

    info!("start meta events consume loop");
    while running.load(Ordering::Relaxed) {
        match bus.consume(Duration::from_secs(3)).await {
            Ok(Some(payload)) => updater.handle_record(&payload).await,
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                error!("meta bus consume fatal: {e}");
                break;
            }
            Err(e) => warn!("meta bus consume error: {e}"),
        }
    }
    info!("stop meta events consume loop");
}
