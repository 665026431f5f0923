use std::{env, fs};

use serde::Deserialize;

/// Flattened runtime configuration for the stats server.
#[derive(Debug, Clone)]
pub struct Config {
    pub share_bus_address: String,
    pub meta_bus_address: Option<String>,
    pub share_tail_records: u64,
    pub meta_tail_records: u64,
    pub db_url: Option<String>,
    pub redis_url: Option<String>,
    pub kv_prefix: String,
    pub kv_key_ttl_s: u64,
    pub kv_publish_policy: u32,
    pub kv_index_policy: u32,
    pub kv_concurrency: usize,
    pub flush_db_interval_s: u64,
    pub expire_interval_s: u64,
    pub last_flush_file: Option<String>,
    pub http_listen_address: String,
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsServerConfig {
    #[serde(default)]
    bus: BusConfig,
    #[serde(default)]
    kv: KvConfig,
    #[serde(default)]
    db: DbConfig,
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Debug, Deserialize)]
struct BusConfig {
    share_address: Option<String>,
    meta_address: Option<String>,
    share_tail_records: Option<u64>,
    meta_tail_records: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            share_address: Some("127.0.0.1:9091".to_string()),
            meta_address: None,
            // ~100k workers submitting every 10s for one hour
            share_tail_records: Some(36_000_000),
            meta_tail_records: Some(100_000),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KvConfig {
    url: Option<String>,
    prefix: Option<String>,
    key_ttl_s: Option<u64>,
    publish_policy: Option<u32>,
    index_policy: Option<u32>,
    concurrency: Option<usize>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefix: Some(String::new()),
            key_ttl_s: Some(0),
            publish_policy: Some(0),
            index_policy: Some(0),
            concurrency: Some(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DbConfig {
    url: Option<String>,
    flush_interval_s: Option<u64>,
    expire_interval_s: Option<u64>,
    last_flush_file: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            flush_interval_s: Some(15),
            expire_interval_s: Some(1800),
            last_flush_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    http_listen_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_address: Some("127.0.0.1:8080".to_string()),
        }
    }
}

impl Config {
    pub fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();
        Self::from_arg_list(&args)
    }

    fn from_arg_list(args: &[String]) -> Result<Self, Box<dyn std::error::Error>> {
        let log_file = args
            .iter()
            .position(|arg| arg == "-f" || arg == "--log-file")
            .and_then(|i| args.get(i + 1))
            .cloned();

        let config_path = args
            .iter()
            .position(|arg| arg == "--config" || arg == "-c")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
            .ok_or("Missing required argument: --config")?;

        let config_str = fs::read_to_string(config_path)?;
        let parsed: StatsServerConfig = toml::from_str(&config_str)?;
        Self::from_parsed(parsed, log_file)
    }

    fn from_parsed(
        parsed: StatsServerConfig,
        log_file: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = BusConfig::default();
        let concurrency = parsed.kv.concurrency.unwrap_or(1).max(1);

        Ok(Config {
            share_bus_address: parsed
                .bus
                .share_address
                .or(defaults.share_address)
                .ok_or("Missing required config: bus.share_address")?,
            meta_bus_address: parsed.bus.meta_address,
            share_tail_records: parsed.bus.share_tail_records.unwrap_or(36_000_000),
            meta_tail_records: parsed.bus.meta_tail_records.unwrap_or(100_000),
            db_url: parsed.db.url,
            redis_url: parsed.kv.url,
            kv_prefix: parsed.kv.prefix.unwrap_or_default(),
            kv_key_ttl_s: parsed.kv.key_ttl_s.unwrap_or(0),
            kv_publish_policy: parsed.kv.publish_policy.unwrap_or(0),
            kv_index_policy: parsed.kv.index_policy.unwrap_or(0),
            kv_concurrency: concurrency,
            flush_db_interval_s: parsed.db.flush_interval_s.unwrap_or(15),
            expire_interval_s: parsed.db.expire_interval_s.unwrap_or(1800),
            last_flush_file: parsed.db.last_flush_file,
            http_listen_address: parsed
                .server
                .http_listen_address
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            log_file,
        })
    }
}
