use std::{env, fs};

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub share_bus_address: String,
    pub share_tail_records: u64,
    pub flush_disk_interval_s: u64,
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriterConfig {
    #[serde(default)]
    sharelog: SharelogConfig,
    #[serde(default)]
    bus: BusConfig,
}

#[derive(Debug, Deserialize)]
struct SharelogConfig {
    data_dir: Option<String>,
    flush_disk_interval_s: Option<u64>,
}

impl Default for SharelogConfig {
    fn default() -> Self {
        Self {
            data_dir: Some("./sharelog".to_string()),
            flush_disk_interval_s: Some(2),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BusConfig {
    share_address: Option<String>,
    share_tail_records: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            share_address: Some("127.0.0.1:9091".to_string()),
            share_tail_records: Some(0),
        }
    }
}

impl Config {
    pub fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();

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

        let parsed: WriterConfig = toml::from_str(&fs::read_to_string(config_path)?)?;
        Ok(Self::from_parsed(parsed, log_file))
    }

    fn from_parsed(parsed: WriterConfig, log_file: Option<String>) -> Self {
        Config {
            data_dir: parsed
                .sharelog
                .data_dir
                .unwrap_or_else(|| "./sharelog".to_string()),
            share_bus_address: parsed
                .bus
                .share_address
                .unwrap_or_else(|| "127.0.0.1:9091".to_string()),
            share_tail_records: parsed.bus.share_tail_records.unwrap_or(0),
            flush_disk_interval_s: parsed.sharelog.flush_disk_interval_s.unwrap_or(2),
            log_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let parsed: WriterConfig = toml::from_str("").unwrap();
        let config = Config::from_parsed(parsed, None);
        assert_eq!(config.data_dir, "./sharelog");
        assert_eq!(config.flush_disk_interval_s, 2);
        assert_eq!(config.share_tail_records, 0);
    }

    #[test]
    fn test_full_config() {
        let parsed: WriterConfig = toml::from_str(
            r#"
            [sharelog]
            data_dir = "/var/lib/sharelog"
            flush_disk_interval_s = 5

            [bus]
            share_address = "10.0.0.5:9091"
            share_tail_records = 1000
            "#,
        )
        .unwrap();
        let config = Config::from_parsed(parsed, None);
        assert_eq!(config.data_dir, "/var/lib/sharelog");
        assert_eq!(config.flush_disk_interval_s, 5);
        assert_eq!(config.share_bus_address, "10.0.0.5:9091");
        assert_eq!(config.share_tail_records, 1000);
    }
}
