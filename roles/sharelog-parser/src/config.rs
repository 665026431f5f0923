use std::{env, fs};

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub db_url: String,
    pub flush_db_interval_s: u64,
    pub http_listen_address: String,
    /// `YYYY-MM-DD`; when set, parse that single day in bulk and exit.
    pub run_date: Option<String>,
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParserConfig {
    #[serde(default)]
    sharelog: SharelogConfig,
    #[serde(default)]
    db: DbConfig,
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Debug, Deserialize)]
struct SharelogConfig {
    data_dir: Option<String>,
}

impl Default for SharelogConfig {
    fn default() -> Self {
        Self {
            data_dir: Some("./sharelog".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DbConfig {
    url: Option<String>,
    flush_interval_s: Option<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            flush_interval_s: Some(15),
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
            http_listen_address: Some("127.0.0.1:8081".to_string()),
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

        let run_date = args
            .iter()
            .position(|arg| arg == "--date" || arg == "-d")
            .and_then(|i| args.get(i + 1))
            .cloned();

        let config_path = args
            .iter()
            .position(|arg| arg == "--config" || arg == "-c")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
            .ok_or("Missing required argument: --config")?;

        let parsed: ParserConfig = toml::from_str(&fs::read_to_string(config_path)?)?;
        Self::from_parsed(parsed, run_date, log_file)
    }

    fn from_parsed(
        parsed: ParserConfig,
        run_date: Option<String>,
        log_file: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Config {
            data_dir: parsed
                .sharelog
                .data_dir
                .unwrap_or_else(|| "./sharelog".to_string()),
            db_url: parsed.db.url.ok_or("Missing required config: db.url")?,
            flush_db_interval_s: parsed.db.flush_interval_s.unwrap_or(15),
            http_listen_address: parsed
                .server
                .http_listen_address
                .unwrap_or_else(|| "127.0.0.1:8081".to_string()),
            run_date,
            log_file,
        })
    }
}
