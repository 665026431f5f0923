//! HTTP endpoints over the live rollup state.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{Timelike, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use sharelog::WorkerKey;
use stats_core::{unix_timestamp, ShareStats};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::rollup::RollupAggregator;

/// State shared between the parser loop and the HTTP server. The current
/// day's aggregator is swapped at the midnight file switch.
pub struct ParserState {
    started_at: u64,
    request_count: AtomicU64,
    response_bytes: AtomicU64,
    current: RwLock<Option<Arc<RollupAggregator>>>,
}

impl ParserState {
    pub fn new() -> Self {
        Self {
            started_at: unix_timestamp(),
            request_count: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }

    pub fn set_current(&self, rollup: Arc<RollupAggregator>) {
        *self.current.write().unwrap() = Some(rollup);
    }

    pub fn current(&self) -> Option<Arc<RollupAggregator>> {
        self.current.read().unwrap().clone()
    }
}

impl Default for ParserState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_http_server(
    address: String,
    state: Arc<ParserState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&address).await?;
    info!("http status server listening on http://{}", address);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                error!("error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ParserState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let query = req.uri().query().unwrap_or("").to_string();

    let (status, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => serve_server_status(&state),
        (&Method::GET, "/share_stats") | (&Method::POST, "/share_stats") => {
            serve_share_stats(&state, &query)
        }
        _ => (StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    };

    state
        .response_bytes
        .fetch_add(body.len() as u64, Ordering::Relaxed);
    let response = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    Ok(response)
}

fn stats_json(stats: &ShareStats) -> serde_json::Value {
    json!({
        "accept": stats.share_accept,
        "reject": stats.share_reject,
        "reject_rate": stats.reject_rate,
        "earn": stats.earn,
    })
}

fn serve_server_status(state: &Arc<ParserState>) -> (StatusCode, String) {
    let rollup = match state.current() {
        Some(rollup) => rollup,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"no data available"}"#.to_string(),
            )
        }
    };

    let pool = rollup.get(&WorkerKey::pool()).expect("pool entry always exists");
    let current_hour = Utc::now().hour();
    let body = json!({
        "uptime_secs": unix_timestamp().saturating_sub(state.started_at),
        "request_count": state.request_count.load(Ordering::Relaxed),
        "response_bytes": state.response_bytes.load(Ordering::Relaxed),
        "date": rollup.day_start(),
        "pool": {
            "today": stats_json(&pool.day_stats()),
            "curr_hour": stats_json(&pool.hour_stats(current_hour)),
        },
    });
    (StatusCode::OK, body.to_string())
}

fn serve_share_stats(state: &Arc<ParserState>, query: &str) -> (StatusCode, String) {
    let rollup = match state.current() {
        Some(rollup) => rollup,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"no data available"}"#.to_string(),
            )
        }
    };

    let params = parse_query(query);
    let parsed = parse_stats_params(&params);
    let (user_id, worker_ids, hours) = match parsed {
        Some(parsed) => parsed,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                r#"{"error":"invalid args"}"#.to_string(),
            )
        }
    };

    let current_hour = Utc::now().hour() as i32;
    let mut data = serde_json::Map::new();
    for worker_id in &worker_ids {
        let key = WorkerKey::new(user_id, *worker_id);
        let entry = rollup.get(&key);

        let mut rows = Vec::with_capacity(hours.len());
        for hour in &hours {
            let stats = match (&entry, *hour) {
                // 24 selects the whole day
                (Some(stats), 24) => stats.day_stats(),
                // 0..-23 select offsets from the current UTC hour
                (Some(stats), offset @ -23..=0) => {
                    let hour_idx = current_hour + offset;
                    if (0..24).contains(&hour_idx) {
                        stats.hour_stats(hour_idx as u32)
                    } else {
                        ShareStats::default()
                    }
                }
                _ => ShareStats::default(),
            };
            let mut row = stats_json(&stats);
            row["hour"] = json!(hour);
            rows.push(row);
        }
        data.insert(worker_id.to_string(), json!(rows));
    }

    (StatusCode::OK, json!({ "data": data }).to_string())
}

type StatsParams = (i32, Vec<i64>, Vec<i32>);

fn parse_stats_params(params: &HashMap<String, String>) -> Option<StatsParams> {
    let user_id = params.get("user_id")?.parse::<i32>().ok()?;
    let worker_ids: Vec<i64> = params
        .get("worker_id")?
        .split(',')
        .filter_map(|id| id.trim().parse::<i64>().ok())
        .collect();
    let hours: Vec<i32> = params
        .get("hour")?
        .split(',')
        .filter_map(|h| h.trim().parse::<i32>().ok())
        .collect();
    if worker_ids.is_empty() || hours.is_empty() {
        return None;
    }
    Some((user_id, worker_ids, hours))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            Some((kv.next()?.to_string(), kv.next().unwrap_or("").to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::{Share, ShareResult};
    use std::net::Ipv4Addr;

    fn seeded_state() -> Arc<ParserState> {
        let state = Arc::new(ParserState::new());
        let rollup = Arc::new(RollupAggregator::new(86_400));
        for k in 0..10u32 {
            rollup.process_share(&Share {
                user_id: 1,
                worker_hash_id: 5,
                ip: Share::ip_from(Ipv4Addr::new(10, 0, 0, 1)),
                timestamp: 86_400 + k,
                share_weight: 2,
                score: 0.0,
                result: ShareResult::Accept,
            });
        }
        state.set_current(rollup);
        state
    }

    #[test]
    fn test_share_stats_day_row() {
        let state = seeded_state();
        let (status, body) =
            serve_share_stats(&state, "user_id=1&worker_id=5&hour=24");
        assert_eq!(status, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let rows = parsed["data"]["5"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["hour"], json!(24));
        assert_eq!(rows[0]["accept"], json!(20));
    }

    #[test]
    fn test_share_stats_unknown_worker_is_zero() {
        let state = seeded_state();
        let (_, body) = serve_share_stats(&state, "user_id=1&worker_id=99&hour=24");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["data"]["99"][0]["accept"], json!(0));
    }

    #[test]
    fn test_share_stats_requires_all_params() {
        let state = seeded_state();
        let (status, _) = serve_share_stats(&state, "user_id=1&worker_id=5");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_no_state_yields_unavailable() {
        let state = Arc::new(ParserState::new());
        let (status, _) = serve_server_status(&state);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
