//! HTTP status endpoints for the live aggregator.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use sharelog::WorkerKey;
use stats_core::{unix_timestamp, WorkerStatus};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::server::StatsServer;

pub async fn run_http_server(
    address: String,
    server: Arc<StatsServer>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&address).await?;
    info!("http status server listening on http://{}", address);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let server = server.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { handle_request(req, server).await }
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
    server: Arc<StatsServer>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    server.count_request();
    let query = req.uri().query().unwrap_or("").to_string();

    let (status, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::POST, "/") => serve_server_status(&server),
        (&Method::GET, "/worker_status") | (&Method::POST, "/worker_status") => {
            serve_worker_status(&server, &query)
        }
        (&Method::GET, "/flush_db_time") => serve_flush_db_time(&server),
        _ => (StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    };

    server.count_response_bytes(body.len() as u64);
    let response = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    Ok(response)
}

fn initializing_response() -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        r#"{"error":"service is initializing"}"#.to_string(),
    )
}

fn serve_server_status(server: &Arc<StatsServer>) -> (StatusCode, String) {
    if server.is_initializing() {
        return initializing_response();
    }
    let status = server.server_status(unix_timestamp());
    let body = serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
    (StatusCode::OK, body)
}

fn serve_worker_status(server: &Arc<StatsServer>, query: &str) -> (StatusCode, String) {
    if server.is_initializing() {
        return initializing_response();
    }

    let params = parse_query(query);
    let (user_id, worker_ids) = match parse_worker_params(&params) {
        Some(parsed) => parsed,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                r#"{"error":"invalid args"}"#.to_string(),
            )
        }
    };
    let is_merge = params
        .get("is_merge")
        .map(|v| v.starts_with('t') || v.starts_with('T'))
        .unwrap_or(false);

    let mut keys: Vec<WorkerKey> = worker_ids
        .iter()
        .map(|worker_id| WorkerKey::new(user_id, *worker_id))
        .collect();
    let now = unix_timestamp();
    let mut statuses = server.registry.status_batch(&keys, now);
    if is_merge {
        statuses = vec![WorkerStatus::merge(&statuses)];
        keys = vec![WorkerKey::new(user_id, 0)];
    }

    let mut data = serde_json::Map::new();
    for (key, status) in keys.iter().zip(&statuses) {
        let mut entry = json!({
            "accept": [status.accept_1m, status.accept_5m, status.accept_15m, status.accept_1h],
            "reject": [0, 0, status.reject_15m, status.reject_1h],
            "accept_count": status.accept_count,
            "last_share_ip": status.ip_string(),
            "last_share_time": status.last_share_time,
        });
        // a user row carries the live worker count
        if !is_merge && key.is_user_row() {
            entry["workers"] = json!(server.registry.worker_count_of_user(user_id));
        }
        data.insert(key.worker_id.to_string(), entry);
    }

    (StatusCode::OK, json!({ "data": data }).to_string())
}

fn serve_flush_db_time(server: &Arc<StatsServer>) -> (StatusCode, String) {
    if server.is_initializing() {
        return initializing_response();
    }
    (
        StatusCode::OK,
        json!({ "flush_db_time": server.last_flush_time() }).to_string(),
    )
}

fn parse_worker_params(params: &HashMap<String, String>) -> Option<(i32, Vec<i64>)> {
    let user_id = params.get("user_id")?.parse::<i32>().ok()?;
    let worker_ids: Vec<i64> = params
        .get("worker_id")?
        .split(',')
        .filter_map(|id| id.trim().parse::<i64>().ok())
        .collect();
    if worker_ids.is_empty() {
        return None;
    }
    Some((user_id, worker_ids))
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
