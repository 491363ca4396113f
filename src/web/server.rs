//! HTTP side doors: the dynamic-record update API and the opt-in debug
//! stats endpoint.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tracing::{info, warn};

use crate::resolver::dynamic::{normalize_domain, DynItem, DynResolver};
use crate::stats::Stats;

/// Serve `POST /update_dyn` for one dynamic resolver.
pub async fn run_dyn_update(addr: String, resolver: Arc<DynResolver>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/update_dyn", post(update_dyn))
        .with_state(resolver);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dyn update API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn update_dyn(
    State(resolver): State<Arc<DynResolver>>,
    Json(item): Json<DynItem>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(name) = normalize_domain(&item.name) else {
        return bad_request("bad params");
    };
    let Ok(ip) = item.addr.parse::<IpAddr>() else {
        return bad_request("bad params");
    };
    if !resolver.allows_update(&name) {
        warn!("update for {:?} outside the allowed suffixes", name);
        return bad_request("name not allowed");
    }

    match resolver.update(&name, ip, item.ttl) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "err": 0, "msg": "OK" }))),
        Err(e) => {
            warn!("update_dyn for {:?}: {}", name, e);
            bad_request("error")
        }
    }
}

fn bad_request(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "err": -1, "msg": msg })))
}

/// Serve `GET /api/stats` with the process counters.
pub async fn run_debug(addr: String, stats: Arc<Stats>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/stats", get(api_stats))
        .with_state(stats);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("debug endpoint listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn api_stats(State(stats): State<Arc<Stats>>) -> Json<serde_json::Value> {
    Json(stats.snapshot())
}
