use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::control::Controller;
use crate::error::ConfigError;
use crate::role::ActuatorRole;
use crate::store::DosingPatch;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

type AppState = Arc<Controller>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/dosing/enable", post(api_enable))
        .route("/api/dosing/disable", post(api_disable))
        .route("/api/dosing/config", axum::routing::patch(api_update_config))
        .route("/api/dosing/dose-now", post(api_dose_now))
        .route("/api/dosing/history", get(api_history))
        .route("/api/pumps/{role}/clear-fault", post(api_clear_fault))
        .with_state(controller)
}

async fn api_status(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.status().await)
}

async fn api_enable(State(c): State<AppState>) -> impl IntoResponse {
    Json((*c.enable().await).clone())
}

async fn api_disable(State(c): State<AppState>) -> impl IntoResponse {
    Json((*c.disable().await).clone())
}

async fn api_update_config(
    State(c): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let patch: DosingPatch = match serde_json::from_value(body) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("invalid config update: {e}")),
    };
    match c.update_config(&patch).await {
        Ok(state) => Json((*state).clone()).into_response(),
        Err(e) => config_error(e),
    }
}

async fn api_dose_now(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.trigger_dose_now().await)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn api_history(State(c): State<AppState>, Query(q): Query<HistoryQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    Json(c.history(limit).await)
}

async fn api_clear_fault(State(c): State<AppState>, Path(role): Path<String>) -> Response {
    let Ok(role) = role.parse::<ActuatorRole>() else {
        return not_found(format!("unknown actuator role '{role}'"));
    };
    match c.clear_fault(role) {
        Ok(state) => Json(state).into_response(),
        Err(e) => config_error(e),
    }
}

fn config_error(e: ConfigError) -> Response {
    match e {
        ConfigError::UnknownRole(_) => not_found(e.to_string()),
        other => bad_request(other.to_string()),
    }
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

fn not_found(msg: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    controller: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("control api listening on http://{addr}");

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
