use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::channel::DesiredState;
use crate::core::SyncCore;
use crate::error::SyncError;
use crate::state::Snapshot;

const DEFAULT_WINDOW: &str = "24h";

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(core: Arc<SyncCore>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/devices/{device}/command", post(api_command))
        .with_state(core)
}

async fn api_status(State(core): State<Arc<SyncCore>>) -> impl IntoResponse {
    let snapshot = core.get_snapshot();
    Json(Snapshot::clone(&snapshot))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    window: Option<String>,
}

async fn api_history(
    State(core): State<Arc<SyncCore>>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let raw = q.window.as_deref().unwrap_or(DEFAULT_WINDOW);
    match parse_window(raw) {
        Some(window) => Json(core.history_window(window)).into_response(),
        None => error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid window '{raw}' (expected e.g. 30m, 24h, 7d)"),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    status: DesiredState,
}

async fn api_command(
    State(core): State<Arc<SyncCore>>,
    Path(device): Path<String>,
    Json(body): Json<CommandBody>,
) -> Response {
    match core.send_command(&device, body.status) {
        Ok(command) => (StatusCode::ACCEPTED, Json(command)).into_response(),
        Err(e @ SyncError::UnknownDevice(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// `<n>m`, `<n>h` or `<n>d` with `n > 0`.
fn parse_window(s: &str) -> Option<Duration> {
    let s = s.trim();
    let unit = s.chars().last()?;
    let n = s[..s.len() - unit.len_utf8()].parse::<u64>().ok().filter(|n| *n > 0)?;
    let secs = match unit {
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return None,
    };
    n.checked_mul(secs).map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    core: Arc<SyncCore>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(core))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
