//! Read-only JSON monitor for a running engine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoapply_engine::report::FINAL_REPORT_JSON;
use autoapply_engine::MonitorReceiver;
use autoapply_storage::{FinalReport, StatsStore};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CRATE_NAME: &str = "autoapply-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: MonitorReceiver,
    pub stats: Arc<StatsStore>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(monitor: MonitorReceiver, stats: Arc<StatsStore>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            monitor,
            stats,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub total_cycles: Option<u64>,
    pub success_rate: Option<f64>,
    pub has_parquet_manifest: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/cycles", get(cycles_handler))
        .route("/reports", get(reports_handler))
        .route("/reports/chart", get(reports_chart_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!(addr = %bound, "monitor listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.monitor.borrow().clone();
    Json(snapshot).into_response()
}

async fn cycles_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.stats.snapshot();
    Json(serde_json::json!({
        "totals": snapshot.totals,
        "success_rate": snapshot.totals.success_rate(),
        "cycles": snapshot.history,
    }))
    .into_response()
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.reports_dir, 20) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reports_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.stats.snapshot();
    let x = snapshot.history.iter().map(|c| c.cycle_number).collect::<Vec<_>>();
    let ok = snapshot.history.iter().map(|c| c.successes).collect::<Vec<_>>();
    let failed = snapshot.history.iter().map(|c| c.failures).collect::<Vec<_>>();
    Json(serde_json::json!({
        "data": [
            {"type": "bar", "name": "succeeded", "x": x, "y": ok, "marker": {"color": "#16a34a"}},
            {"type": "bar", "name": "failed", "x": x, "y": failed, "marker": {"color": "#dc2626"}}
        ],
        "layout": {
            "title": "Applications Per Cycle",
            "barmode": "stack",
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    }))
    .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Most recent run directories first.
fn load_runs(reports_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut entries = std::fs::read_dir(reports_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    entries.reverse();

    let mut runs = Vec::new();
    for e in entries.into_iter().take(limit) {
        let report_path = e.path().join(FINAL_REPORT_JSON);
        let report: Option<FinalReport> = if report_path.exists() {
            Some(serde_json::from_str(&std::fs::read_to_string(&report_path)?)?)
        } else {
            None
        };
        runs.push(RunReportRow {
            run_id: e.file_name().to_string_lossy().to_string(),
            total_cycles: report.as_ref().map(|r| r.total_cycles),
            success_rate: report.as_ref().map(|r| r.success_rate),
            has_parquet_manifest: e.path().join("snapshots/manifest.json").exists(),
        });
    }
    Ok(runs)
}
