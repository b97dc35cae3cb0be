//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns
//! exporter health statistics as a plain-text table.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use std::sync::atomic::Ordering;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "Project: https://github.com/cansp-dev/herakles-log-exporter — More info: https://www.herakles.now — Support: exporter@herakles.now";

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");
    state.record_http_request();

    let engine = &state.engine;
    let programs = engine.runtime().programs();
    let load_errors = engine.runtime().load_errors();

    // Unhealthy only when nothing can run at all.
    let (status, message) = if programs.is_empty() && !load_errors.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "No program loaded")
    } else if !load_errors.is_empty() {
        (StatusCode::OK, "OK - some programs failed to compile")
    } else {
        (StatusCode::OK, "OK")
    };

    let telemetry = engine.telemetry();
    let mut table = String::new();
    writeln!(table, "{:30} | {:>12}", "Statistic", "Value").ok();
    writeln!(table, "{}", "-".repeat(45)).ok();
    let rows: [(&str, String); 6] = [
        ("Programs loaded", programs.len().to_string()),
        ("Programs failed", load_errors.len().to_string()),
        ("Log streams", telemetry.log_count.get().to_string()),
        ("Lines processed", telemetry.lines_total.get().to_string()),
        ("Metrics in store", engine.store().len().to_string()),
        (
            "HTTP requests",
            state.http_requests.load(Ordering::Relaxed).to_string(),
        ),
    ];
    for (name, value) in rows {
        writeln!(table, "{:30} | {:>12}", name, value).ok();
    }

    let mut streams = String::new();
    writeln!(streams, "LOG STREAMS").ok();
    writeln!(streams, "===========").ok();
    for source in engine.tailer().sources().await {
        let Some(handle) = engine.tailer().lookup(&source).await else {
            continue;
        };
        let kind = handle
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        let last_read = handle
            .last_read()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let phase = if handle.is_complete() { "completed" } else { "active" };
        writeln!(streams, "{:8} {:9} {:35} {}", kind, phase, last_read, source).ok();
    }

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!(
            "{message}\n\nUptime: {uptime}\n\n{table}\n{streams}\n{FOOTER_TEXT}",
            uptime = state.uptime()
        ),
    )
}
