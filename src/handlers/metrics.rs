//! Metrics endpoint handlers.
//!
//! `/metrics` serves program metrics followed by the exporter's own telemetry
//! in Prometheus text format. `/json`, `/varz` and `/graphite` serve the
//! program metrics in the other export formats.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use herakles_log_exporter::{EngineError, Format};
use std::time::Instant;
use tracing::{debug, error, instrument};

use crate::state::SharedState;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed(EngineError),
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        let MetricsError::EncodingFailed(e) = self;
        error!("Failed to encode metrics: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response()
    }
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    let start = Instant::now();
    debug!("Processing /metrics request");
    state.record_http_request();

    let body = state
        .engine
        .render_metrics()
        .map_err(MetricsError::EncodingFailed)?;

    debug!(
        "Rendered /metrics ({} bytes) in {:.2}ms",
        body.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok((
        [(header::CONTENT_TYPE, Format::Prometheus.content_type())],
        body,
    ))
}

fn render(state: &SharedState, format: Format) -> Result<impl IntoResponse, MetricsError> {
    state.record_http_request();
    let body = state
        .engine
        .render(format)
        .map_err(MetricsError::EncodingFailed)?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], body))
}

/// Handler for the /json endpoint.
#[instrument(skip(state))]
pub async fn json_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    debug!("Processing /json request");
    render(&state, Format::Json)
}

/// Handler for the /varz endpoint.
#[instrument(skip(state))]
pub async fn varz_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    debug!("Processing /varz request");
    render(&state, Format::Varz)
}

/// Handler for the /graphite endpoint.
#[instrument(skip(state))]
pub async fn graphite_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    debug!("Processing /graphite request");
    render(&state, Format::Graphite)
}
