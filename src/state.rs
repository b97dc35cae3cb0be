//! Application state management for the exporter.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers.

use herakles_log_exporter::Engine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<Config>,
    /// Requests served, for /health.
    pub http_requests: AtomicU64,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            http_requests: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Uptime as "Xh Ym Zs".
    pub fn uptime(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let hours = uptime_secs / 3600;
        let minutes = (uptime_secs % 3600) / 60;
        let seconds = uptime_secs % 60;
        format!("{}h {}m {}s", hours, minutes, seconds)
    }
}
