//! HTTP endpoint handlers for the exporter.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/`: Landing page
//! - `/metrics`: Prometheus metrics endpoint
//! - `/json`, `/varz`, `/graphite`: Alternative export formats
//! - `/progz`: Loaded programs and compile errors
//! - `/health`: Health check endpoint

pub mod health;
pub mod metrics;
pub mod progz;
pub mod root;

// Re-export handlers
pub use health::health_handler;
pub use metrics::{graphite_handler, json_handler, metrics_handler, varz_handler};
pub use progz::progz_handler;
pub use root::root_handler;
