//! Herakles Log Exporter Library
//!
//! Turns log lines into Prometheus metrics. Small programs written in a
//! pattern language declare metrics and say how matching lines update them:
//!
//! ```text
//! counter http_requests by code
//!
//! /" (?P<code>\d{3}) / {
//!   http_requests[$code]++
//! }
//! ```
//!
//! # Pipeline
//!
//! - [`compiler`]: lexer, parser, type checker and code generator producing
//!   a bytecode [`compiler::Object`] per program
//! - [`runtime`]: the bytecode VM plus program loading, reloading and the
//!   execution worker pool
//! - [`metrics`]: the shared metric [`metrics::Store`]
//! - [`tailer`]: log discovery and per-file, pipe and socket streams
//! - [`exporter`]: Prometheus text, JSON, varz and graphite renderings
//! - [`engine`]: wires all of the above together
//!
//! # Usage
//!
//! ```no_run
//! use herakles_log_exporter::engine::{Engine, EngineOptions};
//! use herakles_log_exporter::exporter::Format;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut options = EngineOptions::default();
//! options.runtime.program_path = Some("/etc/herakles-log-exporter/progs".into());
//! options.logs.push("/var/log/nginx/access.log".into());
//!
//! let engine = Engine::new(options)?;
//! engine.load_programs()?;
//! engine.start();
//! println!("{}", engine.render(Format::Prometheus)?);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod engine;
pub mod exporter;
pub mod logline;
pub mod metrics;
pub mod runtime;
pub mod tailer;
pub mod telemetry;
pub mod waker;

// Re-export main types for convenience
pub use engine::{Engine, EngineError, EngineOptions};
pub use exporter::{Exporter, ExporterOptions, Format};
pub use logline::LogLine;
pub use metrics::Store;
