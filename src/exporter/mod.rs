//! Renders the metric store for scrapers.
//!
//! Every format reads one metric at a time through [`Metric::snapshot`], so a
//! render holds at most one metric's read lock and never stalls ingestion.
//! Expired label sets are skipped everywhere.

mod graphite;
mod json;
mod prometheus;
mod varz;

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::metrics::{Metric, Store};

/// Output formats supported by [`Exporter::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Prometheus,
    Json,
    Varz,
    Graphite,
}

impl Format {
    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Prometheus => "text/plain; version=0.0.4; charset=utf-8",
            Format::Json => "application/json",
            Format::Varz | Format::Graphite => "text/plain; charset=utf-8",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Prometheus => "prometheus",
            Format::Json => "json",
            Format::Varz => "varz",
            Format::Graphite => "graphite",
        })
    }
}

impl FromStr for Format {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prometheus" | "prom" => Ok(Format::Prometheus),
            "json" => Ok(Format::Json),
            "varz" => Ok(Format::Varz),
            "graphite" => Ok(Format::Graphite),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("unknown export format {0:?}")]
    UnknownFormat(String),

    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to format output: {0}")]
    Fmt(#[from] fmt::Error),

    #[error("failed to encode Prometheus text: {0}")]
    Encode(#[from] ::prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    /// Add a `prog` label naming the declaring program.
    pub emit_prog_label: bool,
    /// Append each label set's update time to Prometheus samples.
    pub emit_metric_timestamp: bool,
    /// `instance` label for varz output.
    pub hostname: String,
    /// Prepended to every graphite path.
    pub graphite_prefix: String,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            emit_prog_label: true,
            emit_metric_timestamp: false,
            hostname: local_hostname(),
            graphite_prefix: String::new(),
        }
    }
}

/// The host name, or "localhost" when it cannot be read.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Renders a [`Store`] in any supported [`Format`].
#[derive(Debug, Clone)]
pub struct Exporter {
    store: Arc<Store>,
    options: ExporterOptions,
}

impl Exporter {
    pub fn new(store: Arc<Store>, options: ExporterOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    pub fn render(&self, format: Format) -> Result<String, ExportError> {
        self.render_at(format, Utc::now())
    }

    /// Renders as of `now`, which decides label set expiry.
    pub fn render_at(&self, format: Format, now: DateTime<Utc>) -> Result<String, ExportError> {
        let metrics = self.exported_metrics();
        match format {
            Format::Prometheus => prometheus::render(&metrics, &self.options, now),
            Format::Json => json::render(&metrics, now),
            Format::Varz => varz::render(&metrics, &self.options, now),
            Format::Graphite => graphite::render(&metrics, &self.options, now),
        }
    }

    fn exported_metrics(&self) -> Vec<Arc<Metric>> {
        self.store
            .metrics()
            .into_iter()
            .filter(|m| !m.hidden)
            .collect()
    }
}

/// Exported metric names may not contain hyphens.
pub(crate) fn sanitize_name(name: &str) -> String {
    name.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Kind, ValueType};

    #[test]
    fn test_format_from_str() {
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("Prometheus".parse::<Format>().unwrap(), Format::Prometheus);
        assert!(matches!(
            "xml".parse::<Format>(),
            Err(ExportError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_hidden_metrics_are_not_exported() {
        let store = Arc::new(Store::new());
        let shown = Arc::new(Metric::new("shown", "p", Kind::Counter, ValueType::Int, vec![]));
        let hidden = Arc::new(
            Metric::new("secret", "p", Kind::Counter, ValueType::Int, vec![]).hidden(true),
        );
        store.add(shown.clone()).unwrap();
        store.add(hidden.clone()).unwrap();
        shown.get_datum(&[]).unwrap();
        hidden.get_datum(&[]).unwrap();

        let exporter = Exporter::new(store, ExporterOptions::default());
        for format in [Format::Prometheus, Format::Json, Format::Varz, Format::Graphite] {
            let out = exporter.render(format).unwrap();
            assert!(out.contains("shown"), "{} output: {}", format, out);
            assert!(!out.contains("secret"), "{} output: {}", format, out);
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("foo-bar-total"), "foo_bar_total");
    }
}
