//! Graphite plaintext protocol: `PATH VALUE TIMESTAMP`.

use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;

use super::{ExportError, ExporterOptions};
use crate::metrics::{format_float, DatumValue, Kind, Metric};

/// Graphite path components may not contain dots or spaces.
fn path_component(s: &str) -> String {
    s.chars()
        .map(|c| if c == '.' || c.is_whitespace() { '_' } else { c })
        .collect()
}

pub(super) fn render(
    metrics: &[Arc<Metric>],
    options: &ExporterOptions,
    now: DateTime<Utc>,
) -> Result<String, ExportError> {
    let mut out = String::new();
    for m in metrics.iter().filter(|m| m.kind != Kind::Text) {
        for set in m.snapshot(now) {
            let mut path = format!(
                "{}{}.{}",
                options.graphite_prefix,
                path_component(&m.program),
                path_component(&m.name)
            );
            for v in &set.labels {
                path.push('.');
                path.push_str(&path_component(v));
            }
            let ts = set.time.timestamp();
            match &set.value {
                DatumValue::Buckets(b) => {
                    for (le, count) in b.cumulative() {
                        let bin = if le.is_infinite() {
                            "inf".to_string()
                        } else {
                            path_component(&format_float(le))
                        };
                        writeln!(out, "{}.bin_{} {} {}", path, bin, count, ts)?;
                    }
                    writeln!(out, "{}.count {} {}", path, b.count, ts)?;
                    writeln!(out, "{}.sum {} {}", path, format_float(b.sum), ts)?;
                }
                value => writeln!(out, "{} {} {}", path, value, ts)?,
            }
        }
    }
    Ok(out)
}
