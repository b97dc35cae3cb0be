//! JSON dump of every metric, grouped by name.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ExportError;
use crate::metrics::{Kind, LabelSet, Metric, ValueType};

#[derive(Debug, Serialize)]
struct MetricEntry<'a> {
    program: &'a str,
    kind: Kind,
    #[serde(rename = "type")]
    value_type: ValueType,
    keys: &'a [String],
    #[serde(skip_serializing_if = "str::is_empty")]
    source: &'a str,
    label_values: Vec<LabelSet>,
}

pub(super) fn render(metrics: &[Arc<Metric>], now: DateTime<Utc>) -> Result<String, ExportError> {
    let mut by_name: BTreeMap<&str, Vec<MetricEntry<'_>>> = BTreeMap::new();
    for m in metrics {
        by_name.entry(&m.name).or_default().push(MetricEntry {
            program: &m.program,
            kind: m.kind,
            value_type: m.value_type,
            keys: &m.keys,
            source: &m.source,
            label_values: m.snapshot(now),
        });
    }
    Ok(serde_json::to_string_pretty(&by_name)?)
}
