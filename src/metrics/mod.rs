//! Metrics declared by programs and the cells that hold their values.
//!
//! A [`Metric`] is immutable after declaration apart from its label map: each
//! label tuple maps to exactly one [`Datum`] for the metric's lifetime. The
//! label map is guarded by a per-metric `RwLock`, so exporters and writers on
//! other metrics never contend.

pub mod datum;
pub mod store;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub use datum::{
    format_float, ranges_from_boundaries, BucketCount, Buckets, Datum, DatumValue, Range,
};
pub use store::Store;

/// Metric kinds supported by the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Counter,
    Gauge,
    Timer,
    Histogram,
    Text,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Timer => "timer",
            Kind::Histogram => "histogram",
            Kind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Value type of a metric's datums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MetricError {
    #[error("metric `{name}' takes {expected} label value(s), got {got}")]
    LabelArity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("metric `{name}' already exists as a {existing}, cannot add it as a {requested}")]
    KindConflict {
        name: String,
        existing: Kind,
        requested: Kind,
    },

    #[error("cannot {op} a {datum} datum")]
    TypeMismatch {
        op: &'static str,
        datum: &'static str,
    },
}

/// A datum plus its optional expiry.
#[derive(Debug, Clone)]
struct LabelValue {
    datum: Arc<Datum>,
    expiry: Option<Duration>,
}

impl LabelValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => {
                let age = now.signed_duration_since(self.datum.time());
                age.to_std().map(|age| age > expiry).unwrap_or(false)
            }
            None => false,
        }
    }
}

/// Exported view of one label tuple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelSet {
    pub labels: Vec<String>,
    pub value: DatumValue,
    pub time: DateTime<Utc>,
}

/// A named metric declared by one program.
#[derive(Debug)]
pub struct Metric {
    pub name: String,
    pub program: String,
    pub kind: Kind,
    pub value_type: ValueType,
    pub keys: Vec<String>,
    pub hidden: bool,
    /// Declaration site, `file:line:col`.
    pub source: String,
    pub buckets: Vec<Range>,
    /// Maximum number of label tuples kept, oldest evicted first.
    pub limit: Option<usize>,
    label_values: RwLock<HashMap<Vec<String>, LabelValue>>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        kind: Kind,
        value_type: ValueType,
        keys: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            kind,
            value_type,
            keys,
            hidden: false,
            source: String::new(),
            buckets: Vec::new(),
            limit: None,
            label_values: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<Range>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    /// True when `other` describes the same storage layout as `self`.
    pub fn same_shape(&self, other: &Metric) -> bool {
        self.kind == other.kind
            && self.value_type == other.value_type
            && self.keys == other.keys
            && self.buckets == other.buckets
    }

    fn new_datum(&self) -> Datum {
        if self.kind == Kind::Histogram {
            return Datum::new_buckets(&self.buckets);
        }
        match self.value_type {
            ValueType::Int => Datum::new_int(),
            ValueType::Float => Datum::new_float(),
            ValueType::String => Datum::new_string(),
        }
    }

    fn check_arity(&self, labels: &[String]) -> Result<(), MetricError> {
        if labels.len() != self.keys.len() {
            return Err(MetricError::LabelArity {
                name: self.name.clone(),
                expected: self.keys.len(),
                got: labels.len(),
            });
        }
        Ok(())
    }

    /// Returns the datum for `labels`, creating it on first use.
    pub fn get_datum(&self, labels: &[String]) -> Result<Arc<Datum>, MetricError> {
        self.check_arity(labels)?;
        {
            let map = self.label_values.read().unwrap_or_else(|e| e.into_inner());
            if let Some(lv) = map.get(labels) {
                return Ok(lv.datum.clone());
            }
        }

        let mut map = self.label_values.write().unwrap_or_else(|e| e.into_inner());
        if let Some(lv) = map.get(labels) {
            return Ok(lv.datum.clone());
        }
        if let Some(limit) = self.limit {
            while map.len() >= limit.max(1) {
                let oldest = map
                    .iter()
                    .min_by_key(|(_, lv)| lv.datum.time())
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        map.remove(&k);
                    }
                    None => break,
                }
            }
        }
        let datum = Arc::new(self.new_datum());
        map.insert(
            labels.to_vec(),
            LabelValue {
                datum: datum.clone(),
                expiry: None,
            },
        );
        Ok(datum)
    }

    /// Removes the datum for `labels`. Returns whether one existed.
    pub fn remove_datum(&self, labels: &[String]) -> Result<bool, MetricError> {
        self.check_arity(labels)?;
        let mut map = self.label_values.write().unwrap_or_else(|e| e.into_inner());
        Ok(map.remove(labels).is_some())
    }

    /// Sets the expiry of the datum for `labels`, creating it if needed.
    pub fn expire_datum(&self, labels: &[String], expiry: Duration) -> Result<(), MetricError> {
        self.get_datum(labels)?;
        let mut map = self.label_values.write().unwrap_or_else(|e| e.into_inner());
        if let Some(lv) = map.get_mut(labels) {
            lv.expiry = Some(expiry);
        }
        Ok(())
    }

    /// Expiry configured for `labels`, if any.
    pub fn expiry(&self, labels: &[String]) -> Option<Duration> {
        let map = self.label_values.read().unwrap_or_else(|e| e.into_inner());
        map.get(labels).and_then(|lv| lv.expiry)
    }

    /// Number of label tuples currently held, including expired ones.
    pub fn len(&self) -> usize {
        self.label_values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all unexpired label tuples, sorted by labels.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<LabelSet> {
        let map = self.label_values.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<LabelSet> = map
            .iter()
            .filter(|(_, lv)| !lv.is_expired(now))
            .map(|(labels, lv)| LabelSet {
                labels: labels.clone(),
                value: lv.datum.value(),
                time: lv.datum.time(),
            })
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        out
    }

    /// Removes expired label tuples, returning how many were dropped.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.label_values.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, lv| !lv.is_expired(now));
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_datum_is_stable() {
        let m = Metric::new("foo", "test", Kind::Counter, ValueType::Int, labels(&["a"]));
        let d1 = m.get_datum(&labels(&["x"])).unwrap();
        let d2 = m.get_datum(&labels(&["x"])).unwrap();
        assert!(Arc::ptr_eq(&d1, &d2));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_get_datum_checks_arity() {
        let m = Metric::new("foo", "test", Kind::Counter, ValueType::Int, labels(&["a", "b"]));
        let err = m.get_datum(&labels(&["x"])).unwrap_err();
        assert_eq!(
            err,
            MetricError::LabelArity {
                name: "foo".into(),
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_histogram_metric_creates_bucket_datum() {
        let m = Metric::new("h", "test", Kind::Histogram, ValueType::Float, vec![])
            .with_buckets(ranges_from_boundaries(&[0.0, 1.0]));
        let d = m.get_datum(&[]).unwrap();
        d.set_float(0.5, Utc::now()).unwrap();
        assert!(matches!(d.value(), DatumValue::Buckets(b) if b.count == 1));
    }

    #[test]
    fn test_expired_label_values_are_hidden_and_collected() {
        let m = Metric::new("foo", "test", Kind::Gauge, ValueType::Int, labels(&["a"]));
        let old = Utc.timestamp_opt(1_000, 0).unwrap();
        let d = m.get_datum(&labels(&["old"])).unwrap();
        d.set_int(1, old).unwrap();
        m.expire_datum(&labels(&["old"]), Duration::from_secs(60))
            .unwrap();
        m.get_datum(&labels(&["fresh"]))
            .unwrap()
            .set_int(2, Utc::now())
            .unwrap();

        let now = Utc::now();
        let snap = m.snapshot(now);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].labels, labels(&["fresh"]));

        assert_eq!(m.gc(now), 1);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_limit_evicts_least_recently_updated() {
        let m = Metric::new("foo", "test", Kind::Counter, ValueType::Int, labels(&["a"]))
            .with_limit(Some(2));
        let t0 = Utc.timestamp_opt(100, 0).unwrap();
        let t1 = Utc.timestamp_opt(200, 0).unwrap();
        m.get_datum(&labels(&["a"])).unwrap().set_int(1, t0).unwrap();
        m.get_datum(&labels(&["b"])).unwrap().set_int(1, t1).unwrap();
        m.get_datum(&labels(&["c"])).unwrap();

        let keys: Vec<_> = m.snapshot(Utc::now()).into_iter().map(|l| l.labels).collect();
        assert_eq!(keys, vec![labels(&["b"]), labels(&["c"])]);
    }

    #[test]
    fn test_remove_datum() {
        let m = Metric::new("foo", "test", Kind::Counter, ValueType::Int, labels(&["a"]));
        m.get_datum(&labels(&["x"])).unwrap();
        assert!(m.remove_datum(&labels(&["x"])).unwrap());
        assert!(!m.remove_datum(&labels(&["x"])).unwrap());
        assert!(m.is_empty());
    }
}
