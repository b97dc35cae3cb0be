//! Typed storage cells behind one (metric, label tuple) pair.
//!
//! A `Datum` is allocated once per label tuple and only ever mutated in place,
//! so readers holding an `Arc<Datum>` always observe the live cell. Integer and
//! float cells are lock-free atomics; text and histogram cells use a short
//! internal lock.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::MetricError;

/// A histogram bucket range, `min <= v < max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn contains(&self, v: f64) -> bool {
        self.min <= v && v < self.max
    }
}

/// Builds the bucket ranges for a histogram declared with `boundaries`.
///
/// Consecutive boundaries form the ranges, and a final range runs from the
/// last boundary to +Inf.
pub fn ranges_from_boundaries(boundaries: &[f64]) -> Vec<Range> {
    let mut ranges: Vec<Range> = boundaries
        .windows(2)
        .map(|w| Range {
            min: w[0],
            max: w[1],
        })
        .collect();
    if let Some(last) = boundaries.last() {
        ranges.push(Range {
            min: *last,
            max: f64::INFINITY,
        });
    }
    ranges
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    pub range: Range,
    pub count: u64,
}

/// Histogram state: per-range counts plus total count and sum.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Buckets {
    pub buckets: Vec<BucketCount>,
    pub count: u64,
    pub sum: f64,
}

impl Buckets {
    fn new(ranges: &[Range]) -> Self {
        Self {
            buckets: ranges
                .iter()
                .map(|r| BucketCount {
                    range: *r,
                    count: 0,
                })
                .collect(),
            count: 0,
            sum: 0.0,
        }
    }

    /// Records one observation. Values below the first range are counted in it.
    pub fn observe(&mut self, v: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|b| b.range.contains(v))
            .or_else(|| {
                self.buckets
                    .first()
                    .filter(|b| v < b.range.min)
                    .map(|_| 0)
            });
        if let Some(i) = idx {
            self.buckets[i].count += 1;
        }
        self.count += 1;
        self.sum += v;
    }

    /// Cumulative counts keyed by each range's upper bound.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        self.buckets
            .iter()
            .map(|b| {
                total += b.count;
                (b.range.max, total)
            })
            .collect()
    }
}

/// Point-in-time copy of a datum's value, used by exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DatumValue {
    Int(i64),
    Float(f64),
    String(String),
    Buckets(Buckets),
}

impl fmt::Display for DatumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatumValue::Int(v) => write!(f, "{}", v),
            DatumValue::Float(v) => f.write_str(&format_float(*v)),
            DatumValue::String(s) => f.write_str(s),
            DatumValue::Buckets(b) => f.write_str(&format_float(b.sum)),
        }
    }
}

#[derive(Debug)]
enum Cell {
    Int(AtomicI64),
    Float(AtomicU64),
    Text(RwLock<String>),
    Buckets(Mutex<Buckets>),
}

/// A typed, mutable metric cell with the time of its last update.
#[derive(Debug)]
pub struct Datum {
    cell: Cell,
    /// Unix nanoseconds of the last update.
    time: AtomicI64,
}

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Formats a float the way the language prints it: shortest round-trip form.
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{}", v)
    }
}

impl Datum {
    fn with_cell(cell: Cell) -> Self {
        Self {
            cell,
            time: AtomicI64::new(nanos(Utc::now())),
        }
    }

    pub fn new_int() -> Self {
        Self::with_cell(Cell::Int(AtomicI64::new(0)))
    }

    pub fn new_float() -> Self {
        Self::with_cell(Cell::Float(AtomicU64::new(0f64.to_bits())))
    }

    pub fn new_string() -> Self {
        Self::with_cell(Cell::Text(RwLock::new(String::new())))
    }

    pub fn new_buckets(ranges: &[Range]) -> Self {
        Self::with_cell(Cell::Buckets(Mutex::new(Buckets::new(ranges))))
    }

    fn kind_name(&self) -> &'static str {
        match self.cell {
            Cell::Int(_) => "int",
            Cell::Float(_) => "float",
            Cell::Text(_) => "string",
            Cell::Buckets(_) => "buckets",
        }
    }

    fn touch(&self, t: DateTime<Utc>) {
        self.time.store(nanos(t), Ordering::Relaxed);
    }

    /// Time of the last update.
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.time.load(Ordering::Relaxed))
    }

    fn add_float(cell: &AtomicU64, delta: f64) {
        let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
    }

    pub fn set_int(&self, v: i64, t: DateTime<Utc>) -> Result<(), MetricError> {
        match &self.cell {
            Cell::Int(c) => c.store(v, Ordering::Release),
            Cell::Float(c) => c.store((v as f64).to_bits(), Ordering::Release),
            Cell::Buckets(b) => lock_buckets(b).observe(v as f64),
            Cell::Text(s) => *write_text(s) = v.to_string(),
        }
        self.touch(t);
        Ok(())
    }

    pub fn set_float(&self, v: f64, t: DateTime<Utc>) -> Result<(), MetricError> {
        match &self.cell {
            Cell::Int(c) => c.store(v as i64, Ordering::Release),
            Cell::Float(c) => c.store(v.to_bits(), Ordering::Release),
            Cell::Buckets(b) => lock_buckets(b).observe(v),
            Cell::Text(s) => *write_text(s) = format_float(v),
        }
        self.touch(t);
        Ok(())
    }

    pub fn set_string(&self, v: &str, t: DateTime<Utc>) -> Result<(), MetricError> {
        match &self.cell {
            Cell::Text(s) => *write_text(s) = v.to_string(),
            _ => {
                return Err(MetricError::TypeMismatch {
                    op: "set a string on",
                    datum: self.kind_name(),
                })
            }
        }
        self.touch(t);
        Ok(())
    }

    pub fn inc_int_by(&self, delta: i64, t: DateTime<Utc>) -> Result<(), MetricError> {
        match &self.cell {
            Cell::Int(c) => {
                c.fetch_add(delta, Ordering::AcqRel);
            }
            Cell::Float(c) => Self::add_float(c, delta as f64),
            _ => {
                return Err(MetricError::TypeMismatch {
                    op: "increment",
                    datum: self.kind_name(),
                })
            }
        }
        self.touch(t);
        Ok(())
    }

    pub fn inc_float_by(&self, delta: f64, t: DateTime<Utc>) -> Result<(), MetricError> {
        match &self.cell {
            Cell::Int(c) => {
                c.fetch_add(delta as i64, Ordering::AcqRel);
            }
            Cell::Float(c) => Self::add_float(c, delta),
            _ => {
                return Err(MetricError::TypeMismatch {
                    op: "increment",
                    datum: self.kind_name(),
                })
            }
        }
        self.touch(t);
        Ok(())
    }

    pub fn get_int(&self) -> Result<i64, MetricError> {
        match &self.cell {
            Cell::Int(c) => Ok(c.load(Ordering::Acquire)),
            Cell::Float(c) => Ok(f64::from_bits(c.load(Ordering::Acquire)) as i64),
            Cell::Buckets(b) => Ok(lock_buckets(b).count as i64),
            Cell::Text(_) => Err(MetricError::TypeMismatch {
                op: "read an integer from",
                datum: self.kind_name(),
            }),
        }
    }

    pub fn get_float(&self) -> Result<f64, MetricError> {
        match &self.cell {
            Cell::Int(c) => Ok(c.load(Ordering::Acquire) as f64),
            Cell::Float(c) => Ok(f64::from_bits(c.load(Ordering::Acquire))),
            Cell::Buckets(b) => Ok(lock_buckets(b).sum),
            Cell::Text(_) => Err(MetricError::TypeMismatch {
                op: "read a float from",
                datum: self.kind_name(),
            }),
        }
    }

    /// The value rendered as text. Histograms render their sum.
    pub fn value_string(&self) -> String {
        self.value().to_string()
    }

    pub fn value(&self) -> DatumValue {
        match &self.cell {
            Cell::Int(c) => DatumValue::Int(c.load(Ordering::Acquire)),
            Cell::Float(c) => DatumValue::Float(f64::from_bits(c.load(Ordering::Acquire))),
            Cell::Text(s) => DatumValue::String(
                s.read().unwrap_or_else(|e| e.into_inner()).clone(),
            ),
            Cell::Buckets(b) => DatumValue::Buckets(lock_buckets(b).clone()),
        }
    }
}

fn lock_buckets(b: &Mutex<Buckets>) -> std::sync::MutexGuard<'_, Buckets> {
    b.lock().unwrap_or_else(|e| e.into_inner())
}

fn write_text(s: &RwLock<String>) -> std::sync::RwLockWriteGuard<'_, String> {
    s.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_int_datum_set_and_increment() {
        let d = Datum::new_int();
        let t = Utc.timestamp_opt(10, 0).unwrap();
        d.set_int(5, t).unwrap();
        d.inc_int_by(3, t).unwrap();
        assert_eq!(d.get_int().unwrap(), 8);
        assert_eq!(d.time(), t);
        assert_eq!(d.value_string(), "8");
    }

    #[test]
    fn test_float_datum_accumulates() {
        let d = Datum::new_float();
        let t = Utc::now();
        d.inc_float_by(0.5, t).unwrap();
        d.inc_int_by(1, t).unwrap();
        assert_eq!(d.get_float().unwrap(), 1.5);
        assert_eq!(d.value_string(), "1.5");
    }

    #[test]
    fn test_string_datum_rejects_increment() {
        let d = Datum::new_string();
        d.set_string("hello", Utc::now()).unwrap();
        assert_eq!(d.value(), DatumValue::String("hello".into()));
        assert!(d.inc_int_by(1, Utc::now()).is_err());
        assert!(Datum::new_int().set_string("x", Utc::now()).is_err());
    }

    #[test]
    fn test_histogram_observe_and_cumulative() {
        let ranges = ranges_from_boundaries(&[0.0, 1.0, 2.0, 4.0]);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3].max, f64::INFINITY);

        let d = Datum::new_buckets(&ranges);
        let t = Utc::now();
        for v in [0.5, 1.5, 1.7, 3.0, 10.0, -1.0] {
            d.set_float(v, t).unwrap();
        }
        let DatumValue::Buckets(b) = d.value() else {
            panic!("expected buckets");
        };
        assert_eq!(b.count, 6);
        assert!((b.sum - 15.7).abs() < 1e-9);
        assert_eq!(
            b.cumulative(),
            vec![(1.0, 2), (2.0, 4), (4.0, 5), (f64::INFINITY, 6)]
        );
    }

    #[test]
    fn test_histogram_value_string_is_sum() {
        let d = Datum::new_buckets(&ranges_from_boundaries(&[0.0, 1.0]));
        d.set_float(3.1, Utc::now()).unwrap();
        assert_eq!(d.value_string(), "3.1");
    }

    #[test]
    fn test_concurrent_increments_are_atomic() {
        let d = Arc::new(Datum::new_int());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = d.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        d.inc_int_by(1, Utc::now()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(d.get_int().unwrap(), 8000);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(0.25), "0.25");
        assert_eq!(format_float(f64::INFINITY), "+Inf");
    }
}
