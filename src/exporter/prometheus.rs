//! Prometheus text exposition.
//!
//! Program metrics are converted to `MetricFamily` protos, one per exported
//! name, and encoded with the prometheus crate's `TextEncoder`. Programs
//! declaring the same name share a family and are told apart by `prog`.

use ::prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric as ProtoMetric, MetricFamily, MetricType,
};
use ::prometheus::TextEncoder;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{sanitize_name, ExportError, ExporterOptions};
use crate::metrics::{Buckets, DatumValue, Kind, LabelSet, Metric};

fn metric_type(kind: Kind) -> Option<MetricType> {
    match kind {
        Kind::Counter => Some(MetricType::COUNTER),
        Kind::Gauge | Kind::Timer => Some(MetricType::GAUGE),
        Kind::Histogram => Some(MetricType::HISTOGRAM),
        Kind::Text => None,
    }
}

/// Label pairs for one label set, sorted by name.
fn label_pairs(metric: &Metric, set: &LabelSet, options: &ExporterOptions) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = metric
        .keys
        .iter()
        .zip(&set.labels)
        .map(|(k, v)| (sanitize_name(k), v.clone()))
        .collect();
    if options.emit_prog_label {
        pairs.push(("prog".to_string(), metric.program.clone()));
    }
    pairs.sort();
    pairs
}

fn histogram(b: &Buckets) -> Histogram {
    let mut h = Histogram::default();
    h.set_sample_count(b.count);
    h.set_sample_sum(b.sum);
    // The encoder appends the +Inf bucket from the sample count.
    let buckets = b
        .cumulative()
        .into_iter()
        .filter(|(le, _)| le.is_finite())
        .map(|(le, count)| {
            let mut bucket = Bucket::default();
            bucket.set_upper_bound(le);
            bucket.set_cumulative_count(count);
            bucket
        })
        .collect();
    h.set_bucket(buckets);
    h
}

fn proto_metric(
    metric: &Metric,
    set: &LabelSet,
    options: &ExporterOptions,
) -> Option<(Vec<(String, String)>, ProtoMetric)> {
    let pairs = label_pairs(metric, set, options);
    let mut m = ProtoMetric::default();
    m.set_label(
        pairs
            .iter()
            .map(|(k, v)| {
                let mut lp = LabelPair::default();
                lp.set_name(k.clone());
                lp.set_value(v.clone());
                lp
            })
            .collect(),
    );

    let value = match &set.value {
        DatumValue::Int(v) => *v as f64,
        DatumValue::Float(v) => *v,
        DatumValue::Buckets(b) => {
            m.set_histogram(histogram(b));
            0.0
        }
        DatumValue::String(_) => return None,
    };
    match metric.kind {
        Kind::Counter => {
            let mut c = Counter::default();
            c.set_value(value);
            m.set_counter(c);
        }
        Kind::Gauge | Kind::Timer => {
            let mut g = Gauge::default();
            g.set_value(value);
            m.set_gauge(g);
        }
        Kind::Histogram => {}
        Kind::Text => return None,
    }
    if options.emit_metric_timestamp {
        m.set_timestamp_ms(set.time.timestamp_millis());
    }
    Some((pairs, m))
}

/// Builds one family per exported name. `metrics` must be sorted by name.
fn families(
    metrics: &[Arc<Metric>],
    options: &ExporterOptions,
    now: DateTime<Utc>,
) -> Vec<MetricFamily> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < metrics.len() {
        let name = sanitize_name(&metrics[i].name);
        let mut j = i;
        while j < metrics.len() && sanitize_name(&metrics[j].name) == name {
            j += 1;
        }
        let family: Vec<&Arc<Metric>> = metrics[i..j]
            .iter()
            .filter(|m| m.kind != Kind::Text)
            .collect();
        i = j;
        let Some(first) = family.first() else {
            continue;
        };
        let Some(ty) = metric_type(first.kind) else {
            continue;
        };

        let mut rows: Vec<(Vec<(String, String)>, ProtoMetric)> = family
            .iter()
            .filter(|m| m.kind == first.kind)
            .flat_map(|m| {
                m.snapshot(now)
                    .into_iter()
                    .filter_map(|set| proto_metric(m, &set, options))
                    .collect::<Vec<_>>()
            })
            .collect();
        if rows.is_empty() {
            continue;
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mf = MetricFamily::default();
        mf.set_name(name);
        mf.set_help(format!("defined at {}", first.source));
        mf.set_field_type(ty);
        mf.set_metric(rows.into_iter().map(|(_, m)| m).collect());
        out.push(mf);
    }
    out
}

pub(super) fn render(
    metrics: &[Arc<Metric>],
    options: &ExporterOptions,
    now: DateTime<Utc>,
) -> Result<String, ExportError> {
    Ok(TextEncoder::new().encode_to_string(&families(metrics, options, now))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ranges_from_boundaries, ValueType};
    use chrono::TimeZone;

    fn options() -> ExporterOptions {
        ExporterOptions {
            emit_prog_label: true,
            emit_metric_timestamp: false,
            hostname: "gunstar".into(),
            graphite_prefix: String::new(),
        }
    }

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_counter_with_labels() {
        let m = Arc::new(
            Metric::new("foo", "test", Kind::Counter, ValueType::Int, labels(&["a", "b"]))
                .with_source("test.lpm:1:1"),
        );
        let t = Utc.timestamp_opt(1397586900, 0).unwrap();
        m.get_datum(&labels(&["2", "1"])).unwrap().set_int(1, t).unwrap();
        m.get_datum(&labels(&["1", "2"])).unwrap().set_int(3, t).unwrap();

        let out = render(&[m], &options(), t).unwrap();
        assert_eq!(
            out,
            "# HELP foo defined at test.lpm:1:1\n\
             # TYPE foo counter\n\
             foo{a=\"1\",b=\"2\",prog=\"test\"} 3\n\
             foo{a=\"2\",b=\"1\",prog=\"test\"} 1\n"
        );
    }

    #[test]
    fn test_timer_is_gauge_and_text_is_skipped() {
        let timer = Arc::new(Metric::new("latency", "p", Kind::Timer, ValueType::Float, vec![]));
        let text = Arc::new(Metric::new("message", "p", Kind::Text, ValueType::String, vec![]));
        let t = Utc::now();
        timer.get_datum(&[]).unwrap().set_float(0.25, t).unwrap();
        text.get_datum(&[]).unwrap().set_string("hi", t).unwrap();

        let out = render(&[timer, text], &options(), t).unwrap();
        assert!(out.contains("# TYPE latency gauge\n"));
        assert!(out.contains("latency{prog=\"p\"} 0.25\n"));
        assert!(!out.contains("message"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let m = Arc::new(
            Metric::new("req_ms", "p", Kind::Histogram, ValueType::Float, vec![])
                .with_buckets(ranges_from_boundaries(&[0.0, 10.0, 100.0])),
        );
        let d = m.get_datum(&[]).unwrap();
        let t = Utc::now();
        for v in [1.0, 5.0, 50.0, 500.0] {
            d.set_float(v, t).unwrap();
        }

        let mut opts = options();
        opts.emit_prog_label = false;
        let out = render(&[m], &opts, t).unwrap();
        assert!(out.contains("# TYPE req_ms histogram\n"));
        assert!(out.contains("req_ms_bucket{le=\"10\"} 2\n"), "{}", out);
        assert!(out.contains("req_ms_bucket{le=\"100\"} 3\n"));
        assert!(out.contains("req_ms_bucket{le=\"+Inf\"} 4\n"));
        assert_eq!(out.matches("le=\"+Inf\"").count(), 1);
        assert!(!out.contains("inf\""));
        assert!(out.contains("req_ms_sum 556\n"));
        assert!(out.contains("req_ms_count 4\n"));
    }

    #[test]
    fn test_histogram_le_follows_other_labels() {
        let m = Arc::new(
            Metric::new("size", "p", Kind::Histogram, ValueType::Float, labels(&["method"]))
                .with_buckets(ranges_from_boundaries(&[0.0, 1.0])),
        );
        let t = Utc::now();
        m.get_datum(&labels(&["GET"])).unwrap().set_float(0.5, t).unwrap();

        let out = render(&[m], &options(), t).unwrap();
        assert!(
            out.contains("size_bucket{method=\"GET\",prog=\"p\",le=\"1\"} 1\n"),
            "{}",
            out
        );
        assert!(out.contains("size_count{method=\"GET\",prog=\"p\"} 1\n"));
    }

    #[test]
    fn test_hyphens_escaping_and_timestamps() {
        let m = Arc::new(Metric::new(
            "bytes-total",
            "p",
            Kind::Counter,
            ValueType::Int,
            labels(&["path"]),
        ));
        let t = Utc.timestamp_opt(1, 500_000_000).unwrap();
        m.get_datum(&labels(&["a\"b"])).unwrap().set_int(7, t).unwrap();

        let mut opts = options();
        opts.emit_metric_timestamp = true;
        let out = render(&[m], &opts, t).unwrap();
        assert!(out.contains("bytes_total{path=\"a\\\"b\",prog=\"p\"} 7 1500\n"), "{}", out);
    }

    #[test]
    fn test_programs_share_a_family() {
        let a = Arc::new(Metric::new("hits", "a", Kind::Counter, ValueType::Int, vec![]));
        let b = Arc::new(Metric::new("hits", "b", Kind::Counter, ValueType::Int, vec![]));
        let t = Utc::now();
        a.get_datum(&[]).unwrap().set_int(1, t).unwrap();
        b.get_datum(&[]).unwrap().set_int(2, t).unwrap();

        let out = render(&[a, b], &options(), t).unwrap();
        assert_eq!(out.matches("# TYPE hits counter").count(), 1);
        assert!(out.contains("hits{prog=\"a\"} 1\n"));
        assert!(out.contains("hits{prog=\"b\"} 2\n"));
    }

    #[test]
    fn test_empty_families_are_left_out() {
        let m = Arc::new(Metric::new("unused", "p", Kind::Counter, ValueType::Int, vec![]));
        let out = render(&[m], &options(), Utc::now()).unwrap();
        assert!(out.is_empty(), "{}", out);
    }
}
