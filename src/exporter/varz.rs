//! Flat `name{k=v,...} value` text, one line per label set.

use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;

use super::{ExportError, ExporterOptions};
use crate::metrics::Metric;

pub(super) fn render(
    metrics: &[Arc<Metric>],
    options: &ExporterOptions,
    now: DateTime<Utc>,
) -> Result<String, ExportError> {
    let mut out = String::new();
    for m in metrics {
        for set in m.snapshot(now) {
            let mut pairs: Vec<String> = m
                .keys
                .iter()
                .zip(&set.labels)
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.push(format!("prog={}", m.program));
            pairs.push(format!("instance={}", options.hostname));
            writeln!(out, "{}{{{}}} {}", m.name, pairs.join(","), set.value)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Kind, ValueType};

    fn options() -> ExporterOptions {
        ExporterOptions {
            hostname: "gunstar".into(),
            ..ExporterOptions::default()
        }
    }

    #[test]
    fn test_varz_lines() {
        let t = Utc::now();
        let single = Arc::new(Metric::new("foo", "test", Kind::Counter, ValueType::Int, vec![]));
        single.get_datum(&[]).unwrap().set_int(1, t).unwrap();
        let dims = Arc::new(Metric::new(
            "bar",
            "test",
            Kind::Counter,
            ValueType::Int,
            vec!["a".into(), "b".into()],
        ));
        dims.get_datum(&["1".to_string(), "2".to_string()])
            .unwrap()
            .set_int(1, t)
            .unwrap();
        let text = Arc::new(Metric::new("msg", "test", Kind::Text, ValueType::String, vec![]));
        text.get_datum(&[]).unwrap().set_string("hi", t).unwrap();

        let out = render(&[dims, single, text], &options(), t).unwrap();
        assert_eq!(
            out,
            "bar{a=1,b=2,prog=test,instance=gunstar} 1\n\
             foo{prog=test,instance=gunstar} 1\n\
             msg{prog=test,instance=gunstar} hi\n"
        );
    }

    #[test]
    fn test_varz_empty_store() {
        assert_eq!(render(&[], &options(), Utc::now()).unwrap(), "");
    }
}
