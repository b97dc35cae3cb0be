//! The per-engine metric registry.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Metric, MetricError};

/// Concurrency-safe registry of metrics, keyed by exported name.
///
/// Several programs may export metrics under the same name as long as they
/// agree on the kind; each name maps to one entry per declaring program.
#[derive(Debug, Default)]
pub struct Store {
    families: DashMap<String, Vec<Arc<Metric>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `metric` and returns the instance programs should write to.
    ///
    /// If the declaring program already registered a metric of the same name
    /// and shape, the existing instance is returned and its data survives the
    /// reload. A changed shape replaces the old instance.
    pub fn add(&self, metric: Arc<Metric>) -> Result<Arc<Metric>, MetricError> {
        let mut family = self.families.entry(metric.name.clone()).or_default();

        if let Some(existing) = family.iter().find(|m| m.program != metric.program) {
            if existing.kind != metric.kind {
                return Err(MetricError::KindConflict {
                    name: metric.name.clone(),
                    existing: existing.kind,
                    requested: metric.kind,
                });
            }
        }

        if let Some(pos) = family.iter().position(|m| m.program == metric.program) {
            if family[pos].same_shape(&metric) {
                debug!(
                    "Keeping existing metric {} for program {}",
                    metric.name, metric.program
                );
                return Ok(family[pos].clone());
            }
            debug!(
                "Replacing metric {} for program {} after shape change",
                metric.name, metric.program
            );
            family[pos] = metric.clone();
            return Ok(metric);
        }

        family.push(metric.clone());
        Ok(metric)
    }

    /// Undoes an `add` of `metric`: puts back `previous`, the instance the
    /// program had registered before, or drops the entry if there was none.
    pub fn rollback(&self, metric: &Metric, previous: Option<Arc<Metric>>) {
        let Some(mut family) = self.families.get_mut(&metric.name) else {
            return;
        };
        let pos = family.iter().position(|m| m.program == metric.program);
        match (pos, previous) {
            (Some(pos), Some(previous)) => family[pos] = previous,
            (Some(pos), None) => {
                family.remove(pos);
            }
            (None, Some(previous)) => family.push(previous),
            (None, None) => {}
        }
        let empty = family.is_empty();
        drop(family);
        if empty {
            self.families.remove_if(&metric.name, |_, family| family.is_empty());
        }
    }

    /// Looks up the metric `name` declared by `program`.
    pub fn find(&self, name: &str, program: &str) -> Option<Arc<Metric>> {
        self.families
            .get(name)
            .and_then(|family| family.iter().find(|m| m.program == program).cloned())
    }

    /// All metrics, sorted by name then program.
    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        let mut all: Vec<Arc<Metric>> = self
            .families
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.program.cmp(&b.program)));
        all
    }

    /// Visits every metric in export order.
    pub fn range<F: FnMut(&Arc<Metric>)>(&self, mut f: F) {
        for m in self.metrics() {
            f(&m);
        }
    }

    /// Removes expired label tuples from every metric.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.range(|m| removed += m.gc(now));
        if removed > 0 {
            debug!("Metric store gc removed {} expired label sets", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.families.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.families.clear();
    }
}
