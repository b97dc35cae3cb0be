//! Self-monitoring metrics for herakles-log-exporter.
//!
//! These describe the engine itself (lines read, streams opened, program
//! loads and faults) and live on a per-engine registry, never the global
//! one, so several engines can coexist in one process.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Engine self-metrics, cheap to clone.
#[derive(Clone)]
pub struct EngineMetrics {
    // ========== Line Metrics ==========
    pub lines_total: IntCounter,

    // ========== Log Stream Metrics ==========
    pub log_count: IntGauge,
    pub log_opens_total: IntCounterVec,  // labels: log
    pub log_closes_total: IntCounterVec, // labels: log
    pub log_lines_total: IntCounterVec,  // labels: log
    pub log_errors_total: IntCounterVec, // labels: log

    // ========== Program Metrics ==========
    pub prog_loads_total: IntCounterVec,          // labels: prog
    pub prog_load_errors_total: IntCounterVec,    // labels: prog
    pub prog_runtime_errors_total: IntCounterVec, // labels: prog

    // ========== Store Metrics ==========
    pub metric_gc_removed_total: IntCounter,
}

impl EngineMetrics {
    /// Creates and registers all engine metrics with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let lines_total = IntCounter::new(
            "herakles_log_lines_total",
            "Total number of log lines received by the engine",
        )?;

        let log_count = IntGauge::new(
            "herakles_log_log_count",
            "Number of log streams currently being read",
        )?;
        let log_opens_total = IntCounterVec::new(
            Opts::new("herakles_log_log_opens_total", "Number of times a log stream was opened"),
            &["log"],
        )?;
        let log_closes_total = IntCounterVec::new(
            Opts::new("herakles_log_log_closes_total", "Number of times a log stream completed"),
            &["log"],
        )?;
        let log_lines_total = IntCounterVec::new(
            Opts::new("herakles_log_log_lines_total", "Number of lines read per log stream"),
            &["log"],
        )?;
        let log_errors_total = IntCounterVec::new(
            Opts::new("herakles_log_log_errors_total", "Number of read errors per log stream"),
            &["log"],
        )?;

        let prog_loads_total = IntCounterVec::new(
            Opts::new("herakles_log_prog_loads_total", "Number of successful program loads"),
            &["prog"],
        )?;
        let prog_load_errors_total = IntCounterVec::new(
            Opts::new(
                "herakles_log_prog_load_errors_total",
                "Number of program loads that failed to compile",
            ),
            &["prog"],
        )?;
        let prog_runtime_errors_total = IntCounterVec::new(
            Opts::new(
                "herakles_log_prog_runtime_errors_total",
                "Number of lines a program faulted on",
            ),
            &["prog"],
        )?;

        let metric_gc_removed_total = IntCounter::new(
            "herakles_log_metric_gc_removed_total",
            "Number of expired label sets removed from the metric store",
        )?;

        registry.register(Box::new(lines_total.clone()))?;
        registry.register(Box::new(log_count.clone()))?;
        registry.register(Box::new(log_opens_total.clone()))?;
        registry.register(Box::new(log_closes_total.clone()))?;
        registry.register(Box::new(log_lines_total.clone()))?;
        registry.register(Box::new(log_errors_total.clone()))?;
        registry.register(Box::new(prog_loads_total.clone()))?;
        registry.register(Box::new(prog_load_errors_total.clone()))?;
        registry.register(Box::new(prog_runtime_errors_total.clone()))?;
        registry.register(Box::new(metric_gc_removed_total.clone()))?;

        Ok(Self {
            lines_total,
            log_count,
            log_opens_total,
            log_closes_total,
            log_lines_total,
            log_errors_total,
            prog_loads_total,
            prog_load_errors_total,
            prog_runtime_errors_total,
            metric_gc_removed_total,
        })
    }

    /// Metrics on a private registry, for components used standalone.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("fresh registry has no name collisions")
    }
}
