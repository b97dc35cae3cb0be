//! One running log-metrics engine.
//!
//! The [`Engine`] owns a metric store, a telemetry registry, the program
//! runtime with its worker pool, and the tailer. It runs the periodic loops
//! (log discovery, program reload, stale stream gc, expired metric gc) and
//! shuts them all down in order: loops first, then streams, then the
//! execution workers once the line channel is drained.

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exporter::{ExportError, Exporter, ExporterOptions, Format};
use crate::metrics::Store;
use crate::runtime::{LoadSummary, Runtime, RuntimeError, RuntimeOptions};
use crate::tailer::{StreamError, Tailer, TailerOptions};
use crate::telemetry::EngineMetrics;
use crate::waker::Waker;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to register engine metrics: {0}")]
    Telemetry(#[from] prometheus::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Log globs and socket URLs to read.
    pub logs: Vec<String>,
    pub runtime: RuntimeOptions,
    pub tailer: TailerOptions,
    pub exporter: ExporterOptions,
    /// Interval of log discovery and program reload checks. Zero disables
    /// both loops.
    pub poll_interval: Duration,
    /// Interval between read cycles of every stream.
    pub poll_log_interval: Duration,
    pub stale_log_gc_interval: Duration,
    pub expired_metrics_gc_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            logs: Vec::new(),
            runtime: RuntimeOptions::default(),
            tailer: TailerOptions::default(),
            exporter: ExporterOptions::default(),
            poll_interval: Duration::from_millis(250),
            poll_log_interval: Duration::from_millis(250),
            stale_log_gc_interval: Duration::from_secs(60 * 60),
            expired_metrics_gc_interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct Engine {
    store: Arc<Store>,
    registry: Registry,
    telemetry: EngineMetrics,
    runtime: Arc<Runtime>,
    tailer: Arc<Tailer>,
    exporter: Exporter,
    options: EngineOptions,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Builds an engine whose streams read every `poll_log_interval`.
    ///
    /// Must be called within a tokio runtime: the execution workers start
    /// immediately.
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let waker = Waker::timed(options.poll_log_interval);
        Self::with_waker(options, waker)
    }

    /// Builds an engine whose streams are driven by `waker`.
    pub fn with_waker(options: EngineOptions, waker: Waker) -> Result<Self, EngineError> {
        let registry = Registry::new();
        let telemetry = EngineMetrics::new(&registry)?;
        let store = Arc::new(Store::new());
        let runtime = Arc::new(Runtime::new(
            store.clone(),
            telemetry.clone(),
            options.runtime.clone(),
        ));

        let (tx, rx) = mpsc::channel(options.runtime.channel_capacity.max(1));
        let dispatcher = runtime.spawn_workers(rx);
        let tailer = Arc::new(Tailer::new(
            tx,
            waker,
            telemetry.clone(),
            options.tailer.clone(),
        ));
        for pattern in &options.logs {
            tailer.add_pattern(pattern)?;
        }
        let exporter = Exporter::new(store.clone(), options.exporter.clone());

        Ok(Self {
            store,
            registry,
            telemetry,
            runtime,
            tailer,
            exporter,
            options,
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(Some(dispatcher)),
            started_at: Utc::now(),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn tailer(&self) -> &Arc<Tailer> {
        &self.tailer
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    pub fn telemetry(&self) -> &EngineMetrics {
        &self.telemetry
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Loads or reloads programs from the configured program path.
    pub fn load_programs(&self) -> Result<LoadSummary, EngineError> {
        Ok(self.runtime.load_all()?)
    }

    /// Runs one discovery pass and one gc pass over the streams.
    pub async fn poll_logs(&self) -> usize {
        let started = self.tailer.poll().await;
        self.tailer.gc().await;
        started
    }

    /// Removes expired label sets from the store.
    pub fn gc_metrics(&self) -> usize {
        let removed = self.store.gc();
        self.telemetry.metric_gc_removed_total.inc_by(removed as u64);
        removed
    }

    /// Starts the periodic loops.
    pub fn start(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        if !loops.is_empty() {
            return;
        }

        if !self.options.poll_interval.is_zero() {
            let tailer = self.tailer.clone();
            loops.push(self.spawn_loop("log discovery", self.options.poll_interval, move || {
                let tailer = tailer.clone();
                async move {
                    tailer.poll().await;
                }
            }));

            let runtime = self.runtime.clone();
            loops.push(self.spawn_loop("program reload", self.options.poll_interval, move || {
                let runtime = runtime.clone();
                async move {
                    // Compilation is CPU bound; keep it off the async workers.
                    match tokio::task::spawn_blocking(move || runtime.load_all()).await {
                        Ok(Ok(summary)) if summary.loaded + summary.unloaded > 0 => {
                            info!(
                                "Programs reloaded: {} loaded, {} unloaded, {} failed",
                                summary.loaded, summary.unloaded, summary.failed
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Program reload failed: {}", e),
                        Err(e) => error!("Program reload task failed: {}", e),
                    }
                }
            }));
        }

        if !self.options.stale_log_gc_interval.is_zero() {
            let tailer = self.tailer.clone();
            loops.push(self.spawn_loop(
                "stale log gc",
                self.options.stale_log_gc_interval,
                move || {
                    let tailer = tailer.clone();
                    async move {
                        tailer.gc().await;
                    }
                },
            ));
        }

        if !self.options.expired_metrics_gc_interval.is_zero() {
            let store = self.store.clone();
            let telemetry = self.telemetry.clone();
            loops.push(self.spawn_loop(
                "expired metric gc",
                self.options.expired_metrics_gc_interval,
                move || {
                    let removed = store.gc();
                    telemetry.metric_gc_removed_total.inc_by(removed as u64);
                    async {}
                },
            ));
        }
        info!("Started {} background loop(s)", loops.len());
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("Background loop {} stopped", name);
        })
    }

    /// Reads every log to EOF once and waits until all lines are processed.
    ///
    /// Requires `tailer.one_shot`; streams in follow mode never finish.
    pub async fn run_one_shot(&self) -> Result<(), EngineError> {
        self.tailer.poll().await;
        self.tailer.join().await;
        self.shutdown().await;
        Ok(())
    }

    /// Program metrics in `format`.
    pub fn render(&self, format: Format) -> Result<String, EngineError> {
        Ok(self.exporter.render(format)?)
    }

    /// Program metrics followed by engine telemetry, in Prometheus text.
    pub fn render_metrics(&self) -> Result<String, EngineError> {
        let mut out = self.exporter.render(Format::Prometheus)?;
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        out.push_str(&String::from_utf8_lossy(&buffer));
        Ok(out)
    }

    /// Stops the loops and streams, then waits for the workers to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let loops: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            loops.drain(..).collect()
        };
        for task in loops {
            if let Err(e) = task.await {
                warn!("Background loop failed: {}", e);
            }
        }

        self.tailer.shutdown().await;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!("Line dispatcher failed: {}", e);
            }
            info!("Engine stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn options(progs: &std::path::Path, log: &std::path::Path) -> EngineOptions {
        EngineOptions {
            logs: vec![log.display().to_string()],
            runtime: RuntimeOptions {
                program_path: Some(progs.to_path_buf()),
                workers: 2,
                ..RuntimeOptions::default()
            },
            tailer: TailerOptions {
                one_shot: true,
                ..TailerOptions::default()
            },
            exporter: ExporterOptions {
                hostname: "test".into(),
                ..ExporterOptions::default()
            },
            ..EngineOptions::default()
        }
    }

    #[tokio::test]
    async fn test_one_shot_counts_lines() {
        let dir = tempfile::tempdir().unwrap();
        let progs = dir.path().join("progs");
        fs::create_dir(&progs).unwrap();
        fs::write(
            progs.join("errors.lpm"),
            "counter errors by level\n/^(?P<level>ERROR|WARN) / {\n  errors[$level]++\n}\n",
        )
        .unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "ERROR one\nINFO two\nWARN three\nERROR four\n").unwrap();

        let engine = Engine::new(options(&progs, &log)).unwrap();
        let summary = engine.load_programs().unwrap();
        assert_eq!(summary.loaded, 1);
        engine.run_one_shot().await.unwrap();

        let out = engine.render_metrics().unwrap();
        assert!(out.contains("errors{level=\"ERROR\",prog=\"errors.lpm\"} 2\n"), "{}", out);
        assert!(out.contains("errors{level=\"WARN\",prog=\"errors.lpm\"} 1\n"), "{}", out);
        assert!(out.contains("herakles_log_lines_total 4\n"), "{}", out);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "").unwrap();
        let engine = Engine::new(options(dir.path(), &log)).unwrap();
        engine.start();
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_gc_metrics_counts_removed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "").unwrap();
        let engine = Engine::new(options(dir.path(), &log)).unwrap();
        engine
            .runtime()
            .load_program(
                "exp.lpm",
                "counter seen by id\n/id=(\\d+)/ {\n  seen[$1]++\n  del seen[$1] after 1ms\n}\n",
            )
            .unwrap();
        let mut thread = crate::runtime::Thread::new();
        engine
            .runtime()
            .process_line(&mut thread, &crate::logline::LogLine::new("x", "id=7"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.gc_metrics(), 1);
        assert_eq!(engine.telemetry().metric_gc_removed_total.get(), 1);
        engine.shutdown().await;
    }
}
