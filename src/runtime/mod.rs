//! Program loading and line execution.
//!
//! The [`Runtime`] owns every loaded program. Programs are compiled from
//! `*.lpm` files in parallel, bound to the shared metric [`Store`], and run
//! against each incoming [`LogLine`] by a pool of worker tasks. Lines are
//! sharded onto workers by source path, so lines from one stream are always
//! processed in order.

pub mod code;
pub mod timefmt;
pub mod vm;

use ahash::AHasher;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::compiler::{self, CompileErrors, CompileOptions, Object};
use crate::logline::LogLine;
use crate::metrics::{MetricError, Store};
use crate::telemetry::EngineMetrics;

pub use vm::{ExecutionOutcome, FaultKind, RuntimeFault, Thread, Vm, VmOptions};

/// File extension of program sources.
pub const PROGRAM_EXTENSION: &str = "lpm";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot read program path {path}: {source}")]
    ReadPath {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Compile(CompileErrors),

    #[error("program {program}: {source}")]
    Metric {
        program: String,
        source: MetricError,
    },
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// A program file or a directory of programs.
    pub program_path: Option<PathBuf>,
    pub compile: CompileOptions,
    pub vm: VmOptions,
    /// Number of execution worker tasks.
    pub workers: usize,
    /// Capacity of each worker's line queue.
    pub channel_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            program_path: None,
            compile: CompileOptions::default(),
            vm: VmOptions::default(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            channel_capacity: 1024,
        }
    }
}

/// A compiled program ready to run.
#[derive(Debug)]
pub struct LoadedProgram {
    pub name: String,
    pub vm: Vm,
    pub source_hash: u64,
    pub loaded_at: DateTime<Utc>,
}

/// What one call to [`Runtime::load_all`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub unloaded: usize,
}

#[derive(Default)]
struct Programs {
    by_name: BTreeMap<String, Arc<LoadedProgram>>,
    /// Copy of `by_name` values handed to workers without holding the lock.
    snapshot: Arc<Vec<Arc<LoadedProgram>>>,
    /// Last compile error per program name.
    errors: BTreeMap<String, String>,
    /// Source hashes of programs that failed, to avoid recompiling them.
    failed_hashes: BTreeMap<String, u64>,
}

impl Programs {
    fn refresh_snapshot(&mut self) {
        self.snapshot = Arc::new(self.by_name.values().cloned().collect());
    }
}

fn source_hash(source: &str) -> u64 {
    let mut hasher = AHasher::default();
    source.hash(&mut hasher);
    hasher.finish()
}

fn is_program_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    !hidden
        && path.extension().and_then(|e| e.to_str()) == Some(PROGRAM_EXTENSION)
        && path.is_file()
}

/// Lists program files under `path`, sorted by name.
pub fn discover_programs(path: &Path) -> Result<Vec<PathBuf>, RuntimeError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = std::fs::read_dir(path).map_err(|source| RuntimeError::ReadPath {
        path: path.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_program_file(p))
        .collect();
    files.sort();
    Ok(files)
}

fn program_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Loaded programs plus the machinery to run them.
pub struct Runtime {
    store: Arc<Store>,
    telemetry: EngineMetrics,
    options: RuntimeOptions,
    programs: RwLock<Programs>,
}

impl Runtime {
    pub fn new(store: Arc<Store>, telemetry: EngineMetrics, options: RuntimeOptions) -> Self {
        Self {
            store,
            telemetry,
            options,
            programs: RwLock::new(Programs::default()),
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Loads or reloads every program under the configured program path.
    ///
    /// Only sources whose content changed are recompiled. Programs whose file
    /// disappeared are unloaded; their metrics stay in the store.
    #[instrument(skip(self))]
    pub fn load_all(&self) -> Result<LoadSummary, RuntimeError> {
        let mut summary = LoadSummary::default();
        let Some(path) = self.options.program_path.clone() else {
            return Ok(summary);
        };

        let files = discover_programs(&path)?;
        let mut sources = Vec::with_capacity(files.len());
        for file in &files {
            match std::fs::read_to_string(file) {
                Ok(source) => sources.push((program_name(file), source)),
                Err(e) => {
                    warn!("Failed to read program {}: {}", file.display(), e);
                    summary.failed += 1;
                }
            }
        }

        let present: Vec<String> = sources.iter().map(|(name, _)| name.clone()).collect();
        let changed: Vec<(String, String, u64)> = {
            let programs = self.read_programs();
            sources
                .into_iter()
                .filter_map(|(name, source)| {
                    let hash = source_hash(&source);
                    let unchanged = programs
                        .by_name
                        .get(&name)
                        .map(|p| p.source_hash == hash)
                        .unwrap_or(false)
                        || programs.failed_hashes.get(&name) == Some(&hash);
                    if unchanged {
                        debug!("Program {} unchanged, skipping compile", name);
                        summary.unchanged += 1;
                        None
                    } else {
                        Some((name, source, hash))
                    }
                })
                .collect()
        };

        debug!("Compiling {} changed program(s)", changed.len());
        let compile_options = &self.options.compile;
        let compiled: Vec<(String, u64, Result<Object, CompileErrors>)> = changed
            .into_par_iter()
            .map(|(name, source, hash)| {
                let result = compiler::compile(&name, &source, compile_options);
                (name, hash, result)
            })
            .collect();

        for (name, hash, result) in compiled {
            match result.map_err(RuntimeError::Compile).and_then(|obj| self.install(obj, hash)) {
                Ok(()) => summary.loaded += 1,
                Err(e) => {
                    self.record_failure(&name, hash, &e);
                    summary.failed += 1;
                }
            }
        }

        let stale: Vec<String> = self
            .read_programs()
            .by_name
            .keys()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if self.unload(&name) {
                summary.unloaded += 1;
            }
        }

        info!(
            "Programs: {} loaded, {} unchanged, {} failed, {} unloaded",
            summary.loaded, summary.unchanged, summary.failed, summary.unloaded
        );
        Ok(summary)
    }

    /// Compiles and installs one program from source.
    pub fn load_program(&self, name: &str, source: &str) -> Result<(), RuntimeError> {
        let hash = source_hash(source);
        let result = compiler::compile(name, source, &self.options.compile)
            .map_err(RuntimeError::Compile)
            .and_then(|obj| self.install(obj, hash));
        if let Err(e) = &result {
            self.record_failure(name, hash, e);
        }
        result
    }

    /// Registers the program's metrics and swaps it in. A failed registration
    /// leaves the store as it was before the call.
    fn install(&self, mut obj: Object, hash: u64) -> Result<(), RuntimeError> {
        let mut added = Vec::with_capacity(obj.metrics.len());
        for metric in obj.metrics.iter_mut() {
            let previous = self.store.find(&metric.name, &metric.program);
            match self.store.add(metric.clone()) {
                Ok(registered) => {
                    *metric = registered.clone();
                    added.push((registered, previous));
                }
                Err(source) => {
                    for (registered, previous) in added.into_iter().rev() {
                        self.store.rollback(&registered, previous);
                    }
                    return Err(RuntimeError::Metric {
                        program: obj.name.clone(),
                        source,
                    });
                }
            }
        }

        let name = obj.name.clone();
        let program = Arc::new(LoadedProgram {
            name: name.clone(),
            vm: Vm::new(obj, self.options.vm.clone()),
            source_hash: hash,
            loaded_at: Utc::now(),
        });

        let mut programs = self.write_programs();
        programs.by_name.insert(name.clone(), program);
        programs.errors.remove(&name);
        programs.failed_hashes.remove(&name);
        programs.refresh_snapshot();
        drop(programs);

        self.telemetry
            .prog_loads_total
            .with_label_values(&[name.as_str()])
            .inc();
        info!("Loaded program {}", name);
        Ok(())
    }

    fn record_failure(&self, name: &str, hash: u64, err: &RuntimeError) {
        error!("Failed to load program {}: {}", name, err);
        self.telemetry
            .prog_load_errors_total
            .with_label_values(&[name])
            .inc();
        let mut programs = self.write_programs();
        programs.errors.insert(name.to_string(), err.to_string());
        programs.failed_hashes.insert(name.to_string(), hash);
    }

    /// Removes a program. Returns whether it was loaded.
    pub fn unload(&self, name: &str) -> bool {
        let mut programs = self.write_programs();
        programs.errors.remove(name);
        programs.failed_hashes.remove(name);
        let removed = programs.by_name.remove(name).is_some();
        if removed {
            programs.refresh_snapshot();
            info!("Unloaded program {}", name);
        }
        removed
    }

    /// The currently loaded programs, sorted by name.
    pub fn programs(&self) -> Arc<Vec<Arc<LoadedProgram>>> {
        self.read_programs().snapshot.clone()
    }

    /// Compile errors of programs that failed their last load.
    pub fn load_errors(&self) -> BTreeMap<String, String> {
        self.read_programs().errors.clone()
    }

    fn read_programs(&self) -> std::sync::RwLockReadGuard<'_, Programs> {
        self.programs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_programs(&self) -> std::sync::RwLockWriteGuard<'_, Programs> {
        self.programs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs every loaded program against `line`, reusing `thread`.
    ///
    /// Returns the number of programs that faulted.
    pub fn process_line(&self, thread: &mut Thread, line: &LogLine) -> usize {
        if line.eof {
            return 0;
        }
        self.telemetry.lines_total.inc();
        let programs = self.programs();
        let mut faults = 0;
        for program in programs.iter() {
            if let Err(fault) = program.vm.execute(thread, line) {
                debug!("{} on line {:?} from {}", fault, line.line, line.filename);
                self.telemetry
                    .prog_runtime_errors_total
                    .with_label_values(&[program.name.as_str()])
                    .inc();
                faults += 1;
            }
        }
        faults
    }

    /// Starts the dispatcher and worker pool consuming `lines`.
    ///
    /// The returned task finishes once `lines` is closed and every worker has
    /// drained its queue.
    pub fn spawn_workers(self: &Arc<Self>, mut lines: mpsc::Receiver<LogLine>) -> JoinHandle<()> {
        let n = self.options.workers.max(1);
        let capacity = self.options.channel_capacity.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for id in 0..n {
            let (tx, mut rx) = mpsc::channel::<LogLine>(capacity);
            senders.push(tx);
            let runtime = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                let mut thread = Thread::new();
                let mut processed: u64 = 0;
                while let Some(line) = rx.recv().await {
                    runtime.process_line(&mut thread, &line);
                    processed += 1;
                }
                debug!("Execution worker {} exiting after {} lines", id, processed);
            }));
        }
        info!("Started {} execution worker(s)", n);

        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let mut hasher = AHasher::default();
                line.filename.hash(&mut hasher);
                let shard = (hasher.finish() % n as u64) as usize;
                if senders[shard].send(line).await.is_err() {
                    warn!("Execution worker {} is gone, dropping line", shard);
                }
            }
            drop(senders);
            for worker in workers {
                if let Err(e) = worker.await {
                    error!("Execution worker failed: {}", e);
                }
            }
            debug!("Line dispatcher finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DatumValue;
    use std::fs;

    fn runtime(dir: Option<&Path>) -> (Arc<Store>, Runtime) {
        let store = Arc::new(Store::new());
        let options = RuntimeOptions {
            program_path: dir.map(Path::to_path_buf),
            workers: 2,
            ..RuntimeOptions::default()
        };
        let rt = Runtime::new(store.clone(), EngineMetrics::unregistered(), options);
        (store, rt)
    }

    fn counter_value(store: &Store, name: &str, prog: &str) -> DatumValue {
        store
            .find(name, prog)
            .unwrap()
            .get_datum(&[])
            .unwrap()
            .value()
    }

    #[test]
    fn test_discover_skips_hidden_and_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.lpm"), "").unwrap();
        fs::write(dir.path().join("a.lpm"), "").unwrap();
        fs::write(dir.path().join(".hidden.lpm"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let names: Vec<String> = discover_programs(dir.path())
            .unwrap()
            .iter()
            .map(|p| program_name(p))
            .collect();
        assert_eq!(names, vec!["a.lpm", "b.lpm"]);
    }

    #[test]
    fn test_bad_program_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.lpm"), "counter ok\n/x/ {\n ok++\n}\n").unwrap();
        fs::write(dir.path().join("bad.lpm"), "counter\n").unwrap();
        let (_, rt) = runtime(Some(dir.path()));

        let summary = rt.load_all().unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(rt.programs().len(), 1);
        assert!(rt.load_errors()["bad.lpm"].contains("bad.lpm:"));
    }

    #[test]
    fn test_reload_only_changed_and_unload_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.lpm");
        let b = dir.path().join("b.lpm");
        fs::write(&a, "counter a\n").unwrap();
        fs::write(&b, "counter b\n").unwrap();
        let (store, rt) = runtime(Some(dir.path()));
        assert_eq!(rt.load_all().unwrap().loaded, 2);

        let again = rt.load_all().unwrap();
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.loaded, 0);

        fs::write(&a, "counter a\ncounter a2\n").unwrap();
        fs::remove_file(&b).unwrap();
        let summary = rt.load_all().unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.unloaded, 1);
        let names: Vec<String> = rt.programs().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["a.lpm"]);
        assert!(store.find("a2", "a.lpm").is_some());
    }

    #[test]
    fn test_reload_keeps_metric_data() {
        let (store, rt) = runtime(None);
        rt.load_program("p.lpm", "counter hits\n/hit/ {\n hits++\n}\n").unwrap();
        let mut thread = Thread::new();
        rt.process_line(&mut thread, &LogLine::new("f", "hit"));
        rt.load_program("p.lpm", "counter hits\n/hit|HIT/ {\n hits++\n}\n").unwrap();
        rt.process_line(&mut thread, &LogLine::new("f", "HIT"));
        assert_eq!(counter_value(&store, "hits", "p.lpm"), DatumValue::Int(2));
    }

    #[test]
    fn test_failed_install_leaves_no_metrics_behind() {
        let (store, rt) = runtime(None);
        rt.load_program("a.lpm", "gauge shared\n").unwrap();
        let err = rt
            .load_program("b.lpm", "counter mine\ncounter shared\n")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Metric { .. }));
        assert!(store.find("mine", "b.lpm").is_none());
        assert!(store.find("shared", "b.lpm").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(rt.programs().len(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_previous_metrics() {
        let (store, rt) = runtime(None);
        rt.load_program("a.lpm", "gauge shared\n").unwrap();
        rt.load_program("b.lpm", "counter mine\n/x/ {\n mine++\n}\n").unwrap();
        let mut thread = Thread::new();
        rt.process_line(&mut thread, &LogLine::new("f", "x"));
        let before = store.find("mine", "b.lpm").unwrap();

        let err = rt.load_program("b.lpm", "counter mine by k\ncounter shared\n");
        assert!(err.is_err());
        let after = store.find("mine", "b.lpm").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(counter_value(&store, "mine", "b.lpm"), DatumValue::Int(1));

        rt.process_line(&mut thread, &LogLine::new("f", "x"));
        assert_eq!(counter_value(&store, "mine", "b.lpm"), DatumValue::Int(2));
    }

    #[test]
    fn test_process_line_counts_faults_and_skips_eof() {
        let (store, rt) = runtime(None);
        rt.load_program("div.lpm", "counter c\n/(\\d+)/ {\n c += 10 / $1\n}\n").unwrap();
        rt.load_program("ok.lpm", "counter n\n/./ {\n n++\n}\n").unwrap();
        let mut thread = Thread::new();
        assert_eq!(rt.process_line(&mut thread, &LogLine::new("f", "0")), 1);
        assert_eq!(rt.process_line(&mut thread, &LogLine::new("f", "5")), 0);
        assert_eq!(rt.process_line(&mut thread, &LogLine::eof("f")), 0);
        assert_eq!(counter_value(&store, "c", "div.lpm"), DatumValue::Int(2));
        assert_eq!(counter_value(&store, "n", "ok.lpm"), DatumValue::Int(2));
        assert_eq!(
            rt.telemetry
                .prog_runtime_errors_total
                .with_label_values(&["div.lpm"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_workers_drain_all_lines() {
        let (store, rt) = runtime(None);
        rt.load_program("count.lpm", "counter lines by file\nlines[getfilename()]++\n")
            .unwrap();
        let rt = Arc::new(rt);
        let (tx, rx) = mpsc::channel(16);
        let done = rt.spawn_workers(rx);
        for i in 0..100 {
            let file = if i % 2 == 0 { "a.log" } else { "b.log" };
            tx.send(LogLine::new(file, format!("line {}", i))).await.unwrap();
        }
        drop(tx);
        done.await.unwrap();

        let metric = store.find("lines", "count.lpm").unwrap();
        for file in ["a.log", "b.log"] {
            let d = metric.get_datum(&[file.to_string()]).unwrap();
            assert_eq!(d.get_int().unwrap(), 50);
        }
    }
}
