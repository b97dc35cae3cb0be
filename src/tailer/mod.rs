//! Log discovery and stream ownership.
//!
//! The [`Tailer`] expands the configured log patterns, starts a stream for
//! every matching file, pipe or socket that has no live stream yet, and
//! removes completed streams on [`gc`](Tailer::gc). It holds the only strong
//! reference to each stream's state.

pub mod logstream;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use regex::Regex;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::logline::LogLine;
use crate::telemetry::EngineMetrics;
use crate::waker::Waker;
pub use logstream::{
    FilePosition, StartPosition, StreamError, StreamHandle, StreamKind, StreamState,
};
use logstream::{dgram, file, pipe, socket, StreamContext};

#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// Read deadline for sockets and pipes.
    pub read_timeout: Duration,
    /// Streams idle for longer than this are stopped by gc.
    pub stale_timeout: Duration,
    /// Read files found at the first poll from the beginning.
    pub read_from_start: bool,
    /// Read every stream to EOF once, then complete.
    pub one_shot: bool,
    /// File names matching this are never tailed.
    pub ignore: Option<Regex>,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            stale_timeout: Duration::from_secs(24 * 60 * 60),
            read_from_start: false,
            one_shot: false,
            ignore: None,
        }
    }
}

/// A parsed log pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPattern {
    Glob(String),
    Tcp(String),
    Unix(String),
    Udp(String),
    Unixgram(String),
}

impl LogPattern {
    /// Parses a pattern, absolutizing relative globs against the working
    /// directory.
    pub fn parse(pattern: &str) -> Result<Self, StreamError> {
        let socket = |prefix: &str| pattern.strip_prefix(prefix).map(str::to_string);
        if let Some(addr) = socket("tcp://") {
            return Ok(LogPattern::Tcp(addr));
        }
        if let Some(path) = socket("unixgram://") {
            return Ok(LogPattern::Unixgram(path));
        }
        if let Some(path) = socket("unix://") {
            return Ok(LogPattern::Unix(path));
        }
        if let Some(addr) = socket("udp://") {
            return Ok(LogPattern::Udp(addr));
        }
        let path = Path::new(pattern);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        let glob = absolute.to_string_lossy().into_owned();
        glob::Pattern::new(&glob).map_err(|source| StreamError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(LogPattern::Glob(glob))
    }

    /// Key under which this pattern's single stream is tracked, for sockets.
    fn socket_key(&self) -> Option<String> {
        match self {
            LogPattern::Glob(_) => None,
            LogPattern::Tcp(a) => Some(format!("tcp://{}", a)),
            LogPattern::Unix(p) => Some(format!("unix://{}", p)),
            LogPattern::Udp(a) => Some(format!("udp://{}", a)),
            LogPattern::Unixgram(p) => Some(format!("unixgram://{}", p)),
        }
    }
}

#[derive(Debug)]
struct WatchedPattern {
    pattern: LogPattern,
    /// Whether a discovery pass already ran for this pattern.
    polled: bool,
}

/// Owns every log stream.
pub struct Tailer {
    options: TailerOptions,
    waker: Waker,
    telemetry: EngineMetrics,
    lines: Mutex<Option<mpsc::Sender<LogLine>>>,
    patterns: Mutex<Vec<WatchedPattern>>,
    streams: tokio::sync::Mutex<HashMap<String, Arc<StreamState>>>,
    /// Read positions of stopped file streams, by path.
    positions: Mutex<HashMap<String, FilePosition>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Tailer {
    pub fn new(
        lines: mpsc::Sender<LogLine>,
        waker: Waker,
        telemetry: EngineMetrics,
        options: TailerOptions,
    ) -> Self {
        Self {
            options,
            waker,
            telemetry,
            lines: Mutex::new(Some(lines)),
            patterns: Mutex::new(Vec::new()),
            streams: tokio::sync::Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Adds a log pattern. Streams start on the next [`poll`](Self::poll).
    pub fn add_pattern(&self, pattern: &str) -> Result<(), StreamError> {
        let pattern = LogPattern::parse(pattern)?;
        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        if !patterns.iter().any(|w| w.pattern == pattern) {
            debug!("Watching log pattern {:?}", pattern);
            patterns.push(WatchedPattern {
                pattern,
                polled: false,
            });
        }
        Ok(())
    }

    fn context(&self, state: Arc<StreamState>) -> Option<StreamContext> {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        Some(StreamContext {
            state,
            lines,
            waker: self.waker.clone(),
            telemetry: self.telemetry.clone(),
            cancel: self.cancel.child_token(),
            read_timeout: self.options.read_timeout,
            one_shot: self.options.one_shot,
        })
    }

    /// Runs one discovery pass over every pattern.
    ///
    /// Returns the number of streams started.
    #[instrument(skip(self))]
    pub async fn poll(&self) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }
        let work: Vec<(LogPattern, bool)> = {
            let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
            patterns
                .iter_mut()
                .map(|w| {
                    let first = !w.polled;
                    w.polled = true;
                    (w.pattern.clone(), first)
                })
                .collect()
        };

        let mut started = 0;
        for (pattern, first) in work {
            let result = match &pattern {
                LogPattern::Glob(glob) => self.poll_glob(glob, first).await,
                _ => self.poll_socket(&pattern).await.map(usize::from),
            };
            match result {
                Ok(n) => started += n,
                Err(e) => warn!("{}", e),
            }
        }
        let count = self.streams.lock().await.len();
        self.telemetry.log_count.set(count as i64);
        started
    }

    async fn poll_glob(&self, pattern: &str, first: bool) -> Result<usize, StreamError> {
        let paths = glob::glob(pattern).map_err(|source| StreamError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let mut started = 0;
        for path in paths.filter_map(|p| p.ok()) {
            if self.is_ignored(&path) {
                debug!("Ignoring {}", path.display());
                continue;
            }
            let start = if first && !self.options.read_from_start && !self.options.one_shot {
                StartPosition::End
            } else {
                StartPosition::Beginning
            };
            match self.start_path(&path, start).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("{}", e);
                    self.telemetry
                        .log_errors_total
                        .with_label_values(&[path.to_string_lossy().as_ref()])
                        .inc();
                }
            }
        }
        Ok(started)
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let Some(ignore) = &self.options.ignore else {
            return false;
        };
        path.file_name()
            .map(|n| ignore.is_match(&n.to_string_lossy()))
            .unwrap_or(false)
    }

    fn remember_position(&self, source: &str, state: &StreamState) {
        if let Some(position) = state.resume_position() {
            self.positions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(source.to_string(), position);
        }
    }

    /// Start position for a file that had a stopped stream, if the same
    /// file is still at `key`.
    fn resume_from(&self, key: &str, meta: &std::fs::Metadata) -> Option<StartPosition> {
        use std::os::unix::fs::MetadataExt;
        let position = self
            .positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)?;
        if position.dev != meta.dev() || position.ino != meta.ino() {
            return None;
        }
        if position.offset > meta.len() {
            return Some(StartPosition::Beginning);
        }
        Some(StartPosition::At(position.offset))
    }

    /// Starts a stream for `path` unless a live one exists.
    async fn start_path(&self, path: &Path, start: StartPosition) -> Result<bool, StreamError> {
        let key = path.to_string_lossy().into_owned();
        let mut streams = self.streams.lock().await;
        match streams.get(&key) {
            Some(s) if !s.is_complete() => return Ok(false),
            Some(s) => self.remember_position(&key, s),
            None => {}
        }
        let meta = std::fs::metadata(path).map_err(|source| StreamError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file_type = meta.file_type();
        if file_type.is_dir() {
            return Ok(false);
        }

        let (state, handle) = if file_type.is_fifo() {
            let rx = pipe::open(path)?;
            let state = Arc::new(StreamState::new(key.as_str(), StreamKind::Pipe));
            let Some(ctx) = self.context(state.clone()) else {
                return Ok(false);
            };
            (state, pipe::spawn(ctx, rx))
        } else if file_type.is_file() {
            let start = self.resume_from(&key, &meta).unwrap_or(start);
            let open = file::open(path, start)?;
            let state = Arc::new(StreamState::new(key.as_str(), StreamKind::File));
            let Some(ctx) = self.context(state.clone()) else {
                return Ok(false);
            };
            (state, file::spawn(ctx, open))
        } else {
            return Err(StreamError::Unsupported(path.to_path_buf()));
        };

        self.telemetry.log_opens_total.with_label_values(&[key.as_str()]).inc();
        streams.insert(key, state);
        self.track(handle);
        Ok(true)
    }

    async fn poll_socket(&self, pattern: &LogPattern) -> Result<bool, StreamError> {
        let Some(key) = pattern.socket_key() else {
            return Ok(false);
        };
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&key) {
            // Sockets are bound once; a completed listener is not reopened.
            return Ok(false);
        }
        let (state, handle) = match pattern {
            LogPattern::Tcp(addr) | LogPattern::Unix(addr) => {
                let listener = match pattern {
                    LogPattern::Tcp(_) => socket::bind_tcp(addr).await?,
                    _ => socket::bind_unix(addr)?,
                };
                let state = Arc::new(StreamState::new(key.as_str(), StreamKind::Socket));
                let Some(ctx) = self.context(state.clone()) else {
                    return Ok(false);
                };
                info!("Bound {} at {:?}", key, listener.local_addr());
                (state, socket::spawn(ctx, listener))
            }
            LogPattern::Udp(addr) | LogPattern::Unixgram(addr) => {
                let sock = match pattern {
                    LogPattern::Udp(_) => dgram::bind_udp(addr).await?,
                    _ => dgram::bind_unix(addr)?,
                };
                let state = Arc::new(StreamState::new(key.as_str(), StreamKind::Datagram));
                let Some(ctx) = self.context(state.clone()) else {
                    return Ok(false);
                };
                info!("Bound {} at {:?}", key, sock.local_addr());
                (state, dgram::spawn(ctx, sock))
            }
            LogPattern::Glob(_) => return Ok(false),
        };
        self.telemetry.log_opens_total.with_label_values(&[key.as_str()]).inc();
        streams.insert(key, state);
        self.track(handle);
        Ok(true)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Removes completed streams and stops streams idle past the stale
    /// timeout. Returns the number of streams removed.
    #[instrument(skip(self))]
    pub async fn gc(&self) -> usize {
        let now = Utc::now();
        let mut streams = self.streams.lock().await;
        let before = streams.len();
        streams.retain(|source, state| {
            if state.is_complete() {
                debug!("Removing completed stream {}", source);
                self.remember_position(source, state);
                return false;
            }
            let idle = now.signed_duration_since(state.last_read());
            if idle.to_std().map(|d| d > self.options.stale_timeout).unwrap_or(false) {
                info!("Stopping stale stream {} (idle {}s)", source, idle.num_seconds());
                state.stop();
            }
            true
        });
        let removed = before - streams.len();
        self.telemetry.log_count.set(streams.len() as i64);
        removed
    }

    /// A weak handle to the stream reading `source`, if one is tracked.
    pub async fn lookup(&self, source: &str) -> Option<StreamHandle> {
        self.streams.lock().await.get(source).map(StreamHandle::new)
    }

    /// Sources of all tracked streams, sorted.
    pub async fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// True when every tracked stream has completed.
    pub async fn all_complete(&self) -> bool {
        self.streams.lock().await.values().all(|s| s.is_complete())
    }

    /// Waits for every stream task started so far to finish.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Log stream task failed: {}", e);
            }
        }
    }

    /// Stops every stream, waits for them to finish and releases the line
    /// channel so the consumers can drain.
    pub async fn shutdown(&self) {
        info!("Shutting down tailer");
        self.cancel.cancel();
        self.join().await;
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
