//! Log streams: one owned task per file, pipe or socket.
//!
//! Every stream shares a [`StreamState`] with the tailer, which holds the only
//! strong reference; collaborators get a weak [`StreamHandle`]. A stream reads
//! until it completes (deleted or rotated away and drained, stopped, or
//! cancelled). Completion is final: a reappearing path gets a new stream.

pub mod dgram;
pub mod file;
pub mod pipe;
pub mod socket;

use chrono::{DateTime, TimeZone, Utc};
use memchr::memchr;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logline::LogLine;
use crate::telemetry::EngineMetrics;
use crate::waker::Waker;

/// Read buffer size for every stream kind.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("invalid log pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("{0} is not a regular file or named pipe")]
    Unsupported(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    File,
    Pipe,
    Socket,
    Datagram,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::File => "file",
            StreamKind::Pipe => "pipe",
            StreamKind::Socket => "socket",
            StreamKind::Datagram => "datagram",
        })
    }
}

/// Where a newly opened file stream starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    End,
    /// Byte offset of a stream that was stopped earlier on the same file.
    At(u64),
}

/// How far a stopped file stream read, and which file it was reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePosition {
    pub dev: u64,
    pub ino: u64,
    pub offset: u64,
}

/// State shared between a stream task and the tailer.
#[derive(Debug)]
pub struct StreamState {
    pub source: Arc<str>,
    pub kind: StreamKind,
    completed: AtomicBool,
    /// Unix nanos of the last successful read.
    last_read: AtomicI64,
    /// Graceful stop: finish what is readable, then complete.
    stop: CancellationToken,
    /// Set by a file stream that was stopped while its file was still in place.
    resume: Mutex<Option<FilePosition>>,
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl StreamState {
    pub fn new(source: impl Into<Arc<str>>, kind: StreamKind) -> Self {
        Self {
            source: source.into(),
            kind,
            completed: AtomicBool::new(false),
            last_read: AtomicI64::new(now_nanos()),
            stop: CancellationToken::new(),
            resume: Mutex::new(None),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn last_read(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.last_read.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Where a new stream on the same file should pick up, if this one was
    /// stopped rather than rotated away or deleted.
    pub fn resume_position(&self) -> Option<FilePosition> {
        *self.resume.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_resume_position(&self, position: FilePosition) {
        *self.resume.lock().unwrap_or_else(|e| e.into_inner()) = Some(position);
    }

    fn touch(&self) {
        self.last_read.store(now_nanos(), Ordering::Relaxed);
    }
}

/// A weak, lookup-only reference to a stream.
#[derive(Debug, Clone)]
pub struct StreamHandle(Weak<StreamState>);

impl StreamHandle {
    pub fn new(state: &Arc<StreamState>) -> Self {
        Self(Arc::downgrade(state))
    }

    /// True once the stream completed or was dropped by the tailer.
    pub fn is_complete(&self) -> bool {
        self.0.upgrade().map(|s| s.is_complete()).unwrap_or(true)
    }

    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        self.0.upgrade().map(|s| s.last_read())
    }

    pub fn kind(&self) -> Option<StreamKind> {
        self.0.upgrade().map(|s| s.kind)
    }

    pub fn stop(&self) {
        if let Some(s) = self.0.upgrade() {
            s.stop();
        }
    }
}

/// Splits a byte stream into lines, holding a trailing partial line back.
#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: Vec<u8>,
}

fn to_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `buf` and returns every line it completes.
    pub fn push(&mut self, mut buf: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(i) = memchr(b'\n', buf) {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&buf[..i]);
            lines.push(to_line(line));
            buf = &buf[i + 1..];
        }
        self.partial.extend_from_slice(buf);
        lines
    }

    /// Takes the partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(to_line(std::mem::take(&mut self.partial)))
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

/// Everything a stream task needs besides its descriptor.
#[derive(Clone)]
pub struct StreamContext {
    pub state: Arc<StreamState>,
    pub lines: mpsc::Sender<LogLine>,
    pub waker: Waker,
    pub telemetry: EngineMetrics,
    /// Engine shutdown: stop immediately.
    pub cancel: CancellationToken,
    pub read_timeout: Duration,
    pub one_shot: bool,
}

/// Why a stream stopped waiting between read cycles.
pub(crate) enum Wake {
    Read,
    Stop,
    Cancel,
}

impl StreamContext {
    pub fn source(&self) -> &str {
        &self.state.source
    }

    /// Sends one line. Returns false once nobody is receiving.
    pub async fn send_line(&self, line: String) -> bool {
        self.state.touch();
        self.telemetry
            .log_lines_total
            .with_label_values(&[self.source()])
            .inc();
        self.lines
            .send(LogLine::new(self.state.source.clone(), line))
            .await
            .is_ok()
    }

    /// Decodes `buf` and sends every complete line.
    pub async fn send_buffer(&self, decoder: &mut LineDecoder, buf: &[u8]) -> bool {
        for line in decoder.push(buf) {
            if !self.send_line(line).await {
                return false;
            }
        }
        true
    }

    /// Sends the pending partial line, if any.
    pub async fn flush(&self, decoder: &mut LineDecoder) {
        if let Some(line) = decoder.flush() {
            self.send_line(line).await;
        }
    }

    pub fn read_error(&self, err: &std::io::Error) {
        debug!("{}: read error: {}", self.source(), err);
        self.telemetry
            .log_errors_total
            .with_label_values(&[self.source()])
            .inc();
    }

    /// Marks the stream completed and sends its end-of-stream line.
    pub async fn complete(&self) {
        if self.state.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.telemetry
            .log_closes_total
            .with_label_values(&[self.source()])
            .inc();
        debug!("{} stream {} completed", self.state.kind, self.source());
        let _ = self.lines.send(LogLine::eof(self.state.source.clone())).await;
    }

    /// Parks until the next read cycle, a stop request, or shutdown.
    pub(crate) async fn wait(&self) -> Wake {
        if self.cancel.is_cancelled() {
            return Wake::Cancel;
        }
        if self.state.stop_requested() {
            return Wake::Stop;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancel,
            _ = self.state.stop.cancelled() => Wake::Stop,
            _ = self.waker.wait() => Wake::Read,
        }
    }
}
