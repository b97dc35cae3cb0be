//! A single line read from a log source.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Source path or socket address the line came from.
    pub filename: Arc<str>,
    pub line: String,
    /// Set on the synthetic line a stream sends when it completes.
    pub eof: bool,
}

impl LogLine {
    pub fn new(filename: impl Into<Arc<str>>, line: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            line: line.into(),
            eof: false,
        }
    }

    /// The end-of-stream marker for `filename`.
    pub fn eof(filename: impl Into<Arc<str>>) -> Self {
        Self {
            filename: filename.into(),
            line: String::new(),
            eof: true,
        }
    }
}
