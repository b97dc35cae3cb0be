//! Compile-time diagnostics.

use std::fmt;
use std::sync::Arc;

/// A location in program source. Lines and columns are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub filename: Arc<str>,
    pub line: usize,
    pub start_col: usize,
    pub end_col: usize,
}

impl Position {
    pub fn new(filename: Arc<str>, line: usize, start_col: usize, end_col: usize) -> Self {
        Self {
            filename,
            line,
            start_col,
            end_col,
        }
    }

    /// Smallest position covering `self` and `other` when both are on one line.
    pub fn merge(&self, other: &Position) -> Position {
        if self.line != other.line {
            return self.clone();
        }
        Position {
            filename: self.filename.clone(),
            line: self.line,
            start_col: self.start_col.min(other.start_col),
            end_col: self.end_col.max(other.end_col),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.start_col)?;
        if self.end_col > self.start_col {
            write!(f, "-{}", self.end_col)?;
        }
        Ok(())
    }
}

/// A lexical, syntax or type error at a source position.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{pos}: {message}")]
pub struct CompileError {
    pub pos: Position,
    pub message: String,
}

impl CompileError {
    pub fn new(pos: Position, message: impl Into<String>) -> Self {
        Self {
            pos,
            message: message.into(),
        }
    }
}

/// Every error found while compiling one program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.0.iter()
    }
}

impl From<CompileError> for CompileErrors {
    fn from(e: CompileError) -> Self {
        CompileErrors(vec![e])
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}
