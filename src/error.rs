//! Structured error types shared by every phase of the font pipeline.

use core::fmt;
use std::io;

/// Pipeline phase where an error originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    /// Bundle access (file I/O, manifest bookkeeping).
    Bundle,
    /// Stylesheet tokenizing and indexing.
    Stylesheet,
    /// Markup tokenizing and tree building.
    Markup,
    /// Font loading and cmap extraction.
    Font,
    /// Subsetting jobs and their application.
    Subset,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bundle => "bundle",
            Self::Stylesheet => "stylesheet",
            Self::Markup => "markup",
            Self::Font => "font",
            Self::Subset => "subset",
        };
        f.write_str(name)
    }
}

/// Typed actual-vs-limit context for limit violations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorLimitContext {
    /// Name of the limit that was exceeded.
    pub kind: Box<str>,
    /// Observed value.
    pub actual: usize,
    /// Configured limit.
    pub limit: usize,
}

impl ErrorLimitContext {
    /// Build a limit context.
    pub fn new(kind: impl Into<String>, actual: usize, limit: usize) -> Self {
        Self {
            kind: kind.into().into_boxed_str(),
            actual,
            limit,
        }
    }
}

/// Error raised by the font pipeline or one of its collaborators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubfontError {
    /// Processing phase where this error originated.
    pub phase: ErrorPhase,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: Box<str>,
    /// Optional bundle path context.
    pub path: Option<Box<str>>,
    /// Optional typed actual-vs-limit context.
    pub limit: Option<Box<ErrorLimitContext>>,
}

impl SubfontError {
    /// Create an error for `phase` with a stable `code`.
    pub fn new(phase: ErrorPhase, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            code,
            message: message.into().into_boxed_str(),
            path: None,
            limit: None,
        }
    }

    /// Wrap an I/O failure on a bundle path.
    pub fn io(path: impl Into<String>, err: &io::Error) -> Self {
        Self::new(ErrorPhase::Bundle, "BUNDLE_IO", err.to_string()).with_path(path)
    }

    /// Attach a bundle path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into().into_boxed_str());
        self
    }

    /// Attach an actual-vs-limit context.
    pub fn with_limit(mut self, kind: &'static str, actual: usize, limit: usize) -> Self {
        self.limit = Some(Box::new(ErrorLimitContext::new(kind, actual, limit)));
        self
    }
}

impl fmt::Display for SubfontError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.phase, self.code, self.message)?;
        if let Some(path) = self.path.as_deref() {
            write!(f, " [path={}]", path)?;
        }
        if let Some(limit) = self.limit.as_deref() {
            write!(
                f,
                " [limit_kind={} actual={} limit={}]",
                limit.kind, limit.actual, limit.limit
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for SubfontError {}
