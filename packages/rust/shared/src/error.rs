//! Error types for rowforge.
//!
//! Library crates use [`RowForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Which kind of feedback the last failed attempt of a retried call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    /// The model returned no usable content.
    NoResponse,
    /// The response could not be parsed as JSON.
    ParseError,
    /// The JSON parsed but violated the schema.
    SchemaViolation,
    /// The external verification command exited non-zero.
    VerificationFailed,
    /// The call itself failed (network, provider, I/O).
    Exception,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResponse => "no_response",
            Self::ParseError => "parse_error",
            Self::SchemaViolation => "schema_violation",
            Self::VerificationFailed => "verification_failed",
            Self::Exception => "exception",
        }
    }
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for all rowforge operations.
#[derive(Debug, thiserror::Error)]
pub enum RowForgeError {
    /// Invalid pipeline or app configuration. Fatal, never retried.
    #[error("config error: {message}")]
    Config { message: String },

    /// A plugin failed while producing content for a row.
    #[error("plugin `{plugin}` failed: {message}")]
    Plugin { plugin: String, message: String },

    /// A model call kept failing validation until the retry cap was reached.
    #[error("model response rejected after {attempts} attempt(s) ({kind}): {feedback}")]
    ModelResponse {
        attempts: u32,
        kind: FeedbackKind,
        feedback: String,
    },

    /// A single crawled page could not be visited or extracted.
    #[error("crawl page error at {url}: {message}")]
    CrawlPage { url: String, message: String },

    /// Network/HTTP error.
    #[error("network error: {0}")]
    Network(String),

    /// The model provider answered with an error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Malformed data (JSON, templates, responses).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Cache or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A step exceeded its time budget.
    #[error("step {step} timed out after {seconds}s")]
    Timeout { step: usize, seconds: u64 },

    /// A row task panicked or could not be scheduled.
    #[error("task error: {0}")]
    Task(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RowForgeError>;

impl RowForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a plugin error tagged with the plugin instance.
    pub fn plugin(plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the whole run instead of failing a single row.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
