//! Error taxonomy shared across the crate.
//!
//! Every failure a caller can react to differently gets its own variant;
//! everything else stays in the message. CLI code wraps these in `anyhow`
//! at the top level for display.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by cache, analysis, fixing and learning operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Runner output or a persisted document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A file could not be read or written.
    #[error("cannot access {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A child process exceeded its deadline and was killed.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// Caller-supplied input or an imported document violated a contract.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileAccess {
            path: path.into(),
            source,
        }
    }

    /// Parse failure with context about what was being parsed.
    pub fn parse(context: impl std::fmt::Display, source: impl std::fmt::Display) -> Self {
        Error::Parse(format!("{}: {}", context, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_access_mentions_path() {
        let err = Error::file_access(
            "/tmp/results.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/results.json"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn timeout_reports_seconds() {
        let err = Error::Timeout { seconds: 120 };
        assert_eq!(err.to_string(), "timed out after 120s");
    }

    #[test]
    fn parse_helper_joins_context_and_source() {
        let err = Error::parse("runner output", "unexpected token at line 1");
        assert_eq!(
            err.to_string(),
            "parse error: runner output: unexpected token at line 1"
        );
    }
}
