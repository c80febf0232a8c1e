//! Logging handle passed explicitly to components that report progress.
//!
//! There is no global logger. Components receive a [`Logger`] and write
//! through it, which keeps output testable (capture with [`MemorySink`])
//! and lets the CLI silence everything for `--json` output.

use std::sync::{Arc, Mutex};

/// Severity attached to each line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
}

/// Destination for log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str);
}

/// Writes to stderr. Warnings get a visible prefix; info lines are
/// printed as-is so callers control their own formatting.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, level: Level, message: &str) {
        match level {
            Level::Warn => eprintln!("⚠️  {}", message),
            _ => eprintln!("{}", message),
        }
    }
}

/// Captures lines in memory for assertions in tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.lines()
            .iter()
            .any(|(_, line)| line.contains(fragment))
    }
}

impl LogSink for MemorySink {
    fn write(&self, level: Level, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

/// Discards everything.
struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _level: Level, _message: &str) {}
}

/// Cheap-to-clone handle components log through.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    verbose: bool,
}

impl Logger {
    /// Standard CLI logger writing to stderr.
    pub fn stderr(verbose: bool) -> Self {
        Self {
            sink: Arc::new(StderrSink),
            verbose,
        }
    }

    /// Logger backed by a caller-provided sink.
    pub fn with_sink(sink: Arc<dyn LogSink>, verbose: bool) -> Self {
        Self { sink, verbose }
    }

    /// Logger that drops all output. Used for `--json` runs and tests
    /// that don't inspect logs.
    pub fn silent() -> Self {
        Self {
            sink: Arc::new(NullSink),
            verbose: false,
        }
    }

    /// Emitted only when verbose mode is on.
    pub fn debug(&self, message: &str) {
        if self.verbose {
            self.sink.write(Level::Debug, message);
        }
    }

    pub fn info(&self, message: &str) {
        self.sink.write(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.sink.write(Level::Warn, message);
    }
}
