//! Structured logging for maestro services.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (validation retries, late HITL events)
//! - INFO: Stage transitions of plans and executions
//! - DEBUG: Dispatch traces, session resolution, persistence paths
//! - TRACE: Raw agent output
//!
//! A [`Logger`] is handed to every service constructor. Logging is best effort:
//! every method returns `()` and sink failures never reach the caller.
//! Debug mode can be enabled with `--debug` or `MAESTRO_DEBUG=1`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

#[derive(Debug)]
enum Sink {
    Disabled,
    File(PathBuf),
    Memory(Mutex<Vec<String>>),
}

/// Cloneable, best-effort logging capability.
#[derive(Debug, Clone)]
pub struct Logger {
    sink: Arc<Sink>,
    level: LogLevel,
}

impl Logger {
    /// A logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            sink: Arc::new(Sink::Disabled),
            level: LogLevel::Error,
        }
    }

    /// Append to `path`, creating parent directories. The file is truncated
    /// so each process run starts with a fresh log.
    pub fn to_file(path: PathBuf, level: LogLevel) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&path, "");
        Self {
            sink: Arc::new(Sink::File(path)),
            level,
        }
    }

    /// Keep lines in memory; read them back with [`Logger::lines`].
    pub fn in_memory(level: LogLevel) -> Self {
        Self {
            sink: Arc::new(Sink::Memory(Mutex::new(Vec::new()))),
            level,
        }
    }

    /// Resolve the level from the `--debug` flag and `MAESTRO_DEBUG`.
    pub fn level_for(debug: bool) -> LogLevel {
        let env_debug = std::env::var("MAESTRO_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);
        if debug || env_debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Captured lines for an in-memory logger; empty for other sinks.
    pub fn lines(&self) -> Vec<String> {
        match self.sink.as_ref() {
            Sink::Memory(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Log a message at the specified level.
    pub fn log_at(&self, level: LogLevel, msg: &str) {
        if level > self.level {
            return;
        }

        match self.sink.as_ref() {
            Sink::Disabled => {}
            Sink::File(path) => {
                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
                    let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
                }
            }
            Sink::Memory(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push(format!("[{}] {}", level.as_str(), msg));
                }
            }
        }
    }

    pub fn error(&self, msg: &str) {
        self.log_at(LogLevel::Error, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log_at(LogLevel::Warn, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log_at(LogLevel::Info, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log_at(LogLevel::Debug, msg);
    }

    pub fn trace(&self, msg: &str) {
        self.log_at(LogLevel::Trace, msg);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! mlog {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! mlog_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! mlog_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level.
#[macro_export]
macro_rules! mlog_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! mlog_trace {
    ($logger:expr, $($arg:tt)*) => {
        $logger.trace(&format!($($arg)*))
    };
}
