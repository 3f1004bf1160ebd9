//! Structured logging on top of `slog`/`sloggers`.
//!
//! A single root `Logger` is built once at startup from the CLI verbosity / config
//! `loglevel`, and every long-lived component (`Server`, `Session`, `PacketQueue`) is
//! handed a child logger with structured key-value context (peer address,
//! conversation-id) via `slog::o!`.

pub use slog::{debug, error, info, o, trace, warn, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Verbosity levels selectable via `-v`/`-V` or the config's `loglevel` field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    fn severity(self) -> Severity {
        match self {
            Verbosity::Quiet => Severity::Critical,
            Verbosity::Warn => Severity::Warning,
            Verbosity::Info => Severity::Info,
            Verbosity::Debug => Severity::Debug,
            Verbosity::Trace => Severity::Trace,
        }
    }

    /// Parses the config's `loglevel` string (`"warn"`, `"info"`, `"debug"`, `"trace"`).
    /// Unknown values fall back to `Info` rather than rejecting the config outright.
    pub fn from_config_str(s: &str) -> Verbosity {
        match s {
            "quiet" | "off" => Verbosity::Quiet,
            "warn" | "warning" => Verbosity::Warn,
            "debug" => Verbosity::Debug,
            "trace" | "verbose" => Verbosity::Trace,
            _ => Verbosity::Info,
        }
    }

    /// `-v` bumps one step past `Info`, `-V` (or repeated `-v`) reaches `Trace`.
    pub fn from_flag_count(count: u64) -> Verbosity {
        match count {
            0 => Verbosity::Info,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

/// Builds the process-wide root logger. Everything downstream derives a child logger from
/// this one rather than constructing its own, so a single `-v` controls the whole tree.
pub fn root_logger(verbosity: Verbosity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(verbosity.severity());
    builder.destination(Destination::Stderr);
    builder
        .build()
        .unwrap_or_else(|_| Logger::root(slog::Discard, o!()))
}
