//! Per-run diagnostic output
//!
//! Each run carries its own topic mask and sink, fixed when the run starts.
//! Events go to `tracing` by default; a run can redirect them to stderr or to
//! any shared writer.

use odebridge_config::Config;
use std::fmt;
use std::io::Write;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, PoisonError};

/// Set of enabled diagnostic topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogLevel(u32);

impl LogLevel {
    pub const NONE: LogLevel = LogLevel(0);
    pub const GENERAL: LogLevel = LogLevel(1);
    pub const RHS: LogLevel = LogLevel(1 << 1);
    pub const JACOBIAN: LogLevel = LogLevel(1 << 2);
    pub const MASS: LogLevel = LogLevel(1 << 3);
    pub const OUTPUT: LogLevel = LogLevel(1 << 4);
    pub const DENSE: LogLevel = LogLevel(1 << 5);
    pub const ALL: LogLevel = LogLevel((1 << 6) - 1);

    /// Build a mask from topic names as found in configuration
    ///
    /// Unknown names are ignored; configuration validates them beforehand.
    pub fn from_topics<S: AsRef<str>>(topics: &[S]) -> Self {
        topics
            .iter()
            .map(|t| match t.as_ref() {
                "all" => LogLevel::ALL,
                "general" => LogLevel::GENERAL,
                "rhs" => LogLevel::RHS,
                "jacobian" => LogLevel::JACOBIAN,
                "mass" => LogLevel::MASS,
                "output" => LogLevel::OUTPUT,
                "dense" => LogLevel::DENSE,
                _ => LogLevel::NONE,
            })
            .fold(LogLevel::NONE, |acc, t| acc | t)
    }

    pub fn contains(self, topic: LogLevel) -> bool {
        topic.0 != 0 && self.0 & topic.0 == topic.0
    }

    fn name(self) -> &'static str {
        match self {
            LogLevel::GENERAL => "general",
            LogLevel::RHS => "rhs",
            LogLevel::JACOBIAN => "jacobian",
            LogLevel::MASS => "mass",
            LogLevel::OUTPUT => "output",
            LogLevel::DENSE => "dense",
            _ => "mixed",
        }
    }
}

impl BitOr for LogLevel {
    type Output = LogLevel;

    fn bitor(self, rhs: LogLevel) -> LogLevel {
        LogLevel(self.0 | rhs.0)
    }
}

/// Destination for diagnostic lines
#[derive(Clone, Default)]
pub enum LogSink {
    #[default]
    Tracing,
    Stderr,
    Writer(Arc<Mutex<dyn Write + Send>>),
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::Tracing => write!(f, "Tracing"),
            LogSink::Stderr => write!(f, "Stderr"),
            LogSink::Writer(_) => write!(f, "Writer(..)"),
        }
    }
}

/// Topic mask plus sink, immutable for the lifetime of a run
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    level: LogLevel,
    sink: LogSink,
}

impl Diagnostics {
    pub fn new(level: LogLevel, sink: LogSink) -> Self {
        Self { level, sink }
    }

    /// Diagnostics as described by loaded configuration
    pub fn from_config(config: &Config) -> Self {
        let level = LogLevel::from_topics(&config.log_topics());
        let sink = match config.log_sink() {
            "stderr" => LogSink::Stderr,
            _ => LogSink::Tracing,
        };
        Self { level, sink }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, topic: LogLevel) -> bool {
        self.level.contains(topic)
    }

    /// Emit one line under `topic` if that topic is enabled
    pub fn emit(&self, topic: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(topic) {
            return;
        }
        match &self.sink {
            LogSink::Tracing => {
                tracing::debug!(target: "odebridge", topic = topic.name(), "{}", args)
            }
            LogSink::Stderr => eprintln!("[odebridge:{}] {}", topic.name(), args),
            LogSink::Writer(writer) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                // A failing diagnostic writer must not disturb the run
                let _ = writeln!(writer, "[{}] {}", topic.name(), args);
            }
        }
    }
}
