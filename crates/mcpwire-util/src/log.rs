//! Logging setup using tracing.
//!
//! Every mcpwire binary goes through [`init`] so the filter rules stay the
//! same everywhere: `RUST_LOG` wins, then explicit directives, then the
//! configured level.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, util::TryInitError, EnvFilter};

/// Severity threshold, as written in config files and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// How [`init`] sets up the subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Write events to stderr. When off, spans still work but events go nowhere.
    pub to_stderr: bool,
    /// Used when no directives are given.
    pub level: LogLevel,
    /// Filter directives, e.g. `mcpwire_mcp=debug,tower_http=info`.
    pub directives: Option<String>,
    /// Print file and line of each event.
    pub source_location: bool,
    /// Print the event target (module path).
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            to_stderr: true,
            level: LogLevel::Info,
            directives: None,
            source_location: false,
            show_target: false,
        }
    }
}

impl LogConfig {
    /// The filter applied when `RUST_LOG` is not set.
    pub fn default_filter(&self) -> String {
        match self.directives.as_deref().map(str::trim) {
            Some(directives) if !directives.is_empty() => directives.to_string(),
            _ => self.level.to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// A second call fails and leaves the first subscriber in place.
pub fn init(config: LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));
    let registry = tracing_subscriber::registry().with(filter);

    if !config.to_stderr {
        return registry.try_init();
    }

    let layer = tracing_fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.show_target)
        .with_file(config.source_location)
        .with_line_number(config.source_location);
    registry.with(layer).try_init()
}
