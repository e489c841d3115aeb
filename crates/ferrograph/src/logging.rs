//! Logging setup and the diagnostic sink.
//!
//! Components never print. They report through a [`DiagnosticSink`] owned by
//! the session; the default [`TracingSink`] turns each diagnostic into a
//! `tracing` event under a per-subsystem target such as
//! `ferrograph::patterns`, so verbosity is controlled with an `EnvFilter`.
//!
//! - `FERROGRAPH_LOG`: filter directive overriding [`LogConfig`]
//!   (e.g. `"warn,ferrograph::patterns=debug"`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to install global subscriber: {0}")]
    InstallFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Result<Self, LoggingError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(LoggingError::InvalidLogLevel(other.to_string())),
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Component that emitted a diagnostic; each maps to its own tracing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    Builder,
    Patterns,
    Autodiff,
    Partition,
    Device,
    Session,
    Cache,
}

impl Subsystem {
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Builder,
        Subsystem::Patterns,
        Subsystem::Autodiff,
        Subsystem::Partition,
        Subsystem::Device,
        Subsystem::Session,
        Subsystem::Cache,
    ];

    pub fn target(&self) -> &'static str {
        match self {
            Subsystem::Builder => "ferrograph::builder",
            Subsystem::Patterns => "ferrograph::patterns",
            Subsystem::Autodiff => "ferrograph::autodiff",
            Subsystem::Partition => "ferrograph::partition",
            Subsystem::Device => "ferrograph::device",
            Subsystem::Session => "ferrograph::session",
            Subsystem::Cache => "ferrograph::cache",
        }
    }
}

/// Per-subsystem verbosity.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub default_level: LogLevel,
    pub levels: BTreeMap<Subsystem, LogLevel>,
}

impl LogConfig {
    pub fn new(default_level: LogLevel) -> Self {
        Self {
            default_level,
            levels: BTreeMap::new(),
        }
    }

    pub fn with_level(mut self, subsystem: Subsystem, level: LogLevel) -> Self {
        self.levels.insert(subsystem, level);
        self
    }

    pub fn level(&self, subsystem: Subsystem) -> LogLevel {
        self.levels
            .get(&subsystem)
            .copied()
            .unwrap_or(self.default_level)
    }

    /// Renders the config as an `EnvFilter` directive string.
    pub fn filter_directive(&self) -> String {
        let mut directive = self.default_level.as_filter_str().to_string();
        for (subsystem, level) in &self.levels {
            directive.push(',');
            directive.push_str(subsystem.target());
            directive.push('=');
            directive.push_str(level.as_filter_str());
        }
        directive
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let directive = match crate::env::log_filter() {
            Some(filter) => filter.to_string(),
            None => self.filter_directive(),
        };
        EnvFilter::try_new(&directive).map_err(|err| LoggingError::InvalidFilter {
            filter: directive,
            reason: err.to_string(),
        })
    }
}

/// Installs the process-wide subscriber. Later calls are no-ops.
pub fn init_global(config: &LogConfig) -> Result<(), LoggingError> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }
    let filter = config.env_filter()?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_target(true))
        .try_init()
        .map_err(|err| LoggingError::InstallFailed(err.to_string()))?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Installs a subscriber for the current thread until the guard drops.
pub fn scoped(config: &LogConfig) -> Result<tracing::subscriber::DefaultGuard, LoggingError> {
    let filter = config.env_filter()?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_target(true).with_test_writer());
    Ok(tracing::subscriber::set_default(subscriber))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    PassStats {
        pass: String,
        changed: bool,
        iterations: usize,
        rewrites_applied: usize,
        erased_ops: usize,
    },
    PatternApplied {
        pattern: String,
        op: String,
    },
    GradientsSynthesized {
        grad_ops: usize,
        var_updates: usize,
    },
    Partitioned {
        stages: usize,
        virtual_graphs: usize,
    },
    DeviceAttached {
        id: u32,
    },
    DeviceDetached {
        id: u32,
    },
    StateChanged {
        from: String,
        to: String,
    },
    CacheHit {
        key: u64,
    },
    CacheMiss {
        key: u64,
    },
    CacheStored {
        key: u64,
        path: String,
    },
    Message {
        subsystem: Subsystem,
        level: LogLevel,
        text: String,
    },
}

impl Diagnostic {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Diagnostic::PassStats { .. } | Diagnostic::PatternApplied { .. } => {
                Subsystem::Patterns
            }
            Diagnostic::GradientsSynthesized { .. } => Subsystem::Autodiff,
            Diagnostic::Partitioned { .. } => Subsystem::Partition,
            Diagnostic::DeviceAttached { .. } | Diagnostic::DeviceDetached { .. } => {
                Subsystem::Device
            }
            Diagnostic::StateChanged { .. } => Subsystem::Session,
            Diagnostic::CacheHit { .. }
            | Diagnostic::CacheMiss { .. }
            | Diagnostic::CacheStored { .. } => Subsystem::Cache,
            Diagnostic::Message { subsystem, .. } => *subsystem,
        }
    }

    pub fn message(subsystem: Subsystem, level: LogLevel, text: impl Into<String>) -> Self {
        Diagnostic::Message {
            subsystem,
            level,
            text: text.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::PassStats {
                pass,
                changed,
                iterations,
                rewrites_applied,
                erased_ops,
            } => write!(
                f,
                "pass {pass}: changed={changed} iterations={iterations} rewrites={rewrites_applied} erased={erased_ops}"
            ),
            Diagnostic::PatternApplied { pattern, op } => write!(f, "{pattern} applied to {op}"),
            Diagnostic::GradientsSynthesized {
                grad_ops,
                var_updates,
            } => write!(f, "added {grad_ops} grad ops and {var_updates} var updates"),
            Diagnostic::Partitioned {
                stages,
                virtual_graphs,
            } => write!(f, "{stages} stages over {virtual_graphs} virtual graphs"),
            Diagnostic::DeviceAttached { id } => write!(f, "attached to device {id}"),
            Diagnostic::DeviceDetached { id } => write!(f, "detached from device {id}"),
            Diagnostic::StateChanged { from, to } => write!(f, "{from} -> {to}"),
            Diagnostic::CacheHit { key } => write!(f, "engine cache hit {key:016x}"),
            Diagnostic::CacheMiss { key } => write!(f, "engine cache miss {key:016x}"),
            Diagnostic::CacheStored { key, path } => {
                write!(f, "engine {key:016x} stored at {path}")
            }
            Diagnostic::Message { text, .. } => f.write_str(text),
        }
    }
}

/// Receives diagnostics from every subsystem of a session.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

macro_rules! emit_at {
    ($level:expr, $target:literal, $diag:expr) => {
        match $level {
            LogLevel::Off => {}
            LogLevel::Error => tracing::error!(target: $target, "{}", $diag),
            LogLevel::Warn => tracing::warn!(target: $target, "{}", $diag),
            LogLevel::Info => tracing::info!(target: $target, "{}", $diag),
            LogLevel::Debug => tracing::debug!(target: $target, "{}", $diag),
            LogLevel::Trace => tracing::trace!(target: $target, "{}", $diag),
        }
    };
}

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        let level = match &diagnostic {
            Diagnostic::Message { level, .. } => *level,
            Diagnostic::PatternApplied { .. } => LogLevel::Trace,
            Diagnostic::StateChanged { .. } | Diagnostic::Partitioned { .. } => LogLevel::Info,
            _ => LogLevel::Debug,
        };
        match diagnostic.subsystem() {
            Subsystem::Builder => emit_at!(level, "ferrograph::builder", diagnostic),
            Subsystem::Patterns => emit_at!(level, "ferrograph::patterns", diagnostic),
            Subsystem::Autodiff => emit_at!(level, "ferrograph::autodiff", diagnostic),
            Subsystem::Partition => emit_at!(level, "ferrograph::partition", diagnostic),
            Subsystem::Device => emit_at!(level, "ferrograph::device", diagnostic),
            Subsystem::Session => emit_at!(level, "ferrograph::session", diagnostic),
            Subsystem::Cache => emit_at!(level, "ferrograph::cache", diagnostic),
        }
    }
}

/// Collects diagnostics in memory. Used by tests to assert on what happened.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, predicate: impl Fn(&Diagnostic) -> bool) -> usize {
        self.events().iter().filter(|d| predicate(d)).count()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: Diagnostic) {
        match self.events.lock() {
            Ok(mut events) => events.push(diagnostic),
            Err(poisoned) => poisoned.into_inner().push(diagnostic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_lists_subsystem_overrides() {
        let config = LogConfig::new(LogLevel::Warn)
            .with_level(Subsystem::Patterns, LogLevel::Debug)
            .with_level(Subsystem::Cache, LogLevel::Trace);
        assert_eq!(
            config.filter_directive(),
            "warn,ferrograph::patterns=debug,ferrograph::cache=trace"
        );
        assert_eq!(config.level(Subsystem::Device), LogLevel::Warn);
    }

    #[test]
    fn parses_levels() {
        assert_eq!(LogLevel::parse("WARNING").ok(), Some(LogLevel::Warn));
        assert!(LogLevel::parse("loud").is_err());
    }

    #[test]
    fn scoped_guard_routes_events() {
        let _guard = scoped(&LogConfig::new(LogLevel::Trace)).expect("subscriber");
        TracingSink.emit(Diagnostic::CacheMiss { key: 7 });
    }
}
