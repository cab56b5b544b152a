//! Unified logging module for PlcLink services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. When a log
//! directory is configured, a daily rolling file is written through a
//! non-blocking `tracing-appender` worker.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging initialization errors
#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("Failed to prepare log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809000Z [INFO] Dev plc-1 connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writers alive for the lifetime of the process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix
    pub service_name: String,
    /// Default filter directive when `RUST_LOG` is not set (e.g. "info")
    pub level: String,
    /// Directory for the daily rolling log file; `None` logs to console only
    pub log_dir: Option<PathBuf>,
    /// Write the file log as JSON lines
    pub enable_json: bool,
    /// Colorize console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Resolve the effective filter directive.
///
/// `RUST_LOG` wins when present and non-empty, otherwise the configured level.
pub fn filter_directive(rust_log: Option<String>, level: &str) -> String {
    match rust_log {
        Some(env) if !env.trim().is_empty() => env,
        _ => level.to_string(),
    }
}

fn build_env_filter(directive: &str) -> Result<EnvFilter, LogInitError> {
    EnvFilter::try_new(directive).map_err(|e| LogInitError::Filter {
        filter: directive.to_string(),
        reason: e.to_string(),
    })
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), LogInitError> {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), &config.level);
    let env_filter = build_env_filter(&directive)?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LogInitError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(
        "Logging initialized for {} (filter: {})",
        config.service_name,
        directive
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_takes_precedence() {
        assert_eq!(
            filter_directive(Some("warn,linksrv=trace".into()), "info"),
            "warn,linksrv=trace"
        );
        assert_eq!(filter_directive(Some("   ".into()), "debug"), "debug");
        assert_eq!(filter_directive(None, "info"), "info");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let err = build_env_filter("linksrv=loud").unwrap_err();
        assert!(matches!(err, LogInitError::Filter { .. }));
    }

    #[test]
    fn test_level_labels() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }
}
