//! Diagnostic logging setup.
//!
//! Diagnostics go through `tracing` to stderr (pretty or JSON) and optionally
//! to a log file. User-facing status markers are printed separately on
//! stdout and never depend on the configured level.

use crate::config::EnvParser;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Logging configuration resolved from `DEVLOOP_LOG*` variables.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub stderr: bool,
}

impl LogConfig {
    /// Build from `DEVLOOP_LOG`, `DEVLOOP_LOG_FORMAT` and `DEVLOOP_LOG_FILE`.
    ///
    /// Invalid values fall back to defaults; they must never stop the tool.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG", default_level).into_inner();
        let format = match parser
            .get_string("LOG_FORMAT", "pretty")
            .into_inner()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = parser
            .get_optional_string("LOG_FILE")
            .into_inner()
            .map(PathBuf::from);

        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Filter directive applied to devloop crates; other crates stay at warn.
    pub fn filter_directive(&self) -> String {
        format!(
            "warn,devloop={level},devloop_common={level}",
            level = self.level
        )
    }
}

/// Keeps non-blocking writers flushed until dropped.
#[derive(Default)]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let directive = config.filter_directive();
    let filter = EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        filter: directive.clone(),
        message: e.to_string(),
    })?;

    let mut guards = Vec::new();

    let stderr_layer = config.stderr.then(|| {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        match config.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Pretty => layer.compact().boxed(),
        }
    });

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            guards.push(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn clear() {
        for var in ["DEVLOOP_LOG", "DEVLOOP_LOG_FORMAT", "DEVLOOP_LOG_FILE"] {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let _guard = env_test_lock();
        clear();

        let config = LogConfig::from_env("warn");
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
        assert!(!config.stderr);
    }

    #[test]
    fn test_from_env_reads_variables() {
        let _guard = env_test_lock();
        clear();
        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::set_var("DEVLOOP_LOG", "TRACE");
            std::env::set_var("DEVLOOP_LOG_FORMAT", "json");
            std::env::set_var("DEVLOOP_LOG_FILE", "/tmp/devloop-test.log");
        }

        let config = LogConfig::from_env("warn").with_stderr();
        assert_eq!(config.level, "trace");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file.as_deref(),
            Some(std::path::Path::new("/tmp/devloop-test.log"))
        );
        assert!(config.stderr);

        clear();
    }

    #[test]
    fn test_with_level_overrides_and_builds_directive() {
        let _guard = env_test_lock();
        clear();

        let config = LogConfig::from_env("warn").with_level("debug");
        assert_eq!(
            config.filter_directive(),
            "warn,devloop=debug,devloop_common=debug"
        );
        assert!(EnvFilter::try_new(config.filter_directive()).is_ok());
    }
}
