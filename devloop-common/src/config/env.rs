//! `DEVLOOP_*` environment overrides.
//!
//! [`EnvParser`] reads one variable per call and never fails the call
//! itself: a malformed value is recorded as an [`EnvError`] and the caller's
//! default is kept, so every bad variable can be reported in one message.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "DEVLOOP_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var}={value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Reads `DEVLOOP_<NAME>` variables and collects parse failures.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(full variable name, value)` when the variable is set.
    fn lookup(name: &str) -> (String, Option<String>) {
        let var = format!("{PREFIX}{name}");
        let value = env::var(&var).ok();
        (var, value)
    }

    fn invalid<T>(
        &mut self,
        var: String,
        expected: &'static str,
        value: String,
        default: T,
    ) -> Sourced<T> {
        self.errors.push(EnvError::Invalid {
            var,
            expected,
            value,
        });
        Sourced::default_value(default)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// An empty value explicitly clears the setting.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            (var, Some(value)) => {
                let value = Some(value).filter(|v| !v.trim().is_empty());
                Sourced::from_env(value, var)
            }
            (_, None) => Sourced::default_value(None),
        }
    }

    /// Humantime syntax: `250ms`, `2s`, `1m 30s`.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        match Self::lookup(name) {
            (var, Some(value)) => match humantime::parse_duration(value.trim()) {
                Ok(duration) => Sourced::from_env(duration, var),
                Err(_) => self.invalid(var, "duration", value, default),
            },
            (_, None) => Sourced::default_value(default),
        }
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        match Self::lookup(name) {
            (var, Some(value)) => match value.trim().parse::<u32>() {
                Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var,
                        value: n.into(),
                        min: min.into(),
                        max: max.into(),
                    });
                    Sourced::default_value(default)
                }
                Err(_) => self.invalid(var, "unsigned integer", value, default),
            },
            (_, None) => Sourced::default_value(default),
        }
    }

    /// A local TCP port; `0` is rejected.
    pub fn get_port(&mut self, name: &str, default: u16) -> Sourced<u16> {
        match Self::lookup(name) {
            (var, Some(value)) => match value.trim().parse::<u16>() {
                Ok(port) if port > 0 => Sourced::from_env(port, var),
                _ => self.invalid(var, "port (1-65535)", value, default),
            },
            (_, None) => Sourced::default_value(default),
        }
    }

    /// A path; a leading `~/` expands to the home directory.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let (var, value) = Self::lookup(name);
        let source = if value.is_some() {
            ConfigSource::Environment
        } else {
            ConfigSource::Default
        };
        let raw = value.unwrap_or_else(|| default.to_string());
        let path = match (raw.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&raw),
        };
        match source {
            ConfigSource::Environment => Sourced::from_env(path, var),
            _ => Sourced::default_value(path),
        }
    }

    /// A `tracing` level name, lowercased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        match Self::lookup(name) {
            (var, Some(value)) => {
                let level = value.trim().to_lowercase();
                if LOG_LEVELS.contains(&level.as_str()) {
                    Sourced::from_env(level, var)
                } else {
                    self.invalid(var, "log level", value, default.to_string())
                }
            }
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }
}
