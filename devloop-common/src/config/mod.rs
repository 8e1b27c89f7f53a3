//! Configuration system for devloop.
//!
//! Values are layered: built-in defaults, then `.devloop/config.toml`, then
//! `DEVLOOP_*` environment variables. Every resolved value keeps its
//! [`Sourced`] origin so `devloop -v` can explain where a setting came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use crate::errors::ErrorCode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Per-project state directory, relative to the project root.
pub const STATE_DIR: &str = ".devloop";

/// Configuration file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Default remote folder the project tree is synced into.
pub const DEFAULT_SYNC_FOLDER: &str = "/projects";

/// Default remote folder holding supervised-process pid files.
pub const DEFAULT_SHARED_DIR: &str = "/opt/devloop";

/// First local port tried for sequential allocation.
pub const DEFAULT_PORT_RANGE_START: u16 = 20001;

/// Last local port tried for sequential allocation.
pub const DEFAULT_PORT_RANGE_END: u16 = 30001;

/// Returns `<root>/.devloop`.
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration '{value}' for {field} in {path}")]
    Duration {
        path: PathBuf,
        field: &'static str,
        value: String,
    },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Parse { .. } | Self::Duration { .. } => {
                ErrorCode::ConfigParseError
            }
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

/// On-disk shape of `.devloop/config.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    debounce: Option<String>,
    sync_folder: Option<String>,
    shared_dir: Option<String>,
    status_interval: Option<String>,
    start_check_attempts: Option<u32>,
    start_check_interval: Option<String>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
    namespace: Option<String>,
    kubectl: Option<PathBuf>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct DevloopConfig {
    /// Quiescence window before a watch cycle starts.
    pub debounce: Sourced<Duration>,
    /// Remote folder the project is synced into.
    pub sync_folder: Sourced<String>,
    /// Remote folder for supervisor pid files.
    pub shared_dir: Sourced<String>,
    /// Cadence of the program status poller.
    pub status_interval: Sourced<Duration>,
    /// Probes made after starting a supervised program.
    pub start_check_attempts: Sourced<u32>,
    pub start_check_interval: Sourced<Duration>,
    pub port_range: (u16, u16),
    pub namespace: Sourced<Option<String>>,
    pub kubectl: Sourced<PathBuf>,
}

impl Default for DevloopConfig {
    fn default() -> Self {
        Self {
            debounce: Sourced::default_value(Duration::from_millis(100)),
            sync_folder: Sourced::default_value(DEFAULT_SYNC_FOLDER.to_string()),
            shared_dir: Sourced::default_value(DEFAULT_SHARED_DIR.to_string()),
            status_interval: Sourced::default_value(Duration::from_secs(5)),
            start_check_attempts: Sourced::default_value(3),
            start_check_interval: Sourced::default_value(Duration::from_secs(1)),
            port_range: (DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END),
            namespace: Sourced::default_value(None),
            kubectl: Sourced::default_value(PathBuf::from("kubectl")),
        }
    }
}

impl DevloopConfig {
    /// Load configuration for the project rooted at `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = state_dir(root).join(CONFIG_FILE);
        if path.is_file() {
            config.apply_file(&path)?;
        }
        config.apply_env()?;
        debug!(
            debounce = ?config.debounce.value,
            debounce_source = %config.debounce.source,
            sync_folder = %config.sync_folder.value,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let duration = |field: &'static str, value: &str| {
            humantime::parse_duration(value).map_err(|_| ConfigError::Duration {
                path: path.to_path_buf(),
                field,
                value: value.to_string(),
            })
        };

        if let Some(v) = &file.debounce {
            self.debounce = Sourced::from_file(duration("debounce", v)?);
        }
        if let Some(v) = &file.status_interval {
            self.status_interval = Sourced::from_file(duration("status_interval", v)?);
        }
        if let Some(v) = &file.start_check_interval {
            self.start_check_interval = Sourced::from_file(duration("start_check_interval", v)?);
        }
        if let Some(v) = file.sync_folder {
            self.sync_folder = Sourced::from_file(v);
        }
        if let Some(v) = file.shared_dir {
            self.shared_dir = Sourced::from_file(v);
        }
        if let Some(v) = file.start_check_attempts {
            self.start_check_attempts = Sourced::from_file(v);
        }
        if let Some(v) = file.port_range_start {
            self.port_range.0 = v;
        }
        if let Some(v) = file.port_range_end {
            self.port_range.1 = v;
        }
        if file.namespace.is_some() {
            self.namespace = Sourced::from_file(file.namespace);
        }
        if let Some(v) = file.kubectl {
            self.kubectl = Sourced::from_file(v);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        let debounce = parser.get_duration("DEBOUNCE", self.debounce.value);
        if debounce.is_set() {
            self.debounce = debounce;
        }
        let interval = parser.get_duration("STATUS_INTERVAL", self.status_interval.value);
        if interval.is_set() {
            self.status_interval = interval;
        }
        let folder = parser.get_string("SYNC_FOLDER", &self.sync_folder.value);
        if folder.is_set() {
            self.sync_folder = folder;
        }
        let namespace = parser.get_optional_string("NAMESPACE");
        if namespace.is_set() {
            self.namespace = namespace;
        }
        let kubectl = parser.get_path("KUBECTL", &self.kubectl.value.to_string_lossy());
        if kubectl.is_set() {
            self.kubectl = kubectl;
        }
        let shared = parser.get_string("SHARED_DIR", &self.shared_dir.value);
        if shared.is_set() {
            self.shared_dir = shared;
        }
        let attempts =
            parser.get_u32_range("START_CHECK_ATTEMPTS", self.start_check_attempts.value, 1, 60);
        if attempts.is_set() {
            self.start_check_attempts = attempts;
        }
        let check = parser.get_duration("START_CHECK_INTERVAL", self.start_check_interval.value);
        if check.is_set() {
            self.start_check_interval = check;
        }
        let first = parser.get_port("PORT_RANGE_START", self.port_range.0);
        let last = parser.get_port("PORT_RANGE_END", self.port_range.1);
        self.port_range = (first.value, last.value);

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
