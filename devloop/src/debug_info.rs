//! Debug session descriptor.
//!
//! While a debug tunnel is open, `<temp>/devloop/<component>-debug.json`
//! records which local port reaches the debugger so `debug info` and IDE
//! integrations can find it.

use devloop_common::ErrorCode;
use devloop_common::util::is_process_running;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

pub const DESCRIPTOR_KIND: &str = "OdoDebugInfo";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DebugInfoError {
    #[error("failed to access debug descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed debug descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DebugInfoError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::InternalIoError,
            Self::Parse { .. } => ErrorCode::InternalSerdeError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSpec {
    pub local_port: u16,
    pub remote_port: u16,
    /// Pid of the devloop process holding the tunnel.
    pub debug_process_id: u32,
    pub component_name: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub kind: String,
    pub api_version: String,
    pub spec: DebugSpec,
}

impl DebugInfo {
    pub fn new(component: &str, app: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            kind: DESCRIPTOR_KIND.to_string(),
            api_version: "v1".to_string(),
            spec: DebugSpec {
                local_port,
                remote_port,
                debug_process_id: std::process::id(),
                component_name: component.to_string(),
                app_name: app.to_string(),
            },
        }
    }

    /// `<temp>/devloop`
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("devloop")
    }

    pub fn path_in(dir: &Path, component: &str) -> PathBuf {
        dir.join(format!("{component}-debug.json"))
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, DebugInfoError> {
        let path = Self::path_in(dir, &self.spec.component_name);
        let io = |source| DebugInfoError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io)?;
        let body = serde_json::to_vec_pretty(self).map_err(|source| DebugInfoError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, body).map_err(io)?;
        debug!(path = %path.display(), port = self.spec.local_port, "Debug descriptor written");
        Ok(path)
    }

    /// Read the descriptor; `None` when there is none.
    pub fn load(dir: &Path, component: &str) -> Result<Option<Self>, DebugInfoError> {
        let path = Self::path_in(dir, component);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DebugInfoError::Io { path, source }),
        };
        let info: DebugInfo = serde_json::from_str(&text)
            .map_err(|source| DebugInfoError::Parse { path, source })?;
        Ok(Some(info))
    }

    /// The descriptor of a live debug session: the file parses, its writer
    /// is alive and the local port accepts connections.
    pub async fn load_running(dir: &Path, component: &str) -> Option<Self> {
        let info = match Self::load(dir, component) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                debug!("Ignoring debug descriptor: {}", e);
                return None;
            }
        };
        if info.kind != DESCRIPTOR_KIND || !is_process_running(info.spec.debug_process_id) {
            return None;
        }
        let addr = ("127.0.0.1", info.spec.local_port);
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Some(info),
            _ => None,
        }
    }

    /// Remove the descriptor. Returns false when there was none.
    pub fn remove(dir: &Path, component: &str) -> Result<bool, DebugInfoError> {
        let path = Self::path_in(dir, component);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(DebugInfoError::Io { path, source }),
        }
    }
}
