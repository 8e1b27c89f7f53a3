//! Collaborator traits for the remote side of a dev session.
//!
//! The engine never talks to a cluster directly. It goes through these
//! traits, implemented by the kubectl platform in the `devloop` binary and
//! by [`crate::mock::MockPlatform`] in tests. Every call is cancellable by
//! dropping its future; implementations must not leave work running after
//! the future is dropped (kubectl children use `kill_on_drop`).

use crate::errors::ErrorCode;
use crate::manifest::{EnvVar, Protocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identity of the pod currently backing the component.
///
/// A different `uid` means the workload was recreated: remote files and
/// processes from the previous target cannot be assumed to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub pod: String,
    pub uid: String,
}

impl TargetRef {
    pub fn new(pod: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            uid: uid.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pod)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("target {0} is gone")]
    TargetGone(String),

    #[error("remote transport failed: {0}")]
    Transport(String),

    #[error("remote command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("local port {0} is already in use")]
    LocalPortInUse(u16),

    #[error("forwarding stream closed: {0}")]
    StreamClosed(String),

    #[error("{0} not found on PATH")]
    ClientMissing(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TargetGone(_) => ErrorCode::PlatformTargetGone,
            Self::Transport(_) | Self::CommandFailed { .. } => ErrorCode::PlatformExecFailed,
            Self::LocalPortInUse(_) => ErrorCode::TunnelPortUnavailable,
            Self::StreamClosed(_) => ErrorCode::TunnelForwardFailed,
            Self::ClientMissing(_) => ErrorCode::PlatformClientMissing,
            Self::Cancelled => ErrorCode::SyncCancelled,
        }
    }

    /// Errors after which further calls against the same target are pointless.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TargetGone(_) | Self::Transport(_) | Self::ClientMissing(_) | Self::Cancelled
        )
    }
}

// ── Exec ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `argv` in `container`, feeding `stdin` if given, and wait for exit.
    async fn exec(
        &self,
        target: &TargetRef,
        container: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RemoteError>;
}

// ── Files ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn ensure_dir(
        &self,
        target: &TargetRef,
        container: &str,
        dir: &str,
    ) -> Result<(), RemoteError>;

    /// Write `content` to `remote_path`, creating parent directories.
    async fn upload(
        &self,
        target: &TargetRef,
        container: &str,
        remote_path: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError>;

    /// Remove paths recursively, in the given order.
    async fn remove(
        &self,
        target: &TargetRef,
        container: &str,
        remote_paths: &[String],
    ) -> Result<(), RemoteError>;
}

// ── Supervised processes ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub command_line: String,
    pub working_dir: Option<String>,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub pid: Option<u32>,
    pub alive: bool,
    /// Exit status, when the backend observed the process ending.
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Start `spec` detached from the caller; returns once the pid is known.
    async fn start(
        &self,
        target: &TargetRef,
        container: &str,
        spec: &ProcessSpec,
    ) -> Result<ProcessHandle, RemoteError>;

    async fn probe(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<ProbeResult, RemoteError>;

    /// Kill the program and its children. Stopping a stopped program is a no-op.
    async fn stop(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<(), RemoteError>;
}

// ── Port forwarding ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub container: String,
    pub local_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Forward `127.0.0.1:local_port` to the container port until `cancel`
    /// fires (returns `Ok`) or the stream fails (returns `Err`).
    async fn forward(
        &self,
        target: &TargetRef,
        spec: &ForwardSpec,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError>;
}

// ── Workload ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Workload: Send + Sync {
    /// Pod currently backing the component, if it is running.
    async fn current_target(&self) -> Result<Option<TargetRef>, RemoteError>;

    /// Delete the component workload created for this session.
    async fn delete(&self) -> Result<(), RemoteError>;

    /// Apply a cluster resource declared by an `apply` command.
    async fn apply(&self, component: &str, uri: Option<&Path>) -> Result<ExecOutput, RemoteError>;

    /// Container logs; with `follow` the implementation may stream to stdout
    /// and return once the stream ends.
    async fn logs(&self, container: &str, follow: bool) -> Result<String, RemoteError>;
}

/// Bundle of collaborator handles shared by the engine components.
#[derive(Clone)]
pub struct Platform {
    pub exec: Arc<dyn RemoteExec>,
    pub files: Arc<dyn FileTransport>,
    pub processes: Arc<dyn ProcessBackend>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub workload: Arc<dyn Workload>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
