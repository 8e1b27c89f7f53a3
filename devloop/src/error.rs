//! Top-level error type.

use crate::debug_info::DebugInfoError;
use crate::lock::LockError;
use crate::runner::CommandError;
use crate::supervisor::SupervisorError;
use crate::sync::SyncError;
use crate::tunnel::TunnelError;
use crate::watch::{CycleError, WatchError};
use devloop_common::config::ConfigError;
use devloop_common::ignore_rules::IgnoreError;
use devloop_common::manifest::ManifestError;
use devloop_common::{ErrorClass, ErrorCode, IndexError, RemoteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevloopError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    DebugInfo(#[from] DebugInfoError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("component \"{component}\" is not running on the cluster")]
    WorkloadNotFound { component: String },

    #[error("{manifest} declares no containers")]
    NoContainer { manifest: String },

    #[error("component \"{component}\" has no debug session running")]
    NoDebugSession { component: String },
}

impl DevloopError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Manifest(e) => e.code(),
            Self::Config(e) => e.code(),
            Self::Lock(e) => e.code(),
            Self::Ignore(IgnoreError::Read { .. }) => ErrorCode::InternalIoError,
            Self::Ignore(_) => ErrorCode::ConfigParseError,
            Self::Index(e) => e.code(),
            Self::Sync(e) => e.code(),
            Self::Command(e) => e.code(),
            Self::Supervisor(e) => e.code(),
            Self::Tunnel(e) => e.code(),
            Self::Remote(e) => e.code(),
            Self::DebugInfo(e) => e.code(),
            Self::Watch(e) => e.code(),
            Self::Cycle(e) => e.code(),
            Self::WorkloadNotFound { .. } => ErrorCode::PlatformWorkloadNotFound,
            Self::NoContainer { .. } => ErrorCode::ManifestInvalid,
            Self::NoDebugSession { .. } => ErrorCode::TunnelNoDebugEndpoint,
        }
    }

    /// Category shown after the code, e.g. "command group error".
    pub fn category_label(&self) -> &'static str {
        match self.code() {
            ErrorCode::ManifestNotFound => "no manifest found",
            code => code.category().name(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.code().class()
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }

    /// Whether a watch cycle failing with this error should end the session.
    /// A vanished pod is recoverable: the next cycle re-resolves the target.
    pub fn ends_session(&self) -> bool {
        match self.code() {
            ErrorCode::PlatformTargetGone | ErrorCode::TunnelStale => false,
            code => code.class() == ErrorClass::Fatal,
        }
    }

    pub fn into_cycle_error(self) -> CycleError {
        if let Self::Cycle(inner) = self {
            return inner;
        }
        let code = self.code();
        let message = self.to_string();
        if self.ends_session() {
            CycleError::Fatal { code, message }
        } else {
            CycleError::Failed { code, message }
        }
    }
}
