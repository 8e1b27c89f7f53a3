//! Error Catalog for devloop
//!
//! Every user-facing failure maps to a unique code (DL-E001 through DL-E599),
//! a message template, remediation steps and an [`ErrorClass`] that decides
//! how the session reacts to it.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Manifest, configuration, environment |
//! | E100-E199  | Command     | Command groups, plans and execution  |
//! | E200-E299  | Sync        | File index and file transfer         |
//! | E300-E399  | Tunnel      | Port allocation and forwarding       |
//! | E400-E499  | Platform    | Remote workload and exec plumbing    |
//! | E500-E599  | Internal    | Internal/unexpected errors           |
//!
//! # Example
//!
//! ```rust
//! use devloop_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::CommandNoDefault.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all devloop error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// No manifest in the project directory
    ManifestNotFound,
    /// Manifest could not be read or parsed
    ManifestParseError,
    /// Manifest contents are inconsistent
    ManifestInvalid,
    /// Configuration file could not be parsed
    ConfigParseError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Another session already owns this project
    SessionAlreadyRunning,

    // =========================================================================
    // Command Errors (E100-E199)
    // =========================================================================
    /// Group has no commands at all
    CommandGroupNotFound,
    /// Group has commands but none is default
    CommandNoDefault,
    /// Group has more than one default command
    CommandAmbiguousDefault,
    /// Named command does not exist
    CommandNotFound,
    /// Named command belongs to another group
    CommandGroupMismatch,
    /// Composite references an unknown child or itself
    CommandPlanError,
    /// A leaf of the execution plan failed
    CommandExecutionFailed,
    /// Supervised process could not be started or stopped
    CommandSupervisorError,

    // =========================================================================
    // Sync Errors (E200-E299)
    // =========================================================================
    /// Persisted file index is unreadable
    SyncCorruptIndex,
    /// Local tree could not be scanned
    SyncScanFailed,
    /// Some files failed to transfer
    SyncPartialPush,
    /// Index could not be written
    SyncIndexWriteFailed,
    /// Push was interrupted by cancellation
    SyncCancelled,

    // =========================================================================
    // Tunnel Errors (E300-E399)
    // =========================================================================
    /// No local port could be bound
    TunnelPortUnavailable,
    /// Port-forward stream failed
    TunnelForwardFailed,
    /// Tunnels point at a target that no longer exists
    TunnelStale,
    /// No debug endpoint declared
    TunnelNoDebugEndpoint,

    // =========================================================================
    // Platform Errors (E400-E499)
    // =========================================================================
    /// Component workload is not running
    PlatformWorkloadNotFound,
    /// Remote exec failed at the transport level
    PlatformExecFailed,
    /// Platform client binary is missing
    PlatformClientMissing,
    /// Remote target disappeared mid-operation
    PlatformTargetGone,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Local filesystem error
    InternalIoError,
    /// Serialization/deserialization error
    InternalSerdeError,
    /// Logging system error
    InternalLoggingError,
    /// Unexpected internal state
    InternalStateError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ManifestNotFound => 1,
            Self::ManifestParseError => 2,
            Self::ManifestInvalid => 3,
            Self::ConfigParseError => 4,
            Self::ConfigEnvError => 5,
            Self::SessionAlreadyRunning => 6,

            Self::CommandGroupNotFound => 100,
            Self::CommandNoDefault => 101,
            Self::CommandAmbiguousDefault => 102,
            Self::CommandNotFound => 103,
            Self::CommandGroupMismatch => 104,
            Self::CommandPlanError => 105,
            Self::CommandExecutionFailed => 110,
            Self::CommandSupervisorError => 111,

            Self::SyncCorruptIndex => 200,
            Self::SyncScanFailed => 201,
            Self::SyncPartialPush => 202,
            Self::SyncIndexWriteFailed => 203,
            Self::SyncCancelled => 204,

            Self::TunnelPortUnavailable => 300,
            Self::TunnelForwardFailed => 301,
            Self::TunnelStale => 302,
            Self::TunnelNoDebugEndpoint => 303,

            Self::PlatformWorkloadNotFound => 400,
            Self::PlatformExecFailed => 401,
            Self::PlatformClientMissing => 402,
            Self::PlatformTargetGone => 403,

            Self::InternalIoError => 500,
            Self::InternalSerdeError => 501,
            Self::InternalLoggingError => 502,
            Self::InternalStateError => 503,
        }
    }

    /// Returns the formatted code string (e.g. "DL-E101").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("DL-E{:03}", self.code_number())
    }

    /// Returns the subsystem category derived from the code range.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Command,
            200..=299 => ErrorCategory::Sync,
            300..=399 => ErrorCategory::Tunnel,
            400..=499 => ErrorCategory::Platform,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns how the session treats this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ManifestNotFound
            | Self::ManifestParseError
            | Self::ManifestInvalid
            | Self::ConfigParseError
            | Self::ConfigEnvError
            | Self::SessionAlreadyRunning
            | Self::CommandGroupNotFound
            | Self::CommandNoDefault
            | Self::CommandAmbiguousDefault
            | Self::CommandNotFound
            | Self::CommandGroupMismatch
            | Self::CommandPlanError
            | Self::TunnelNoDebugEndpoint
            | Self::PlatformClientMissing => ErrorClass::Configuration,

            Self::CommandExecutionFailed => ErrorClass::PartialExecution,

            Self::CommandSupervisorError
            | Self::SyncCorruptIndex
            | Self::SyncScanFailed
            | Self::SyncPartialPush
            | Self::SyncIndexWriteFailed
            | Self::SyncCancelled
            | Self::TunnelPortUnavailable
            | Self::TunnelForwardFailed
            | Self::PlatformExecFailed => ErrorClass::Transient,

            Self::TunnelStale
            | Self::PlatformWorkloadNotFound
            | Self::PlatformTargetGone
            | Self::InternalIoError
            | Self::InternalSerdeError
            | Self::InternalLoggingError
            | Self::InternalStateError => ErrorClass::Fatal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            class: self.class(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ManifestNotFound => "No devloop.toml manifest found in the project directory",
            Self::ManifestParseError => "The manifest could not be parsed",
            Self::ManifestInvalid => "The manifest contains inconsistent declarations",
            Self::ConfigParseError => "Configuration file contains invalid TOML",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::SessionAlreadyRunning => "Another devloop session is running for this project",

            Self::CommandGroupNotFound => "No command declared for the requested group",
            Self::CommandNoDefault => "Command group has no default command",
            Self::CommandAmbiguousDefault => "Command group has more than one default command",
            Self::CommandNotFound => "Named command is not declared in the manifest",
            Self::CommandGroupMismatch => "Named command belongs to a different group",
            Self::CommandPlanError => "Composite command could not be expanded",
            Self::CommandExecutionFailed => "A command in the execution plan failed",
            Self::CommandSupervisorError => "Supervised process could not be controlled",

            Self::SyncCorruptIndex => "The file index is corrupt",
            Self::SyncScanFailed => "The project tree could not be scanned",
            Self::SyncPartialPush => "Some files could not be pushed to the component",
            Self::SyncIndexWriteFailed => "The file index could not be written",
            Self::SyncCancelled => "The push was cancelled",

            Self::TunnelPortUnavailable => "No local port could be allocated",
            Self::TunnelForwardFailed => "Port forwarding failed",
            Self::TunnelStale => "Port forwarding targets a pod that no longer exists",
            Self::TunnelNoDebugEndpoint => "No debug endpoint is declared",

            Self::PlatformWorkloadNotFound => "The component is not running on the cluster",
            Self::PlatformExecFailed => "Remote execution failed",
            Self::PlatformClientMissing => "The cluster client binary was not found",
            Self::PlatformTargetGone => "The component pod disappeared",

            Self::InternalIoError => "Local filesystem error",
            Self::InternalSerdeError => "Serialization error",
            Self::InternalLoggingError => "Logging could not be initialized",
            Self::InternalStateError => "Unexpected internal state",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ManifestNotFound => &[
                "Run devloop from the project root",
                "Or pass --project <dir> pointing at a directory with devloop.toml",
            ],
            Self::ManifestParseError | Self::ManifestInvalid => {
                &["Check devloop.toml for typos in [[commands]] and [[containers]]"]
            }
            Self::ConfigParseError => &["Fix or remove .devloop/config.toml"],
            Self::ConfigEnvError => &["Check DEVLOOP_* environment variables"],
            Self::SessionAlreadyRunning => &[
                "Stop the other session first",
                "If it crashed, the stale lock is cleared automatically on next start",
            ],
            Self::CommandGroupNotFound => &["Declare a command for this group in devloop.toml"],
            Self::CommandNoDefault | Self::CommandAmbiguousDefault => {
                &["Mark exactly one command of the group with default = true"]
            }
            Self::CommandNotFound | Self::CommandGroupMismatch => {
                &["Check the command id passed on the command line"]
            }
            Self::CommandPlanError => &["Check the child ids listed by the composite command"],
            Self::CommandExecutionFailed => &[
                "Inspect the captured output above",
                "Fix the source and save; the next change triggers a new push",
            ],
            Self::CommandSupervisorError => &["Check `devloop logs` for the container output"],
            Self::SyncCorruptIndex => &["The index is rebuilt automatically with a full push"],
            Self::SyncScanFailed => &["Check file permissions in the project tree"],
            Self::SyncPartialPush => &["The next change retries the failed files"],
            Self::SyncIndexWriteFailed => &["Check that .devloop/ is writable"],
            Self::SyncCancelled => &[],
            Self::TunnelPortUnavailable => &["Free a port or use --random-ports"],
            Self::TunnelForwardFailed => &["Check cluster connectivity"],
            Self::TunnelStale => &["Restart the dev session"],
            Self::TunnelNoDebugEndpoint => &["Declare an endpoint named debug in devloop.toml"],
            Self::PlatformWorkloadNotFound => &["Deploy the component before starting a dev session"],
            Self::PlatformExecFailed | Self::PlatformTargetGone => {
                &["Check the pod status with kubectl get pods"]
            }
            Self::PlatformClientMissing => &[
                "Install kubectl and make sure it is on PATH",
                "Or set DEVLOOP_KUBECTL to its location",
            ],
            Self::InternalIoError
            | Self::InternalSerdeError
            | Self::InternalLoggingError
            | Self::InternalStateError => &["Re-run with -v and report the log output"],
        }
    }

    /// Returns every code, for catalog checks.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ManifestNotFound,
            Self::ManifestParseError,
            Self::ManifestInvalid,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::SessionAlreadyRunning,
            Self::CommandGroupNotFound,
            Self::CommandNoDefault,
            Self::CommandAmbiguousDefault,
            Self::CommandNotFound,
            Self::CommandGroupMismatch,
            Self::CommandPlanError,
            Self::CommandExecutionFailed,
            Self::CommandSupervisorError,
            Self::SyncCorruptIndex,
            Self::SyncScanFailed,
            Self::SyncPartialPush,
            Self::SyncIndexWriteFailed,
            Self::SyncCancelled,
            Self::TunnelPortUnavailable,
            Self::TunnelForwardFailed,
            Self::TunnelStale,
            Self::TunnelNoDebugEndpoint,
            Self::PlatformWorkloadNotFound,
            Self::PlatformExecFailed,
            Self::PlatformClientMissing,
            Self::PlatformTargetGone,
            Self::InternalIoError,
            Self::InternalSerdeError,
            Self::InternalLoggingError,
            Self::InternalStateError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code_string())
    }
}

/// Error categories grouping codes by subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Manifest and configuration errors (E001-E099)
    Config,
    /// Command group errors (E100-E199)
    Command,
    /// File index and transfer errors (E200-E299)
    Sync,
    /// Port-forwarding errors (E300-E399)
    Tunnel,
    /// Cluster plumbing errors (E400-E499)
    Platform,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns the lowercase name shown next to the error code.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "configuration error",
            Self::Command => "command group error",
            Self::Sync => "sync error",
            Self::Tunnel => "tunnel error",
            Self::Platform => "platform error",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How an error affects the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Reported immediately, never auto-corrected.
    Configuration,
    /// Retried by the owning boundary or healed by the next cycle.
    Transient,
    /// A plan leaf failed; the watcher keeps going.
    PartialExecution,
    /// The session stops.
    Fatal,
}

impl ErrorClass {
    /// Process exit code for this class.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PartialExecution => 1,
            Self::Configuration => 2,
            Self::Transient => 3,
            Self::Fatal => 4,
        }
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "DL-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Session reaction class
    pub class: ErrorClass,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
