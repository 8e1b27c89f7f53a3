//! Shared types and building blocks for devloop.
//!
//! This crate holds everything that does not depend on a running session:
//! the manifest schema, the file index and diff engine, ignore rules,
//! configuration, logging, the error catalog, the collaborator traits and
//! the in-memory mock platform used by tests.

pub mod config;
pub mod errors;
pub mod file_index;
pub mod ignore_rules;
pub mod logging;
pub mod manifest;
pub mod mock;
pub mod remote;
pub mod testing;
pub mod util;

pub use config::{DevloopConfig, EnvError, EnvParser, Sourced};
pub use errors::{ErrorCategory, ErrorClass, ErrorCode, ErrorEntry};
pub use file_index::{Changeset, FileEntry, FileIndex, IndexError, TreeListing};
pub use ignore_rules::IgnoreRules;
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use manifest::{Command, CommandGroup, CommandKind, Endpoint, ExecSpec, Manifest};
pub use remote::{ExecOutput, Platform, RemoteError, TargetRef};
