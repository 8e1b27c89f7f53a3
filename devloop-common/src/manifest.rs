//! Component manifest: containers, endpoints and commands.
//!
//! The manifest (`devloop.toml`) is owned by the user; devloop only consumes
//! it. Commands are a tagged union so plan construction can match on the
//! kind directly.
//!
//! ```toml
//! name = "nodejs"
//!
//! [[containers]]
//! name = "runtime"
//! endpoints = [{ name = "http", target_port = 3000 }, { name = "debug", target_port = 5858 }]
//!
//! [[commands]]
//! id = "install"
//! group = "build"
//! default = true
//! exec = { component = "runtime", command_line = "npm install", working_dir = "/projects" }
//!
//! [[commands]]
//! id = "all"
//! composite = { commands = ["install", "run"] }
//! ```

use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifest file name looked up at the project root.
pub const MANIFEST_FILE: &str = "devloop.toml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no {MANIFEST_FILE} found in {0}")]
    NotFound(PathBuf),

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

    #[error("duplicate command id \"{0}\"")]
    DuplicateCommand(String),

    #[error("command \"{command}\" targets unknown container \"{container}\"")]
    UnknownContainer { command: String, container: String },

    #[error("commands \"{first}\" and \"{second}\" both map to program name \"{program}\"")]
    ProgramNameClash {
        first: String,
        second: String,
        program: String,
    },
}

impl ManifestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ManifestNotFound,
            Self::Read { .. } | Self::Parse { .. } => ErrorCode::ManifestParseError,
            Self::DuplicateCommand(_)
            | Self::UnknownContainer { .. }
            | Self::ProgramNameClash { .. } => ErrorCode::ManifestInvalid,
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────

/// Supervisor program name for a command id. It names the pid file of the
/// command in the container.
pub fn program_name(id: &str) -> String {
    id.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Command groups a command can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandGroup {
    Build,
    Run,
    Debug,
    Test,
    Deploy,
    Init,
}

impl CommandGroup {
    /// Groups whose leaves start long-running supervised processes.
    pub fn is_supervised(self) -> bool {
        matches!(self, Self::Run | Self::Debug)
    }
}

impl fmt::Display for CommandGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::Run => "run",
            Self::Debug => "debug",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Init => "init",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Remote command line executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub component: String,
    pub command_line: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// The process reloads changed sources itself and need not be restarted.
    #[serde(default)]
    pub hot_reload_capable: bool,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Exec(ExecSpec),
    /// Ordered child command ids.
    Composite {
        commands: Vec<String>,
    },
    /// Applies a cluster resource (`uri` is relative to the project root).
    Apply {
        component: String,
        #[serde(default)]
        uri: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(default)]
    pub group: Option<CommandGroup>,
    #[serde(default, rename = "default")]
    pub is_default: bool,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    /// Case-insensitive identity used for lookups.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }

    pub fn exec(&self) -> Option<&ExecSpec> {
        match &self.kind {
            CommandKind::Exec(spec) => Some(spec),
            _ => None,
        }
    }
}

// ── Containers and endpoints ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
    Ws,
    Wss,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub target_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Endpoint {
    /// Debug endpoints are only forwarded for debug sessions.
    pub fn is_debug(&self) -> bool {
        self.name.to_lowercase().starts_with("debug")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub source_mapping: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

// ── Manifest ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default = "default_app")]
    pub app: String,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

fn default_app() -> String {
    "app".to_string()
}

impl Manifest {
    /// Load and validate `<root>/devloop.toml`.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let path = root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(ManifestError::NotFound(root.to_path_buf()));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, &path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        let mut programs: HashMap<String, &str> = HashMap::new();
        let containers: HashSet<&str> = self.containers.iter().map(|c| c.name.as_str()).collect();
        for command in &self.commands {
            if !seen.insert(command.key()) {
                return Err(ManifestError::DuplicateCommand(command.id.clone()));
            }
            let CommandKind::Exec(spec) = &command.kind else {
                continue;
            };
            if !containers.contains(spec.component.as_str()) {
                return Err(ManifestError::UnknownContainer {
                    command: command.id.clone(),
                    container: spec.component.clone(),
                });
            }
            let program = program_name(&command.id);
            if let Some(first) = programs.insert(program.clone(), &command.id) {
                return Err(ManifestError::ProgramNameClash {
                    first: first.to_string(),
                    second: command.id.clone(),
                    program,
                });
            }
        }
        Ok(())
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// `(container, endpoint)` pairs to forward; debug endpoints only when `debug`.
    pub fn forwarded_endpoints(&self, debug: bool) -> Vec<(String, Endpoint)> {
        self.containers
            .iter()
            .flat_map(|c| c.endpoints.iter().map(move |e| (c.name.clone(), e.clone())))
            .filter(|(_, e)| debug || !e.is_debug())
            .collect()
    }

    /// Container that receives synced sources: the first with a source
    /// mapping, else the first declared.
    pub fn source_container(&self) -> Option<&Container> {
        self.containers
            .iter()
            .find(|c| c.source_mapping.is_some())
            .or_else(|| self.containers.first())
    }
}
