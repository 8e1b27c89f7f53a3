//! Single-session lock for a project.
//!
//! The index, the debug descriptor and the supervisor pid files all assume a
//! single writer, so only one `dev`/`push`/`watch` may run per project.

use devloop_common::ErrorCode;
use devloop_common::config::state_dir;
use devloop_common::util::is_process_running;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const LOCK_FILE: &str = "session.lock";

/// Stale-lock replacements tried before giving up.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another devloop session (pid {pid}) is already running for this project")]
    AlreadyRunning { pid: u32 },

    #[error("failed to write lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyRunning { .. } => ErrorCode::SessionAlreadyRunning,
            Self::Io { .. } => ErrorCode::InternalIoError,
        }
    }
}

/// PID lock file under `<root>/.devloop/`, removed on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    pub fn path_for(root: &Path) -> PathBuf {
        state_dir(root).join(LOCK_FILE)
    }

    /// Acquire the lock for `root`. A lock left behind by a dead process is
    /// replaced.
    /// The pid file is linked into place without clobbering: readers never
    /// see a partial lock and only one racing session wins.
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = Self::path_for(root);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;
        let own = std::process::id();

        for _ in 0..MAX_ATTEMPTS {
            if try_create(&path, own).map_err(io_err)? {
                debug!(path = %path.display(), "Session lock acquired");
                return Ok(Self { path });
            }
            let holder = read_pid(&path);
            if let Some(pid) = holder
                && pid != own
                && is_process_running(pid)
            {
                return Err(LockError::AlreadyRunning { pid });
            }
            warn!(pid = ?holder, path = %path.display(), "Replacing stale session lock");
            // Someone else may have replaced it already; only remove what we read.
            if read_pid(&path) == holder {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        match read_pid(&path) {
            Some(pid) => Err(LockError::AlreadyRunning { pid }),
            None => Err(io_err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "session lock kept changing",
            ))),
        }
    }

    /// Pid of the live session holding the lock for `root`, if any.
    pub fn holder(root: &Path) -> Option<u32> {
        read_pid(&Self::path_for(root)).filter(|pid| is_process_running(*pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Create `path` holding `pid`. False when the file already exists.
fn try_create(path: &Path, pid: u32) -> io::Result<bool> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    write!(tmp, "{pid}")?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
