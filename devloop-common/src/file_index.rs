//! Persisted file index and the diff engine.
//!
//! The index records, per relative path, the size and content signature of
//! every file last acknowledged by the remote side. It is only ever replaced
//! wholesale: [`FileIndex::commit`] produces a new value and
//! [`FileIndex::save`] writes it through a temp file and rename, so readers
//! never observe a partial index.
//!
//! On-disk format (`.devloop/file-index.json`):
//!
//! ```json
//! {"version": 1, "target": "<pod uid>", "files": {"src/app.js": {"size": 120, "lastModifiedDate": "<blake3>"}}}
//! ```
//!
//! `target` is the uid of the pod the entries were acknowledged by. An index
//! recorded against another pod says nothing about what a new pod holds.

use crate::config::{STATE_DIR, state_dir};
use crate::errors::ErrorCode;
use crate::ignore_rules::IgnoreRules;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Index file name inside the state directory.
pub const INDEX_FILE: &str = "file-index.json";

/// Current on-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// Returns `<root>/.devloop/file-index.json`.
pub fn index_path(root: &Path) -> PathBuf {
    state_dir(root).join(INDEX_FILE)
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("file index {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to scan {path}: {message}")]
    Scan { path: PathBuf, message: String },
}

impl IndexError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Corrupt { .. } => ErrorCode::SyncCorruptIndex,
            Self::Io { .. } => ErrorCode::SyncIndexWriteFailed,
            Self::Scan { .. } => ErrorCode::SyncScanFailed,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── Entries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// `/`-separated path relative to the project root; the map key on disk.
    #[serde(skip)]
    pub relative_path: String,
    pub size: u64,
    /// blake3 hex digest of the file content.
    #[serde(rename = "lastModifiedDate")]
    pub signature: String,
    #[serde(
        rename = "lastSyncedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn new(relative_path: impl Into<String>, size: u64, signature: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            signature: signature.into(),
            last_synced_at: None,
        }
    }

    fn same_content(&self, other: &FileEntry) -> bool {
        self.size == other.size && self.signature == other.signature
    }
}

/// Snapshot of the files currently on disk, keyed by relative path.
pub type TreeListing = BTreeMap<String, FileEntry>;

/// Difference between the index and the tree on disk. Each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub added: Vec<FileEntry>,
    pub modified: Vec<FileEntry>,
    pub deleted: Vec<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Files whose content must be uploaded.
    pub fn transfers(&self) -> impl Iterator<Item = &FileEntry> {
        self.added.iter().chain(self.modified.iter())
    }

    pub fn transfer_bytes(&self) -> u64 {
        self.transfers().map(|e| e.size).sum()
    }

    /// Every entry of `listing` as an addition; used for full pushes.
    pub fn all_added(listing: &TreeListing) -> Self {
        Self {
            added: listing.values().cloned().collect(),
            ..Self::default()
        }
    }
}

// ── Index ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndex {
    entries: BTreeMap<String, FileEntry>,
    version: u32,
    target: Option<String>,
}

impl Default for FileIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl FileIndex {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            version: INDEX_VERSION,
            target: None,
        }
    }

    /// Load the index at `path`; a missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No file index yet");
                return Ok(Self::empty());
            }
            Err(e) => return Err(IndexError::io(path, e)),
        };

        let corrupt = |reason: String| IndexError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file: IndexFile = serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
        if file.version != INDEX_VERSION {
            return Err(corrupt(format!("unsupported version {}", file.version)));
        }

        let mut entries = BTreeMap::new();
        for (key, mut entry) in file.files {
            if !is_portable_relative(&key) {
                return Err(corrupt(format!("invalid path '{key}'")));
            }
            entry.relative_path = key.clone();
            entries.insert(key, entry);
        }

        Ok(Self {
            entries,
            version: file.version,
            target: file.target,
        })
    }

    /// Persist atomically: write a sibling temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;

        let body = IndexFile {
            version: self.version,
            target: self.target.clone(),
            files: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&body).map_err(|e| IndexError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| IndexError::io(parent, e))?;
        tmp.write_all(&json).map_err(|e| IndexError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| IndexError::io(path, e))?;
        tmp.persist(path).map_err(|e| IndexError::io(path, e.error))?;

        trace!(path = %path.display(), entries = self.entries.len(), "File index saved");
        Ok(())
    }

    /// Compare the index against `current`, skipping ignored paths on both sides.
    pub fn diff(&self, current: &TreeListing, rules: &IgnoreRules) -> Changeset {
        let mut changeset = Changeset::default();

        for (path, entry) in current {
            if rules.is_ignored(path, false) {
                continue;
            }
            match self.entries.get(path) {
                None => changeset.added.push(entry.clone()),
                Some(stored) if !stored.same_content(entry) => {
                    changeset.modified.push(entry.clone())
                }
                Some(_) => {}
            }
        }

        changeset.deleted = self
            .entries
            .keys()
            .filter(|path| !current.contains_key(*path) && !rules.is_ignored(path, false))
            .cloned()
            .collect();

        changeset
    }

    /// New index reflecting a pushed changeset. Only call after the push
    /// was fully acknowledged.
    #[must_use]
    pub fn commit(&self, changeset: &Changeset) -> FileIndex {
        let now = Utc::now();
        let mut entries = self.entries.clone();
        for entry in changeset.transfers() {
            let mut entry = entry.clone();
            entry.last_synced_at = Some(now);
            entries.insert(entry.relative_path.clone(), entry);
        }
        for path in &changeset.deleted {
            entries.remove(path);
        }
        FileIndex {
            entries,
            version: INDEX_VERSION,
            target: self.target.clone(),
        }
    }

    /// Record the pod uid the entries were pushed to.
    #[must_use]
    pub fn with_target(mut self, uid: impl Into<String>) -> Self {
        self.target = Some(uid.into());
        self
    }

    /// Uid of the pod this index was last pushed to.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// True when the entries describe what `uid` holds. An empty index
    /// matches every target.
    pub fn matches_target(&self, uid: &str) -> bool {
        self.entries.is_empty() || self.target.as_deref() == Some(uid)
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileEntry> {
        self.entries.get(relative_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

fn is_portable_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

// ── Tree scanning ───────────────────────────────────────────────────────

/// Convert a path under `root` into the canonical `/`-separated form.
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// blake3 digest of a file's content.
pub fn file_signature(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// List every regular, non-ignored file under `root`.
///
/// Ignored directories are pruned without descending. Symlinks are not
/// followed; files that vanish between listing and hashing are skipped.
pub fn scan_tree(root: &Path, rules: &IgnoreRules) -> Result<TreeListing, IndexError> {
    let walk_root = root.to_path_buf();
    let walk_rules = rules.clone();
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            match to_relative(&walk_root, entry.path()) {
                Some(rel) => !walk_rules.is_ignored(&rel, is_dir),
                None => true,
            }
        })
        .build();

    let mut listing = TreeListing::new();
    for result in walker {
        let entry = result.map_err(|e| IndexError::Scan {
            path: root.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = to_relative(root, entry.path()) else {
            continue;
        };

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %rel, error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let signature = match file_signature(entry.path()) {
            Ok(sig) => sig,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %rel, "File vanished during scan");
                continue;
            }
            Err(e) => return Err(IndexError::io(entry.path(), e)),
        };
        listing.insert(rel.clone(), FileEntry::new(rel, size, signature));
    }

    Ok(listing)
}

/// Remove the index file. Returns false when it did not exist.
pub fn delete_index(path: &Path) -> Result<bool, IndexError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IndexError::io(path, e)),
    }
}

/// Make sure the project `.gitignore` excludes the state directory.
///
/// Returns true when the file was changed.
pub fn ensure_state_dir_ignored(root: &Path) -> Result<bool, IndexError> {
    let path = root.join(".gitignore");
    let existing = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(IndexError::io(&path, e)),
    };

    let entry = format!("/{STATE_DIR}/");
    let present = existing.lines().map(str::trim).any(|line| {
        line == STATE_DIR
            || line.trim_start_matches('/').trim_end_matches('/') == STATE_DIR
    });
    if present {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    std::fs::write(&path, updated).map_err(|e| IndexError::io(&path, e))?;
    debug!(path = %path.display(), "Added state directory to .gitignore");
    Ok(true)
}
