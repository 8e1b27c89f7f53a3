//! Ignore rules for sync and watch.
//!
//! Patterns come from `.devloopignore` when present, otherwise from
//! `.gitignore`, using gitignore syntax (negation included). `.git/` and the
//! `.devloop/` state directory are always ignored.

use crate::config::STATE_DIR;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Project-specific ignore file, preferred over `.gitignore`.
pub const IGNORE_FILE: &str = ".devloopignore";

pub const GITIGNORE_FILE: &str = ".gitignore";

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: ignore::Error,
    },
}

/// Compiled ignore matcher for one project root.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    matcher: Gitignore,
    source: Option<PathBuf>,
    patterns: Vec<String>,
}

impl IgnoreRules {
    /// Load rules for `root` from `.devloopignore` or `.gitignore`.
    pub fn load(root: &Path) -> Result<Self, IgnoreError> {
        let source = [IGNORE_FILE, GITIGNORE_FILE]
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_file());

        let patterns = match &source {
            Some(path) => parse_ignore_file(path)?,
            None => Vec::new(),
        };
        let mut rules = Self::from_patterns(root, &patterns)?;
        rules.source = source;
        Ok(rules)
    }

    /// Build rules from explicit patterns plus the built-in ones.
    pub fn from_patterns<S: AsRef<str>>(root: &Path, patterns: &[S]) -> Result<Self, IgnoreError> {
        let mut builder = GitignoreBuilder::new(root);
        let builtin = [".git/".to_string(), format!("{STATE_DIR}/")];
        let all: Vec<String> = builtin
            .into_iter()
            .chain(patterns.iter().map(|p| p.as_ref().to_string()))
            .collect();
        for pattern in &all {
            builder
                .add_line(None, pattern)
                .map_err(|source| IgnoreError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }
        let matcher = builder.build().map_err(|source| IgnoreError::Pattern {
            pattern: all.join(", "),
            source,
        })?;
        Ok(Self {
            matcher,
            source: None,
            patterns: all,
        })
    }

    /// True if `relative_path` (or any parent directory) is ignored.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let path = Path::new(relative_path);
        if path.has_root() || relative_path.is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }

    /// File the rules were read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Read an ignore file, dropping blank lines and comments.
pub fn parse_ignore_file(path: &Path) -> Result<Vec<String>, IgnoreError> {
    let content = std::fs::read_to_string(path).map_err(|source| IgnoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_ignore_content(&content))
}

pub fn parse_ignore_content(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ignore_content_skips_comments() {
        let patterns = parse_ignore_content("# deps\nnode_modules/\n\n  *.log  \n");
        assert_eq!(patterns, vec!["node_modules/", "*.log"]);
    }

    #[test]
    fn test_builtin_rules_always_apply() {
        let dir = TempDir::new().unwrap();
        let rules = IgnoreRules::load(dir.path()).unwrap();
        assert!(rules.is_ignored(".git/HEAD", false));
        assert!(rules.is_ignored(".devloop/file-index.json", false));
        assert!(rules.is_ignored(".devloop", true));
        assert!(!rules.is_ignored("src/main.rs", false));
        assert!(rules.source().is_none());
    }

    #[test]
    fn test_devloopignore_preferred_over_gitignore() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.txt\n").unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.log\n").unwrap();

        let rules = IgnoreRules::load(dir.path()).unwrap();
        assert!(rules.is_ignored("debug.log", false));
        assert!(!rules.is_ignored("notes.txt", false));
        assert_eq!(rules.source(), Some(dir.path().join(IGNORE_FILE).as_path()));
    }

    #[test]
    fn test_gitignore_used_as_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "node_modules/\n").unwrap();

        let rules = IgnoreRules::load(dir.path()).unwrap();
        assert!(rules.is_ignored("node_modules/express/index.js", false));
        assert!(!rules.is_ignored("src/node_modules.rs", false));
    }

    #[test]
    fn test_negation_reincludes_file() {
        let dir = TempDir::new().unwrap();
        let rules = IgnoreRules::from_patterns(dir.path(), &["*.env", "!keep.env"]).unwrap();
        assert!(rules.is_ignored("secret.env", false));
        assert!(!rules.is_ignored("keep.env", false));
    }
}
