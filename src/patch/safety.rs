//! Worktree confinement for patch targets.
//!
//! Every target path is checked before the engine touches the filesystem:
//! it must be relative, must not climb out with `..`, must be valid UTF-8,
//! must fall under an allowed prefix when an allow-list is configured, and
//! must not reach outside the worktree through a symlinked directory.

use std::path::{Component, Path, PathBuf};

use crate::config::PatchSettings;
use crate::error::{Result, StewardError};

/// Path rules for one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    root: PathBuf,
    allowed_prefixes: Vec<PathBuf>,
}

impl PathPolicy {
    /// Policy that allows the whole worktree.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowed_prefixes: Vec::new(),
        }
    }

    /// Policy for `root` with the allow-list from `[patch]`.
    pub fn from_settings(root: impl Into<PathBuf>, settings: &PatchSettings) -> Self {
        Self::new(root).with_allowed_prefixes(settings.allowed_prefixes.clone())
    }

    /// Restrict targets to these worktree-relative prefixes.
    #[must_use]
    pub fn with_allowed_prefixes(mut self, prefixes: Vec<PathBuf>) -> Self {
        self.allowed_prefixes = prefixes.iter().map(|p| normalize(p)).collect();
        self
    }

    /// The worktree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a worktree-relative target to an absolute path.
    ///
    /// # Errors
    ///
    /// [`StewardError::PolicyViolation`] when any rule is broken.
    pub fn resolve(&self, target: impl AsRef<Path>) -> Result<PathBuf> {
        let target = target.as_ref();
        let display = target.to_string_lossy().into_owned();

        if target.to_str().is_none() {
            return Err(StewardError::policy(display, "path is not valid UTF-8"));
        }
        if target.as_os_str().is_empty() {
            return Err(StewardError::policy(display, "empty path"));
        }

        let mut rel = PathBuf::new();
        for component in target.components() {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(StewardError::policy(display, "path escapes the worktree"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StewardError::policy(display, "absolute paths are not allowed"))
                }
            }
        }
        if rel.as_os_str().is_empty() {
            return Err(StewardError::policy(display, "path names the worktree itself"));
        }

        if !self.allowed_prefixes.is_empty()
            && !self.allowed_prefixes.iter().any(|p| rel.starts_with(p))
        {
            return Err(StewardError::policy(
                display,
                "path is outside the allowed prefixes",
            ));
        }

        self.check_symlinks(&rel, &display)?;
        Ok(self.root.join(rel))
    }

    /// Worktree-relative, `/`-separated form of an absolute path under the root.
    #[must_use]
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        parts.map(|p| p.join("/"))
    }

    /// Reject existing ancestors that are symlinks pointing out of the root.
    fn check_symlinks(&self, rel: &Path, display: &str) -> Result<()> {
        let mut current = self.root.clone();
        let mut canonical_root: Option<PathBuf> = None;
        for component in rel.components() {
            current.push(component);
            let Ok(meta) = std::fs::symlink_metadata(&current) else {
                // Nothing below a missing component exists either.
                return Ok(());
            };
            if !meta.file_type().is_symlink() {
                continue;
            }
            let root = match &canonical_root {
                Some(root) => root.clone(),
                None => {
                    let root = self.root.canonicalize()?;
                    canonical_root = Some(root.clone());
                    root
                }
            };
            match current.canonicalize() {
                Ok(resolved) if resolved.starts_with(&root) => {}
                _ => {
                    return Err(StewardError::policy(
                        display,
                        "path resolves outside the worktree through a symlink",
                    ))
                }
            }
        }
        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
