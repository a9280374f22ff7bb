//! Artifact I/O.
//!
//! Run artifacts (`artifacts/*.json`, `snapshot.json`, checkpoint metadata,
//! patched worktree files) are always written atomically: the bytes go to a
//! sibling temporary file which is synced and then renamed over the target.
//! A crash therefore leaves either the old content or the new content, never
//! a truncated mix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::context::RunLayout;
use crate::digest::content_hash;
use crate::error::{Result, StewardError};
use crate::events::replay::ArtifactRef;
use crate::events::{EventKind, EventLog};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = "tmp";

/// Atomically replace `path` with `bytes`, creating parent directories.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(bytes)?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{TMP_SUFFIX}", std::process::id()))
}

/// Read and decode a JSON artifact.
///
/// A missing file is [`StewardError::MissingArtifact`]; undecodable content is
/// [`StewardError::MalformedArtifact`].
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(StewardError::missing(path)),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|e| StewardError::malformed(path, e.to_string()))
}

/// Pretty JSON with a trailing newline.
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes named artifacts under `artifacts/` and records them in the log.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: RunLayout,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// Path of the artifact `name` (`artifacts/<name>.json`).
    #[must_use]
    pub fn json_path(&self, name: &str) -> PathBuf {
        self.layout.artifacts_dir().join(format!("{name}.json"))
    }

    /// Serialize `value` to `artifacts/<name>.json` and emit `ARTIFACT_WRITTEN`.
    pub fn write_json<T: Serialize>(
        &self,
        log: &mut EventLog,
        name: &str,
        value: &T,
    ) -> Result<ArtifactRef> {
        let path = self.json_path(name);
        self.write_bytes(log, name, &path, &to_json_bytes(value)?)
    }

    /// Write a text artifact at `rel_path` (relative to `artifacts/`).
    pub fn write_text(
        &self,
        log: &mut EventLog,
        name: &str,
        rel_path: &Path,
        text: &str,
    ) -> Result<ArtifactRef> {
        let path = self.layout.artifacts_dir().join(rel_path);
        self.write_bytes(log, name, &path, text.as_bytes())
    }

    /// Decode `artifacts/<name>.json`.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        load_json(&self.json_path(name))
    }

    fn write_bytes(
        &self,
        log: &mut EventLog,
        name: &str,
        path: &Path,
        bytes: &[u8],
    ) -> Result<ArtifactRef> {
        atomic_write(path, bytes)?;
        let artifact = ArtifactRef {
            path: self.run_relative(path),
            content_hash: content_hash(bytes),
        };
        log.emit(EventKind::ArtifactWritten {
            name: name.to_string(),
            path: artifact.path.clone(),
            content_hash: artifact.content_hash.clone(),
        })?;
        debug!("Wrote artifact {} ({})", name, artifact.path);
        Ok(artifact)
    }

    fn run_relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(self.layout.root()).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

// ============================================================================
// Tests
// ============================================================================
