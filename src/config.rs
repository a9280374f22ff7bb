//! Configuration management for steward.
//!
//! Settings live in `steward.toml` inside the run directory (or at an
//! explicit path). Every section is optional; missing values take the
//! defaults below.
//!
//! ```toml
//! run_id = "run-2026-10-18"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! multiplier = 2.0
//! max_delay_ms = 30000
//! jitter_seed = 7
//!
//! [checkpoint]
//! keep_last = 5
//!
//! [patch]
//! worktree = "worktree"
//! output_prefix = "docs"
//! allowed_prefixes = ["docs"]
//!
//! [facts]
//! repo_url = "https://github.com/acme/widget"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::context::CONFIG_FILE;
use crate::error::{Result, StewardError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    /// Run identifier; defaults to the run directory name.
    pub run_id: Option<String>,

    /// Retry policy for worker stages.
    pub retry: RetrySettings,

    /// Checkpoint retention.
    pub checkpoint: CheckpointSettings,

    /// Patch engine settings.
    pub patch: PatchSettings,

    /// Trusted values used by consistency fixes.
    pub facts: FactsSettings,
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Exponential growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on the delay before jitter, in milliseconds.
    pub max_delay_ms: u64,
    /// Seed that makes jitter a pure function of the attempt number.
    pub jitter_seed: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_seed: None,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Checkpoint retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Number of most recent checkpoints to keep.
    pub keep_last: usize,
    /// Prune after every stage-boundary checkpoint.
    pub auto_cleanup: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            keep_last: 5,
            auto_cleanup: true,
        }
    }
}

/// Patch engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchSettings {
    /// Target worktree, relative to the run directory.
    pub worktree: PathBuf,
    /// Prefix under the worktree where drafts are published.
    pub output_prefix: Option<PathBuf>,
    /// Worktree-relative prefixes patches may touch (empty allows all).
    pub allowed_prefixes: Vec<PathBuf>,
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self {
            worktree: PathBuf::from(crate::context::DEFAULT_WORKTREE_DIR),
            output_prefix: None,
            allowed_prefixes: Vec::new(),
        }
    }
}

/// Trusted facts supplied by the evidence layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactsSettings {
    /// Canonical repository URL.
    pub repo_url: Option<String>,
}

impl StewardConfig {
    /// Load configuration from a run directory, falling back to defaults.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load_file(&path)
        } else {
            debug!("No {} in {}, using defaults", CONFIG_FILE, run_dir.display());
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from an explicit file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StewardError::config_with_path(format!("cannot read: {e}"), path.to_path_buf())
        })?;
        let config: StewardConfig = toml::from_str(&content).map_err(|e| {
            StewardError::config_with_path(e.to_string(), path.to_path_buf())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Run id from the config, or the run directory's file name.
    #[must_use]
    pub fn resolve_run_id(&self, run_dir: &Path) -> String {
        self.run_id.clone().unwrap_or_else(|| {
            run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string())
        })
    }

    /// Check value ranges and path shapes.
    pub fn validate(&self) -> Result<()> {
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(StewardError::invalid_config(
                "retry.multiplier",
                "must be >= 1.0",
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(StewardError::invalid_config(
                "retry.max_delay_ms",
                "must be >= retry.base_delay_ms",
            ));
        }
        if self.checkpoint.keep_last == 0 {
            return Err(StewardError::invalid_config(
                "checkpoint.keep_last",
                "must keep at least one checkpoint",
            ));
        }
        check_relative("patch.worktree", &self.patch.worktree)?;
        if let Some(prefix) = &self.patch.output_prefix {
            check_relative("patch.output_prefix", prefix)?;
        }
        for prefix in &self.patch.allowed_prefixes {
            check_relative("patch.allowed_prefixes", prefix)?;
        }
        Ok(())
    }
}

fn check_relative(field: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(StewardError::invalid_config(field, "must be a relative path"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(StewardError::invalid_config(field, "must not contain '..'"));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
