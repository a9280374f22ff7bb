//! Declarative, idempotent content patches.
//!
//! A [`Patch`] describes one intended mutation of one file in the target
//! worktree. Patches are generated fresh on every run from the drafts and the
//! current worktree, applied in a fixed order, and recorded only as audit
//! artifacts (`artifacts/patch_bundle.json`, `artifacts/diff_report.json`).
//!
//! # Architecture
//!
//! ```text
//! drafts/** ──generate──> PatchBundle (sorted) ──apply_batch──> DiffReport
//!                               │                    │
//!                               │                    ├── PathPolicy (fail-closed)
//!                               ▼                    └── per-type state machine
//!                      artifacts/patch_bundle.json       absent / matching / differing
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::patch::{plan, apply};
//!
//! let bundle = plan(&ctx, &config.patch, &mut log)?;
//! let report = apply(&ctx, &config.patch, &mut log)?;
//! report.ensure_clean()?;
//! ```

pub mod engine;
pub mod generate;
pub mod markdown;
pub mod safety;

pub use engine::{DiffReport, PatchEngine};
pub use generate::generate_patches;
pub use safety::PathPolicy;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::config::PatchSettings;
use crate::context::RunContext;
use crate::digest::content_hash;
use crate::error::{Result, StewardError};
use crate::events::EventLog;

/// Version of the patch bundle format.
pub const BUNDLE_SCHEMA_VERSION: u32 = 1;

/// Artifact name of the patch bundle.
pub const BUNDLE_ARTIFACT: &str = "patch_bundle";

/// Artifact name of the diff report.
pub const DIFF_REPORT_ARTIFACT: &str = "diff_report";

// ============================================================================
// Patch
// ============================================================================

/// The type-specific part of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchOp {
    /// Write the whole file.
    CreateFile { content: String },
    /// Insert `content` after the heading whose text is `anchor`.
    UpdateByAnchor { anchor: String, content: String },
    /// Merge keys into the leading front-matter block.
    UpdateFrontmatterKeys {
        keys: BTreeMap<String, serde_json::Value>,
    },
    /// Replace the inclusive, 1-indexed line span `[start, end]`.
    UpdateFileRange {
        start: usize,
        end: usize,
        content: String,
    },
}

impl PatchOp {
    /// Wire name of the patch type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::UpdateByAnchor { .. } => "update_by_anchor",
            Self::UpdateFrontmatterKeys { .. } => "update_frontmatter_keys",
            Self::UpdateFileRange { .. } => "update_file_range",
        }
    }

    /// Hash of the payload: the file content for `create_file`, the
    /// canonical JSON of the op otherwise.
    pub fn payload_hash(&self) -> Result<String> {
        match self {
            Self::CreateFile { content } => Ok(content_hash(content)),
            other => Ok(content_hash(serde_json::to_vec(other)?)),
        }
    }
}

/// One intended mutation of one worktree file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub patch_id: String,
    /// Worktree-relative path, `/`-separated.
    pub path: String,
    #[serde(flatten)]
    pub op: PatchOp,
    pub content_hash: String,
    /// Hash the target must have before the patch may change it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_before_hash: Option<String>,
}

impl Patch {
    /// Build a patch with its deterministic hash and id.
    pub fn new(path: impl Into<String>, op: PatchOp) -> Result<Self> {
        let path = path.into();
        let content_hash = op.payload_hash()?;
        let patch_id = patch_id(op.type_name(), &path, &content_hash);
        Ok(Self {
            patch_id,
            path,
            op,
            content_hash,
            expected_before_hash: None,
        })
    }

    /// Require the target to have this hash before it is changed.
    #[must_use]
    pub fn with_expected_before_hash(mut self, hash: Option<String>) -> Self {
        self.expected_before_hash = hash;
        self
    }
}

/// First 16 hex characters of SHA-256 over type, path and payload hash.
fn patch_id(patch_type: &str, path: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [patch_type, path, content_hash] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to one patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied {
        patch_id: String,
        path: String,
        before_hash: Option<String>,
        after_hash: String,
    },
    /// The target already had the desired content.
    Skipped {
        patch_id: String,
        path: String,
        reason: String,
    },
    /// The target is not in a state the patch can be applied to.
    Conflict {
        patch_id: String,
        path: String,
        reason: String,
    },
}

impl PatchOutcome {
    #[must_use]
    pub fn patch_id(&self) -> &str {
        match self {
            Self::Applied { patch_id, .. }
            | Self::Skipped { patch_id, .. }
            | Self::Conflict { patch_id, .. } => patch_id,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Applied { path, .. } | Self::Skipped { path, .. } | Self::Conflict { path, .. } => {
                path
            }
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Ordered set of patches for one run, persisted as an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBundle {
    pub schema_version: u32,
    pub patches: Vec<Patch>,
}

impl PatchBundle {
    /// Bundle `patches`, sorted by path then patch id.
    #[must_use]
    pub fn new(mut patches: Vec<Patch>) -> Self {
        sort_patches(&mut patches);
        Self {
            schema_version: BUNDLE_SCHEMA_VERSION,
            patches,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Check a bundle read back from `source`: the schema version must be
    /// known and every `content_hash` must match its payload.
    pub fn verify(&self, source: &Path) -> Result<()> {
        if self.schema_version != BUNDLE_SCHEMA_VERSION {
            return Err(StewardError::malformed(
                source,
                format!("unsupported schema_version {}", self.schema_version),
            ));
        }
        for patch in &self.patches {
            if patch.op.payload_hash()? != patch.content_hash {
                return Err(StewardError::malformed(
                    source,
                    format!(
                        "content_hash of patch {} does not match its payload",
                        patch.patch_id
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Sort into application order.
pub fn sort_patches(patches: &mut [Patch]) {
    patches.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.patch_id.cmp(&b.patch_id)));
}

// ============================================================================
// Patch Stage
// ============================================================================

/// Generate patches from `drafts/` and write the bundle artifact.
///
/// Any failure is recorded as `RUN_FAILED` before it propagates.
pub fn plan(ctx: &RunContext, settings: &PatchSettings, log: &mut EventLog) -> Result<PatchBundle> {
    let policy = PathPolicy::from_settings(ctx.layout().worktree(), settings);
    let result = generate_patches(
        &ctx.layout().drafts_dir(),
        &policy,
        settings.output_prefix.as_deref(),
    )
    .and_then(|bundle| {
        ArtifactStore::new(ctx.layout().clone()).write_json(log, BUNDLE_ARTIFACT, &bundle)?;
        Ok(bundle)
    });
    match result {
        Ok(bundle) => {
            info!("Planned {} patches", bundle.patches.len());
            Ok(bundle)
        }
        Err(e) => {
            log.emit_failure(&e)?;
            Err(e)
        }
    }
}

/// Apply the stored bundle and write the diff report artifact.
///
/// A halted batch is still reported; a policy violation or I/O error is
/// recorded as `RUN_FAILED` before it propagates.
pub fn apply(ctx: &RunContext, settings: &PatchSettings, log: &mut EventLog) -> Result<DiffReport> {
    let store = ArtifactStore::new(ctx.layout().clone());
    let policy = PathPolicy::from_settings(ctx.layout().worktree(), settings);
    let engine = PatchEngine::new(policy);

    let result = store
        .load_json::<PatchBundle>(BUNDLE_ARTIFACT)
        .and_then(|bundle| {
            bundle.verify(&store.json_path(BUNDLE_ARTIFACT))?;
            engine.apply_batch(&bundle.patches)
        });
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            log.emit_failure(&e)?;
            return Err(e);
        }
    };

    store.write_json(log, DIFF_REPORT_ARTIFACT, &report)?;
    if let Err(e) = report.ensure_clean() {
        log.emit_failure(&e)?;
    }
    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================
