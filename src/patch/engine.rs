//! Patch application.
//!
//! Each patch type is a small state machine over the current target state
//! (absent, present and matching, present and differing). A patch that is
//! already in effect is skipped; a patch whose preconditions do not hold is a
//! conflict and writes nothing. Conflicts are returned by value; only policy
//! violations and I/O failures are errors.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::markdown::{
    find_anchor, insert_after_anchor, merge_frontmatter, replace_line_range, FrontmatterMerge,
};
use super::safety::PathPolicy;
use super::{sort_patches, Patch, PatchOp, PatchOutcome};
use crate::artifacts::atomic_write;
use crate::digest::content_hash;
use crate::error::{Result, StewardError};

// ============================================================================
// Diff Report
// ============================================================================

/// Audit record of one batch application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// Whether the batch stopped at a conflict.
    pub halted: bool,
    /// Patches that were not attempted because the batch halted.
    pub not_attempted: usize,
    pub entries: Vec<PatchOutcome>,
}

impl DiffReport {
    fn record(&mut self, outcome: PatchOutcome) {
        match &outcome {
            PatchOutcome::Applied { .. } => self.applied += 1,
            PatchOutcome::Skipped { .. } => self.skipped += 1,
            PatchOutcome::Conflict { .. } => self.conflicts += 1,
        }
        self.entries.push(outcome);
    }

    /// The first conflict, if any.
    #[must_use]
    pub fn first_conflict(&self) -> Option<&PatchOutcome> {
        self.entries.iter().find(|e| e.is_conflict())
    }

    /// Turn a conflicted report into [`StewardError::PatchConflict`].
    pub fn ensure_clean(&self) -> Result<()> {
        match self.first_conflict() {
            Some(PatchOutcome::Conflict {
                patch_id,
                path,
                reason,
            }) => Err(StewardError::PatchConflict {
                patch_id: patch_id.clone(),
                path: path.clone(),
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// One-line summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "applied={} skipped={} conflicts={}{}",
            self.applied,
            self.skipped,
            self.conflicts,
            if self.halted { " (halted)" } else { "" }
        )
    }
}

// ============================================================================
// Patch Engine
// ============================================================================

/// Applies patches to one worktree.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    policy: PathPolicy,
}

impl PatchEngine {
    #[must_use]
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Apply one patch.
    ///
    /// # Errors
    ///
    /// [`StewardError::PolicyViolation`] before any filesystem access when
    /// the target is not allowed; I/O errors from reading or writing.
    pub fn apply(&self, patch: &Patch) -> Result<PatchOutcome> {
        let target = self.policy.resolve(&patch.path)?;
        self.apply_at(patch, &target)
    }

    /// Apply patches sorted by path, stopping at the first conflict.
    ///
    /// Every target is checked against the policy before the first write,
    /// so a violation anywhere in the batch leaves the worktree untouched.
    pub fn apply_batch(&self, patches: &[Patch]) -> Result<DiffReport> {
        let mut ordered = patches.to_vec();
        sort_patches(&mut ordered);

        let targets = ordered
            .iter()
            .map(|p| self.policy.resolve(&p.path))
            .collect::<Result<Vec<PathBuf>>>()?;

        let mut report = DiffReport::default();
        for (index, (patch, target)) in ordered.iter().zip(&targets).enumerate() {
            let outcome = self.apply_at(patch, target)?;
            let conflict = outcome.is_conflict();
            report.record(outcome);
            if conflict {
                report.halted = true;
                report.not_attempted = ordered.len() - index - 1;
                warn!(
                    "Patch {} on {} conflicted; halting batch with {} patches left",
                    patch.patch_id, patch.path, report.not_attempted
                );
                break;
            }
        }

        info!("Patch batch: {}", report.summary());
        Ok(report)
    }

    fn apply_at(&self, patch: &Patch, target: &Path) -> Result<PatchOutcome> {
        let current = read_optional(target)?;
        let outcome = match &patch.op {
            PatchOp::CreateFile { content } => self.create_file(patch, target, current, content)?,
            op => match current {
                None => conflict(patch, "target file does not exist"),
                Some(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => self.update_text(patch, target, &text, op)?,
                    Err(_) => conflict(patch, "target file is not valid UTF-8"),
                },
            },
        };
        debug!(
            "{} {} {}: {}",
            patch.op.type_name(),
            patch.patch_id,
            patch.path,
            outcome_label(&outcome)
        );
        Ok(outcome)
    }

    fn create_file(
        &self,
        patch: &Patch,
        target: &Path,
        current: Option<Vec<u8>>,
        content: &str,
    ) -> Result<PatchOutcome> {
        let before_hash = match current {
            None => None,
            Some(bytes) => {
                let hash = content_hash(&bytes);
                if hash == patch.content_hash {
                    return Ok(skipped(patch, "content already matches"));
                }
                if let Some(reason) = before_hash_mismatch(patch, &hash) {
                    return Ok(conflict(patch, reason));
                }
                Some(hash)
            }
        };
        write(patch, target, before_hash, content)
    }

    fn update_text(
        &self,
        patch: &Patch,
        target: &Path,
        text: &str,
        op: &PatchOp,
    ) -> Result<PatchOutcome> {
        let updated = match op {
            PatchOp::CreateFile { content } => {
                return self.create_file(patch, target, Some(text.as_bytes().to_vec()), content)
            }
            PatchOp::UpdateByAnchor { anchor, content } => {
                if find_anchor(text, anchor).is_none() {
                    return Ok(conflict(patch, format!("anchor '{anchor}' not found")));
                }
                let needle = content.trim();
                if text.contains(needle) {
                    return Ok(skipped(patch, "content already present"));
                }
                match insert_after_anchor(text, anchor, content) {
                    Some(updated) => updated,
                    None => return Ok(conflict(patch, format!("anchor '{anchor}' not found"))),
                }
            }
            PatchOp::UpdateFrontmatterKeys { keys } => match merge_frontmatter(text, keys) {
                Ok(FrontmatterMerge::Unchanged) => {
                    return Ok(skipped(patch, "front matter already up to date"))
                }
                Ok(FrontmatterMerge::Updated(updated)) => updated,
                Err(reason) => return Ok(conflict(patch, reason)),
            },
            PatchOp::UpdateFileRange {
                start,
                end,
                content,
            } => match replace_line_range(text, *start, *end, content) {
                Ok(updated) if updated == text => {
                    return Ok(skipped(patch, "line range already matches"))
                }
                Ok(updated) => updated,
                Err(reason) => return Ok(conflict(patch, reason)),
            },
        };

        let hash = content_hash(text);
        if let Some(reason) = before_hash_mismatch(patch, &hash) {
            return Ok(conflict(patch, reason));
        }
        write(patch, target, Some(hash), &updated)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn before_hash_mismatch(patch: &Patch, current: &str) -> Option<String> {
    match &patch.expected_before_hash {
        Some(expected) if expected != current => Some(format!(
            "before-hash mismatch: expected {}, found {}",
            short(expected),
            short(current)
        )),
        _ => None,
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn write(patch: &Patch, target: &Path, before_hash: Option<String>, content: &str) -> Result<PatchOutcome> {
    atomic_write(target, content.as_bytes())?;
    Ok(PatchOutcome::Applied {
        patch_id: patch.patch_id.clone(),
        path: patch.path.clone(),
        before_hash,
        after_hash: content_hash(content),
    })
}

fn skipped(patch: &Patch, reason: impl Into<String>) -> PatchOutcome {
    PatchOutcome::Skipped {
        patch_id: patch.patch_id.clone(),
        path: patch.path.clone(),
        reason: reason.into(),
    }
}

fn conflict(patch: &Patch, reason: impl Into<String>) -> PatchOutcome {
    PatchOutcome::Conflict {
        patch_id: patch.patch_id.clone(),
        path: patch.path.clone(),
        reason: reason.into(),
    }
}

fn outcome_label(outcome: &PatchOutcome) -> &'static str {
    match outcome {
        PatchOutcome::Applied { .. } => "applied",
        PatchOutcome::Skipped { .. } => "skipped",
        PatchOutcome::Conflict { .. } => "conflict",
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> PatchEngine {
        PatchEngine::new(PathPolicy::new(dir.path()))
    }

    fn create(path: &str, content: &str) -> Patch {
        Patch::new(
            path,
            PatchOp::CreateFile {
                content: content.into(),
            },
        )
        .expect("patch")
    }

    fn write_file(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn read_file(dir: &TempDir, rel: &str) -> String {
        fs::read_to_string(dir.path().join(rel)).expect("read")
    }

    #[test]
    fn test_create_file_applies_then_skips() {
        let dir = TempDir::new().expect("create temp dir");
        let engine = engine(&dir);
        let patch = create("docs/intro.md", "# Intro\n");

        let first = engine.apply(&patch).expect("apply");
        assert!(matches!(first, PatchOutcome::Applied { before_hash: None, .. }));
        let second = engine.apply(&patch).expect("apply");
        assert!(matches!(second, PatchOutcome::Skipped { .. }));
        assert_eq!(read_file(&dir, "docs/intro.md"), "# Intro\n");
    }

    #[test]
    fn test_create_file_before_hash_mismatch_conflicts() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "edited by hand\n");
        let patch = create("a.md", "generated\n")
            .with_expected_before_hash(Some(content_hash("original\n")));

        let outcome = engine(&dir).apply(&patch).expect("apply");
        assert!(outcome.is_conflict());
        assert_eq!(read_file(&dir, "a.md"), "edited by hand\n");
    }

    #[test]
    fn test_create_file_overwrites_with_matching_before_hash() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "original\n");
        let patch = create("a.md", "generated\n")
            .with_expected_before_hash(Some(content_hash("original\n")));

        let outcome = engine(&dir).apply(&patch).expect("apply");
        assert!(matches!(outcome, PatchOutcome::Applied { .. }));
        assert_eq!(read_file(&dir, "a.md"), "generated\n");
    }

    #[test]
    fn test_anchor_missing_conflicts_without_write() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "# Title\n\nBody\n");
        let patch = Patch::new(
            "a.md",
            PatchOp::UpdateByAnchor {
                anchor: "Install".into(),
                content: "Steps.".into(),
            },
        )
        .expect("patch");

        let outcome = engine(&dir).apply(&patch).expect("apply");
        assert!(outcome.is_conflict());
        assert_eq!(read_file(&dir, "a.md"), "# Title\n\nBody\n");
    }

    #[test]
    fn test_anchor_insert_is_idempotent() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "# Title\n## Install\nRun.\n");
        let patch = Patch::new(
            "a.md",
            PatchOp::UpdateByAnchor {
                anchor: "Install".into(),
                content: "Needs Rust.\n".into(),
            },
        )
        .expect("patch");
        let engine = engine(&dir);

        assert!(matches!(
            engine.apply(&patch).expect("apply"),
            PatchOutcome::Applied { .. }
        ));
        assert_eq!(
            read_file(&dir, "a.md"),
            "# Title\n## Install\n\nNeeds Rust.\n\nRun.\n"
        );
        assert!(matches!(
            engine.apply(&patch).expect("apply"),
            PatchOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn test_frontmatter_update_and_missing_file() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "# A\n");
        let patch = Patch::new(
            "a.md",
            PatchOp::UpdateFrontmatterKeys {
                keys: BTreeMap::from([("title".to_string(), json!("A"))]),
            },
        )
        .expect("patch");
        let engine = engine(&dir);

        assert!(matches!(
            engine.apply(&patch).expect("apply"),
            PatchOutcome::Applied { .. }
        ));
        assert_eq!(read_file(&dir, "a.md"), "---\ntitle: A\n---\n# A\n");
        assert!(matches!(
            engine.apply(&patch).expect("apply"),
            PatchOutcome::Skipped { .. }
        ));

        let missing = Patch::new("b.md", patch.op.clone()).expect("patch");
        assert!(engine.apply(&missing).expect("apply").is_conflict());
        assert!(!dir.path().join("b.md").exists());
    }

    #[test]
    fn test_range_out_of_bounds_conflicts() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "a.md", "one\ntwo\n");
        let engine = engine(&dir);
        let range = |start, end| {
            Patch::new(
                "a.md",
                PatchOp::UpdateFileRange {
                    start,
                    end,
                    content: "TWO\n".into(),
                },
            )
            .expect("patch")
        };

        assert!(engine.apply(&range(2, 3)).expect("apply").is_conflict());
        assert!(engine.apply(&range(0, 1)).expect("apply").is_conflict());
        assert_eq!(read_file(&dir, "a.md"), "one\ntwo\n");

        assert!(matches!(
            engine.apply(&range(2, 2)).expect("apply"),
            PatchOutcome::Applied { .. }
        ));
        assert_eq!(read_file(&dir, "a.md"), "one\nTWO\n");
        assert!(matches!(
            engine.apply(&range(2, 2)).expect("apply"),
            PatchOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn test_batch_halts_at_first_conflict() {
        let dir = TempDir::new().expect("create temp dir");
        write_file(&dir, "b.md", "hand edited\n");
        let patches = vec![
            create("c.md", "c\n"),
            create("b.md", "b\n").with_expected_before_hash(Some(content_hash("old\n"))),
            create("a.md", "a\n"),
        ];

        let report = engine(&dir).apply_batch(&patches).expect("batch");
        assert!(report.halted);
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.not_attempted, 1);
        assert_eq!(report.entries[0].path(), "a.md");
        assert!(!dir.path().join("c.md").exists());
        assert!(matches!(
            report.ensure_clean(),
            Err(StewardError::PatchConflict { .. })
        ));
    }

    #[test]
    fn test_batch_policy_violation_writes_nothing() {
        let dir = TempDir::new().expect("create temp dir");
        let patches = vec![create("a.md", "a\n"), create("../escape.md", "x\n")];

        let err = engine(&dir).apply_batch(&patches).unwrap_err();
        assert!(matches!(err, StewardError::PolicyViolation { .. }));
        assert!(!dir.path().join("a.md").exists());
    }
}
