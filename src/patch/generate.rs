//! Patch generation from drafts.
//!
//! Every file under `drafts/` becomes a `create_file` patch for
//! `<output_prefix>/<relative path>` in the worktree, unless the target
//! already holds exactly that content, in which case no patch is emitted at
//! all. Re-running generation over unchanged inputs therefore yields an empty
//! bundle.

use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use super::safety::PathPolicy;
use super::{Patch, PatchBundle, PatchOp};
use crate::digest::{content_hash, file_hash};
use crate::error::{Result, StewardError};

/// Build the sorted patch bundle for `drafts_dir`.
///
/// A missing drafts directory yields an empty bundle.
pub fn generate_patches(
    drafts_dir: &Path,
    policy: &PathPolicy,
    output_prefix: Option<&Path>,
) -> Result<PatchBundle> {
    if !drafts_dir.exists() {
        debug!("No drafts at {}", drafts_dir.display());
        return Ok(PatchBundle::new(Vec::new()));
    }

    let mut patches = Vec::new();
    let walker = WalkDir::new(drafts_dir)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| {
            StewardError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(drafts_dir)
            .map_err(|e| StewardError::malformed(entry.path(), e.to_string()))?;
        let target_rel = match output_prefix {
            Some(prefix) => prefix.join(rel),
            None => rel.to_path_buf(),
        };
        let target = policy.resolve(&target_rel)?;
        let path = policy.relative(&target).ok_or_else(|| {
            StewardError::policy(target_rel.to_string_lossy(), "path is not valid UTF-8")
        })?;

        let bytes = std::fs::read(entry.path())?;
        let content = String::from_utf8(bytes)
            .map_err(|_| StewardError::malformed(entry.path(), "draft is not valid UTF-8"))?;

        let existing = file_hash(&target)?;
        if existing.as_deref() == Some(content_hash(&content).as_str()) {
            debug!("Omitting {}: worktree already matches draft", path);
            continue;
        }

        let patch =
            Patch::new(path, PatchOp::CreateFile { content })?.with_expected_before_hash(existing);
        patches.push(patch);
    }

    Ok(PatchBundle::new(patches))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchEngine;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        drafts: std::path::PathBuf,
        policy: PathPolicy,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("create temp dir");
        let drafts = dir.path().join("drafts");
        let worktree = dir.path().join("worktree");
        fs::create_dir_all(drafts.join("guide")).expect("mkdir");
        fs::create_dir_all(&worktree).expect("mkdir");
        fs::write(drafts.join("index.md"), "# Home\n").expect("write");
        fs::write(drafts.join("guide/setup.md"), "# Setup\n").expect("write");
        Fixture {
            policy: PathPolicy::new(&worktree),
            drafts,
            _dir: dir,
        }
    }

    #[test]
    fn test_generates_sorted_create_patches() {
        let fx = fixture();
        let bundle =
            generate_patches(&fx.drafts, &fx.policy, Some(Path::new("docs"))).expect("generate");
        let paths: Vec<_> = bundle.patches.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/guide/setup.md", "docs/index.md"]);
        assert!(bundle.patches.iter().all(|p| p.expected_before_hash.is_none()));
    }

    #[test]
    fn test_second_pass_over_unchanged_inputs_is_empty() {
        let fx = fixture();
        let first = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        PatchEngine::new(fx.policy.clone())
            .apply_batch(&first.patches)
            .expect("apply");

        let second = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        assert!(second.is_empty());
        let third = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        assert_eq!(second, third);
    }

    #[test]
    fn test_changed_target_records_before_hash() {
        let fx = fixture();
        let target = fx.policy.root().join("index.md");
        fs::write(&target, "# Old home\n").expect("write");

        let bundle = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        let index = bundle
            .patches
            .iter()
            .find(|p| p.path == "index.md")
            .expect("index patch");
        assert_eq!(
            index.expected_before_hash.as_deref(),
            Some(content_hash("# Old home\n").as_str())
        );
    }

    #[test]
    fn test_generation_is_byte_stable() {
        let fx = fixture();
        let a = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        let b = generate_patches(&fx.drafts, &fx.policy, None).expect("generate");
        assert_eq!(
            serde_json::to_vec(&a).expect("encode"),
            serde_json::to_vec(&b).expect("encode")
        );
    }

    #[test]
    fn test_missing_drafts_dir_is_empty() {
        let dir = TempDir::new().expect("create temp dir");
        let bundle = generate_patches(&dir.path().join("drafts"), &PathPolicy::new(dir.path()), None)
            .expect("generate");
        assert!(bundle.is_empty());
    }
}
