//! Narrow fix strategies, dispatched on `(gate, error_code)`.
//!
//! Each strategy touches files only through a [`Workspace`], which confines
//! paths to the worktree and remembers the content hash every file had before
//! the strategy first looked at it. The fix loop uses those pre-image hashes
//! to prove that a reported fix really changed something.

use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

use super::Issue;
use crate::artifacts::atomic_write;
use crate::config::FactsSettings;
use crate::digest::file_hash;
use crate::error::{Result, StewardError};
use crate::patch::markdown::{heading_text, merge_frontmatter, split_frontmatter, FrontmatterMerge};
use crate::patch::PathPolicy;

// ============================================================================
// Workspace
// ============================================================================

/// Policy-checked file access with pre-image tracking.
#[derive(Debug)]
pub struct Workspace {
    policy: PathPolicy,
    pre_images: BTreeMap<String, Option<String>>,
}

impl Workspace {
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            pre_images: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Resolve `rel` and record its current hash if this is the first access.
    pub fn track(&mut self, rel: &str) -> Result<PathBuf> {
        let path = self.policy.resolve(rel)?;
        if !self.pre_images.contains_key(rel) {
            let hash = file_hash(&path)?;
            self.pre_images.insert(rel.to_string(), hash);
        }
        Ok(path)
    }

    /// Read a worktree file as UTF-8 text.
    pub fn read(&mut self, rel: &str) -> Result<String> {
        let path = self.track(rel)?;
        if !path.is_file() {
            return Err(StewardError::missing(path));
        }
        let bytes = std::fs::read(&path)?;
        String::from_utf8(bytes).map_err(|_| StewardError::malformed(&path, "file is not valid UTF-8"))
    }

    /// Replace a worktree file atomically.
    pub fn write(&mut self, rel: &str, content: &str) -> Result<()> {
        let path = self.track(rel)?;
        atomic_write(&path, content.as_bytes())
    }

    /// Hash `rel` had before it was first accessed (`Some(None)` = absent).
    #[must_use]
    pub fn pre_image(&self, rel: &str) -> Option<Option<&str>> {
        self.pre_images.get(rel).map(Option::as_deref)
    }

    /// The subset of `claimed` whose content differs from its pre-image.
    ///
    /// Files the workspace never saw cannot be verified and do not count.
    pub fn changed_files(&self, claimed: &[String]) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for rel in claimed {
            let Some(before) = self.pre_images.get(rel) else {
                debug!("Claimed file {} was never accessed through the workspace", rel);
                continue;
            };
            let after = file_hash(&self.policy.resolve(rel)?)?;
            if &after != before && !changed.contains(rel) {
                changed.push(rel.clone());
            }
        }
        Ok(changed)
    }
}

// ============================================================================
// Strategy Trait
// ============================================================================

/// What a strategy reports back to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyResult {
    /// The strategy believes it fixed the issue by editing `files`.
    Fixed { files: Vec<String> },
    /// The strategy cannot fix this instance.
    Unfixable(String),
}

/// A fix for one family of validation issues.
pub trait FixStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Attempt the fix.
    ///
    /// # Errors
    ///
    /// Only unexpected failures (I/O, policy); a fix that is not possible is
    /// reported as [`StrategyResult::Unfixable`].
    fn apply(&self, issue: &Issue, workspace: &mut Workspace) -> Result<StrategyResult>;
}

fn issue_file(issue: &Issue) -> std::result::Result<&str, StrategyResult> {
    if issue.location.path.is_empty() {
        Err(StrategyResult::Unfixable(
            "issue has no file location".to_string(),
        ))
    } else {
        Ok(&issue.location.path)
    }
}

// ============================================================================
// Token Removal
// ============================================================================

/// Placeholder and draft markers that must not ship.
static TOKEN_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn token_pattern() -> Option<&'static Regex> {
    TOKEN_PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)\b(?:TODO|TBD|FIXME)\b:?|lorem ipsum(?: dolor sit amet)?[,.]?|\{\{[^}]*\}\}|\[PLACEHOLDER\]",
            )
            .ok()
        })
        .as_ref()
}

/// Removes forbidden and placeholder tokens.
#[derive(Debug, Default)]
pub struct TokenRemoval;

impl TokenRemoval {
    /// Strip tokens from one line. Returns `None` when nothing matched.
    fn clean_line(pattern: &Regex, line: &str) -> Option<String> {
        if !pattern.is_match(line) {
            return None;
        }
        let (body, ending) = match line.strip_suffix("\r\n") {
            Some(body) => (body, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            },
        };
        let indent_len = body.len() - body.trim_start().len();
        let replaced = pattern.replace_all(body, "");
        let words: Vec<&str> = replaced.split_whitespace().collect();
        if words.is_empty() {
            return Some(String::new());
        }
        Some(format!("{}{}{}", &body[..indent_len], words.join(" "), ending))
    }
}

impl FixStrategy for TokenRemoval {
    fn name(&self) -> &'static str {
        "token_removal"
    }

    fn apply(&self, issue: &Issue, workspace: &mut Workspace) -> Result<StrategyResult> {
        let rel = match issue_file(issue) {
            Ok(rel) => rel,
            Err(unfixable) => return Ok(unfixable),
        };
        let Some(pattern) = token_pattern() else {
            return Ok(StrategyResult::Unfixable(
                "token pattern unavailable".to_string(),
            ));
        };

        let text = workspace.read(rel)?;
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        if let Some(line) = issue.line() {
            if line > lines.len() {
                return Ok(StrategyResult::Unfixable(format!(
                    "line {line} is past the end of {rel}"
                )));
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut removed = 0usize;
        for (index, line) in lines.iter().enumerate() {
            let in_scope = issue.line().is_none_or(|target| target == index + 1);
            match in_scope.then(|| Self::clean_line(pattern, line)).flatten() {
                Some(cleaned) => {
                    removed += 1;
                    out.push_str(&cleaned);
                }
                None => out.push_str(line),
            }
        }

        if removed == 0 {
            return Ok(StrategyResult::Unfixable(format!(
                "no forbidden token found in {rel}"
            )));
        }
        debug!("Removed tokens from {} line(s) of {}", removed, rel);
        workspace.write(rel, &out)?;
        Ok(StrategyResult::Fixed {
            files: vec![rel.to_string()],
        })
    }
}

// ============================================================================
// Front Matter Title
// ============================================================================

/// Synthesizes or repairs a front-matter block carrying a `title`.
#[derive(Debug, Default)]
pub struct FrontmatterTitle;

impl FrontmatterTitle {
    fn existing_title(text: &str) -> Option<String> {
        let (yaml, _) = split_frontmatter(text)?;
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
        value
            .get("title")
            .and_then(serde_yaml::Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    fn derive_title(body: &str, rel: &str) -> String {
        body.lines()
            .find_map(heading_text)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                Path::new(rel)
                    .file_stem()
                    .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
                    .unwrap_or_default()
            })
    }
}

impl FixStrategy for FrontmatterTitle {
    fn name(&self) -> &'static str {
        "frontmatter_title"
    }

    fn apply(&self, issue: &Issue, workspace: &mut Workspace) -> Result<StrategyResult> {
        let rel = match issue_file(issue) {
            Ok(rel) => rel,
            Err(unfixable) => return Ok(unfixable),
        };
        let text = workspace.read(rel)?;
        if Self::existing_title(&text).is_some() {
            return Ok(StrategyResult::Unfixable(format!(
                "{rel} already has a title"
            )));
        }

        let body = split_frontmatter(&text).map_or(text.as_str(), |(_, body)| body);
        let title = Self::derive_title(body, rel);
        if title.is_empty() {
            return Ok(StrategyResult::Unfixable(format!(
                "cannot derive a title for {rel}"
            )));
        }
        let keys = BTreeMap::from([("title".to_string(), json!(title))]);

        // A block that does not parse as a mapping is replaced outright.
        let merged = match merge_frontmatter(&text, &keys) {
            Ok(merged) => merged,
            Err(reason) => {
                debug!("Replacing front matter of {}: {}", rel, reason);
                merge_frontmatter(body, &keys).map_err(anyhow::Error::msg)?
            }
        };
        match merged {
            FrontmatterMerge::Updated(out) => {
                workspace.write(rel, &out)?;
                Ok(StrategyResult::Fixed {
                    files: vec![rel.to_string()],
                })
            }
            FrontmatterMerge::Unchanged => Ok(StrategyResult::Unfixable(format!(
                "front matter of {rel} already complete"
            ))),
        }
    }
}

// ============================================================================
// Repository URL Consistency
// ============================================================================

static REPO_URL_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn repo_url_pattern() -> Option<&'static Regex> {
    REPO_URL_PATTERN
        .get_or_init(|| Regex::new(r"https?://github\.com/[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+").ok())
        .as_ref()
}

fn normalize_repo_url(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .replacen("http://", "https://", 1)
        .to_ascii_lowercase()
}

/// Rewrites repository URLs that disagree with the trusted facts.
#[derive(Debug, Default)]
pub struct RepoUrlConsistency {
    trusted: Option<String>,
}

impl RepoUrlConsistency {
    pub fn new(trusted: Option<String>) -> Self {
        Self {
            trusted: trusted.map(|url| url.trim_end_matches('/').to_string()),
        }
    }
}

impl FixStrategy for RepoUrlConsistency {
    fn name(&self) -> &'static str {
        "repo_url_consistency"
    }

    fn apply(&self, issue: &Issue, workspace: &mut Workspace) -> Result<StrategyResult> {
        let Some(trusted) = self.trusted.as_deref() else {
            return Ok(StrategyResult::Unfixable(
                "no trusted repository URL configured".to_string(),
            ));
        };
        let rel = match issue_file(issue) {
            Ok(rel) => rel,
            Err(unfixable) => return Ok(unfixable),
        };
        let Some(pattern) = repo_url_pattern() else {
            return Ok(StrategyResult::Unfixable(
                "URL pattern unavailable".to_string(),
            ));
        };

        let text = workspace.read(rel)?;
        let wanted = normalize_repo_url(trusted);
        let mut rewritten = 0usize;
        let out = pattern.replace_all(&text, |caps: &regex::Captures<'_>| {
            let found = &caps[0];
            // A sentence may end right after the URL.
            let core = found.trim_end_matches('.');
            let tail = &found[core.len()..];
            if normalize_repo_url(core) == wanted {
                found.to_string()
            } else {
                rewritten += 1;
                format!("{trusted}{tail}")
            }
        });

        if rewritten == 0 {
            return Ok(StrategyResult::Unfixable(format!(
                "no mismatching repository URL in {rel}"
            )));
        }
        let out = out.into_owned();
        workspace.write(rel, &out)?;
        Ok(StrategyResult::Fixed {
            files: vec![rel.to_string()],
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Strategies keyed by `(gate, error_code)`.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<(String, String), Box<dyn FixStrategy>>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.strategies.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

impl StrategyRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies.
    #[must_use]
    pub fn with_defaults(facts: &FactsSettings) -> Self {
        let mut registry = Self::new();
        registry.register("content", "FORBIDDEN_TOKEN", TokenRemoval);
        registry.register("content", "PLACEHOLDER_TOKEN", TokenRemoval);
        for code in [
            "FRONTMATTER_MISSING",
            "FRONTMATTER_INVALID",
            "FRONTMATTER_KEY_MISSING",
        ] {
            registry.register("frontmatter", code, FrontmatterTitle);
        }
        registry.register(
            "consistency",
            "REPO_URL_MISMATCH",
            RepoUrlConsistency::new(facts.repo_url.clone()),
        );
        registry
    }

    /// Register (or replace) the strategy for a key.
    pub fn register(
        &mut self,
        gate: impl Into<String>,
        error_code: impl Into<String>,
        strategy: impl FixStrategy + 'static,
    ) {
        self.strategies
            .insert((gate.into(), error_code.into()), Box::new(strategy));
    }

    #[must_use]
    pub fn get(&self, gate: &str, error_code: &str) -> Option<&dyn FixStrategy> {
        self.strategies
            .get(&(gate.to_string(), error_code.to_string()))
            .map(Box::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
