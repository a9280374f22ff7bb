//! Issue-driven fix loop.
//!
//! The fixer consumes a validation report, picks exactly one open issue in a
//! deterministic order, dispatches it to a narrow fix strategy and verifies
//! that the strategy really changed a file.
//!
//! # Architecture
//!
//! ```text
//! ValidationReport ──select_issue──> Issue ──(gate, error_code)──> FixStrategy
//!                                      │                               │
//!                                      │                          Workspace
//!                                      ▼                        (pre-image hashes)
//!                               IssueFixLoop::run_once ──verify──> FixOutcome | NoOpFix
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::fixer::{IssueFixLoop, ValidationReport};
//!
//! let mut report = ValidationReport::load(&report_path)?;
//! let fixer = IssueFixLoop::new(&ctx, &config);
//! match fixer.run_once(&mut log, &mut report, None)? {
//!     FixOutcome::Resolved { issue_id, .. } => println!("fixed {issue_id}"),
//!     FixOutcome::Unfixable { reason, .. } => println!("escalate: {reason}"),
//!     FixOutcome::NoIssues => println!("clean"),
//! }
//! ```

pub mod runner;
pub mod strategies;

pub use runner::IssueFixLoop;
pub use strategies::{FixStrategy, StrategyRegistry, Workspace};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::artifacts::{atomic_write, load_json, to_json_bytes};
use crate::error::{Result, StewardError};

// ============================================================================
// Issue Types
// ============================================================================

/// Severity of a validation issue, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocker,
    Error,
    Warn,
    Info,
}

impl Severity {
    /// Sort rank (blocker = 0).
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Blocker => 0,
            Self::Error => 1,
            Self::Warn => 2,
            Self::Info => 3,
        }
    }

    /// Whether the fixer picks issues of this severity on its own.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocker | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    #[default]
    Open,
    Resolved,
}

/// Where an issue was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLocation {
    /// Worktree-relative path; empty when the issue is not tied to a file.
    #[serde(default)]
    pub path: String,
    /// 1-indexed line; 0 when unknown.
    #[serde(default)]
    pub line: u32,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub gate: String,
    pub severity: Severity,
    pub error_code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub location: IssueLocation,
    #[serde(default)]
    pub status: IssueStatus,
}

impl Issue {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }

    /// The issue's line, if known.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        (self.location.line > 0).then_some(self.location.line as usize)
    }

    fn sort_key(&self) -> (u8, &str, &str, u32, &str) {
        (
            self.severity.rank(),
            &self.gate,
            &self.location.path,
            self.location.line,
            &self.issue_id,
        )
    }
}

/// Output of the external validation-gate runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    /// Per-gate summaries, kept as produced by the gate runner.
    #[serde(default)]
    pub gates: Vec<serde_json::Value>,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    /// Read a report file.
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    /// Write the report back atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &to_json_bytes(self)?)
    }

    #[must_use]
    pub fn get(&self, issue_id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.issue_id == issue_id)
    }

    /// Mark an issue resolved. Returns `false` if it is not in the report.
    pub fn mark_resolved(&mut self, issue_id: &str) -> bool {
        match self.issues.iter_mut().find(|i| i.issue_id == issue_id) {
            Some(issue) => {
                issue.status = IssueStatus::Resolved;
                true
            }
            None => false,
        }
    }

    /// Number of issues still open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_open()).count()
    }
}

/// Pick the next issue to fix.
///
/// Only open blockers and errors are candidates. `issue_id` narrows the
/// candidates to that issue, so a resolved or warn/info issue yields `None`.
/// Otherwise the most severe candidate wins, ties broken by gate, path, line
/// and id.
///
/// # Errors
///
/// [`StewardError::IssueNotFound`] when `issue_id` is not in the report.
pub fn select_issue<'a>(
    report: &'a ValidationReport,
    issue_id: Option<&str>,
) -> Result<Option<&'a Issue>> {
    if let Some(id) = issue_id {
        let issue = report.get(id).ok_or_else(|| StewardError::IssueNotFound {
            issue_id: id.to_string(),
        })?;
        return Ok((issue.is_open() && issue.severity.is_blocking()).then_some(issue));
    }

    Ok(report
        .issues
        .iter()
        .filter(|i| i.is_open() && i.severity.is_blocking())
        .min_by(|a, b| a.sort_key().cmp(&b.sort_key())))
}

// ============================================================================
// Fix Outcome
// ============================================================================

/// Result of one fix-loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixOutcome {
    /// The issue's file changed and the issue is marked resolved.
    Resolved {
        issue_id: String,
        changed_files: Vec<String>,
    },
    /// No strategy can fix the issue.
    Unfixable { issue_id: String, reason: String },
    /// Nothing left to fix.
    NoIssues,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn issue(id: &str, gate: &str, severity: Severity, path: &str, line: u32) -> Issue {
        Issue {
            issue_id: id.into(),
            gate: gate.into(),
            severity,
            error_code: "CODE".into(),
            message: String::new(),
            location: IssueLocation {
                path: path.into(),
                line,
            },
            status: IssueStatus::Open,
        }
    }

    fn report(issues: Vec<Issue>) -> ValidationReport {
        ValidationReport {
            ok: false,
            gates: Vec::new(),
            issues,
        }
    }

    #[test]
    fn test_blocker_before_error() {
        let r = report(vec![
            issue("e1", "a", Severity::Error, "a.md", 1),
            issue("b1", "z", Severity::Blocker, "z.md", 9),
        ]);
        let picked = select_issue(&r, None).expect("select").expect("issue");
        assert_eq!(picked.issue_id, "b1");
    }

    #[test]
    fn test_ties_break_by_gate_path_line_id() {
        let r = report(vec![
            issue("i3", "links", Severity::Error, "b.md", 1),
            issue("i2", "links", Severity::Error, "a.md", 7),
            issue("i1", "links", Severity::Error, "a.md", 7),
            issue("i0", "spelling", Severity::Error, "a.md", 1),
            issue("i4", "links", Severity::Error, "a.md", 3),
        ]);
        let picked = select_issue(&r, None).expect("select").expect("issue");
        assert_eq!(picked.issue_id, "i4");
    }

    #[test]
    fn test_warnings_and_resolved_are_not_picked() {
        let mut r = report(vec![
            issue("w", "a", Severity::Warn, "a.md", 1),
            issue("e", "a", Severity::Error, "a.md", 1),
        ]);
        assert!(r.mark_resolved("e"));
        assert!(select_issue(&r, None).expect("select").is_none());
        assert_eq!(r.open_count(), 1);
    }

    #[test]
    fn test_specific_issue() {
        let mut r = report(vec![
            issue("b", "a", Severity::Blocker, "a.md", 1),
            issue("e", "z", Severity::Error, "z.md", 9),
            issue("w", "a", Severity::Warn, "a.md", 1),
        ]);
        assert_eq!(
            select_issue(&r, Some("e")).expect("select").map(|i| i.issue_id.as_str()),
            Some("e")
        );
        // Known but not blocking: no candidate, and not an error either.
        assert!(select_issue(&r, Some("w")).expect("select").is_none());
        assert!(matches!(
            select_issue(&r, Some("nope")),
            Err(StewardError::IssueNotFound { .. })
        ));
        r.mark_resolved("e");
        assert!(select_issue(&r, Some("e")).expect("select").is_none());
    }

    #[test]
    fn test_report_wire_format() {
        let json = r#"{
            "ok": false,
            "gates": [{"name": "content", "ok": false}],
            "issues": [{
                "issue_id": "c-1",
                "gate": "content",
                "severity": "blocker",
                "error_code": "FORBIDDEN_TOKEN",
                "message": "TODO left in page",
                "location": {"path": "docs/a.md", "line": 3},
                "status": "OPEN"
            }]
        }"#;
        let r: ValidationReport = serde_json::from_str(json).expect("decode");
        assert_eq!(r.issues[0].severity, Severity::Blocker);
        assert_eq!(r.issues[0].line(), Some(3));
        assert_eq!(r.gates.len(), 1);
    }
}
