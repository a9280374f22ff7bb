//! One iteration of the fix loop.
//!
//! `run_once` resolves at most one issue. The external driver re-runs the
//! gates and calls it again until it reports [`FixOutcome::NoIssues`].

use tracing::{info, warn};

use super::strategies::{StrategyRegistry, StrategyResult, Workspace};
use super::{select_issue, FixOutcome, ValidationReport};
use crate::config::StewardConfig;
use crate::context::RunContext;
use crate::error::{Result, StewardError};
use crate::events::{EventKind, EventLog};
use crate::patch::PathPolicy;

/// Error kind recorded for issues no strategy can fix.
const UNFIXABLE: &str = "unfixable";

/// Selects, fixes and verifies one validation issue.
#[derive(Debug)]
pub struct IssueFixLoop {
    policy: PathPolicy,
    registry: StrategyRegistry,
}

impl IssueFixLoop {
    /// Loop over the run's worktree with the built-in strategies.
    pub fn new(ctx: &RunContext, config: &StewardConfig) -> Self {
        Self {
            policy: PathPolicy::from_settings(ctx.layout().worktree(), &config.patch),
            registry: StrategyRegistry::with_defaults(&config.facts),
        }
    }

    /// Loop with an explicit policy and strategy set.
    pub fn with_registry(policy: PathPolicy, registry: StrategyRegistry) -> Self {
        Self { policy, registry }
    }

    #[must_use]
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    /// Fix one issue from `report`, marking it resolved on success.
    ///
    /// # Errors
    ///
    /// [`StewardError::IssueNotFound`] for an unknown `issue_id`,
    /// [`StewardError::NoOpFix`] when a strategy claims success without
    /// changing any file, and any I/O or policy error. Each is recorded as
    /// `RUN_FAILED` before it is returned.
    pub fn run_once(
        &self,
        log: &mut EventLog,
        report: &mut ValidationReport,
        issue_id: Option<&str>,
    ) -> Result<FixOutcome> {
        match self.fix_one(log, report, issue_id) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log.emit_failure(&e)?;
                Err(e)
            }
        }
    }

    fn fix_one(
        &self,
        log: &mut EventLog,
        report: &mut ValidationReport,
        issue_id: Option<&str>,
    ) -> Result<FixOutcome> {
        let Some(issue) = select_issue(report, issue_id)?.cloned() else {
            info!("No open blocking issues");
            log.emit(EventKind::FixerNoIssues {})?;
            return Ok(FixOutcome::NoIssues);
        };

        info!(
            "Fixing {} ({}/{}) in {}",
            issue.issue_id, issue.gate, issue.error_code, issue.location.path
        );
        log.emit(EventKind::FixerStarted {
            issue_id: issue.issue_id.clone(),
        })?;

        let Some(strategy) = self.registry.get(&issue.gate, &issue.error_code) else {
            let reason = format!(
                "no fix strategy for {}/{}",
                issue.gate, issue.error_code
            );
            return self.unfixable(log, issue.issue_id, reason);
        };

        let mut workspace = Workspace::new(self.policy.clone());
        if !issue.location.path.is_empty() {
            workspace.track(&issue.location.path)?;
        }

        let files = match strategy.apply(&issue, &mut workspace) {
            Ok(StrategyResult::Fixed { files }) => files,
            Ok(StrategyResult::Unfixable(reason)) => {
                return self.unfixable(log, issue.issue_id, reason);
            }
            Err(e) => {
                log.emit(EventKind::IssueFixFailed {
                    issue_id: issue.issue_id.clone(),
                    error_kind: e.kind().to_string(),
                    reason: e.to_string(),
                })?;
                return Err(e);
            }
        };

        let changed = workspace.changed_files(&files)?;
        if changed.is_empty() {
            let err = StewardError::NoOpFix {
                issue_id: issue.issue_id.clone(),
                claimed_files: files.iter().map(Into::into).collect(),
            };
            warn!("{} ({})", err, strategy.name());
            log.emit(EventKind::IssueFixFailed {
                issue_id: issue.issue_id,
                error_kind: err.kind().to_string(),
                reason: err.to_string(),
            })?;
            return Err(err);
        }

        report.mark_resolved(&issue.issue_id);
        log.emit(EventKind::IssueResolved {
            issue_id: issue.issue_id.clone(),
        })?;
        log.emit(EventKind::FixerCompleted {
            issue_id: issue.issue_id.clone(),
            changed_files: changed.clone(),
        })?;
        info!("Resolved {} via {}", issue.issue_id, strategy.name());

        Ok(FixOutcome::Resolved {
            issue_id: issue.issue_id,
            changed_files: changed,
        })
    }

    fn unfixable(
        &self,
        log: &mut EventLog,
        issue_id: String,
        reason: String,
    ) -> Result<FixOutcome> {
        warn!("Issue {} is unfixable: {}", issue_id, reason);
        log.emit(EventKind::IssueFixFailed {
            issue_id: issue_id.clone(),
            error_kind: UNFIXABLE.to_string(),
            reason: reason.clone(),
        })?;
        Ok(FixOutcome::Unfixable { issue_id, reason })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, SequentialIds};
    use crate::events::log::read_events;
    use crate::events::{replay, RunState};
    use crate::fixer::strategies::FixStrategy;
    use crate::fixer::{Issue, IssueLocation, IssueStatus, Severity};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ctx: RunContext,
        log: EventLog,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = RunContext::new("run-fix", dir.path())
            .with_clock(Arc::new(ManualClock::default()))
            .with_ids(Arc::new(SequentialIds::new()));
        fs::create_dir_all(ctx.layout().worktree().join("docs")).expect("mkdir");
        let log = EventLog::open(&ctx).expect("open log");
        Fixture { _dir: dir, ctx, log }
    }

    fn report(issues: Vec<(&str, &str, &str, Severity)>) -> ValidationReport {
        ValidationReport {
            ok: false,
            gates: Vec::new(),
            issues: issues
                .into_iter()
                .map(|(id, gate, code, severity)| Issue {
                    issue_id: id.into(),
                    gate: gate.into(),
                    severity,
                    error_code: code.into(),
                    message: String::new(),
                    location: IssueLocation {
                        path: "docs/a.md".into(),
                        line: 0,
                    },
                    status: IssueStatus::Open,
                })
                .collect(),
        }
    }

    fn event_types(ctx: &RunContext) -> Vec<&'static str> {
        read_events(&ctx.layout().events_path())
            .expect("read")
            .events
            .iter()
            .map(|e| e.kind.type_name())
            .collect()
    }

    /// Claims success without writing anything.
    struct LyingStrategy;

    impl FixStrategy for LyingStrategy {
        fn name(&self) -> &'static str {
            "lying"
        }

        fn apply(&self, issue: &Issue, workspace: &mut Workspace) -> Result<StrategyResult> {
            workspace.read(&issue.location.path)?;
            Ok(StrategyResult::Fixed {
                files: vec![issue.location.path.clone()],
            })
        }
    }

    #[test]
    fn test_resolves_one_issue_per_call() {
        let mut fx = fixture();
        let page = fx.ctx.layout().worktree().join("docs/a.md");
        fs::write(&page, "# A\nTODO one\nFIXME two\n").expect("write");
        let mut r = report(vec![
            ("w-1", "content", "FORBIDDEN_TOKEN", Severity::Warn),
            ("b-1", "content", "FORBIDDEN_TOKEN", Severity::Blocker),
        ]);
        let fixer = IssueFixLoop::new(&fx.ctx, &StewardConfig::default());

        let outcome = fixer.run_once(&mut fx.log, &mut r, None).expect("fix");
        assert_eq!(
            outcome,
            FixOutcome::Resolved {
                issue_id: "b-1".into(),
                changed_files: vec!["docs/a.md".into()],
            }
        );
        assert_eq!(fs::read_to_string(&page).expect("read"), "# A\none\ntwo\n");
        assert_eq!(r.get("b-1").map(|i| i.status), Some(IssueStatus::Resolved));
        assert_eq!(r.get("w-1").map(|i| i.status), Some(IssueStatus::Open));

        assert_eq!(
            fixer.run_once(&mut fx.log, &mut r, None).expect("fix"),
            FixOutcome::NoIssues
        );
        assert_eq!(
            event_types(&fx.ctx),
            vec![
                "FIXER_STARTED",
                "ISSUE_RESOLVED",
                "FIXER_COMPLETED",
                "FIXER_NO_ISSUES"
            ]
        );
    }

    #[test]
    fn test_unknown_code_is_unfixable() {
        let mut fx = fixture();
        fs::write(fx.ctx.layout().worktree().join("docs/a.md"), "# A\n").expect("write");
        let mut r = report(vec![("e-1", "links", "BROKEN_LINK", Severity::Error)]);
        let fixer = IssueFixLoop::new(&fx.ctx, &StewardConfig::default());

        let outcome = fixer.run_once(&mut fx.log, &mut r, None).expect("fix");
        assert!(matches!(outcome, FixOutcome::Unfixable { ref issue_id, .. } if issue_id == "e-1"));
        assert_eq!(r.open_count(), 1);

        let snapshot = replay("run-fix", &read_events(fx.log.path()).expect("read").events);
        assert_eq!(snapshot.run_state, RunState::Running);
    }

    #[test]
    fn test_noop_fix_is_an_error() {
        let mut fx = fixture();
        let page = fx.ctx.layout().worktree().join("docs/a.md");
        fs::write(&page, "# A\n").expect("write");
        let mut r = report(vec![("b-1", "custom", "ANY", Severity::Blocker)]);

        let mut registry = StrategyRegistry::new();
        registry.register("custom", "ANY", LyingStrategy);
        let fixer =
            IssueFixLoop::with_registry(PathPolicy::new(fx.ctx.layout().worktree()), registry);

        let err = fixer
            .run_once(&mut fx.log, &mut r, None)
            .expect_err("no-op must fail");
        assert!(matches!(err, StewardError::NoOpFix { ref issue_id, .. } if issue_id == "b-1"));
        assert_eq!(r.open_count(), 1);
        assert_eq!(fs::read_to_string(&page).expect("read"), "# A\n");
        assert_eq!(
            event_types(&fx.ctx),
            vec!["FIXER_STARTED", "ISSUE_FIX_FAILED", "RUN_FAILED"]
        );
    }

    #[test]
    fn test_unknown_issue_id() {
        let mut fx = fixture();
        let mut r = report(vec![]);
        let fixer = IssueFixLoop::new(&fx.ctx, &StewardConfig::default());
        assert!(matches!(
            fixer.run_once(&mut fx.log, &mut r, Some("ghost")),
            Err(StewardError::IssueNotFound { .. })
        ));
    }
}
