//! Snapshot replay.
//!
//! [`replay`] folds an event sequence into a [`Snapshot`]. The fold is pure:
//! it reads nothing but the events themselves, so the same sequence always
//! yields the same snapshot, byte for byte once serialized. Timestamps in the
//! snapshot come from the events, never from the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::log::read_events;
use super::{Event, EventKind, WorkStatus};
use crate::artifacts::{atomic_write, load_json, to_json_bytes};
use crate::context::RunLayout;
use crate::error::Result;
use crate::fixer::Severity;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// No event has been recorded yet.
    #[default]
    Created,
    Running,
    /// The fix loop is working on validation issues.
    Fixing,
    Failed,
    Completed,
}

impl RunState {
    /// Failed and completed runs do not change state implicitly.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Fixing => "FIXING",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        };
        write!(f, "{}", s)
    }
}

/// Progress of one work item (section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Started,
    Succeeded,
    Failed,
}

/// State of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionState {
    /// Worker the item belongs to.
    pub worker: String,
    pub status: SectionStatus,
    /// Number of times the item was started.
    pub attempts: u32,
}

/// An issue that has been opened and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIssue {
    pub issue_id: String,
    pub gate: String,
    pub severity: Severity,
    pub error_code: String,
}

/// Index entry for a written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub content_hash: String,
}

/// The last terminal failure recorded for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_kind: String,
    pub message: String,
}

/// Last result of a validation gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSummary {
    pub ok: bool,
    pub issue_count: u32,
}

/// Derived current state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: String,
    pub run_state: RunState,
    pub section_states: BTreeMap<String, SectionState>,
    pub open_issues: Vec<OpenIssue>,
    pub artifacts_index: BTreeMap<String, ArtifactRef>,
    /// Workers that finished successfully, in completion order.
    pub completed_workers: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Number of events folded into this snapshot.
    #[serde(default)]
    pub events_applied: u64,
    #[serde(default)]
    pub last_event_id: Option<Uuid>,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub gate_results: BTreeMap<String, GateSummary>,
    #[serde(default)]
    pub pull_request: Option<String>,
}

impl Snapshot {
    /// Empty snapshot of a run with no events.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run_state: RunState::Created,
            section_states: BTreeMap::new(),
            open_issues: Vec::new(),
            artifacts_index: BTreeMap::new(),
            completed_workers: Vec::new(),
            created_at: None,
            updated_at: None,
            events_applied: 0,
            last_event_id: None,
            failure: None,
            gate_results: BTreeMap::new(),
            pull_request: None,
        }
    }

    /// Whether `worker` has completed.
    #[must_use]
    pub fn is_worker_completed(&self, worker: &str) -> bool {
        self.completed_workers.iter().any(|w| w == worker)
    }

    /// Fold one event into the snapshot.
    ///
    /// Returns `false` (and changes nothing) for events of another run.
    pub fn apply(&mut self, event: &Event) -> bool {
        if event.run_id != self.run_id {
            return false;
        }

        self.events_applied += 1;
        self.last_event_id = Some(event.event_id);
        self.created_at.get_or_insert(event.timestamp);
        self.updated_at = Some(event.timestamp);
        if self.run_state == RunState::Created {
            self.run_state = RunState::Running;
        }

        match &event.kind {
            EventKind::WorkItemStarted { worker, item_id } => {
                if let Some(item_id) = item_id {
                    let section = self
                        .section_states
                        .entry(item_id.clone())
                        .or_insert_with(|| SectionState {
                            worker: worker.clone(),
                            status: SectionStatus::Started,
                            attempts: 0,
                        });
                    section.worker = worker.clone();
                    section.status = SectionStatus::Started;
                    section.attempts += 1;
                }
            }
            EventKind::WorkItemFinished {
                worker,
                item_id,
                status,
                ..
            } => match item_id {
                Some(item_id) => {
                    let section = self
                        .section_states
                        .entry(item_id.clone())
                        .or_insert_with(|| SectionState {
                            worker: worker.clone(),
                            status: SectionStatus::Started,
                            attempts: 1,
                        });
                    section.status = match status {
                        WorkStatus::Succeeded => SectionStatus::Succeeded,
                        WorkStatus::Failed => SectionStatus::Failed,
                    };
                }
                None => {
                    if *status == WorkStatus::Succeeded && !self.is_worker_completed(worker) {
                        self.completed_workers.push(worker.clone());
                    }
                }
            },
            EventKind::ArtifactWritten {
                name,
                path,
                content_hash,
            } => {
                self.artifacts_index.insert(
                    name.clone(),
                    ArtifactRef {
                        path: path.clone(),
                        content_hash: content_hash.clone(),
                    },
                );
            }
            EventKind::IssueOpened {
                issue_id,
                gate,
                severity,
                error_code,
            } => {
                if !self.open_issues.iter().any(|i| &i.issue_id == issue_id) {
                    self.open_issues.push(OpenIssue {
                        issue_id: issue_id.clone(),
                        gate: gate.clone(),
                        severity: *severity,
                        error_code: error_code.clone(),
                    });
                }
            }
            EventKind::IssueResolved { issue_id } => {
                self.open_issues.retain(|i| &i.issue_id != issue_id);
            }
            EventKind::RunFailed {
                error_kind,
                message,
            } => {
                self.run_state = RunState::Failed;
                self.failure = Some(FailureInfo {
                    error_kind: error_kind.clone(),
                    message: message.clone(),
                });
            }
            EventKind::RunStateChanged { state } => {
                self.run_state = *state;
            }
            EventKind::FixerStarted { .. } => {
                if !self.run_state.is_terminal() {
                    self.run_state = RunState::Fixing;
                }
            }
            EventKind::FixerCompleted { .. }
            | EventKind::FixerNoIssues {}
            | EventKind::IssueFixFailed { .. } => {
                if self.run_state == RunState::Fixing {
                    self.run_state = RunState::Running;
                }
            }
            EventKind::GateRunStarted { .. } => {}
            EventKind::GateRunFinished {
                gate,
                ok,
                issue_count,
            } => {
                self.gate_results.insert(
                    gate.clone(),
                    GateSummary {
                        ok: *ok,
                        issue_count: *issue_count,
                    },
                );
            }
            EventKind::PrOpened { url } => {
                self.pull_request = Some(url.clone());
            }
            EventKind::RunCompleted {} => {
                self.run_state = RunState::Completed;
            }
        }
        true
    }

    /// Canonical JSON encoding (pretty, trailing newline).
    pub fn to_json(&self) -> Result<Vec<u8>> {
        to_json_bytes(self)
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Fold `events` in order into a fresh snapshot of `run_id`.
#[must_use]
pub fn replay(run_id: &str, events: &[Event]) -> Snapshot {
    let mut snapshot = Snapshot::new(run_id);
    replay_onto(&mut snapshot, events);
    snapshot
}

/// Fold `events` into an existing snapshot (e.g. one loaded from a checkpoint).
pub fn replay_onto(snapshot: &mut Snapshot, events: &[Event]) {
    let mut foreign = 0usize;
    for event in events {
        if !snapshot.apply(event) {
            foreign += 1;
        }
    }
    if foreign > 0 {
        warn!(
            "Ignored {} events that belong to a run other than {}",
            foreign, snapshot.run_id
        );
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Write a snapshot atomically.
pub fn persist_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    atomic_write(path, &snapshot.to_json()?)?;
    debug!("Persisted snapshot ({} events) to {}", snapshot.events_applied, path.display());
    Ok(())
}

/// Read a previously persisted snapshot.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    load_json(path)
}

/// Current state of a run.
///
/// The event log is authoritative: when it exists it is replayed and any
/// persisted snapshot is ignored. Without a log the persisted snapshot is
/// used; with neither, the run is empty.
pub fn load_current(layout: &RunLayout, run_id: &str) -> Result<Snapshot> {
    let events_path = layout.events_path();
    if events_path.exists() {
        let read = read_events(&events_path)?;
        let snapshot = replay(run_id, &read.events);
        debug!(
            "Replayed {} events ({} skipped) for {}",
            read.events.len(),
            read.skipped,
            run_id
        );
        return Ok(snapshot);
    }

    let snapshot_path = layout.snapshot_path();
    if snapshot_path.exists() {
        return load_snapshot(&snapshot_path);
    }

    Ok(Snapshot::new(run_id))
}

/// Replay the log and persist the resulting snapshot.
pub fn refresh_snapshot(layout: &RunLayout, run_id: &str) -> Result<Snapshot> {
    let snapshot = load_current(layout, run_id)?;
    persist_snapshot(&layout.snapshot_path(), &snapshot)?;
    info!(
        "Snapshot refreshed: state={} completed_workers={}",
        snapshot.run_state,
        snapshot.completed_workers.len()
    );
    Ok(snapshot)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, RunContext, SequentialIds};
    use crate::error::StewardError;
    use crate::events::EventLog;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> RunContext {
        RunContext::new("run-1", dir.path())
            .with_clock(Arc::new(ManualClock::default()))
            .with_ids(Arc::new(SequentialIds::new()))
    }

    fn finished(worker: &str) -> EventKind {
        EventKind::WorkItemFinished {
            worker: worker.into(),
            item_id: None,
            status: WorkStatus::Succeeded,
            error: None,
        }
    }

    fn sample_log(ctx: &RunContext) -> Vec<Event> {
        let mut log = EventLog::open(ctx).expect("open");
        let kinds = vec![
            EventKind::WorkItemStarted {
                worker: "draft".into(),
                item_id: None,
            },
            EventKind::WorkItemStarted {
                worker: "draft".into(),
                item_id: Some("page/intro".into()),
            },
            EventKind::WorkItemFinished {
                worker: "draft".into(),
                item_id: Some("page/intro".into()),
                status: WorkStatus::Succeeded,
                error: None,
            },
            finished("draft"),
            EventKind::ArtifactWritten {
                name: "patch_bundle".into(),
                path: "artifacts/patch_bundle.json".into(),
                content_hash: "abc".into(),
            },
            EventKind::IssueOpened {
                issue_id: "i-1".into(),
                gate: "links".into(),
                severity: Severity::Error,
                error_code: "BROKEN_LINK".into(),
            },
            EventKind::IssueOpened {
                issue_id: "i-2".into(),
                gate: "content".into(),
                severity: Severity::Blocker,
                error_code: "FORBIDDEN_TOKEN".into(),
            },
            EventKind::FixerStarted {
                issue_id: "i-2".into(),
            },
            EventKind::IssueResolved {
                issue_id: "i-2".into(),
            },
            EventKind::FixerCompleted {
                issue_id: "i-2".into(),
                changed_files: vec!["docs/a.md".into()],
            },
            EventKind::GateRunFinished {
                gate: "links".into(),
                ok: false,
                issue_count: 1,
            },
        ];
        kinds
            .into_iter()
            .map(|k| log.emit(k).expect("emit"))
            .collect()
    }

    #[test]
    fn test_replay_folds_all_event_kinds() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let events = sample_log(&ctx);

        let snapshot = replay("run-1", &events);
        assert_eq!(snapshot.run_state, RunState::Running);
        assert_eq!(snapshot.completed_workers, vec!["draft".to_string()]);
        assert_eq!(
            snapshot.section_states["page/intro"].status,
            SectionStatus::Succeeded
        );
        assert_eq!(snapshot.open_issues.len(), 1);
        assert_eq!(snapshot.open_issues[0].issue_id, "i-1");
        assert!(snapshot.artifacts_index.contains_key("patch_bundle"));
        assert!(!snapshot.gate_results["links"].ok);
        assert_eq!(snapshot.events_applied, events.len() as u64);
        assert_eq!(snapshot.created_at, Some(events[0].timestamp));
        assert_eq!(snapshot.updated_at, Some(events[events.len() - 1].timestamp));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let events = sample_log(&ctx);

        let a = replay("run-1", &events).to_json().expect("encode");
        let b = replay("run-1", &events).to_json().expect("encode");
        assert_eq!(a, b);

        // Decoding the log from disk yields the same snapshot.
        let read = read_events(&ctx.layout().events_path()).expect("read");
        assert_eq!(replay("run-1", &read.events).to_json().expect("encode"), a);
    }

    #[test]
    fn test_completed_worker_listed_once() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let mut log = EventLog::open(&ctx).expect("open");
        let events = vec![
            log.emit(finished("draft")).expect("emit"),
            log.emit(finished("draft")).expect("emit"),
        ];
        assert_eq!(replay("run-1", &events).completed_workers.len(), 1);
    }

    #[test]
    fn test_terminal_states() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let mut log = EventLog::open(&ctx).expect("open");
        let failed = log
            .emit_failure(&StewardError::transient("connection reset"))
            .expect("emit");
        let fixer = log
            .emit(EventKind::FixerStarted {
                issue_id: "i".into(),
            })
            .expect("emit");

        let snapshot = replay("run-1", &[failed.clone(), fixer]);
        assert_eq!(snapshot.run_state, RunState::Failed);
        assert_eq!(snapshot.failure.as_ref().map(|f| f.error_kind.as_str()), Some("transient"));

        let done = log.emit(EventKind::RunCompleted {}).expect("emit");
        assert_eq!(replay("run-1", &[failed, done]).run_state, RunState::Completed);
    }

    #[test]
    fn test_foreign_events_are_ignored() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let events = sample_log(&ctx);
        let snapshot = replay("other-run", &events);
        assert_eq!(snapshot, Snapshot::new("other-run"));
    }

    #[test]
    fn test_log_is_authoritative_over_snapshot() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        let layout = ctx.layout().clone();

        let mut stale = Snapshot::new("run-1");
        stale.completed_workers.push("stale-worker".into());
        persist_snapshot(&layout.snapshot_path(), &stale).expect("persist");

        // Snapshot alone is used when there is no log.
        let loaded = load_current(&layout, "run-1").expect("load");
        assert_eq!(loaded.completed_workers, vec!["stale-worker".to_string()]);

        sample_log(&ctx);
        let loaded = load_current(&layout, "run-1").expect("load");
        assert_eq!(loaded.completed_workers, vec!["draft".to_string()]);
    }

    #[test]
    fn test_load_snapshot_errors() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("snapshot.json");
        assert!(matches!(
            load_snapshot(&path),
            Err(StewardError::MissingArtifact { .. })
        ));

        std::fs::write(&path, "{ nope").expect("write");
        assert!(matches!(
            load_snapshot(&path),
            Err(StewardError::MalformedArtifact { .. })
        ));
    }

    #[test]
    fn test_refresh_snapshot_persists() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = test_ctx(&dir);
        sample_log(&ctx);

        let snapshot = refresh_snapshot(ctx.layout(), "run-1").expect("refresh");
        let loaded = load_snapshot(&ctx.layout().snapshot_path()).expect("load");
        assert_eq!(loaded, snapshot);
    }
}
