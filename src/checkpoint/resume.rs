//! Resume after a crash.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CheckpointId, CheckpointStore};
use crate::context::RunContext;
use crate::error::Result;
use crate::events::log::read_from;
use crate::events::replay::{replay_onto, Snapshot};

/// What a resumed run has to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumePlan {
    /// Checkpoint the plan is based on; `None` for a fresh start.
    pub checkpoint_id: Option<CheckpointId>,
    /// Target workers still to run, in target order.
    pub workers_to_rerun: Vec<String>,
    /// Workers the checkpoint recorded as completed.
    pub completed_workers: Vec<String>,
    /// Events appended after the checkpoint position.
    pub events_since_checkpoint: usize,
    /// Malformed lines skipped while reading those events.
    pub skipped_lines: usize,
    /// Checkpoint snapshot with the later events folded in.
    ///
    /// Only for inspection; it does not influence `workers_to_rerun`.
    #[serde(skip)]
    pub validated: Option<Snapshot>,
}

impl ResumePlan {
    /// Whether no checkpoint was found.
    #[must_use]
    pub fn is_fresh_start(&self) -> bool {
        self.checkpoint_id.is_none()
    }

    /// Whether `worker` is scheduled to run.
    #[must_use]
    pub fn is_pending(&self, worker: &str) -> bool {
        self.workers_to_rerun.iter().any(|w| w == worker)
    }
}

/// Compute which of `target_workers` still have to run.
///
/// Without a checkpoint every target is pending. With one, the workers its
/// snapshot records as completed are removed (order of `target_workers` is
/// kept) and the events appended since are replayed onto a copy of that
/// snapshot for validation only.
pub fn resume<S: AsRef<str>>(ctx: &RunContext, target_workers: &[S]) -> Result<ResumePlan> {
    let targets: Vec<String> = target_workers
        .iter()
        .map(|w| w.as_ref().to_string())
        .collect();

    let store = CheckpointStore::new(ctx);
    let Some(checkpoint) = store.latest_checkpoint()? else {
        info!("No checkpoint found; fresh start with {} workers", targets.len());
        return Ok(ResumePlan {
            checkpoint_id: None,
            workers_to_rerun: targets,
            completed_workers: Vec::new(),
            events_since_checkpoint: 0,
            skipped_lines: 0,
            validated: None,
        });
    };

    let snapshot = store.load_checkpoint_snapshot(&checkpoint)?;
    let completed = snapshot.completed_workers.clone();
    let workers_to_rerun: Vec<String> = targets
        .into_iter()
        .filter(|w| !completed.contains(w))
        .collect();

    let tail = read_from(&ctx.layout().events_path(), checkpoint.events_count)?;
    let mut validated = snapshot;
    replay_onto(&mut validated, &tail.events);

    let completed_since: Vec<&String> = validated
        .completed_workers
        .iter()
        .filter(|w| !completed.contains(*w))
        .collect();
    if !completed_since.is_empty() {
        warn!(
            "Workers completed after checkpoint {} will run again: {:?}",
            checkpoint.checkpoint_id, completed_since
        );
    }
    debug!(
        "Replayed {} events after checkpoint {} ({} skipped)",
        tail.events.len(),
        checkpoint.checkpoint_id,
        tail.skipped
    );
    info!(
        "Resuming from checkpoint {}: {} workers pending",
        checkpoint.checkpoint_id,
        workers_to_rerun.len()
    );

    Ok(ResumePlan {
        checkpoint_id: Some(checkpoint.checkpoint_id),
        workers_to_rerun,
        completed_workers: completed,
        events_since_checkpoint: tail.events.len(),
        skipped_lines: tail.skipped,
        validated: Some(validated),
    })
}

// ============================================================================
// Tests
// ============================================================================
