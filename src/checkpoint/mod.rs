//! Checkpoints and crash recovery.
//!
//! A checkpoint is an immutable copy of the run's snapshot together with the
//! event-log position it was taken at. Recovery loads the latest checkpoint,
//! replays only what was appended after it and reports which workers still
//! have to run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────┐     ┌─────────────────┐
//! │ CheckpointStore │────>│ checkpoints/<id>/        │────>│ resume          │
//! │ create/list     │     │   checkpoint.json        │     │ -> ResumePlan   │
//! │ latest/cleanup  │     │   snapshot.json          │     │                 │
//! └─────────────────┘     └──────────────────────────┘     └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::checkpoint::{resume, CheckpointStore};
//!
//! let store = CheckpointStore::new(&ctx);
//! store.create_checkpoint()?;
//! store.cleanup_old_checkpoints(5)?;
//!
//! let plan = resume(&ctx, &["draft", "patch", "validate"])?;
//! for worker in &plan.workers_to_rerun {
//!     println!("pending: {worker}");
//! }
//! ```

pub mod manager;
pub mod resume;

pub use manager::CheckpointStore;
pub use resume::{resume, ResumePlan};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::events::RunState;

/// Layout of a checkpoint id: UTC with microseconds.
pub const CHECKPOINT_ID_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Metadata file inside a checkpoint directory.
pub const METADATA_FILE: &str = "checkpoint.json";

// ============================================================================
// Checkpoint ID
// ============================================================================

/// Identifier of a checkpoint.
///
/// A fixed-width UTC timestamp, so lexicographic and chronological order
/// coincide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Id for an instant.
    ///
    /// ```
    /// use steward::checkpoint::CheckpointId;
    /// use chrono::{TimeZone, Utc};
    ///
    /// let id = CheckpointId::at(Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap());
    /// assert_eq!(id.as_str(), "20240309T070500.000000Z");
    /// ```
    #[must_use]
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(time.format(CHECKPOINT_ID_FORMAT).to_string())
    }

    /// Id for `now` that sorts strictly after `latest`.
    ///
    /// When the clock has not moved past the latest id (coarse clock, clock
    /// skew), the id is bumped one microsecond past it.
    #[must_use]
    pub fn next_after(now: DateTime<Utc>, latest: Option<&CheckpointId>) -> Self {
        let candidate = Self::at(now);
        match latest {
            Some(latest) if candidate <= *latest => match latest.time() {
                Some(t) => Self::at(t + chrono::Duration::microseconds(1)),
                None => candidate,
            },
            _ => candidate,
        }
    }

    /// Wrap an existing id string (e.g. a directory name).
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The instant encoded in the id, if it is well-formed.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, CHECKPOINT_ID_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Metadata of one checkpoint (`checkpoints/<id>/checkpoint.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub run_state: RunState,
    pub completed_workers: Vec<String>,
    /// Snapshot copy, relative to the run directory.
    pub snapshot_path: String,
    /// Non-blank lines in the event log when the checkpoint was taken.
    pub events_count: u64,
}

impl Checkpoint {
    /// Format a summary line for display.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} {} events={} completed=[{}]",
            self.checkpoint_id,
            self.run_state,
            self.events_count,
            self.completed_workers.join(", ")
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
