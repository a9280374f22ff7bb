//! Steward - durable execution and idempotent patching for content pipelines
//!
//! Steward is the recovery substrate underneath a multi-stage generation
//! pipeline: it records what happened, remembers how far a run got, retries
//! what is worth retrying and applies generated content to a target tree in a
//! way that is safe to repeat.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`events`] - Append-only event log and deterministic snapshot replay
//! - [`checkpoint`] - Point-in-time checkpoints and crash resume
//! - [`retry`] - Failure classification and bounded exponential backoff
//! - [`patch`] - Structured patches, path safety and the idempotent patch engine
//! - [`fixer`] - One-issue-at-a-time fix loop over a validation report
//! - [`stage`] - Sequential stage runner tying the pieces together
//! - [`artifacts`] - Atomic artifact writes with event emission
//! - [`context`] - Run layout, injectable clock and identifier source
//! - [`config`] - `steward.toml` loading and validation
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::{checkpoint, RunContext, StageRunner, StewardConfig};
//!
//! let config = StewardConfig::load(run_dir)?;
//! let ctx = RunContext::new(config.resolve_run_id(run_dir), run_dir);
//!
//! // Work out what a previous, possibly crashed, process left to do
//! let plan = checkpoint::resume(&ctx, &["research", "write", "publish"])?;
//!
//! let mut runner = StageRunner::new(&ctx, &config)?;
//! runner.run_pending(&plan, &mut stages)?;
//! ```

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod events;
pub mod fixer;
pub mod patch;
pub mod retry;
pub mod stage;

// Re-export commonly used types
pub use error::{Result, StewardError};

pub use config::StewardConfig;
pub use context::{Clock, ManualClock, RunContext, RunLayout, SequentialIds, SystemClock};

// Re-export event types
pub use events::{Event, EventKind, EventLog, RunState, Snapshot};

// Re-export checkpoint types
pub use checkpoint::{Checkpoint, CheckpointId, CheckpointStore, ResumePlan};

// Re-export retry types
pub use retry::{backoff, Classification, FailureAction, RetryClassifier, RetryPolicy};

// Re-export patch types
pub use patch::{DiffReport, Patch, PatchBundle, PatchEngine, PatchOp, PatchOutcome, PathPolicy};

// Re-export fixer types
pub use fixer::{select_issue, FixOutcome, Issue, IssueFixLoop, Severity, ValidationReport};

pub use stage::StageRunner;
