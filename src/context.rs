//! Explicit run context.
//!
//! Every operation that needs the run directory, the current time or fresh
//! identifiers receives them through a [`RunContext`]. Production code uses
//! [`SystemClock`] and [`RandomIds`]; golden-run tests swap in
//! [`ManualClock`] and [`SequentialIds`] so that event logs, snapshots and
//! retry timing are fully reproducible.
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::context::{ManualClock, RunContext, SequentialIds};
//! use std::sync::Arc;
//!
//! let ctx = RunContext::new("run-1", "/tmp/run-1")
//!     .with_clock(Arc::new(ManualClock::default()))
//!     .with_ids(Arc::new(SequentialIds::new()));
//! ```

use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Run Layout
// ============================================================================

/// Event log file name.
pub const EVENTS_FILE: &str = "events.ndjson";

/// Derived snapshot file name.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Checkpoint directory name.
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Artifact directory name.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Draft directory name.
pub const DRAFTS_DIR: &str = "drafts";

/// Configuration file name.
pub const CONFIG_FILE: &str = "steward.toml";

/// Default target worktree directory name.
pub const DEFAULT_WORKTREE_DIR: &str = "worktree";

/// Paths of everything a run directory holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    worktree: PathBuf,
}

impl RunLayout {
    /// Create a layout rooted at `root` with the default worktree location.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let worktree = root.join(DEFAULT_WORKTREE_DIR);
        Self { root, worktree }
    }

    /// Override the worktree directory (relative paths are joined to the root).
    #[must_use]
    pub fn with_worktree(mut self, worktree: impl AsRef<Path>) -> Self {
        let worktree = worktree.as_ref();
        self.worktree = if worktree.is_absolute() {
            worktree.to_path_buf()
        } else {
            self.root.join(worktree)
        };
        self
    }

    /// The run directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    #[must_use]
    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join(DRAFTS_DIR)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// The target worktree patches are applied to.
    #[must_use]
    pub fn worktree(&self) -> &Path {
        &self.worktree
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of time, including the only blocking suspension point (backoff).
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time and real sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for reproducible runs.
///
/// Each call to [`Clock::now`] returns the current instant and then advances
/// it by a fixed tick, so consecutive events get distinct, ordered
/// timestamps. [`Clock::sleep`] never blocks: it advances the instant by the
/// requested duration and records it.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualClockState>,
    tick: Duration,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock starting at `start` that advances `tick` per reading.
    #[must_use]
    pub fn new(start: DateTime<Utc>, tick: Duration) -> Self {
        Self {
            state: Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            }),
            tick,
        }
    }

    /// Durations passed to `sleep`, in call order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now += chrono_duration(by);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualClockState> {
        // A poisoned lock only means a panicking test thread; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::new(start, Duration::from_millis(1))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.lock();
        let now = state.now;
        state.now += chrono_duration(self.tick);
        now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += chrono_duration(duration);
        state.sleeps.push(duration);
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// ============================================================================
// Identifier Source
// ============================================================================

/// Source of event and span identifiers.
pub trait IdSource: Send + Sync {
    /// A new event id.
    fn event_id(&self) -> Uuid;

    /// A new 16-hex-character span id.
    fn span_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn event_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn span_id(&self) -> String {
        let id = Uuid::new_v4();
        id.simple().to_string()[..16].to_string()
    }
}

/// Counter-based identifiers (`Uuid::from_u128(1)`, `2`, ...).
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl IdSource for SequentialIds {
    fn event_id(&self) -> Uuid {
        Uuid::from_u128(u128::from(self.bump()))
    }

    fn span_id(&self) -> String {
        format!("{:016x}", self.bump())
    }
}

// ============================================================================
// Run Context
// ============================================================================

/// Everything an operation needs to know about the run it belongs to.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    layout: RunLayout,
    trace_id: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("layout", &self.layout)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Create a context with the system clock and random identifiers.
    ///
    /// The trace id is derived from the run id so every process working on
    /// the same run reports the same trace.
    pub fn new(run_id: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        let run_id = run_id.into();
        let trace_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, run_id.as_bytes())
            .simple()
            .to_string();
        Self {
            run_id,
            layout: RunLayout::new(run_dir),
            trace_id,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the identifier source.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Replace the run layout (for a custom worktree location).
    #[must_use]
    pub fn with_layout(mut self, layout: RunLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    #[must_use]
    pub fn ids(&self) -> &dyn IdSource {
        self.ids.as_ref()
    }

    /// Shorthand for `self.clock().now()`.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

// ============================================================================
// Tests
// ============================================================================
