//! Checkpoint storage.
//!
//! The [`CheckpointStore`] creates, lists and prunes checkpoints of one run
//! directory. Each checkpoint lives in its own directory:
//!
//! ```text
//! checkpoints/
//!   20240101T000000.000000Z/
//!     checkpoint.json   metadata, written last
//!     snapshot.json     copy of the run snapshot
//! ```
//!
//! The metadata file is written after the snapshot copy, so a directory
//! without it is an interrupted checkpoint and is ignored by listings.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointId, METADATA_FILE};
use crate::artifacts::{atomic_write, load_json, to_json_bytes};
use crate::context::{RunContext, CHECKPOINTS_DIR, SNAPSHOT_FILE};
use crate::error::{Result, StewardError};
use crate::events::log::count_lines;
use crate::events::replay::{load_snapshot, Snapshot};

/// Manages the checkpoints of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    ctx: RunContext,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(ctx: &RunContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// The `checkpoints/` directory.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.ctx.layout().checkpoints_dir()
    }

    fn checkpoint_dir(&self, id: &CheckpointId) -> PathBuf {
        self.storage_dir().join(id.as_str())
    }

    /// Capture the current `snapshot.json` and event-log position.
    ///
    /// # Errors
    ///
    /// [`StewardError::MissingArtifact`] when the run has no persisted
    /// snapshot yet.
    pub fn create_checkpoint(&self) -> Result<Checkpoint> {
        let layout = self.ctx.layout();
        let snapshot_path = layout.snapshot_path();
        let snapshot_bytes = match fs::read(&snapshot_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StewardError::missing(snapshot_path))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&snapshot_bytes)
            .map_err(|e| StewardError::malformed(&snapshot_path, e.to_string()))?;

        let events_count = count_lines(&layout.events_path())?;
        let latest = self.latest_checkpoint()?.map(|cp| cp.checkpoint_id);
        let now = self.ctx.now();
        let (checkpoint_id, dir) = self.claim_dir(CheckpointId::next_after(now, latest.as_ref()))?;
        atomic_write(&dir.join(SNAPSHOT_FILE), &snapshot_bytes)?;

        let checkpoint = Checkpoint {
            snapshot_path: format!("{}/{}/{}", CHECKPOINTS_DIR, checkpoint_id, SNAPSHOT_FILE),
            created_at: checkpoint_id.time().unwrap_or(now),
            checkpoint_id,
            run_id: self.ctx.run_id().to_string(),
            run_state: snapshot.run_state,
            completed_workers: snapshot.completed_workers,
            events_count,
        };
        atomic_write(&dir.join(METADATA_FILE), &to_json_bytes(&checkpoint)?)?;

        info!("Created checkpoint: {}", checkpoint.summary());
        Ok(checkpoint)
    }

    /// Create the directory for `id`, moving past ids whose directory
    /// already exists. Existing checkpoints are never written into.
    fn claim_dir(&self, mut id: CheckpointId) -> Result<(CheckpointId, PathBuf)> {
        fs::create_dir_all(self.storage_dir())?;
        loop {
            let dir = self.checkpoint_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Checkpoint directory {} already exists", dir.display());
                    let Some(time) = id.time() else {
                        return Err(e.into());
                    };
                    id = CheckpointId::next_after(time, Some(&id));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// All complete checkpoints, oldest first.
    ///
    /// Directories without readable metadata are skipped with a warning.
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let storage_dir = self.storage_dir();
        let entries = match fs::read_dir(&storage_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match load_json::<Checkpoint>(&path.join(METADATA_FILE)) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!("Skipping checkpoint {}: {}", path.display(), e),
            }
        }

        // Ids are bumped past the latest one, so they order creation even
        // when the clock steps backward.
        checkpoints.sort_by(|a, b| a.checkpoint_id.cmp(&b.checkpoint_id));
        debug!("Found {} checkpoints in {}", checkpoints.len(), storage_dir.display());
        Ok(checkpoints)
    }

    /// The most recently created checkpoint.
    pub fn latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Look up a checkpoint by id.
    pub fn get_checkpoint(&self, id: &CheckpointId) -> Result<Option<Checkpoint>> {
        Ok(self
            .list_checkpoints()?
            .into_iter()
            .find(|cp| &cp.checkpoint_id == id))
    }

    /// Load the snapshot copy stored with `checkpoint`.
    pub fn load_checkpoint_snapshot(&self, checkpoint: &Checkpoint) -> Result<Snapshot> {
        load_snapshot(&self.resolve(&checkpoint.snapshot_path))
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        let rel = Path::new(rel);
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.ctx.layout().root().join(rel)
        }
    }

    /// Delete all but the `keep_last` most recent checkpoints.
    ///
    /// A checkpoint that cannot be deleted is logged and skipped; the others
    /// are still removed. Returns the number of checkpoints deleted.
    pub fn cleanup_old_checkpoints(&self, keep_last: usize) -> Result<usize> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= keep_last {
            return Ok(0);
        }

        let excess = checkpoints.len() - keep_last;
        let mut removed = 0;
        for checkpoint in &checkpoints[..excess] {
            let dir = self.checkpoint_dir(&checkpoint.checkpoint_id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    debug!("Deleted checkpoint {}", checkpoint.checkpoint_id);
                    removed += 1;
                }
                Err(e) => warn!(
                    "Failed to delete checkpoint {}: {}",
                    checkpoint.checkpoint_id, e
                ),
            }
        }

        if removed > 0 {
            info!(
                "Pruned {} checkpoints, {} remaining",
                removed,
                checkpoints.len() - removed
            );
        }
        Ok(removed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, SequentialIds};
    use crate::events::replay::{persist_snapshot, refresh_snapshot};
    use crate::events::{EventKind, EventLog, RunState, WorkStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, RunContext, CheckpointStore) {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = RunContext::new("run-1", dir.path())
            .with_clock(Arc::new(ManualClock::default()))
            .with_ids(Arc::new(SequentialIds::new()));
        let store = CheckpointStore::new(&ctx);
        (dir, ctx, store)
    }

    fn complete_worker(ctx: &RunContext, worker: &str) {
        let mut log = EventLog::open(ctx).expect("open log");
        log.emit(EventKind::WorkItemFinished {
            worker: worker.into(),
            item_id: None,
            status: WorkStatus::Succeeded,
            error: None,
        })
        .expect("emit");
        refresh_snapshot(ctx.layout(), ctx.run_id()).expect("refresh");
    }

    #[test]
    fn test_create_requires_snapshot() {
        let (_dir, _ctx, store) = temp_store();
        let err = store.create_checkpoint().unwrap_err();
        assert!(matches!(err, StewardError::MissingArtifact { .. }));
        assert!(store.list_checkpoints().expect("list").is_empty());
    }

    #[test]
    fn test_create_records_state_and_position() {
        let (_dir, ctx, store) = temp_store();
        complete_worker(&ctx, "draft");

        let cp = store.create_checkpoint().expect("create");
        assert_eq!(cp.run_id, "run-1");
        assert_eq!(cp.run_state, RunState::Running);
        assert_eq!(cp.completed_workers, vec!["draft".to_string()]);
        assert_eq!(cp.events_count, 1);

        // The live snapshot is copied, not moved.
        assert!(ctx.layout().snapshot_path().exists());
        let copy = store.load_checkpoint_snapshot(&cp).expect("load copy");
        assert_eq!(copy.completed_workers, cp.completed_workers);
    }

    #[test]
    fn test_list_sorted_and_latest() {
        let (_dir, ctx, store) = temp_store();
        complete_worker(&ctx, "draft");
        let first = store.create_checkpoint().expect("first");
        complete_worker(&ctx, "patch");
        let second = store.create_checkpoint().expect("second");

        let list = store.list_checkpoints().expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].checkpoint_id, first.checkpoint_id);
        assert!(first.checkpoint_id < second.checkpoint_id);
        assert_eq!(
            store.latest_checkpoint().expect("latest").map(|c| c.checkpoint_id),
            Some(second.checkpoint_id.clone())
        );
        assert!(store
            .get_checkpoint(&second.checkpoint_id)
            .expect("get")
            .is_some());
    }

    #[test]
    fn test_ids_stay_monotonic_when_clock_stalls() {
        let dir = TempDir::new().expect("create temp dir");
        // A clock that never advances.
        let clock = ManualClock::new(chrono::Utc::now(), std::time::Duration::ZERO);
        let ctx = RunContext::new("run-1", dir.path()).with_clock(Arc::new(clock));
        let store = CheckpointStore::new(&ctx);
        persist_snapshot(&ctx.layout().snapshot_path(), &Snapshot::new("run-1")).expect("persist");

        let a = store.create_checkpoint().expect("a");
        let b = store.create_checkpoint().expect("b");
        let c = store.create_checkpoint().expect("c");
        assert!(a.checkpoint_id < b.checkpoint_id);
        assert!(b.checkpoint_id < c.checkpoint_id);
        assert_eq!(store.list_checkpoints().expect("list").len(), 3);
    }

    /// Hands out a fixed sequence of instants, then repeats the last one.
    struct SteppingClock(std::sync::Mutex<Vec<chrono::DateTime<chrono::Utc>>>);

    impl crate::context::Clock for SteppingClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            let mut times = self.0.lock().expect("clock lock");
            if times.len() > 1 {
                times.remove(0)
            } else {
                times[0]
            }
        }

        fn sleep(&self, _duration: std::time::Duration) {}
    }

    #[test]
    fn test_clock_stepping_backward_never_overwrites() {
        use chrono::TimeZone;

        let dir = TempDir::new().expect("create temp dir");
        let at = |secs| {
            chrono::Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, secs)
                .single()
                .expect("time")
        };
        let clock = SteppingClock(std::sync::Mutex::new(vec![at(10), at(5), at(6)]));
        let ctx = RunContext::new("run-1", dir.path()).with_clock(Arc::new(clock));
        let store = CheckpointStore::new(&ctx);
        persist_snapshot(&ctx.layout().snapshot_path(), &Snapshot::new("run-1")).expect("persist");

        let a = store.create_checkpoint().expect("a");
        let b = store.create_checkpoint().expect("b");
        let c = store.create_checkpoint().expect("c");
        assert!(a.checkpoint_id < b.checkpoint_id);
        assert!(b.checkpoint_id < c.checkpoint_id);
        assert_eq!(b.created_at, b.checkpoint_id.time().expect("parse"));

        let list: Vec<_> = store
            .list_checkpoints()
            .expect("list")
            .into_iter()
            .map(|cp| cp.checkpoint_id)
            .collect();
        assert_eq!(list, vec![a.checkpoint_id, b.checkpoint_id, c.checkpoint_id.clone()]);
        assert_eq!(
            store.latest_checkpoint().expect("latest").map(|cp| cp.checkpoint_id),
            Some(c.checkpoint_id)
        );
    }

    #[test]
    fn test_existing_directory_is_not_reused() {
        use chrono::TimeZone;

        let dir = TempDir::new().expect("create temp dir");
        let start = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time");
        let clock = ManualClock::new(start, std::time::Duration::ZERO);
        let ctx = RunContext::new("run-1", dir.path()).with_clock(Arc::new(clock));
        let store = CheckpointStore::new(&ctx);
        persist_snapshot(&ctx.layout().snapshot_path(), &Snapshot::new("run-1")).expect("persist");

        // A half-written checkpoint left at exactly the id the clock yields.
        let stray = store.checkpoint_dir(&CheckpointId::at(start));
        fs::create_dir_all(&stray).expect("create stray dir");
        fs::write(stray.join(SNAPSHOT_FILE), "partial").expect("write partial");

        let cp = store.create_checkpoint().expect("create");
        assert!(cp.checkpoint_id > CheckpointId::at(start));
        assert_eq!(fs::read_to_string(stray.join(SNAPSHOT_FILE)).expect("read"), "partial");
        assert_eq!(store.list_checkpoints().expect("list").len(), 1);
    }

    #[test]
    fn test_directory_without_metadata_is_skipped() {
        let (_dir, ctx, store) = temp_store();
        complete_worker(&ctx, "draft");
        store.create_checkpoint().expect("create");

        fs::create_dir_all(store.storage_dir().join("20000101T000000.000000Z"))
            .expect("create stray dir");

        assert_eq!(store.list_checkpoints().expect("list").len(), 1);
    }

    #[test]
    fn test_cleanup_keeps_most_recent() {
        let (_dir, ctx, store) = temp_store();
        complete_worker(&ctx, "draft");
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create_checkpoint().expect("create").checkpoint_id);
        }

        let removed = store.cleanup_old_checkpoints(2).expect("cleanup");
        assert_eq!(removed, 3);

        let remaining: Vec<_> = store
            .list_checkpoints()
            .expect("list")
            .into_iter()
            .map(|c| c.checkpoint_id)
            .collect();
        assert_eq!(remaining, ids[3..].to_vec());
        assert_eq!(store.cleanup_old_checkpoints(2).expect("cleanup"), 0);
    }
}
