//! Stage runner: the minimal driver around workers.
//!
//! Runs worker stages sequentially under the retry policy, records their
//! lifecycle in the event log and writes a checkpoint at every stage
//! boundary, so a crashed run can be resumed with
//! [`checkpoint::resume`](crate::checkpoint::resume).
//!
//! # Architecture
//!
//! ```text
//! ResumePlan ──> run_pending ──> run_worker(name, op)
//!                                   │
//!                WORK_ITEM_STARTED  │  RetryPolicy::run(op)
//!                                   ▼
//!                WORK_ITEM_FINISHED ──> snapshot.json ──> checkpoints/<id>/
//!                (or RUN_FAILED)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::stage::{StageFn, StageRunner};
//!
//! let plan = steward::checkpoint::resume(&ctx, &["research", "write", "publish"])?;
//! let mut runner = StageRunner::new(&ctx, &config)?;
//! let mut stages: Vec<(&str, StageFn)> = vec![
//!     ("research", Box::new(|log| research(log))),
//!     ("write", Box::new(|log| write(log))),
//!     ("publish", Box::new(|log| publish(log))),
//! ];
//! runner.run_pending(&plan, &mut stages)?;
//! ```

use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, ResumePlan};
use crate::config::{CheckpointSettings, StewardConfig};
use crate::context::RunContext;
use crate::error::{Result, StewardError};
use crate::events::replay::refresh_snapshot;
use crate::events::{EventKind, EventLog, WorkStatus};
use crate::retry::RetryPolicy;

/// A worker body. It may emit its own events (e.g. artifact writes).
pub type StageFn<'a> = Box<dyn FnMut(&mut EventLog) -> anyhow::Result<()> + 'a>;

/// Sequential driver for the workers of one run.
#[derive(Debug)]
pub struct StageRunner {
    ctx: RunContext,
    log: EventLog,
    retry: RetryPolicy,
    checkpoints: CheckpointSettings,
}

impl StageRunner {
    /// Open the run's event log and build the runner from configuration.
    pub fn new(ctx: &RunContext, config: &StewardConfig) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            log: EventLog::open(ctx)?,
            retry: RetryPolicy::from_settings(&config.retry),
            checkpoints: config.checkpoint.clone(),
        })
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    /// Run one worker to completion.
    ///
    /// On success the snapshot is persisted and a checkpoint written. On a
    /// permanent failure, or once retries are exhausted, `WORK_ITEM_FINISHED`
    /// (failed) and `RUN_FAILED` are recorded before the error is returned.
    pub fn run_worker<T, F>(&mut self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut EventLog) -> anyhow::Result<T>,
    {
        info!("Starting worker {}", name);
        self.log.emit(EventKind::WorkItemStarted {
            worker: name.to_string(),
            item_id: None,
        })?;

        let result = {
            let Self { ctx, log, retry, .. } = self;
            retry.run(ctx.clock(), name, || op(log))
        };

        match result {
            Ok(value) => {
                self.log.emit(EventKind::WorkItemFinished {
                    worker: name.to_string(),
                    item_id: None,
                    status: WorkStatus::Succeeded,
                    error: None,
                })?;
                self.stage_boundary(name)?;
                info!("Worker {} finished", name);
                Ok(value)
            }
            Err(err) => {
                let err = match err.downcast::<StewardError>() {
                    Ok(err) => err,
                    Err(other) => StewardError::Other(other),
                };
                warn!("Worker {} failed: {}", name, err);
                self.log.emit(EventKind::WorkItemFinished {
                    worker: name.to_string(),
                    item_id: None,
                    status: WorkStatus::Failed,
                    error: Some(err.to_string()),
                })?;
                self.log.emit_failure(&err)?;
                if let Err(e) = refresh_snapshot(self.ctx.layout(), self.ctx.run_id()) {
                    warn!("Could not persist snapshot after failure: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Run the stages `plan` still lists, in the plan's target order, then record
    /// `RUN_COMPLETED`. Returns the names of the workers that ran.
    ///
    /// # Errors
    ///
    /// [`StewardError::InvalidConfig`] when a pending worker has no stage,
    /// checked before anything runs; otherwise the first worker failure.
    pub fn run_pending(
        &mut self,
        plan: &ResumePlan,
        stages: &mut [(&str, StageFn<'_>)],
    ) -> Result<Vec<String>> {
        if let Some(missing) = plan
            .workers_to_rerun
            .iter()
            .find(|w| !stages.iter().any(|(name, _)| *name == w.as_str()))
        {
            return Err(StewardError::invalid_config(
                "stages",
                format!("no stage registered for worker '{missing}'"),
            ));
        }

        for (name, _) in stages.iter() {
            if !plan.is_pending(name) {
                debug!("Skipping worker {}: already completed", name);
            }
        }

        let mut ran = Vec::new();
        for worker in &plan.workers_to_rerun {
            let Some((_, stage)) = stages.iter_mut().find(|(name, _)| *name == worker.as_str())
            else {
                continue;
            };
            self.run_worker(worker, |log| stage(log))?;
            ran.push(worker.clone());
        }

        self.log.emit(EventKind::RunCompleted {})?;
        refresh_snapshot(self.ctx.layout(), self.ctx.run_id())?;
        info!("Run {} completed ({} workers ran)", self.ctx.run_id(), ran.len());
        Ok(ran)
    }

    fn stage_boundary(&mut self, worker: &str) -> Result<()> {
        refresh_snapshot(self.ctx.layout(), self.ctx.run_id())?;
        let store = CheckpointStore::new(&self.ctx);
        let checkpoint = store.create_checkpoint()?;
        debug!("Checkpoint {} after {}", checkpoint.checkpoint_id, worker);

        if self.checkpoints.auto_cleanup {
            let removed = store.cleanup_old_checkpoints(self.checkpoints.keep_last)?;
            if removed > 0 {
                debug!("Pruned {} old checkpoints", removed);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
