//! Single-consumer training loop.
//!
//! ```text
//!   Running ──(lr < floor | queue disabled | error)──▶ Draining ──▶ Terminated
//! ```
//!
//! `Running` dequeues batches and steps the engine. `Draining` disables the
//! queue and joins every producer. `Terminated` finalizes the engine. The
//! controller is the only code that decides to stop and the only code that
//! touches the engine.

use crate::dataloader::{BatchQueue, Dequeued, PipelineConfig, PoolStats, ProducerPool};
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::trainer::engine::ModelUpdateEngine;
use crate::trainer::state::ModelState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The learning rate fell below the configured floor.
    Converged,
    /// The queue was disabled from outside the controller and ran dry.
    QueueDisabled,
}

/// Everything a finished run hands back.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model: ModelState,
    pub stop_reason: StopReason,
    /// Total engine steps, including steps restored from a checkpoint.
    pub steps: u64,
    /// Steps taken by this run only.
    pub steps_this_run: u64,
    pub final_learning_rate: f64,
    pub pool: PoolStats,
}

/// How often progress is logged at `info`.
const PROGRESS_EVERY: u64 = 100;

struct SyncFile {
    path: PathBuf,
    interval: Duration,
    last_write: Instant,
}

impl SyncFile {
    fn is_due(&self) -> bool {
        self.last_write.elapsed() >= self.interval
    }

    fn write<E: ModelUpdateEngine>(&mut self, engine: &E) -> PipelineResult<()> {
        let failed = |path: &Path, source| PipelineError::Checkpoint {
            path: path.to_path_buf(),
            source,
        };
        let state = engine.snapshot().map_err(|e| failed(&self.path, e))?;
        state.save(&self.path).map_err(|e| failed(&self.path, e))?;
        self.last_write = Instant::now();
        info!(path = %self.path.display(), step = state.steps, "sync file written");
        Ok(())
    }
}

pub struct TrainingController<E> {
    engine: E,
    queue: Arc<BatchQueue>,
    pool: Option<ProducerPool>,
    pool_stats: PoolStats,
    state: ControllerState,
    min_learning_rate: f64,
    dequeue_timeout: Option<Duration>,
    sync_file: Option<SyncFile>,
    steps_this_run: u64,
}

impl<E: ModelUpdateEngine> TrainingController<E> {
    /// Takes ownership of a running pool; its queue becomes the controller's.
    pub fn new(engine: E, pool: ProducerPool, config: &PipelineConfig) -> Self {
        let sync_file = config.sync_file.as_ref().map(|path| SyncFile {
            path: path.clone(),
            interval: config.sync_interval,
            last_write: Instant::now(),
        });
        Self {
            engine,
            queue: Arc::clone(pool.queue()),
            pool: Some(pool),
            pool_stats: PoolStats::default(),
            state: ControllerState::Running,
            min_learning_rate: config.min_learning_rate,
            dequeue_timeout: config.dequeue_timeout,
            sync_file,
            steps_this_run: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    /// Trains until a stop condition, then drains: on return the queue is
    /// disabled and every producer has been joined, whatever the result.
    pub fn train(&mut self) -> PipelineResult<StopReason> {
        if self.state != ControllerState::Running {
            return Err(PipelineError::InvariantViolation(format!(
                "training loop started in state {:?}",
                self.state
            )));
        }
        info!(
            step = self.engine.steps(),
            learning_rate = self.engine.learning_rate(),
            "training started"
        );

        let result = self.run_loop();
        self.drain();

        match &result {
            Ok(reason) => info!(
                ?reason,
                step = self.engine.steps(),
                learning_rate = self.engine.learning_rate(),
                "training stopped"
            ),
            Err(err) => {
                warn!(error = %err, step = self.engine.steps(), "training aborted");
                // Keep the progress made so far unless the engine itself failed.
                if err.class() != ErrorClass::Engine {
                    self.write_sync_file_quietly();
                }
            }
        }
        result
    }

    /// Writes the final sync file and finalizes the engine.
    pub fn finish(mut self, stop_reason: StopReason) -> PipelineResult<TrainingOutcome> {
        if self.state != ControllerState::Draining {
            return Err(PipelineError::InvariantViolation(format!(
                "cannot finish a controller in state {:?}",
                self.state
            )));
        }
        if let Some(sync) = self.sync_file.as_mut() {
            sync.write(&self.engine)?;
        }

        let steps = self.engine.steps();
        let final_learning_rate = self.engine.learning_rate();
        self.state = ControllerState::Terminated;
        debug!(state = ?self.state, "controller state changed");

        let model = self
            .engine
            .finalize()
            .map_err(|source| PipelineError::Engine { step: steps, source })?;
        info!(step = steps, "training finished");

        Ok(TrainingOutcome {
            model,
            stop_reason,
            steps,
            steps_this_run: self.steps_this_run,
            final_learning_rate,
            pool: self.pool_stats,
        })
    }

    /// `train` followed by `finish`.
    pub fn run(mut self) -> PipelineResult<TrainingOutcome> {
        let reason = self.train()?;
        self.finish(reason)
    }

    fn run_loop(&mut self) -> PipelineResult<StopReason> {
        let faults = match &self.pool {
            Some(pool) => pool.faults().clone(),
            None => return Err(PipelineError::ProducersExhausted),
        };

        loop {
            if self.engine.learning_rate() < self.min_learning_rate {
                return Ok(StopReason::Converged);
            }

            let batch = match self.queue.dequeue_or_fault(&faults, self.dequeue_timeout)? {
                Dequeued::Batch(batch) => batch,
                Dequeued::Disabled => return Ok(StopReason::QueueDisabled),
            };

            let step = self.engine.steps() + 1;
            let report = self
                .engine
                .step(&batch)
                .map_err(|source| PipelineError::Engine { step, source })?;
            self.steps_this_run += 1;

            debug!(step, learning_rate = report.learning_rate, loss = report.loss, "step done");
            if step % PROGRESS_EVERY == 0 {
                let produced = self.pool.as_ref().map_or(0, |p| p.stats().batches_produced);
                info!(
                    step,
                    learning_rate = report.learning_rate,
                    loss = report.loss,
                    queued = self.queue.len(),
                    produced,
                    "training progress"
                );
            }

            if let Some(sync) = self.sync_file.as_mut().filter(|s| s.is_due()) {
                sync.write(&self.engine)?;
            }
        }
    }

    fn drain(&mut self) {
        self.state = ControllerState::Draining;
        debug!(state = ?self.state, "controller state changed");
        self.queue.disable();
        if let Some(pool) = self.pool.take() {
            self.pool_stats = pool.shutdown();
        }
    }

    fn write_sync_file_quietly(&mut self) {
        if let Some(sync) = self.sync_file.as_mut() {
            if let Err(err) = sync.write(&self.engine) {
                warn!(error = %err, "could not write sync file after abort");
            }
        }
    }
}
