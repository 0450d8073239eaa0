use crate::minibatch::MiniBatch;
use crate::trainer::state::ModelState;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// What one optimizer step reports back to the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Learning rate after this step. This is the convergence signal: the
    /// controller stops once it falls below its floor.
    pub learning_rate: f64,
    pub loss: f64,
}

/// The network, loss and optimizer behind the training loop.
///
/// Only the controller thread touches an engine, so implementations need
/// `Send` (to be moved there) but never `Sync`.
pub trait ModelUpdateEngine: Send {
    /// Runs one optimizer step on `batch`.
    fn step(&mut self, batch: &MiniBatch) -> Result<StepReport>;

    /// Serializable copy of the current state, including optimizer buffers.
    fn snapshot(&self) -> Result<ModelState>;

    /// Consumes the engine and returns the final model.
    fn finalize(self) -> Result<ModelState>
    where
        Self: Sized;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Steps taken so far, including steps restored from a checkpoint.
    fn steps(&self) -> u64;
}

/// Hyper-parameters shared by the bundled engines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Steps without progress before the learning rate shrinks.
    pub patience: u64,
    /// Factor applied to the learning rate when progress stalls.
    pub shrink_factor: f64,
    pub embedding_dim: usize,
    /// Images are downsampled to `input_side x input_side` before projection.
    pub input_side: u32,
    /// Pairs closer than this are "same identity".
    pub distance_threshold: f64,
    pub margin: f64,
    /// Seed for weight initialization.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
            patience: 300,
            shrink_factor: 0.1,
            embedding_dim: 32,
            input_side: 16,
            distance_threshold: 0.6,
            margin: 0.04,
            seed: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_patience(mut self, patience: u64) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning rate must be positive (got {})",
            self.learning_rate
        );
        ensure!(
            (0.0..1.0).contains(&self.momentum),
            "momentum must be in [0, 1) (got {})",
            self.momentum
        );
        ensure!(
            self.weight_decay >= 0.0,
            "weight decay must be non-negative (got {})",
            self.weight_decay
        );
        ensure!(self.patience > 0, "patience must be at least one step");
        ensure!(
            self.shrink_factor > 0.0 && self.shrink_factor < 1.0,
            "shrink factor must be in (0, 1) (got {})",
            self.shrink_factor
        );
        ensure!(self.embedding_dim > 0, "embedding dimension must be positive");
        ensure!(self.input_side > 0, "input side must be positive");
        ensure!(
            self.margin >= 0.0 && self.margin < self.distance_threshold,
            "margin must be in [0, distance_threshold)"
        );
        Ok(())
    }
}

/// Learning-rate schedule driven by the loss: after `patience` steps without
/// improvement of the smoothed loss the rate is multiplied by `shrink_factor`.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    learning_rate: f64,
    shrink_factor: f64,
    patience: u64,
    smoothing: f64,
    smoothed: Option<f64>,
    best: f64,
    stale_steps: u64,
}

/// Relative improvement the smoothed loss must make to count as progress.
const MIN_RELATIVE_PROGRESS: f64 = 1e-3;
/// Floor on that improvement so a loss decaying towards zero still stalls.
const MIN_ABSOLUTE_PROGRESS: f64 = 1e-6;

impl ConvergenceTracker {
    pub fn new(learning_rate: f64, patience: u64, shrink_factor: f64) -> Self {
        Self {
            learning_rate,
            shrink_factor,
            patience: patience.max(1),
            smoothing: 0.1,
            smoothed: None,
            best: f64::INFINITY,
            stale_steps: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.learning_rate, config.patience, config.shrink_factor)
    }

    /// Feeds one step's loss and returns the learning rate to use next.
    pub fn observe(&mut self, loss: f64) -> f64 {
        let smoothed = match self.smoothed {
            Some(prev) => prev + self.smoothing * (loss - prev),
            None => loss,
        };
        self.smoothed = Some(smoothed);

        let required = (MIN_RELATIVE_PROGRESS * self.best.abs()).max(MIN_ABSOLUTE_PROGRESS);
        if !self.best.is_finite() || smoothed < self.best - required {
            self.best = smoothed;
            self.stale_steps = 0;
        } else {
            self.stale_steps += 1;
            if self.stale_steps >= self.patience {
                self.learning_rate *= self.shrink_factor;
                self.stale_steps = 0;
                self.best = smoothed;
                tracing::info!(
                    learning_rate = self.learning_rate,
                    smoothed_loss = smoothed,
                    "no progress, shrinking learning rate"
                );
            }
        }
        self.learning_rate
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Overrides the current rate, e.g. when resuming from a checkpoint.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn smoothed_loss(&self) -> Option<f64> {
        self.smoothed
    }

    pub fn steps_without_progress(&self) -> u64 {
        self.stale_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improving_loss_keeps_rate() {
        let mut tracker = ConvergenceTracker::new(0.1, 3, 0.1);
        for i in 0..50 {
            let lr = tracker.observe(10.0 - i as f64 * 0.1);
            assert_eq!(lr, 0.1);
        }
        assert_eq!(tracker.steps_without_progress(), 0);
    }

    #[test]
    fn test_flat_loss_shrinks_rate_after_patience() {
        let mut tracker = ConvergenceTracker::new(0.1, 4, 0.1);
        // First observation sets the baseline.
        tracker.observe(1.0);
        for _ in 0..3 {
            assert_eq!(tracker.observe(1.0), 0.1);
        }
        let lr = tracker.observe(1.0);
        assert!((lr - 0.01).abs() < 1e-12);
        assert_eq!(tracker.steps_without_progress(), 0);
    }

    #[test]
    fn test_loss_decaying_to_zero_still_stalls() {
        let mut tracker = ConvergenceTracker::new(0.1, 5, 0.1);
        tracker.observe(1.0);
        let mut steps = 0;
        while tracker.learning_rate() == 0.1 {
            tracker.observe(0.0);
            steps += 1;
            assert!(steps < 1_000, "zero loss kept counting as progress");
        }
    }

    #[test]
    fn test_rate_eventually_drops_below_floor() {
        let mut tracker = ConvergenceTracker::new(0.1, 2, 0.1);
        let mut steps = 0;
        while tracker.learning_rate() >= 1e-4 {
            tracker.observe(0.5);
            steps += 1;
            assert!(steps < 100, "schedule never converged");
        }
        assert!(tracker.learning_rate() < 1e-4);
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::default().with_patience(0).validate().is_err());
        let bad_momentum = EngineConfig {
            momentum: 1.0,
            ..EngineConfig::default()
        };
        assert!(bad_momentum.validate().is_err());
    }
}
