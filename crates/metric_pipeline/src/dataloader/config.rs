//! src/dataloader/config.rs
//!
//! Configuration for the producer/consumer batch pipeline.
//!
//! Example:
//! ```ignore
//! let config = PipelineConfig::builder()
//!     .num_people(15)
//!     .samples_per_id(5)
//!     .num_producers(8)
//!     .queue_capacity(4)
//!     .seed(42)
//!     .build();
//! config.validate()?;
//! ```
//!
//! # Memory considerations:
//! - At most `queue_capacity` finished batches wait in the queue, plus one
//!   batch under construction per producer.
//! - `num_producers` above the core count only adds contention.

use crate::catalog::CatalogOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::sampler::DEFAULT_JITTER_PROBABILITY;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What a producer does when a sampled batch mixes image sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DimensionPolicy {
    /// Report the violation to the controller, which shuts the pipeline down.
    #[default]
    Strict,
    /// Log the violation, discard the batch and sample again.
    Retry,
}

/// Configuration for the batch pipeline and its controller.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Distinct identities per batch.
    pub num_people: usize,
    /// Images drawn (with replacement) per identity.
    pub samples_per_id: usize,
    /// Capacity of the bounded batch queue.
    pub queue_capacity: usize,
    /// Number of producer threads (defaults to the available parallelism).
    pub num_producers: usize,
    /// Worker `i` seeds its RNG with `base_seed + i`.
    pub base_seed: u64,
    /// Probability of geometric jitter per sample.
    pub jitter_probability: f64,
    pub dimension_policy: DimensionPolicy,
    /// Resize every image to `(width, height)` right after decoding.
    pub resize: Option<(u32, u32)>,
    /// Maximum time the controller waits for a batch. `None` waits forever.
    pub dequeue_timeout: Option<Duration>,
    /// Training stops once the learning rate drops below this floor.
    pub min_learning_rate: f64,
    /// Periodic checkpoint target.
    pub sync_file: Option<PathBuf>,
    /// How often the checkpoint is rewritten. Default: 5 minutes.
    pub sync_interval: Duration,
    /// How the corpus root is scanned.
    pub catalog: CatalogOptions,
}

/// Default number of batches the queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;
/// Default learning-rate floor that ends training.
pub const DEFAULT_MIN_LEARNING_RATE: f64 = 1e-4;
/// Default checkpoint period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Number of processing units, falling back to one when it cannot be queried.
pub fn available_producers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Wall-clock seconds, used as the seed when none is given.
pub fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_people: 0,
            samples_per_id: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            num_producers: available_producers(),
            base_seed: wall_clock_seed(),
            jitter_probability: DEFAULT_JITTER_PROBABILITY,
            dimension_policy: DimensionPolicy::default(),
            resize: None,
            dequeue_timeout: None,
            min_learning_rate: DEFAULT_MIN_LEARNING_RATE,
            sync_file: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            catalog: CatalogOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Samples per batch. Saturates; `validate` rejects sizes that overflow.
    pub fn batch_size(&self) -> usize {
        self.num_people.saturating_mul(self.samples_per_id)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        let fail = |msg: String| Err(PipelineError::InvalidArgument(msg));

        if self.num_people == 0 {
            return fail("num_people must be > 0".into());
        }
        if self.samples_per_id == 0 {
            return fail("samples_per_id must be > 0".into());
        }
        if self.num_people.checked_mul(self.samples_per_id).is_none() {
            return fail(format!(
                "batch of {} x {} samples overflows",
                self.num_people, self.samples_per_id
            ));
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be > 0; a zero-capacity queue never buffers".into());
        }
        if self.num_producers == 0 {
            return fail("num_producers must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_probability) {
            return fail(format!(
                "jitter_probability must be in [0, 1] (got {})",
                self.jitter_probability
            ));
        }
        if !(self.min_learning_rate.is_finite() && self.min_learning_rate > 0.0) {
            return fail(format!(
                "min_learning_rate must be positive (got {})",
                self.min_learning_rate
            ));
        }
        if let Some((w, h)) = self.resize {
            if w == 0 || h == 0 {
                return fail(format!("resize dimensions must be positive (got {w}x{h})"));
            }
        }
        if self.dequeue_timeout == Some(Duration::ZERO) {
            return fail("dequeue_timeout must be non-zero when set".into());
        }
        if self.sync_file.is_some() && self.sync_interval.is_zero() {
            return fail("sync_interval must be non-zero when a sync file is set".into());
        }
        Ok(())
    }
}

/// Builder for PipelineConfig with method chaining
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn num_people(mut self, n: usize) -> Self {
        self.config.num_people = n;
        self
    }

    pub fn samples_per_id(mut self, n: usize) -> Self {
        self.config.samples_per_id = n;
        self
    }

    /// Set the queue capacity (must be > 0).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the number of producer threads.
    pub fn num_producers(mut self, producers: usize) -> Self {
        self.config.num_producers = producers;
        self
    }

    /// Set the base seed for reproducible sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.base_seed = seed;
        self
    }

    pub fn jitter_probability(mut self, p: f64) -> Self {
        self.config.jitter_probability = p;
        self
    }

    pub fn dimension_policy(mut self, policy: DimensionPolicy) -> Self {
        self.config.dimension_policy = policy;
        self
    }

    pub fn resize(mut self, width: u32, height: u32) -> Self {
        self.config.resize = Some((width, height));
        self
    }

    /// Set the dequeue timeout.
    ///
    /// - Too low: May abort during legitimately slow decoding.
    /// - Too high: Delays detection of stuck producers.
    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.config.dequeue_timeout = Some(timeout);
        self
    }

    pub fn min_learning_rate(mut self, floor: f64) -> Self {
        self.config.min_learning_rate = floor;
        self
    }

    pub fn sync_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sync_file = Some(path.into());
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn catalog_options(mut self, options: CatalogOptions) -> Self {
        self.config.catalog = options;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
