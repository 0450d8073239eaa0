//! src/trainer/mod.rs
//!
//! Wires the pieces together: corpus → catalog → sampler → producer pool →
//! controller → engine.
//!
//! ```ignore
//! let config = PipelineConfig::builder()
//!     .num_people(15)
//!     .samples_per_id(5)
//!     .sync_file("face_metric_sync")
//!     .build();
//! let trainer = Trainer::new(config, EngineConfig::default().with_patience(300))?;
//! let outcome = trainer.train("./faces")?;
//! outcome.model.save("metric_network.json")?;
//! ```

pub mod controller;
pub mod engine;
pub mod linear;
pub mod state;
#[cfg(feature = "tch")]
pub mod tch_engine;

pub use controller::{ControllerState, StopReason, TrainingController, TrainingOutcome};
pub use engine::{ConvergenceTracker, EngineConfig, ModelUpdateEngine, StepReport};
pub use linear::{LinearMetricEngine, LINEAR_ENGINE_KIND};
pub use state::{ModelState, NamedTensor};
#[cfg(feature = "tch")]
pub use tch_engine::{TchMetricEngine, TCH_ENGINE_KIND};

use crate::catalog::IdentityCatalog;
use crate::dataloader::{BatchQueue, PipelineConfig, ProducerPool};
use crate::error::{PipelineError, PipelineResult};
use crate::sampler::{default_codec, BalancedBatchSampler, BatchSource};
use crate::transforms::vision::Resize;
use image::imageops::FilterType;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Validated configuration plus the steps to run a full training job.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: PipelineConfig,
    engine_config: EngineConfig,
}

impl Trainer {
    pub fn new(config: PipelineConfig, engine_config: EngineConfig) -> PipelineResult<Self> {
        config.validate()?;
        engine_config
            .validate()
            .map_err(|e| PipelineError::invalid(format!("{e:#}")))?;
        Ok(Self {
            config,
            engine_config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    /// Scans the corpus root into an identity catalog.
    pub fn load_catalog(&self, dir: impl AsRef<Path>) -> PipelineResult<IdentityCatalog> {
        let catalog = IdentityCatalog::scan(dir, &self.config.catalog)?;
        info!(identities = catalog.len(), "label count");
        Ok(catalog)
    }

    /// Builds the sampler the producers share.
    pub fn sampler(&self, catalog: IdentityCatalog) -> PipelineResult<BalancedBatchSampler> {
        let resize = match self.config.resize {
            Some((w, h)) => Some(
                Resize::new(w, h, FilterType::Triangle)
                    .map_err(|e| PipelineError::invalid(format!("{e:#}")))?,
            ),
            None => None,
        };
        BalancedBatchSampler::new(catalog, self.config.num_people, self.config.samples_per_id)?
            .with_codec(default_codec(resize))
            .with_jitter_probability(self.config.jitter_probability)
    }

    /// Engine used by [`train`](Self::train): a fresh [`LinearMetricEngine`],
    /// or one resumed from the sync file when that file exists.
    pub fn default_engine(&self) -> PipelineResult<LinearMetricEngine> {
        if let Some(path) = self.config.sync_file.as_ref().filter(|p| p.exists()) {
            let checkpoint_error = |source: anyhow::Error| PipelineError::Checkpoint {
                path: path.clone(),
                source,
            };
            let state = ModelState::load(path).map_err(checkpoint_error)?;
            let engine = LinearMetricEngine::from_state(self.engine_config, &state)
                .map_err(checkpoint_error)?;
            info!(
                path = %path.display(),
                step = engine.steps(),
                learning_rate = engine.learning_rate(),
                "resuming from sync file"
            );
            return Ok(engine);
        }
        LinearMetricEngine::new(self.engine_config)
            .map_err(|e| PipelineError::invalid(format!("{e:#}")))
    }

    /// Full job with the default engine.
    pub fn train(&self, dir: impl AsRef<Path>) -> PipelineResult<TrainingOutcome> {
        let engine = self.default_engine()?;
        self.train_with(dir, engine)
    }

    /// Full job with a caller-supplied engine.
    ///
    /// Configuration problems (unreadable corpus, too many people per batch)
    /// are reported before any producer thread starts.
    pub fn train_with<E: ModelUpdateEngine>(
        &self,
        dir: impl AsRef<Path>,
        engine: E,
    ) -> PipelineResult<TrainingOutcome> {
        let catalog = self.load_catalog(dir)?;
        let sampler = self.sampler(catalog)?;
        self.train_from_source(Arc::new(sampler), engine)
    }

    /// Runs the pipeline on any batch source.
    pub fn train_from_source<S, E>(
        &self,
        source: Arc<S>,
        engine: E,
    ) -> PipelineResult<TrainingOutcome>
    where
        S: BatchSource + ?Sized + 'static,
        E: ModelUpdateEngine,
    {
        let queue = Arc::new(BatchQueue::new(self.config.queue_capacity)?);
        let pool = ProducerPool::spawn(source, queue, &self.config)?;
        TrainingController::new(engine, pool, &self.config).run()
    }
}

/// `train <dir> <num_people> <samples_per_id> <threshold>` with every other
/// setting at its default. Returns the final model.
pub fn train(
    dir: impl AsRef<Path>,
    num_people: usize,
    samples_per_id: usize,
    threshold: u64,
) -> PipelineResult<ModelState> {
    let config = PipelineConfig::builder()
        .num_people(num_people)
        .samples_per_id(samples_per_id)
        .build();
    let trainer = Trainer::new(config, EngineConfig::default().with_patience(threshold))?;
    Ok(trainer.train(dir)?.model)
}
