pub mod catalog;
pub mod dataloader;
pub mod error;
pub mod logging;
pub mod minibatch;
pub mod sampler;
pub mod trainer;
pub mod transforms;

pub use catalog::{CatalogOptions, Identity, IdentityCatalog};
pub use dataloader::{BatchQueue, DimensionPolicy, PipelineConfig, PoolStats, ProducerPool};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use minibatch::MiniBatch;
pub use sampler::{BalancedBatchSampler, BatchPlan, BatchSource};
pub use trainer::{
    train, EngineConfig, LinearMetricEngine, ModelState, ModelUpdateEngine, StepReport, Trainer,
    TrainingController, TrainingOutcome,
};
