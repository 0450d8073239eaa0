//! src/dataloader/mod.rs
//!
//! The concurrent half of the pipeline: N producers build identity-balanced
//! mini-batches and push them through one bounded queue to a single consumer.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │ IdentityCatalog  │ (immutable, Arc-shared)
//!                 └────────┬─────────┘
//!                          │ read-only
//!          ┌───────────────┼───────────────┐
//!          ↓               ↓               ↓
//!   [batch-producer-0] [batch-producer-1] … [batch-producer-N-1]
//!    sampler + own RNG   sampler + own RNG     sampler + own RNG
//!          │               │               │
//!          └─────── enqueue (blocks when full) ───────┐
//!                                                     ↓
//!                                          ┌────────────────────┐
//!                                          │ BatchQueue (cap C) │
//!                                          └─────────┬──────────┘
//!                                                    │ dequeue
//!                                                    ↓
//!                                        TrainingController → engine
//! ```
//!
//! Faults that must stop training (strict invariant violations, panics) travel
//! on a separate channel the controller selects over together with the queue.
//!
//! # Module Structure
//!
//! ```text
//! src/dataloader/
//! ├── mod.rs             # Public API exports + architecture docs
//! ├── config.rs          # PipelineConfig, builder, and validation
//! ├── queue.rs           # BatchQueue: bounded, disable-able FIFO
//! ├── workers/
//! │   ├── mod.rs
//! │   └── pool.rs        # ProducerPool and PoolStats
//! └── common/
//!     ├── mod.rs
//!     └── thread.rs      # Thread-local worker ID, per-worker RNG
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let queue = Arc::new(BatchQueue::new(config.queue_capacity)?);
//! let pool = ProducerPool::spawn(Arc::new(sampler), queue.clone(), &config)?;
//! while let Dequeued::Batch(batch) = queue.dequeue() {
//!     // train on batch ...
//! #   break;
//! }
//! let stats = pool.shutdown();
//! ```
//!
//! # Memory Usage
//! At most `queue_capacity + num_producers` batches exist at once.

mod common;
mod config;
mod queue;
mod workers;

pub use common::thread::{current_worker_id, worker_rng, WORKER_ID};
pub use config::{
    available_producers, wall_clock_seed, DimensionPolicy, PipelineConfig, PipelineConfigBuilder,
    DEFAULT_MIN_LEARNING_RATE, DEFAULT_QUEUE_CAPACITY, DEFAULT_SYNC_INTERVAL,
};
pub use queue::{BatchQueue, Dequeued};
pub use workers::pool::{PoolStats, ProducerPool};
