//! Producer pool: N threads looping sample → enqueue.
//!
//! Each producer owns a seeded RNG and a shared handle to the batch source and
//! the queue. The loop re-checks `queue.is_enabled()` before every iteration,
//! so once the controller disables the queue every producer finishes at most
//! one in-flight batch and exits.
//!
//! # Failure handling
//! - Recoverable errors (decode, augmentation) are logged and the iteration
//!   is discarded.
//! - Invariant violations follow [`DimensionPolicy`]: `Retry` behaves like a
//!   recoverable error, `Strict` reports the error on the fault channel and
//!   the producer exits.
//! - Any other error, and any panic inside an iteration, is reported on the
//!   fault channel and the producer exits.
//!
//! The controller watches the fault channel next to the queue, see
//! [`BatchQueue::dequeue_or_fault`].

use crate::dataloader::common::thread::{set_worker_id, worker_rng};
use crate::dataloader::config::{DimensionPolicy, PipelineConfig};
use crate::dataloader::queue::BatchQueue;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::sampler::BatchSource;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Counters collected while the pool runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Batches fully built by producers.
    pub batches_produced: u64,
    /// Built batches the queue refused because it was disabled.
    pub batches_discarded: u64,
    /// Iterations abandoned after a recoverable error.
    pub iterations_failed: u64,
    /// Producer threads joined at shutdown.
    pub producers_joined: usize,
}

#[derive(Default)]
struct Counters {
    produced: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self, producers_joined: usize) -> PoolStats {
        PoolStats {
            batches_produced: self.produced.load(Ordering::Relaxed),
            batches_discarded: self.discarded.load(Ordering::Relaxed),
            iterations_failed: self.failed.load(Ordering::Relaxed),
            producers_joined,
        }
    }
}

/// Owns the producer threads.
///
/// Dropping the pool disables the queue and joins every producer, so no
/// thread outlives it.
pub struct ProducerPool {
    workers: Vec<thread::JoinHandle<()>>,
    queue: Arc<BatchQueue>,
    faults: Receiver<PipelineError>,
    counters: Arc<Counters>,
}

impl ProducerPool {
    /// Spawns `config.num_producers` threads named `batch-producer-{i}`.
    ///
    /// If a spawn fails the threads already started are shut down before the
    /// error is returned.
    pub fn spawn<S>(
        source: Arc<S>,
        queue: Arc<BatchQueue>,
        config: &PipelineConfig,
    ) -> PipelineResult<Self>
    where
        S: BatchSource + ?Sized + 'static,
    {
        if config.num_producers == 0 {
            return Err(PipelineError::invalid(
                "cannot start a producer pool with 0 producers",
            ));
        }

        let (fault_tx, faults) = unbounded();
        let counters = Arc::new(Counters::default());
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_producers),
            queue,
            faults,
            counters,
        };

        for worker_id in 0..config.num_producers {
            let source = Arc::clone(&source);
            let queue = Arc::clone(&pool.queue);
            let counters = Arc::clone(&pool.counters);
            let fault_tx = fault_tx.clone();
            let rng = worker_rng(worker_id, config.base_seed);
            let policy = config.dimension_policy;

            let handle = thread::Builder::new()
                .name(format!("batch-producer-{worker_id}"))
                .spawn(move || {
                    set_worker_id(worker_id);
                    let producer = Producer {
                        worker_id,
                        source: &*source,
                        queue: &queue,
                        faults: &fault_tx,
                        counters: &counters,
                        policy,
                    };
                    producer.run(rng);
                })
                .map_err(|source| PipelineError::Spawn {
                    worker: worker_id,
                    source,
                })?;
            pool.workers.push(handle);
        }

        info!(
            producers = config.num_producers,
            base_seed = config.base_seed,
            batch_size = source.batch_size(),
            "batch producers started"
        );
        Ok(pool)
    }

    /// Receiving end of the fault channel.
    pub fn faults(&self) -> &Receiver<PipelineError> {
        &self.faults
    }

    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    pub fn num_producers(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }

    /// Disables the queue and joins every producer.
    pub fn shutdown(mut self) -> PoolStats {
        let joined = self.join_all();
        let stats = self.counters.snapshot(joined);
        info!(
            produced = stats.batches_produced,
            discarded = stats.batches_discarded,
            failed = stats.iterations_failed,
            joined = stats.producers_joined,
            "batch producers stopped"
        );
        stats
    }

    fn join_all(&mut self) -> usize {
        self.queue.disable();
        let mut joined = 0;
        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            match handle.join() {
                Ok(()) => joined += 1,
                Err(payload) => error!(
                    worker = worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "producer thread panicked outside its loop"
                ),
            }
        }
        joined
    }
}

impl Drop for ProducerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.join_all();
        }
    }
}

struct Producer<'a, S: ?Sized> {
    worker_id: usize,
    source: &'a S,
    queue: &'a BatchQueue,
    faults: &'a Sender<PipelineError>,
    counters: &'a Counters,
    policy: DimensionPolicy,
}

impl<S: BatchSource + ?Sized> Producer<'_, S> {
    fn run(&self, mut rng: StdRng) {
        let worker = self.worker_id;
        debug!(worker, "producer started");

        while self.queue.is_enabled() {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| self.source.next_batch(&mut rng)));

            let batch = match outcome {
                Ok(Ok(batch)) => batch,
                Ok(Err(err)) if self.can_skip(&err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(worker, error = %err, "discarding batch and sampling again");
                    continue;
                }
                Ok(Err(err)) => {
                    error!(worker, error = %err, "producer stopping on unrecoverable error");
                    self.report(err);
                    break;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(worker, panic = %message, "producer iteration panicked");
                    self.report(PipelineError::ProducerPanicked { worker, message });
                    break;
                }
            };

            self.counters.produced.fetch_add(1, Ordering::Relaxed);
            if self.queue.enqueue(batch).is_err() {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        debug!(worker, "producer exiting");
    }

    fn can_skip(&self, err: &PipelineError) -> bool {
        err.is_recoverable()
            || (err.class() == ErrorClass::Invariant && self.policy == DimensionPolicy::Retry)
    }

    fn report(&self, err: PipelineError) {
        // The controller may already be gone; nothing left to tell then.
        let _ = self.faults.send(err);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
