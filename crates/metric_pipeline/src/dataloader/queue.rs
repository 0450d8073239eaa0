//! Bounded, disable-able queue of mini-batches.
//!
//! Producers `enqueue`, the controller `dequeue`s. While the queue is enabled
//! both calls block (full / empty). `disable()` flips it into a one-way drain
//! state that wakes every blocked caller:
//!
//! ```text
//!            disable()
//!  Enabled ─────────────▶ Disabled
//!  enqueue: blocks when full        enqueue: returns the batch
//!  dequeue: blocks when empty       dequeue: queued batches once each,
//!                                            then `Dequeued::Disabled`
//! ```
//!
//! Internally this is a crossbeam bounded channel plus a second, never-written
//! channel whose sender is dropped on disable. A dropped sender makes every
//! `Select` that watches the receiver ready at once, so no waiter can sleep
//! through the transition.

use crate::error::{PipelineError, PipelineResult};
use crate::minibatch::MiniBatch;
use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Result of a dequeue.
#[derive(Debug)]
pub enum Dequeued {
    Batch(MiniBatch),
    /// The queue is disabled and fully drained.
    Disabled,
}

impl Dequeued {
    pub fn into_batch(self) -> Option<MiniBatch> {
        match self {
            Self::Batch(batch) => Some(batch),
            Self::Disabled => None,
        }
    }
}

/// FIFO of complete `{images, labels}` records with capacity `C`.
pub struct BatchQueue {
    tx: Sender<MiniBatch>,
    rx: Receiver<MiniBatch>,
    capacity: usize,
    enabled: AtomicBool,
    disable_tx: Mutex<Option<Sender<()>>>,
    disabled_rx: Receiver<()>,
}

impl std::fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl BatchQueue {
    pub fn new(capacity: usize) -> PipelineResult<Self> {
        if capacity == 0 {
            return Err(PipelineError::invalid(
                "batch queue capacity must be > 0",
            ));
        }
        let (tx, rx) = bounded(capacity);
        let (disable_tx, disabled_rx) = bounded(0);
        Ok(Self {
            tx,
            rx,
            capacity,
            enabled: AtomicBool::new(true),
            disable_tx: Mutex::new(Some(disable_tx)),
            disabled_rx,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Switches the queue to the disabled state. Idempotent.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        let sender = self
            .disable_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!(queued = self.len(), "batch queue disabled");
        }
        // Dropping the sender wakes everyone selecting on `disabled_rx`.
        drop(sender);
    }

    /// Blocks while the queue is full. Hands the batch back if the queue is,
    /// or becomes, disabled.
    pub fn enqueue(&self, batch: MiniBatch) -> Result<(), MiniBatch> {
        if !self.is_enabled() {
            return Err(batch);
        }

        let mut sel = Select::new();
        let send_index = sel.send(&self.tx);
        let disabled_index = sel.recv(&self.disabled_rx);
        let oper = sel.select();
        match oper.index() {
            i if i == send_index => oper.send(&self.tx, batch).map_err(|e| e.into_inner()),
            i => {
                debug_assert_eq!(i, disabled_index);
                let _ = oper.recv(&self.disabled_rx);
                Err(batch)
            }
        }
    }

    /// Blocks while the queue is empty and enabled.
    pub fn dequeue(&self) -> Dequeued {
        match self.wait(None, None) {
            Waited::Batch(batch) => Dequeued::Batch(batch),
            _ => Dequeued::Disabled,
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> PipelineResult<Dequeued> {
        match self.wait(None, Some(timeout)) {
            Waited::Batch(batch) => Ok(Dequeued::Batch(batch)),
            Waited::TimedOut => Err(PipelineError::Stalled(timeout)),
            _ => Ok(Dequeued::Disabled),
        }
    }

    /// Dequeue used by the controller: also wakes when a producer reports a
    /// fault, and when every producer has gone away.
    pub(crate) fn dequeue_or_fault(
        &self,
        faults: &Receiver<PipelineError>,
        timeout: Option<Duration>,
    ) -> PipelineResult<Dequeued> {
        match self.wait(Some(faults), timeout) {
            Waited::Batch(batch) => Ok(Dequeued::Batch(batch)),
            Waited::Disabled => Ok(Dequeued::Disabled),
            Waited::Fault(err) => Err(err),
            Waited::ProducersGone => Err(PipelineError::ProducersExhausted),
            Waited::TimedOut => Err(PipelineError::Stalled(timeout.unwrap_or_default())),
        }
    }

    fn wait(&self, faults: Option<&Receiver<PipelineError>>, timeout: Option<Duration>) -> Waited {
        let mut sel = Select::new();
        let batch_index = sel.recv(&self.rx);
        let disabled_index = sel.recv(&self.disabled_rx);
        let fault_index = faults.map(|rx| sel.recv(rx));

        let oper = match timeout {
            Some(timeout) => match sel.select_timeout(timeout) {
                Ok(oper) => oper,
                Err(_) => return Waited::TimedOut,
            },
            None => sel.select(),
        };

        match oper.index() {
            i if i == batch_index => match oper.recv(&self.rx) {
                Ok(batch) => Waited::Batch(batch),
                // The queue holds its own sender, so the channel never disconnects.
                Err(_) => Waited::Disabled,
            },
            i if i == disabled_index => {
                let _ = oper.recv(&self.disabled_rx);
                self.drain_one()
            }
            i => match (faults, Some(i) == fault_index) {
                (Some(rx), true) => match oper.recv(rx) {
                    Ok(err) => Waited::Fault(err),
                    // Every fault sender dropped: all producers have exited.
                    Err(_) => match self.rx.try_recv() {
                        Ok(batch) => Waited::Batch(batch),
                        Err(_) if !self.is_enabled() => Waited::Disabled,
                        Err(_) => Waited::ProducersGone,
                    },
                },
                _ => Waited::Disabled,
            },
        }
    }

    fn drain_one(&self) -> Waited {
        match self.rx.try_recv() {
            Ok(batch) => Waited::Batch(batch),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Waited::Disabled,
        }
    }
}

enum Waited {
    Batch(MiniBatch),
    Disabled,
    Fault(PipelineError),
    ProducersGone,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use std::thread;

    fn batch(tag: u8) -> MiniBatch {
        MiniBatch::new(vec![RgbImage::from_pixel(1, 1, Rgb([tag, 0, 0]))], vec![tag as usize])
            .unwrap()
    }

    fn tag(batch: &MiniBatch) -> u8 {
        batch.images()[0].get_pixel(0, 0)[0]
    }

    #[test]
    fn test_fifo_order() {
        let queue = BatchQueue::new(4).unwrap();
        for t in 0..3 {
            queue.enqueue(batch(t)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for t in 0..3 {
            let got = queue.dequeue().into_batch().unwrap();
            assert_eq!(tag(&got), t);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backpressure_blocks_until_dequeue() {
        let queue = Arc::new(BatchQueue::new(4).unwrap());
        for t in 0..4 {
            queue.enqueue(batch(t)).unwrap();
        }

        let (done_tx, done_rx) = unbounded();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let result = queue.enqueue(batch(4));
                done_tx.send(result.is_ok()).unwrap();
            })
        };

        // The fifth enqueue must still be blocked.
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(queue.len(), 4);

        assert_eq!(tag(&queue.dequeue().into_batch().unwrap()), 0);
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        producer.join().unwrap();
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_disable_drains_then_reports_disabled() {
        let queue = BatchQueue::new(4).unwrap();
        for t in 0..3 {
            queue.enqueue(batch(t)).unwrap();
        }
        queue.disable();

        let mut drained = Vec::new();
        while let Dequeued::Batch(b) = queue.dequeue() {
            drained.push(tag(&b));
        }
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2]);

        // Drained and disabled: returns immediately, every time.
        assert!(matches!(queue.dequeue(), Dequeued::Disabled));
        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(1)),
            Ok(Dequeued::Disabled)
        ));
    }

    #[test]
    fn test_enqueue_after_disable_returns_batch() {
        let queue = BatchQueue::new(2).unwrap();
        queue.disable();
        let rejected = queue.enqueue(batch(9)).unwrap_err();
        assert_eq!(tag(&rejected), 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_disable_is_idempotent() {
        let queue = BatchQueue::new(1).unwrap();
        queue.disable();
        queue.disable();
        assert!(!queue.is_enabled());
        assert!(matches!(queue.dequeue(), Dequeued::Disabled));
    }

    #[test]
    fn test_disable_wakes_blocked_callers() {
        let queue = Arc::new(BatchQueue::new(1).unwrap());
        queue.enqueue(batch(0)).unwrap();

        let blocked_producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(batch(1)).is_err())
        };
        let empty = Arc::new(BatchQueue::new(1).unwrap());
        let blocked_consumer = {
            let empty = Arc::clone(&empty);
            thread::spawn(move || matches!(empty.dequeue(), Dequeued::Disabled))
        };

        thread::sleep(Duration::from_millis(50));
        queue.disable();
        empty.disable();

        assert!(blocked_producer.join().unwrap(), "producer gets its batch back");
        assert!(blocked_consumer.join().unwrap(), "consumer sees Disabled");
    }

    #[test]
    fn test_dequeue_timeout_reports_stall() {
        let queue = BatchQueue::new(1).unwrap();
        let err = queue.dequeue_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, PipelineError::Stalled(_)));
    }

    #[test]
    fn test_fault_wakes_controller() {
        let queue = BatchQueue::new(1).unwrap();
        let (fault_tx, fault_rx) = unbounded();
        fault_tx
            .send(PipelineError::InvariantViolation("mixed sizes".into()))
            .unwrap();
        let err = queue.dequeue_or_fault(&fault_rx, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));

        // With every sender gone and nothing queued, producers are exhausted.
        drop(fault_tx);
        let err = queue.dequeue_or_fault(&fault_rx, None).unwrap_err();
        assert!(matches!(err, PipelineError::ProducersExhausted));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BatchQueue::new(0).is_err());
    }
}
