//! Thread-local storage for producer identification and per-producer RNGs.
//!
//! Each producer thread owns its random source; nothing here is shared or
//! locked across threads.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::Cell;

thread_local! {
    /// Thread-local producer ID.
    ///
    /// Each producer thread is assigned a unique ID (0 to num_producers-1)
    /// when spawned. Code that runs inside a producer without a handle to it,
    /// such as the image codec, reads it for its `worker` log field.
    pub static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// ID of the producer running on this thread, if any.
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(Cell::get)
}

pub(crate) fn set_worker_id(worker_id: usize) {
    WORKER_ID.with(|id| id.set(Some(worker_id)));
}

/// Creates a producer's RNG.
/// Seed formula: base_seed + worker_id (wrapping).
/// Each producer gets unique but reproducible randomness.
pub fn worker_rng(worker_id: usize, base_seed: u64) -> StdRng {
    StdRng::seed_from_u64(base_seed.wrapping_add(worker_id as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_worker_rng_is_reproducible_and_distinct() {
        let a: u64 = worker_rng(0, 42).random();
        let b: u64 = worker_rng(0, 42).random();
        let c: u64 = worker_rng(1, 42).random();
        assert_eq!(a, b);
        assert_ne!(a, c);

        // worker i with seed s equals worker 0 with seed s + i
        let d: u64 = worker_rng(0, 43).random();
        assert_eq!(c, d);
    }

    #[test]
    fn test_worker_id_is_thread_local() {
        assert_eq!(current_worker_id(), None);
        std::thread::spawn(|| {
            set_worker_id(3);
            assert_eq!(current_worker_id(), Some(3));
        })
        .join()
        .unwrap();
        assert_eq!(current_worker_id(), None);
    }
}
