//! Image codec and augmentation stages used by the batch sampler.
//!
//! Deterministic steps (decode, resize, colour-space conversion) implement
//! [`Transform`]; stochastic ones (colour perturbation, geometric jitter)
//! implement [`RandomTransform`] and draw from the producer's own RNG.

pub mod core;
pub mod vision;

pub use core::{Chain, NoOp, RandomTransform, Transform};
