//! src/dataloader/common/mod.rs
//!
//! Utilities shared by the producer pool and its tests.

pub mod thread;
