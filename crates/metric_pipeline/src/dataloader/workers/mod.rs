//! Producer threads for the batch pipeline.
//!
//! - `pool`: spawns, supervises and joins the producers.

pub(crate) mod pool;
