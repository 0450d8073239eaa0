//! Error taxonomy for the batch pipeline.
//!
//! Transforms and engines report failures as `anyhow::Error` with context; the
//! pipeline wraps them into [`PipelineError`] so callers can decide what is
//! recoverable without string matching.
//!
//! | Class           | Raised by                                  | Handling                          |
//! |-----------------|--------------------------------------------|-----------------------------------|
//! | `Configuration` | catalog builder, sampler precondition, cfg | abort before any thread starts    |
//! | `Recoverable`   | decode / augmentation inside a producer    | log, discard iteration, continue  |
//! | `Invariant`     | mixed image dimensions in one batch        | strict abort (or retry by policy) |
//! | `Engine`        | `ModelUpdateEngine::step` / `finalize`     | propagate, shut pipeline down     |
//! | `Internal`      | thread spawn, panics, stalls, checkpoints  | propagate                         |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Coarse classification used by producers and the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Recoverable,
    Invariant,
    Engine,
    Internal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The corpus root (or one of its entries) could not be read.
    #[error("cannot read corpus at {}: {source}", path.display())]
    CorpusUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied parameter is out of range (e.g. more people than identities).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to decode {}: {source:#}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("augmentation failed for {}: {source:#}", path.display())]
    Augmentation {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// A mini-batch broke one of its structural invariants.
    #[error("mini-batch invariant violated: {0}")]
    InvariantViolation(String),

    #[error("model update engine failed at step {step}: {source:#}")]
    Engine {
        step: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("producer {worker} panicked: {message}")]
    ProducerPanicked { worker: usize, message: String },

    #[error("failed to spawn producer {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    /// No batch arrived within the configured dequeue timeout.
    #[error("no mini-batch arrived within {0:?}; producers may be stuck")]
    Stalled(Duration),

    /// Every producer exited while the queue was still enabled.
    #[error("all producers exited before training converged")]
    ProducersExhausted,

    #[error("checkpoint failed for {}: {source:#}", path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CorpusUnreadable { .. } | Self::InvalidArgument(_) => ErrorClass::Configuration,
            Self::Decode { .. } | Self::Augmentation { .. } => ErrorClass::Recoverable,
            Self::InvariantViolation(_) => ErrorClass::Invariant,
            Self::Engine { .. } => ErrorClass::Engine,
            Self::ProducerPanicked { .. }
            | Self::Spawn { .. }
            | Self::Stalled(_)
            | Self::ProducersExhausted
            | Self::Checkpoint { .. } => ErrorClass::Internal,
        }
    }

    /// Failures a producer may log and move past without stopping.
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
