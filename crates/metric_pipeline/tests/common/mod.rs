#![allow(dead_code)]

use metric_pipeline::{MiniBatch, ModelState, ModelUpdateEngine, StepReport};

use anyhow::{bail, Result};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Writes `root/<name>/<i>.png` for every `(name, count, side)` entry.
/// Each identity gets its own colour so batches are not trivially uniform.
pub fn write_corpus(root: &Path, identities: &[(&str, usize, u32)]) -> Result<()> {
    for (person, (name, count, side)) in identities.iter().enumerate() {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)?;
        for i in 0..*count {
            let shade = (person * 70 + i * 9) as u8;
            let image = RgbImage::from_fn(*side, *side, |x, y| {
                Rgb([shade, (x * 7) as u8, (y * 5) as u8 ^ shade])
            });
            image.save(dir.join(format!("{i}.png")))?;
        }
    }
    Ok(())
}

/// Engine whose learning rate falls by `decrement` per step, so it crosses a
/// floor after a known number of steps.
pub struct ScriptedEngine {
    pub learning_rate: f64,
    pub decrement: f64,
    pub steps: u64,
    pub fail_at: Option<u64>,
    pub expected_batch_size: usize,
    /// Shared with the test so progress is visible after the engine moves.
    pub observed: Arc<AtomicU64>,
}

impl ScriptedEngine {
    pub fn new(learning_rate: f64, decrement: f64, expected_batch_size: usize) -> Self {
        Self {
            learning_rate,
            decrement,
            steps: 0,
            fail_at: None,
            expected_batch_size,
            observed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn failing_at(mut self, step: u64) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl ModelUpdateEngine for ScriptedEngine {
    fn step(&mut self, batch: &MiniBatch) -> Result<StepReport> {
        if batch.len() != self.expected_batch_size {
            bail!(
                "batch of {} samples, expected {}",
                batch.len(),
                self.expected_batch_size
            );
        }
        self.steps += 1;
        self.observed.store(self.steps, Ordering::SeqCst);
        if self.fail_at == Some(self.steps) {
            bail!("scripted failure");
        }
        self.learning_rate -= self.decrement;
        Ok(StepReport {
            learning_rate: self.learning_rate,
            loss: self.learning_rate,
        })
    }

    fn snapshot(&self) -> Result<ModelState> {
        Ok(ModelState::new("scripted", self.steps, self.learning_rate))
    }

    fn finalize(self) -> Result<ModelState> {
        self.snapshot()
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}
