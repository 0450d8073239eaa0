//! Pure-Rust metric-learning engine.
//!
//! Every image is downsampled to a small RGB grid, flattened, and projected
//! linearly to an embedding. The loss is the pairwise contrastive metric
//! loss: pairs of the same identity are pulled within
//! `distance_threshold - margin`, pairs of different identities pushed beyond
//! `distance_threshold + margin`. Weights are updated by SGD with momentum and
//! weight decay, and the learning rate follows a [`ConvergenceTracker`].

use crate::minibatch::MiniBatch;
use crate::trainer::engine::{ConvergenceTracker, EngineConfig, ModelUpdateEngine, StepReport};
use crate::trainer::state::{ModelState, NamedTensor};
use anyhow::{bail, ensure, Context, Result};
use image::{imageops, imageops::FilterType, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const LINEAR_ENGINE_KIND: &str = "linear-metric";

const WEIGHTS: &str = "projection.weight";
const VELOCITY: &str = "optim.projection.velocity";

pub struct LinearMetricEngine {
    config: EngineConfig,
    feature_dim: usize,
    /// Row-major `[embedding_dim, feature_dim]`.
    weights: Vec<f32>,
    velocity: Vec<f32>,
    tracker: ConvergenceTracker,
    steps: u64,
}

impl LinearMetricEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let feature_dim = feature_dim(&config);
        let scale = (3.0 / feature_dim as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let weights = (0..config.embedding_dim * feature_dim)
            .map(|_| rng.random_range(-scale..scale))
            .collect();

        Ok(Self {
            config,
            feature_dim,
            weights,
            velocity: vec![0.0; config.embedding_dim * feature_dim],
            tracker: ConvergenceTracker::from_config(&config),
            steps: 0,
        })
    }

    /// Resumes from a snapshot written by [`ModelUpdateEngine::snapshot`].
    ///
    /// A state without optimizer buffers (a finalized model) resumes with
    /// zero momentum.
    pub fn from_state(config: EngineConfig, state: &ModelState) -> Result<Self> {
        if state.kind != LINEAR_ENGINE_KIND {
            bail!(
                "cannot resume a {LINEAR_ENGINE_KIND} engine from a {} state",
                state.kind
            );
        }
        let mut engine = Self::new(config)?;
        let expected = vec![config.embedding_dim, engine.feature_dim];

        let weights = state
            .param(WEIGHTS)
            .with_context(|| format!("model state has no {WEIGHTS} tensor"))?;
        ensure!(
            weights.shape == expected && weights.data.len() == engine.weights.len(),
            "{WEIGHTS} has shape {:?}, this engine expects {:?}",
            weights.shape,
            expected
        );
        engine.weights.copy_from_slice(&weights.data);

        if let Some(velocity) = state.param(VELOCITY) {
            ensure!(
                velocity.shape == expected && velocity.data.len() == engine.velocity.len(),
                "{VELOCITY} has shape {:?}, this engine expects {:?}",
                velocity.shape,
                expected
            );
            engine.velocity.copy_from_slice(&velocity.data);
        }

        engine.steps = state.steps;
        engine.tracker.set_learning_rate(state.learning_rate);
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Embeds one image with the current weights.
    pub fn embed(&self, image: &RgbImage) -> Vec<f32> {
        self.project(&self.features(image))
    }

    fn features(&self, image: &RgbImage) -> Vec<f32> {
        let side = self.config.input_side;
        let small;
        let grid = if image.dimensions() == (side, side) {
            image
        } else {
            small = imageops::resize(image, side, side, FilterType::Triangle);
            &small
        };
        grid.as_raw().iter().map(|&v| v as f32 / 255.0 - 0.5).collect()
    }

    fn project(&self, features: &[f32]) -> Vec<f32> {
        self.weights
            .chunks_exact(self.feature_dim)
            .map(|row| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>())
            .collect()
    }
}

fn feature_dim(config: &EngineConfig) -> usize {
    (config.input_side * config.input_side) as usize * 3
}

/// Pairwise contrastive loss and its gradient with respect to each embedding.
///
/// Positive and negative pairs are averaged separately so batches with many
/// identities are not dominated by negatives.
pub(crate) fn metric_loss(
    embeddings: &[Vec<f32>],
    labels: &[usize],
    threshold: f64,
    margin: f64,
) -> (f64, Vec<Vec<f64>>) {
    let n = embeddings.len();
    let dim = embeddings.first().map_or(0, Vec::len);
    let mut grads = vec![vec![0.0f64; dim]; n];

    let (mut positives, mut negatives) = (0usize, 0usize);
    for i in 0..n {
        for j in (i + 1)..n {
            if labels[i] == labels[j] {
                positives += 1;
            } else {
                negatives += 1;
            }
        }
    }

    let mut loss = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let diff: Vec<f64> = embeddings[i]
                .iter()
                .zip(&embeddings[j])
                .map(|(a, b)| (*a - *b) as f64)
                .collect();
            let dist = diff.iter().map(|d| d * d).sum::<f64>().sqrt();

            let (violation, sign, count) = if labels[i] == labels[j] {
                (dist - (threshold - margin), 1.0, positives)
            } else {
                ((threshold + margin) - dist, -1.0, negatives)
            };
            if violation <= 0.0 {
                continue;
            }
            let weight = 1.0 / count as f64;
            loss += violation * weight;

            if dist > 1e-12 {
                for k in 0..dim {
                    let g = sign * weight * diff[k] / dist;
                    grads[i][k] += g;
                    grads[j][k] -= g;
                }
            }
        }
    }
    (loss, grads)
}

impl ModelUpdateEngine for LinearMetricEngine {
    fn step(&mut self, batch: &MiniBatch) -> Result<StepReport> {
        let features: Vec<Vec<f32>> = batch.images().iter().map(|img| self.features(img)).collect();
        let embeddings: Vec<Vec<f32>> = features.iter().map(|x| self.project(x)).collect();
        let (loss, grads) = metric_loss(
            &embeddings,
            batch.labels(),
            self.config.distance_threshold,
            self.config.margin,
        );
        ensure!(loss.is_finite(), "loss diverged to {loss} at step {}", self.steps);

        let fd = self.feature_dim;
        let mut gradient = vec![0.0f64; self.weights.len()];
        for (x, g) in features.iter().zip(&grads) {
            for (k, &gk) in g.iter().enumerate() {
                if gk == 0.0 {
                    continue;
                }
                let row = &mut gradient[k * fd..(k + 1) * fd];
                for (slot, &xj) in row.iter_mut().zip(x) {
                    *slot += gk * xj as f64;
                }
            }
        }

        let lr = self.tracker.learning_rate();
        let momentum = self.config.momentum;
        let decay = self.config.weight_decay;
        for ((w, v), g) in self.weights.iter_mut().zip(&mut self.velocity).zip(&gradient) {
            let g = g + decay * *w as f64;
            *v = (momentum * *v as f64 - lr * g) as f32;
            *w += *v;
        }

        self.steps += 1;
        let learning_rate = self.tracker.observe(loss);
        Ok(StepReport {
            learning_rate,
            loss,
        })
    }

    fn snapshot(&self) -> Result<ModelState> {
        let shape = vec![self.config.embedding_dim, self.feature_dim];
        Ok(
            ModelState::new(LINEAR_ENGINE_KIND, self.steps, self.tracker.learning_rate())
                .with_param(NamedTensor::new(WEIGHTS, shape.clone(), self.weights.clone())?)
                .with_param(NamedTensor::new(VELOCITY, shape, self.velocity.clone())?)
                .with_metadata("embedding_dim", self.config.embedding_dim)
                .with_metadata("input_side", self.config.input_side)
                .with_metadata("distance_threshold", self.config.distance_threshold),
        )
    }

    fn finalize(self) -> Result<ModelState> {
        Ok(self.snapshot()?.without_optimizer_state())
    }

    fn learning_rate(&self) -> f64 {
        self.tracker.learning_rate()
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn small_config() -> EngineConfig {
        EngineConfig {
            learning_rate: 0.01,
            embedding_dim: 8,
            input_side: 4,
            patience: 1000,
            ..EngineConfig::default()
        }
    }

    /// Two identities: dark textures (label 0) and bright textures (label 1).
    fn two_identity_batch() -> MiniBatch {
        let texture = |base: u8, phase: u32| {
            RgbImage::from_fn(8, 8, |x, y| {
                let v = base as u32 + ((x * 7 + y * 3 + phase) % 5) * 12;
                Rgb([v as u8, (v / 2) as u8, (255 - v) as u8])
            })
        };
        MiniBatch::new(
            vec![texture(10, 0), texture(10, 3), texture(180, 1), texture(180, 4)],
            vec![0, 0, 1, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_metric_loss_hinges() {
        let embeddings = vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![1.0, 0.0]];
        let (loss, grads) = metric_loss(&embeddings, &[0, 0, 1], 0.6, 0.04);
        // Positive pair at 0.1 and negatives at 0.9 / 1.0 all satisfy the margins.
        assert_eq!(loss, 0.0);
        assert!(grads.iter().flatten().all(|&g| g == 0.0));

        let (loss, grads) = metric_loss(&embeddings, &[0, 1, 1], 0.6, 0.04);
        // 0 vs 1 are 0.1 apart but different: violation 0.64 - 0.1.
        // 1 vs 2 are 0.9 apart but same: violation 0.9 - 0.56.
        assert!((loss - (0.54 / 2.0 + 0.34)).abs() < 1e-9);
        // Descending along -grad moves embedding 0 away from embedding 1.
        assert!(grads[0][0] > 0.0);
    }

    #[test]
    fn test_training_reduces_loss() -> Result<()> {
        let batch = two_identity_batch();
        let mut engine = LinearMetricEngine::new(small_config())?;
        let first = engine.step(&batch)?.loss;
        assert!(first > 0.0);
        let mut last = first;
        for _ in 0..40 {
            last = engine.step(&batch)?.loss;
        }
        assert!(last < first, "loss went from {first} to {last}");
        assert_eq!(engine.steps(), 41);
        Ok(())
    }

    #[test]
    fn test_snapshot_resume_preserves_embeddings() -> Result<()> {
        let batch = two_identity_batch();
        let mut engine = LinearMetricEngine::new(small_config())?;
        engine.step(&batch)?;
        let state = engine.snapshot()?;

        let resumed = LinearMetricEngine::from_state(small_config(), &state)?;
        assert_eq!(resumed.steps(), 1);
        assert_eq!(resumed.learning_rate(), engine.learning_rate());
        let image = &batch.images()[0];
        assert_eq!(resumed.embed(image), engine.embed(image));
        Ok(())
    }

    #[test]
    fn test_resume_rejects_foreign_state() -> Result<()> {
        let state = ModelState::new("something-else", 0, 0.1);
        assert!(LinearMetricEngine::from_state(small_config(), &state).is_err());

        let engine = LinearMetricEngine::new(small_config())?;
        let bigger = EngineConfig {
            input_side: 8,
            ..small_config()
        };
        assert!(LinearMetricEngine::from_state(bigger, &engine.snapshot()?).is_err());
        Ok(())
    }

    #[test]
    fn test_finalize_drops_optimizer_state() -> Result<()> {
        let engine = LinearMetricEngine::new(small_config())?;
        let model = engine.finalize()?;
        assert_eq!(model.kind, LINEAR_ENGINE_KIND);
        assert!(model.param(WEIGHTS).is_some());
        assert!(model.param(VELOCITY).is_none());
        Ok(())
    }

    #[test]
    fn test_same_seed_same_weights() -> Result<()> {
        let a = LinearMetricEngine::new(small_config().with_seed(4))?;
        let b = LinearMetricEngine::new(small_config().with_seed(4))?;
        assert_eq!(a.weights, b.weights);
        Ok(())
    }
}
