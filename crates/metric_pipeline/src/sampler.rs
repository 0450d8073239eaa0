//! Identity-balanced mini-batch sampling.
//!
//! Sampling happens in two phases:
//!
//! ```text
//!  catalog ──select()──▶ BatchPlan ──materialize()──▶ MiniBatch
//!           (indices only, no I/O)    (decode, perturb, jitter)
//! ```
//!
//! `select` picks `num_people` distinct identities without replacement and
//! then `samples_per_id` references per identity with replacement. It touches
//! nothing but the caller's RNG, which keeps selection cheap to test and
//! reproducible per seed. `materialize` runs the image codec and the
//! augmentation stages for every pick.

use crate::catalog::IdentityCatalog;
use crate::error::{PipelineError, PipelineResult};
use crate::minibatch::MiniBatch;
use crate::transforms::vision::{DisturbColors, EnsureRgb, JitterImage, LoadImage, Resize};
use crate::transforms::{RandomTransform, Transform};
use image::RgbImage;
use rand::{seq::index, Rng, RngCore};
use std::path::PathBuf;

/// Probability that a sample receives geometric jitter.
pub const DEFAULT_JITTER_PROBABILITY: f64 = 0.9;

/// Decodes an image reference into RGB pixels.
pub type ImageCodec = Box<dyn Transform<PathBuf, RgbImage>>;

/// Builds the default codec: decode, convert to RGB, optionally resize.
pub fn default_codec(resize: Option<Resize>) -> ImageCodec {
    match resize {
        Some(resize) => Box::new(LoadImage::new().then(EnsureRgb).then(resize)),
        None => Box::new(LoadImage::new().then(EnsureRgb)),
    }
}

/// Anything a producer thread can pull mini-batches from.
pub trait BatchSource: Send + Sync {
    /// Produces one mini-batch, drawing randomness only from `rng`.
    fn next_batch(&self, rng: &mut dyn RngCore) -> PipelineResult<MiniBatch>;

    /// Number of samples in every batch this source produces.
    fn batch_size(&self) -> usize;
}

/// One selected image reference and the label it will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub path: PathBuf,
    pub label: usize,
}

/// The outcome of the selection phase: which references go into the batch.
///
/// Picks are grouped by identity, in selection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    picks: Vec<Pick>,
}

impl BatchPlan {
    pub fn picks(&self) -> &[Pick] {
        &self.picks
    }

    pub fn len(&self) -> usize {
        self.picks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }

    /// Distinct labels, in selection order.
    pub fn labels(&self) -> Vec<usize> {
        let mut labels: Vec<usize> = Vec::new();
        for pick in &self.picks {
            if labels.last() != Some(&pick.label) {
                labels.push(pick.label);
            }
        }
        labels
    }
}

fn check_request(
    catalog: &IdentityCatalog,
    num_people: usize,
    samples_per_id: usize,
) -> PipelineResult<()> {
    if num_people == 0 || samples_per_id == 0 {
        return Err(PipelineError::invalid(format!(
            "num_people and samples_per_id must be positive (got {num_people} and {samples_per_id})"
        )));
    }
    if num_people > catalog.len() {
        return Err(PipelineError::invalid(format!(
            "requested {num_people} people per batch but the catalog only has {} identities",
            catalog.len()
        )));
    }
    if num_people.checked_mul(samples_per_id).is_none() {
        return Err(PipelineError::invalid(format!(
            "batch of {num_people} x {samples_per_id} samples does not fit in memory"
        )));
    }
    Ok(())
}

/// Runs the selection phase against `catalog`.
///
/// Uses `rand::seq::index::sample`, which picks distinct indices in time
/// bounded by `num_people` rather than by rejection.
pub fn plan_batch(
    catalog: &IdentityCatalog,
    num_people: usize,
    samples_per_id: usize,
    rng: &mut dyn RngCore,
) -> PipelineResult<BatchPlan> {
    check_request(catalog, num_people, samples_per_id)?;

    let mut picks = Vec::with_capacity(num_people * samples_per_id);
    for label in index::sample(rng, catalog.len(), num_people).into_iter() {
        let identity = catalog.get(label).ok_or_else(|| {
            PipelineError::InvariantViolation(format!("identity index {label} out of range"))
        })?;
        for _ in 0..samples_per_id {
            let k = rng.random_range(0..identity.images.len());
            picks.push(Pick {
                path: identity.images[k].clone(),
                label,
            });
        }
    }
    Ok(BatchPlan { picks })
}

/// Produces identity-balanced mini-batches from a shared catalog.
///
/// Generic over the codec (`L`), the colour perturbation (`P`) and the
/// geometric jitter (`J`) so tests and alternative pipelines can swap stages.
///
/// # Example
/// ```ignore
/// let sampler = BalancedBatchSampler::new(catalog, 15, 5)?;
/// let batch = sampler.sample(&mut rng)?;
/// assert_eq!(batch.len(), 75);
/// ```
pub struct BalancedBatchSampler<L = ImageCodec, P = DisturbColors, J = JitterImage> {
    catalog: IdentityCatalog,
    num_people: usize,
    samples_per_id: usize,
    jitter_probability: f64,
    codec: L,
    perturb: P,
    jitter: J,
}

impl BalancedBatchSampler {
    /// Creates a sampler with the default codec and augmentations.
    ///
    /// Fails with `InvalidArgument` when `num_people` exceeds the number of
    /// identities, so a bad request is reported before any thread starts.
    pub fn new(
        catalog: IdentityCatalog,
        num_people: usize,
        samples_per_id: usize,
    ) -> PipelineResult<Self> {
        check_request(&catalog, num_people, samples_per_id)?;
        Ok(Self {
            catalog,
            num_people,
            samples_per_id,
            jitter_probability: DEFAULT_JITTER_PROBABILITY,
            codec: default_codec(None),
            perturb: DisturbColors::default(),
            jitter: JitterImage::default(),
        })
    }
}

impl<L, P, J> BalancedBatchSampler<L, P, J> {
    pub fn with_codec<L2>(self, codec: L2) -> BalancedBatchSampler<L2, P, J> {
        BalancedBatchSampler {
            catalog: self.catalog,
            num_people: self.num_people,
            samples_per_id: self.samples_per_id,
            jitter_probability: self.jitter_probability,
            codec,
            perturb: self.perturb,
            jitter: self.jitter,
        }
    }

    pub fn with_color_perturbation<P2>(self, perturb: P2) -> BalancedBatchSampler<L, P2, J> {
        BalancedBatchSampler {
            catalog: self.catalog,
            num_people: self.num_people,
            samples_per_id: self.samples_per_id,
            jitter_probability: self.jitter_probability,
            codec: self.codec,
            perturb,
            jitter: self.jitter,
        }
    }

    pub fn with_jitter<J2>(self, jitter: J2) -> BalancedBatchSampler<L, P, J2> {
        BalancedBatchSampler {
            catalog: self.catalog,
            num_people: self.num_people,
            samples_per_id: self.samples_per_id,
            jitter_probability: self.jitter_probability,
            codec: self.codec,
            perturb: self.perturb,
            jitter,
        }
    }

    pub fn with_jitter_probability(mut self, p: f64) -> PipelineResult<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(PipelineError::invalid(format!(
                "jitter probability must be in [0, 1] (got {p})"
            )));
        }
        self.jitter_probability = p;
        Ok(self)
    }

    pub fn catalog(&self) -> &IdentityCatalog {
        &self.catalog
    }

    pub fn num_people(&self) -> usize {
        self.num_people
    }

    pub fn samples_per_id(&self) -> usize {
        self.samples_per_id
    }

    /// Selection phase only; performs no I/O.
    pub fn select(&self, rng: &mut dyn RngCore) -> PipelineResult<BatchPlan> {
        plan_batch(&self.catalog, self.num_people, self.samples_per_id, rng)
    }
}

impl<L, P, J> BalancedBatchSampler<L, P, J>
where
    L: Transform<PathBuf, RgbImage>,
    P: RandomTransform<RgbImage, RgbImage>,
    J: RandomTransform<RgbImage, RgbImage>,
{
    /// Decodes and augments every pick of `plan`, then checks the batch invariants.
    pub fn materialize(&self, plan: &BatchPlan, rng: &mut dyn RngCore) -> PipelineResult<MiniBatch> {
        let mut images = Vec::with_capacity(plan.len());
        let mut labels = Vec::with_capacity(plan.len());

        for pick in plan.picks() {
            let augmentation_error = |source: anyhow::Error| PipelineError::Augmentation {
                path: pick.path.clone(),
                source,
            };

            let pixels = self
                .codec
                .apply(pick.path.clone())
                .map_err(|source| PipelineError::Decode {
                    path: pick.path.clone(),
                    source,
                })?;
            let pixels = self.perturb.apply(pixels, rng).map_err(augmentation_error)?;
            let pixels = if rng.random_bool(self.jitter_probability) {
                self.jitter.apply(pixels, rng).map_err(augmentation_error)?
            } else {
                pixels
            };

            images.push(pixels);
            labels.push(pick.label);
        }

        MiniBatch::new(images, labels)
    }

    /// Selects and materializes one batch.
    pub fn sample(&self, rng: &mut dyn RngCore) -> PipelineResult<MiniBatch> {
        let plan = self.select(rng)?;
        self.materialize(&plan, rng)
    }
}

impl<L, P, J> BatchSource for BalancedBatchSampler<L, P, J>
where
    L: Transform<PathBuf, RgbImage>,
    P: RandomTransform<RgbImage, RgbImage>,
    J: RandomTransform<RgbImage, RgbImage>,
{
    fn next_batch(&self, rng: &mut dyn RngCore) -> PipelineResult<MiniBatch> {
        self.sample(rng)
    }

    fn batch_size(&self) -> usize {
        self.num_people.saturating_mul(self.samples_per_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogOptions, Identity};
    use crate::error::ErrorClass;
    use crate::transforms::NoOp;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::tempdir;

    fn identity(name: &str, files: &[&str]) -> Identity {
        Identity {
            name: name.to_string(),
            images: files.iter().map(PathBuf::from).collect(),
        }
    }

    fn abc_catalog() -> IdentityCatalog {
        IdentityCatalog::new(vec![
            identity("A", &["a1", "a2"]),
            identity("B", &["b1", "b2", "b3"]),
            identity("C", &["c1"]),
        ])
    }

    fn write_png(path: &Path, width: u32, height: u32, shade: u8) {
        RgbImage::from_pixel(width, height, Rgb([shade, 255 - shade, 64]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_three_identity_scenario() {
        let catalog = abc_catalog();
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = plan_batch(&catalog, 2, 2, &mut rng).unwrap();
            assert_eq!(plan.len(), 4);

            let labels = plan.labels();
            assert_eq!(labels.len(), 2, "two distinct identities per batch");
            for &label in &labels {
                let picks: Vec<_> = plan.picks().iter().filter(|p| p.label == label).collect();
                assert_eq!(picks.len(), 2);
                let owner = catalog.get(label).unwrap();
                assert!(picks.iter().all(|p| owner.images.contains(&p.path)));
                if owner.name == "C" {
                    assert!(picks.iter().all(|p| p.path == Path::new("c1")));
                }
            }
        }
    }

    #[test]
    fn test_selection_never_repeats_identities() {
        let catalog = IdentityCatalog::new(
            (0..20)
                .map(|i| identity(&format!("id{i}"), &["x", "y"]))
                .collect(),
        );
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let plan = plan_batch(&catalog, 20, 1, &mut rng).unwrap();
            let distinct: BTreeSet<_> = plan.picks().iter().map(|p| p.label).collect();
            assert_eq!(distinct.len(), 20);
            assert!(distinct.iter().all(|&l| l < catalog.len()));
        }
    }

    #[test]
    fn test_small_identities_repeat_references() {
        let catalog = IdentityCatalog::new(vec![identity("solo", &["only"])]);
        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_batch(&catalog, 1, 5, &mut rng).unwrap();
        assert_eq!(plan.len(), 5);
        assert!(plan.picks().iter().all(|p| p.path == Path::new("only") && p.label == 0));
    }

    #[test]
    fn test_too_many_people_is_configuration_error() {
        let catalog = abc_catalog();
        let mut rng = StdRng::seed_from_u64(1);
        let err = plan_batch(&catalog, 4, 1, &mut rng).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err = plan_batch(&catalog, 2, usize::MAX, &mut rng).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration, "got {err}");

        let err = BalancedBatchSampler::new(IdentityCatalog::new(vec![]), 1, 1)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn test_selection_is_deterministic_per_seed() {
        let catalog = abc_catalog();
        let a = plan_batch(&catalog, 2, 3, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = plan_batch(&catalog, 2, 3, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_from_disk_is_balanced() {
        let dir = tempdir().unwrap();
        for (i, person) in ["ann", "ben", "cat", "dan"].iter().enumerate() {
            let person_dir = dir.path().join(person);
            std::fs::create_dir(&person_dir).unwrap();
            for k in 0..=i {
                write_png(&person_dir.join(format!("{k}.png")), 12, 10, (i * 40 + k) as u8);
            }
        }
        let catalog = IdentityCatalog::scan(dir.path(), &CatalogOptions::default()).unwrap();
        let sampler = BalancedBatchSampler::new(catalog, 3, 4).unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..5 {
            let batch = sampler.sample(&mut rng).unwrap();
            assert_eq!(batch.len(), 12);
            assert_eq!(batch.dimensions(), (12, 10));
            batch.check_balance(3, 4).unwrap();
        }
        assert_eq!(sampler.batch_size(), 12);
    }

    #[test]
    fn test_mixed_dimensions_violate_invariant() {
        let dir = tempdir().unwrap();
        for (person, width) in [("big", 20), ("small", 10)] {
            let person_dir = dir.path().join(person);
            std::fs::create_dir(&person_dir).unwrap();
            write_png(&person_dir.join("0.png"), width, width, 100);
        }
        let catalog = IdentityCatalog::scan(dir.path(), &CatalogOptions::default()).unwrap();
        let sampler = BalancedBatchSampler::new(catalog, 2, 1)
            .unwrap()
            .with_color_perturbation(NoOp)
            .with_jitter(NoOp);

        let err = sampler.sample(&mut StdRng::seed_from_u64(0)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invariant);
    }

    #[test]
    fn test_resize_codec_unifies_dimensions() {
        let dir = tempdir().unwrap();
        for (person, width) in [("big", 20), ("small", 10)] {
            let person_dir = dir.path().join(person);
            std::fs::create_dir(&person_dir).unwrap();
            write_png(&person_dir.join("0.png"), width, width, 100);
        }
        let catalog = IdentityCatalog::scan(dir.path(), &CatalogOptions::default()).unwrap();
        let resize = Resize::new(8, 8, image::imageops::FilterType::Triangle).unwrap();
        let sampler = BalancedBatchSampler::new(catalog, 2, 2)
            .unwrap()
            .with_codec(default_codec(Some(resize)));

        let batch = sampler.sample(&mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(batch.dimensions(), (8, 8));
    }

    #[test]
    fn test_undecodable_reference_is_recoverable() {
        let dir = tempdir().unwrap();
        let person_dir = dir.path().join("broken");
        std::fs::create_dir(&person_dir).unwrap();
        std::fs::write(person_dir.join("0.png"), b"not an image").unwrap();

        let catalog = IdentityCatalog::scan(dir.path(), &CatalogOptions::default()).unwrap();
        let sampler = BalancedBatchSampler::new(catalog, 1, 1).unwrap();
        let err = sampler.sample(&mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(err.is_recoverable(), "decode failures are recoverable: {err}");
    }

    #[test]
    fn test_jitter_probability_bounds() {
        let sampler = BalancedBatchSampler::new(abc_catalog(), 1, 1).unwrap();
        assert!(sampler.with_jitter_probability(1.5).is_err());
    }
}
