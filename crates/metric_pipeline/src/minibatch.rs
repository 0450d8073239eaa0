use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use std::collections::BTreeMap;

/// The unit of work consumed by one model-update step.
///
/// Images and labels travel together as a single record so that the i-th
/// label always describes the i-th image; there is no second channel that
/// could drift out of step with the first.
///
/// A `MiniBatch` built by the sampler satisfies:
/// - `len() == num_people * samples_per_id`
/// - exactly `num_people` distinct labels, each appearing `samples_per_id` times
/// - every image has the same width and height
#[derive(Debug, Clone)]
pub struct MiniBatch {
    images: Vec<RgbImage>,
    labels: Vec<usize>,
}

impl MiniBatch {
    /// Pairs images with labels, checking the lengths match and that every
    /// image has the same dimensions.
    pub fn new(images: Vec<RgbImage>, labels: Vec<usize>) -> PipelineResult<Self> {
        if images.len() != labels.len() {
            return Err(PipelineError::InvariantViolation(format!(
                "{} images paired with {} labels",
                images.len(),
                labels.len()
            )));
        }
        if images.is_empty() {
            return Err(PipelineError::InvariantViolation(
                "a mini-batch must contain at least one image".into(),
            ));
        }

        let (width, height) = images[0].dimensions();
        if let Some((index, image)) = images
            .iter()
            .enumerate()
            .find(|(_, image)| image.dimensions() != (width, height))
        {
            let (w, h) = image.dimensions();
            return Err(PipelineError::InvariantViolation(format!(
                "all images in a mini-batch must be the same size: image 0 is {width}x{height}, \
                 image {index} is {w}x{h}"
            )));
        }

        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[RgbImage] {
        &self.images
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Shared `(width, height)` of every image in the batch.
    pub fn dimensions(&self) -> (u32, u32) {
        self.images[0].dimensions()
    }

    /// Number of occurrences of each label.
    pub fn label_counts(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Checks the identity-balance invariant: exactly `num_people` distinct labels,
    /// each appearing `samples_per_id` times.
    pub fn check_balance(&self, num_people: usize, samples_per_id: usize) -> PipelineResult<()> {
        let counts = self.label_counts();
        if counts.len() != num_people {
            return Err(PipelineError::InvariantViolation(format!(
                "expected {num_people} distinct labels, found {}",
                counts.len()
            )));
        }
        if let Some((label, count)) = counts.iter().find(|&(_, &c)| c != samples_per_id) {
            return Err(PipelineError::InvariantViolation(format!(
                "label {label} appears {count} times, expected {samples_per_id}"
            )));
        }
        Ok(())
    }
}
