use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use image::RgbImage;
use tch::{Kind, Tensor};

// ============================================================================
// ToTensor
// ============================================================================

/// Converts an RGB image to a channel-first f32 tensor in [0.0, 1.0] range.
///
/// The packed `[H, W, 3]` buffer is permuted into `[3, H, W]`.
///
/// # Example
/// ```ignore
/// let tensor = ToTensor.apply(rgb)?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ToTensor;

impl Transform<RgbImage, Tensor> for ToTensor {
    fn apply(&self, img: RgbImage) -> Result<Tensor> {
        let (width, height) = img.dimensions();
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive (got {}x{})",
            width,
            height
        );

        Tensor::from_slice(img.as_raw())
            .reshape([height as i64, width as i64, 3])
            .permute([2, 0, 1])
            .to_kind(Kind::Float)
            .f_div_scalar(255.0)
            .context("Failed to normalize tensor values")
    }
}

/// Converts a whole `&RgbImage` slice into one `[N, 3, H, W]` tensor.
pub fn stack_images(images: &[RgbImage]) -> Result<Tensor> {
    let tensors = images
        .iter()
        .map(|img| ToTensor.apply(img.clone()))
        .collect::<Result<Vec<_>>>()?;
    ensure!(!tensors.is_empty(), "Cannot stack an empty image list");
    Tensor::f_stack(&tensors, 0).context("Failed to stack image tensors")
}
