use crate::transforms::RandomTransform;
use anyhow::{ensure, Context, Result};
use image::{ImageBuffer, RgbImage};
use rand::{Rng, RngCore};

// ============================================================================
// RandomHorizontalFlip
// ============================================================================

/// Randomly mirrors images left to right.
///
/// # Example
/// ```ignore
/// let flip = RandomHorizontalFlip::new(0.5)?; // 50% flip chance
/// let augmented = flip.apply(image, &mut rng)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RandomHorizontalFlip {
    pub(crate) p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&p),
            "Probability must be in [0.0, 1.0] range (got {})",
            p
        );
        Ok(Self { p })
    }
}

/// Flips an RGB8 image horizontally, copying whole pixel triplets row by row.
pub(crate) fn flip_rgb8(img: RgbImage) -> Result<RgbImage> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Ok(img);
    }
    let width_usize = width as usize;
    let source_pixels = img.into_raw();

    let mut flipped_pixels = Vec::with_capacity(source_pixels.len());
    for row in source_pixels.chunks_exact(width_usize * 3) {
        for pixel in row.chunks_exact(3).rev() {
            flipped_pixels.extend_from_slice(pixel);
        }
    }

    ImageBuffer::from_raw(width, height, flipped_pixels)
        .context("Failed to create flipped image buffer")
}

impl RandomTransform<RgbImage, RgbImage> for RandomHorizontalFlip {
    fn apply(&self, img: RgbImage, rng: &mut dyn RngCore) -> Result<RgbImage> {
        let flip = match self.p {
            // Fast paths skip the draw entirely.
            0.0 => false,
            1.0 => true,
            p => rng.random_bool(p),
        };
        if flip {
            flip_rgb8(img)
        } else {
            Ok(img)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn red_blue() -> RgbImage {
        // 2x1 image: left = red, right = blue
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        img
    }

    #[test]
    fn test_random_horizontal_flip() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let flip = RandomHorizontalFlip::new(1.0)?; // Always flip
        let flipped = flip.apply(red_blue(), &mut rng)?;

        assert_eq!(flipped.as_raw(), &[0, 0, 255, 255, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_random_horizontal_flip_no_flip() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let flip = RandomHorizontalFlip::new(0.0)?; // Never flip
        let result = flip.apply(red_blue(), &mut rng)?;

        assert_eq!(result.as_raw(), red_blue().as_raw());
        Ok(())
    }

    #[test]
    fn test_flip_matches_image_crate() -> Result<()> {
        let mut img = RgbImage::new(5, 3);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgb([x as u8 * 40, y as u8 * 70, (x + y) as u8]);
        }
        let expected = image::imageops::flip_horizontal(&img);
        assert_eq!(flip_rgb8(img)?.as_raw(), expected.as_raw());
        Ok(())
    }

    #[test]
    fn test_invalid_probability() {
        assert!(RandomHorizontalFlip::new(1.5).is_err());
        assert!(RandomHorizontalFlip::new(-0.1).is_err());
    }
}
