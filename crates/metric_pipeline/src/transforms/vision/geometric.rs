use super::augmentation::RandomHorizontalFlip;
use crate::transforms::{RandomTransform, Transform};
use anyhow::{ensure, Result};
use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use rand::{Rng, RngCore};

// ============================================================================
// EnsureRgb
// ============================================================================
/// Converts any decoded image into packed 3-channel RGB.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureRgb;

impl Transform<DynamicImage, RgbImage> for EnsureRgb {
    fn apply(&self, img: DynamicImage) -> Result<RgbImage> {
        Ok(match img {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        })
    }
}

// ============================================================================
// Resize
// ============================================================================

/// Resizes an image to exactly `width x height`, ignoring the aspect ratio.
///
/// Used when a corpus mixes image sizes and every batch must still share one
/// shape. Users must specify the filter type.
///
/// # Filter Types
/// - `Nearest`: Nearest neighbour, fastest
/// - `Triangle`: Bilinear filter, good all-round default
/// - `CatmullRom`: Bicubic sharpening
/// - `Gaussian`: Blurring/smoothing
/// - `Lanczos3`: Lanczos with window 3, highest quality re-sampling but slowest.
///
/// # Examples
/// ``` ignore
/// # use image::imageops::FilterType;
/// let resize = Resize::new(150, 150, FilterType::Triangle)?;
/// let resized = resize.apply(rgb)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    width: u32,
    height: u32,
    filter: FilterType,
}

impl Resize {
    /// Creates a new Resize transform.
    pub fn new(width: u32, height: u32, filter: FilterType) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive after resizing (got {}x{})",
            width,
            height
        );
        Ok(Self {
            width,
            height,
            filter,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Transform<RgbImage, RgbImage> for Resize {
    fn apply(&self, img: RgbImage) -> Result<RgbImage> {
        if img.dimensions() == (self.width, self.height) {
            return Ok(img);
        }
        Ok(imageops::resize(&img, self.width, self.height, self.filter))
    }
}

// ============================================================================
// JitterImage
// ============================================================================

/// Small random geometric perturbation that keeps the image size unchanged.
///
/// Each call draws a rotation in `[-max_rotation, max_rotation]` degrees, a
/// zoom-in crop scale in `[min_scale, 1]` and a translation of up to
/// `max_translate` of the image side, warps the image with bilinear sampling
/// (edges are clamped), then mirrors it with the configured flip probability.
#[derive(Debug, Clone, Copy)]
pub struct JitterImage {
    max_rotation_degrees: f64,
    min_scale: f64,
    max_translate: f64,
    flip: RandomHorizontalFlip,
}

impl Default for JitterImage {
    fn default() -> Self {
        Self {
            max_rotation_degrees: 3.0,
            min_scale: 0.94,
            max_translate: 0.02,
            flip: RandomHorizontalFlip { p: 0.5 },
        }
    }
}

impl JitterImage {
    pub fn new(
        max_rotation_degrees: f64,
        min_scale: f64,
        max_translate: f64,
        flip_probability: f64,
    ) -> Result<Self> {
        ensure!(
            (0.0..=45.0).contains(&max_rotation_degrees),
            "Rotation must be in [0, 45] degrees (got {})",
            max_rotation_degrees
        );
        ensure!(
            min_scale > 0.0 && min_scale <= 1.0,
            "Minimum crop scale must be in (0, 1] (got {})",
            min_scale
        );
        ensure!(
            (0.0..0.5).contains(&max_translate),
            "Translation must be in [0, 0.5) of the image side (got {})",
            max_translate
        );
        Ok(Self {
            max_rotation_degrees,
            min_scale,
            max_translate,
            flip: RandomHorizontalFlip::new(flip_probability)?,
        })
    }
}

impl RandomTransform<RgbImage, RgbImage> for JitterImage {
    fn apply(&self, img: RgbImage, rng: &mut dyn RngCore) -> Result<RgbImage> {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Ok(img);
        }

        let angle = symmetric(rng, self.max_rotation_degrees).to_radians();
        let scale = self.min_scale + rng.random::<f64>() * (1.0 - self.min_scale);
        let shift_x = symmetric(rng, self.max_translate) * width as f64;
        let shift_y = symmetric(rng, self.max_translate) * height as f64;

        let warped = warp(&img, angle, scale, (shift_x, shift_y));
        self.flip.apply(warped, rng)
    }
}

/// Uniform draw from `[-magnitude, magnitude)`.
fn symmetric(rng: &mut dyn RngCore, magnitude: f64) -> f64 {
    (rng.random::<f64>() * 2.0 - 1.0) * magnitude
}

/// Inverse-maps every output pixel through rotation, scale and shift about the
/// image centre and samples the source bilinearly.
fn warp(img: &RgbImage, angle: f64, scale: f64, shift: (f64, f64)) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let (sin, cos) = angle.sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        let u = x as f64 - cx;
        let v = y as f64 - cy;
        let sx = scale * (cos * u - sin * v) + cx + shift.0;
        let sy = scale * (sin * u + cos * v) + cy + shift.1;
        bilinear(img, sx, sy)
    })
}

fn bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_gradient_image(width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                img.put_pixel(x, y, Rgb([r, g, 128]));
            }
        }
        img
    }

    #[test]
    fn test_ensure_rgb_converts_grayscale() -> Result<()> {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(4, 2, image::Luma([9])));
        let rgb = EnsureRgb.apply(gray)?;
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([9, 9, 9]));
        Ok(())
    }

    #[test]
    fn test_resize() -> Result<()> {
        let img = test_gradient_image(100, 60);
        let resize = Resize::new(50, 50, FilterType::Nearest)?;
        let resized = resize.apply(img)?;
        assert_eq!(resized.dimensions(), (50, 50));
        assert!(Resize::new(0, 10, FilterType::Nearest).is_err());
        Ok(())
    }

    #[test]
    fn test_jitter_preserves_dimensions() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let jitter = JitterImage::default();
        for _ in 0..10 {
            let out = jitter.apply(test_gradient_image(37, 23), &mut rng)?;
            assert_eq!(out.dimensions(), (37, 23));
        }
        Ok(())
    }

    #[test]
    fn test_zero_jitter_is_identity() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let jitter = JitterImage::new(0.0, 1.0, 0.0, 0.0)?;
        let img = test_gradient_image(16, 9);
        let out = jitter.apply(img.clone(), &mut rng)?;
        assert_eq!(out.as_raw(), img.as_raw());
        Ok(())
    }

    #[test]
    fn test_jitter_is_deterministic_per_seed() -> Result<()> {
        let jitter = JitterImage::default();
        let img = test_gradient_image(20, 20);
        let a = jitter.apply(img.clone(), &mut StdRng::seed_from_u64(11))?;
        let b = jitter.apply(img, &mut StdRng::seed_from_u64(11))?;
        assert_eq!(a.as_raw(), b.as_raw());
        Ok(())
    }

    #[test]
    fn test_jitter_rejects_bad_parameters() {
        assert!(JitterImage::new(90.0, 0.9, 0.0, 0.5).is_err());
        assert!(JitterImage::new(3.0, 0.0, 0.0, 0.5).is_err());
        assert!(JitterImage::new(3.0, 0.9, 0.7, 0.5).is_err());
        assert!(JitterImage::new(3.0, 0.9, 0.0, 2.0).is_err());
    }
}
