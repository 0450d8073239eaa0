use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::{DynamicImage, ImageReader};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

// ============================================================================
// LoadImage - Base image codec
// ============================================================================

/// Loads images from file paths.
///
/// This is the image codec used by the batch sampler: it reads an image
/// reference from disk and decodes it into a `DynamicImage`. Uses buffered
/// I/O for efficient file reading. With the `turbojpeg` feature JPEGs take a
/// TurboJPEG fast path and fall back to the `image` decoder on failure.
///
/// # Input/Output
/// - **Input**: `PathBuf` - File path to image
/// - **Output**: `DynamicImage` - Decoded image
///
/// # Example
/// ```ignore
/// let loader = LoadImage::new().then(EnsureRgb);
/// let pixels = loader.apply(PathBuf::from("alice/001.jpg"))?;
/// println!("Image size: {:?}", pixels.dimensions());
/// ```
#[derive(Debug, Clone)]
pub struct LoadImage {
    buffer_size: usize,
}

impl Default for LoadImage {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadImage {
    /// Creates a new image loader with an 8KB read buffer.
    pub fn new() -> Self {
        Self { buffer_size: 8192 }
    }

    /// Loads JPEG files using TurboJPEG.
    #[cfg(feature = "turbojpeg")]
    fn load_jpeg_optimized(&self, path: &Path) -> Result<DynamicImage> {
        use image::RgbImage;
        use turbojpeg::{Decompressor, Image, PixelFormat};

        let mut file =
            File::open(path).with_context(|| format!("Failed to open JPEG: {}", path.display()))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read JPEG: {}", path.display()))?;

        let mut decompressor =
            Decompressor::new().with_context(|| "Failed to create TurboJPEG decompressor")?;

        let header = decompressor
            .read_header(&buffer)
            .with_context(|| format!("Failed to read JPEG header: {}", path.display()))?;

        let width = header.width;
        let height = header.height;

        // 3 bytes per pixel
        let mut rgb_data = vec![0u8; width * height * 3];
        let output_image = Image {
            pixels: rgb_data.as_mut_slice(),
            width,
            height,
            format: PixelFormat::RGB,
            pitch: width * 3,
        };

        decompressor
            .decompress(&buffer, output_image)
            .with_context(|| format!("Failed to decompress JPEG: {}", path.display()))?;

        let rgb_image = RgbImage::from_raw(width as u32, height as u32, rgb_data)
            .ok_or_else(|| anyhow::anyhow!("Failed to create RGB image from TurboJPEG data"))?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    }

    /// Loads any format the `image` crate recognizes.
    fn load_standard_format(&self, path: &Path) -> Result<DynamicImage> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?;

        let file_size = file.metadata()?.len() as usize;
        let mut reader = BufReader::with_capacity(self.buffer_size, file);
        let mut buffer = Vec::with_capacity(file_size);
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read image: {}", path.display()))?;

        let image = ImageReader::new(Cursor::new(buffer))
            .with_guessed_format()?
            .decode()
            .inspect_err(|err| {
                tracing::debug!(
                    worker = ?crate::dataloader::current_worker_id(),
                    path = %path.display(),
                    error = %err,
                    "image decode failed"
                );
            })
            .with_context(|| format!("Failed to decode image: {}", path.display()))?;

        Ok(image)
    }

    /// Detects JPEG files by extension for decoder routing.
    #[cfg_attr(not(feature = "turbojpeg"), allow(dead_code))]
    fn is_jpeg_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|extension| matches!(extension.to_lowercase().as_str(), "jpg" | "jpeg"))
    }
}

impl Transform<PathBuf, DynamicImage> for LoadImage {
    #[cfg(feature = "turbojpeg")]
    fn apply(&self, path: PathBuf) -> Result<DynamicImage> {
        if Self::is_jpeg_file(&path) {
            self.load_jpeg_optimized(&path).or_else(|turbo_error| {
                tracing::debug!(
                    worker = ?crate::dataloader::current_worker_id(),
                    path = %path.display(),
                    error = %turbo_error,
                    "TurboJPEG failed, falling back to standard decoder"
                );
                self.load_standard_format(&path)
            })
        } else {
            self.load_standard_format(&path)
        }
    }

    #[cfg(not(feature = "turbojpeg"))]
    fn apply(&self, path: PathBuf) -> Result<DynamicImage> {
        self.load_standard_format(&path)
    }
}

// ============================================================================
// Tests
// ============================================================================
