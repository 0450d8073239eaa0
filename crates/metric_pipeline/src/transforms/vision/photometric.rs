use crate::transforms::RandomTransform;
use anyhow::{ensure, Result};
use image::RgbImage;
use rand::{Rng, RngCore};

// ============================================================================
// DisturbColors
// ============================================================================

/// Randomly perturbs gamma and per-channel colour balance.
///
/// One gamma `g` is drawn from `[1 - gamma_magnitude, 1 + gamma_magnitude]`
/// and one gain per channel from `[1 - color_magnitude, 1]`; the gains are
/// rescaled so the strongest channel keeps gain 1. Every pixel then becomes
///
/// ```text
/// out[c] = 255 * gain[c] * (in[c] / 255) ^ g
/// ```
///
/// computed through a 256-entry lookup table per channel.
///
/// # Example
/// ```ignore
/// let disturb = DisturbColors::default(); // gamma ±0.5, colour 0.2
/// let perturbed = disturb.apply(rgb, &mut rng)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DisturbColors {
    gamma_magnitude: f64,
    color_magnitude: f64,
}

impl Default for DisturbColors {
    fn default() -> Self {
        Self {
            gamma_magnitude: 0.5,
            color_magnitude: 0.2,
        }
    }
}

impl DisturbColors {
    pub fn new(gamma_magnitude: f64, color_magnitude: f64) -> Result<Self> {
        ensure!(
            (0.0..1.0).contains(&gamma_magnitude),
            "Gamma magnitude must be in [0, 1) (got {})",
            gamma_magnitude
        );
        ensure!(
            (0.0..1.0).contains(&color_magnitude),
            "Colour magnitude must be in [0, 1) (got {})",
            color_magnitude
        );
        Ok(Self {
            gamma_magnitude,
            color_magnitude,
        })
    }

    fn lookup_tables(&self, rng: &mut dyn RngCore) -> [[u8; 256]; 3] {
        let gamma = 1.0 + (rng.random::<f64>() * 2.0 - 1.0) * self.gamma_magnitude;
        let mut gains = [0.0f64; 3];
        for gain in &mut gains {
            *gain = 1.0 - rng.random::<f64>() * self.color_magnitude;
        }
        let strongest = gains.iter().copied().fold(f64::MIN, f64::max);

        let mut tables = [[0u8; 256]; 3];
        for (table, gain) in tables.iter_mut().zip(gains) {
            let gain = gain / strongest;
            for (value, slot) in table.iter_mut().enumerate() {
                let level = 255.0 * gain * (value as f64 / 255.0).powf(gamma);
                *slot = level.round().clamp(0.0, 255.0) as u8;
            }
        }
        tables
    }
}

impl RandomTransform<RgbImage, RgbImage> for DisturbColors {
    fn apply(&self, mut img: RgbImage, rng: &mut dyn RngCore) -> Result<RgbImage> {
        let tables = self.lookup_tables(rng);
        for pixel in img.pixels_mut() {
            for (channel, table) in pixel.0.iter_mut().zip(&tables) {
                *channel = table[*channel as usize];
            }
        }
        Ok(img)
    }
}
