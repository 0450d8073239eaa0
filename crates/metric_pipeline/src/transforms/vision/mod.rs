//! src/transforms/vision/mod.rs
//!
//! Image codec and per-sample augmentation used when materializing a batch.
//!
//! # Module Organization
//!
//! ```text
//! transforms/vision/
//! ├── io.rs            → Image decoding (path → DynamicImage)
//! ├── geometric.rs     → RGB conversion, exact resize, geometric jitter
//! ├── augmentation.rs  → Random horizontal flip
//! ├── photometric.rs   → Gamma / colour-balance perturbation
//! └── conversion.rs    → RgbImage → tensor (feature `tch`)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use crate::transforms::{RandomTransform, Transform};
//! use crate::transforms::vision::{DisturbColors, EnsureRgb, JitterImage, LoadImage};
//!
//! let codec = LoadImage::new().then(EnsureRgb);
//! let rgb = codec.apply(path)?;
//! let rgb = DisturbColors::default().apply(rgb, &mut rng)?;
//! let rgb = JitterImage::default().apply(rgb, &mut rng)?;
//! ```

pub mod augmentation;
#[cfg(feature = "tch")]
pub mod conversion;
pub mod geometric;
pub mod io;
pub mod photometric;

pub use augmentation::RandomHorizontalFlip;
#[cfg(feature = "tch")]
pub use conversion::{stack_images, ToTensor};
pub use geometric::{EnsureRgb, JitterImage, Resize};
pub use io::LoadImage;
pub use photometric::DisturbColors;
