//! Lighting normalization ahead of detection: histogram equalization and
//! gamma correction.

use image::{GrayImage, RgbImage};
use imageproc::contrast::equalize_histogram;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PreprocessError {
    #[error("gamma must be a finite value > 0, got {0}")]
    InvalidGamma(f32),
    #[error("cannot equalize a {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },
}

/// Which preprocessing steps run, and how they compose.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessOptions {
    pub histogram_equalization: bool,
    pub gamma_correction: bool,
    pub gamma: f32,
    /// When false the equalized luminance is produced for diagnostics only and
    /// the detector sees the gamma-corrected original.
    pub equalization_feeds_detection: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            histogram_equalization: true,
            gamma_correction: true,
            gamma: 0.8,
            equalization_feeds_detection: false,
        }
    }
}

/// Output of [`Preprocessor::preprocess`].
pub struct Preprocessed {
    /// Image handed to the detector.
    pub image: RgbImage,
    /// Equalized luminance, when equalization ran and succeeded.
    pub equalized: Option<GrayImage>,
}

/// 256-entry power-law lookup table: `255 * (i / 255) ^ (1 / gamma)`.
#[derive(Debug, Clone)]
pub struct GammaLut {
    table: [u8; 256],
}

impl GammaLut {
    pub fn new(gamma: f32) -> Result<Self, PreprocessError> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(PreprocessError::InvalidGamma(gamma));
        }
        let inv_gamma = 1.0 / gamma as f64;
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let v = (i as f64 / 255.0).powf(inv_gamma) * 255.0;
            *entry = v.round().clamp(0.0, 255.0) as u8;
        }
        Ok(Self { table })
    }

    pub fn lookup(&self, value: u8) -> u8 {
        self.table[value as usize]
    }

    /// Apply the table to every channel of every pixel.
    pub fn apply(&self, image: &mut RgbImage) {
        for px in image.pixels_mut() {
            for c in px.0.iter_mut() {
                *c = self.table[*c as usize];
            }
        }
    }
}

/// Equalize the luminance projection of `image`. The colour image itself is
/// left untouched.
pub fn equalize_luminance(image: &RgbImage) -> Result<GrayImage, PreprocessError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage { width, height });
    }
    let gray = image::imageops::grayscale(image);
    Ok(equalize_histogram(&gray))
}

/// Shift each pixel of `image` by the difference between its equalized and
/// original luminance, keeping it RGB.
fn fold_luminance(image: &mut RgbImage, equalized: &GrayImage) {
    let original = image::imageops::grayscale(image);
    for ((px, orig), eq) in image.pixels_mut().zip(original.pixels()).zip(equalized.pixels()) {
        let shift = eq.0[0] as i16 - orig.0[0] as i16;
        for c in px.0.iter_mut() {
            *c = (*c as i16 + shift).clamp(0, 255) as u8;
        }
    }
}

pub struct Preprocessor {
    options: PreprocessOptions,
    lut: Option<GammaLut>,
}

impl Preprocessor {
    /// Build the preprocessor. An invalid gamma is rejected here, never at
    /// call time.
    pub fn new(options: PreprocessOptions) -> Result<Self, PreprocessError> {
        let lut = if options.gamma_correction {
            Some(GammaLut::new(options.gamma)?)
        } else {
            None
        };
        Ok(Self { options, lut })
    }

    pub fn options(&self) -> &PreprocessOptions {
        &self.options
    }

    /// Normalize `image`: equalization first, then gamma correction.
    ///
    /// Equalization failure is logged and the unmodified image carries forward.
    pub fn preprocess(&self, image: &RgbImage) -> Preprocessed {
        let mut output = image.clone();
        let mut equalized = None;

        if self.options.histogram_equalization {
            match equalize_luminance(image) {
                Ok(eq) => {
                    tracing::debug!("histogram equalization completed");
                    if self.options.equalization_feeds_detection {
                        fold_luminance(&mut output, &eq);
                    }
                    equalized = Some(eq);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "histogram equalization failed; continuing with original image");
                }
            }
        }

        if let Some(lut) = &self.lut {
            tracing::debug!(gamma = self.options.gamma, "applying gamma correction");
            lut.apply(&mut output);
        }

        Preprocessed { image: output, equalized }
    }
}
