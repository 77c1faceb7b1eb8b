//! Drawing recognition results onto the output image.

use crate::config::ConfigError;
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use snapattend_core::RecognitionResult;
use std::path::Path;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_SCALE: f32 = 18.0;

pub fn load_font(path: &Path) -> Result<FontArc, ConfigError> {
    let font_err = |reason: String| ConfigError::Font { path: path.to_path_buf(), reason };
    let bytes = std::fs::read(path).map_err(|e| font_err(e.to_string()))?;
    FontArc::try_from_vec(bytes).map_err(|e| font_err(e.to_string()))
}

/// "name (0.NN)" when matched, the bare name otherwise.
pub fn label_for(result: &RecognitionResult) -> String {
    match result.confidence {
        Some(confidence) if result.matched => format!("{} ({confidence:.2})", result.name),
        _ => result.name.clone(),
    }
}

/// Two-pixel box per face, green when matched and red when unknown. Labels are
/// drawn below the box when a font is available.
pub fn annotate(image: &mut RgbImage, results: &[RecognitionResult], font: Option<&FontArc>) {
    for result in results {
        let region = &result.region;
        if region.is_empty() {
            continue;
        }
        let color = if result.matched { MATCHED_COLOR } else { UNKNOWN_COLOR };

        let outer = Rect::at(region.left as i32, region.top as i32).of_size(region.width(), region.height());
        draw_hollow_rect_mut(image, outer, color);
        if region.width() > 2 && region.height() > 2 {
            let inner = Rect::at(region.left as i32 + 1, region.top as i32 + 1)
                .of_size(region.width() - 2, region.height() - 2);
            draw_hollow_rect_mut(image, inner, color);
        }

        if let Some(font) = font {
            let y = region.bottom as i32 + 4;
            draw_text_mut(image, color, region.left as i32, y, PxScale::from(LABEL_SCALE), font, &label_for(result));
        }
    }
}
