//! ArcFace face embedder via ONNX Runtime.
//!
//! Produces L2-normalised embeddings from aligned 112x112 RGB face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = ALIGNED_SIZE as usize;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface and place in the models directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEmbedder {
    session: Session,
    embedding_dim: usize,
}

impl FaceEmbedder {
    /// Load the ArcFace model. Every embedding it returns has `embedding_dim`
    /// values or the call fails.
    pub fn load(model_path: &Path, embedding_dim: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            embedding_dim,
            "loaded ArcFace model"
        );

        Ok(Self { session, embedding_dim })
    }

    /// Embed the face at `region`. Landmarks, when present, drive alignment;
    /// otherwise a square crop of the region is used.
    pub fn embed(&mut self, image: &RgbImage, region: &FaceRegion) -> Result<Embedding, RecognizerError> {
        let crop = match &region.landmarks {
            Some(landmarks) => alignment::align_face(image, landmarks),
            None => alignment::crop_face(image, region),
        };
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.embedding_dim {
            return Err(RecognizerError::DimensionMismatch {
                expected: self.embedding_dim,
                got: raw.len(),
            });
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// 112x112 RGB crop to a normalized NCHW tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
    for (x, y, px) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= ARCFACE_INPUT_SIZE || y >= ARCFACE_INPUT_SIZE {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceEmbedder::load(Path::new("/nonexistent/w600k_r50.onnx"), 512);
        assert!(matches!(err, Err(RecognizerError::ModelNotFound(_))));
    }
}
