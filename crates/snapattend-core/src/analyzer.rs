//! Face detection plus embedding behind one seam.

use crate::detector::{DetectorError, DetectorModel, FaceDetector};
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default ArcFace model file name.
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] RecognizerError),
    #[error("detection took {elapsed_ms} ms, budget is {budget_ms} ms")]
    BudgetExceeded { elapsed_ms: u64, budget_ms: u64 },
    #[error("cannot read image {path}: {source}")]
    Decode { path: PathBuf, source: image::ImageError },
}

/// Read and decode an image file as RGB8. Unreadable or corrupt files are a
/// [`DetectionError::Decode`].
pub fn load_image(path: &Path) -> Result<RgbImage, DetectionError> {
    let image = image::open(path)
        .map_err(|source| DetectionError::Decode { path: path.to_path_buf(), source })?
        .to_rgb8();
    tracing::debug!(path = %path.display(), width = image.width(), height = image.height(), "image loaded");
    Ok(image)
}

/// One detected face and its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Embedding,
}

/// Finds faces in an image and embeds each one.
///
/// Results come back in detection order. That order is stable for a given
/// image but carries no meaning beyond that.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError>;
}

/// SCRFD detection followed by ArcFace embedding, both on ONNX Runtime.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxAnalyzer {
    pub fn new(detector: FaceDetector, embedder: FaceEmbedder) -> Self {
        Self { detector, embedder }
    }

    /// Load `model`'s detector and the ArcFace embedder from `models_dir`.
    pub fn load(models_dir: &Path, model: DetectorModel, embedding_dim: usize) -> Result<Self, DetectionError> {
        let detector = FaceDetector::load(&models_dir.join(model.file_name()))?;
        let embedder = FaceEmbedder::load(&models_dir.join(EMBEDDER_MODEL_FILE), embedding_dim)?;
        tracing::info!(?model, models_dir = %models_dir.display(), "face analyzer ready");
        Ok(Self::new(detector, embedder))
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
        let regions = self.detector.detect(image)?;
        regions
            .into_iter()
            .map(|region| {
                let embedding = self.embedder.embed(image, &region)?;
                Ok(DetectedFace { region, embedding })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reports_missing_detector_first() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxAnalyzer::load(dir.path(), DetectorModel::Accurate, 512).err();
        match err {
            Some(DetectionError::Detector(DetectorError::ModelNotFound(path))) => {
                assert!(path.ends_with("det_10g.onnx"), "path = {path}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_load_image_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();
        assert!(matches!(load_image(&path), Err(DetectionError::Decode { .. })));
        assert!(matches!(load_image(&dir.path().join("missing.png")), Err(DetectionError::Decode { .. })));

        let good = dir.path().join("ok.png");
        RgbImage::new(3, 2).save(&good).unwrap();
        assert_eq!(load_image(&good).unwrap().dimensions(), (3, 2));
    }

    #[test]
    fn test_budget_error_message() {
        let err = DetectionError::BudgetExceeded { elapsed_ms: 1500, budget_ms: 1000 };
        assert_eq!(err.to_string(), "detection took 1500 ms, budget is 1000 ms");
    }
}
