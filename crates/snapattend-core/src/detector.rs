//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-based decoding over three strides followed by NMS. Boxes and
//! landmarks are mapped back from the letterboxed input to source pixels.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place in the models directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("cannot detect on a {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detector variant. Chosen by configuration, never at call time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorModel {
    /// SCRFD 500M: fast, lower recall on small faces.
    #[default]
    Fast,
    /// SCRFD 10G: slower, better on crowded classroom shots.
    Accurate,
}

impl DetectorModel {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Fast => "det_500m.onnx",
            Self::Accurate => "det_10g.onnx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Some(Self::Fast),
            "accurate" | "cnn" => Some(Self::Accurate),
            _ => None,
        }
    }
}

/// Letterbox geometry used to undo the resize.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: usize) -> (Self, u32, u32) {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size as u32);
        let pad_x = (size as u32 - new_w) as f32 / 2.0;
        let pad_y = (size as u32 - new_h) as f32 / 2.0;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Raw detection in source-image float coordinates.
#[derive(Debug, Clone)]
struct Detection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Option<[(f32, f32); 5]>,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn into_region(self, width: u32, height: u32) -> FaceRegion {
        let mut region =
            FaceRegion::from_box(self.x1, self.y1, self.x2 - self.x1, self.y2 - self.y1, width, height);
        region.confidence = self.score;
        region.landmarks = self.landmarks;
        region
    }
}

/// (score, bbox, kps) output indices for one stride.
type StrideOutputIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load an SCRFD ONNX model.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyImage { width, height });
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let kept = nms(detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detection complete");

        Ok(kept
            .into_iter()
            .map(|d| d.into_region(width, height))
            .filter(|r| !r.is_empty())
            .collect())
    }
}

/// Letterbox `image` into a normalized 1x3x640x640 RGB tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (x0 + x as usize, y0 + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to the positional layout [scores 8/16/32, bboxes, kps].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(b) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = letterbox.unmap((ax - b[0] * s, ay - b[1] * s));
        let (x2, y2) = letterbox.unmap((ax + b[2] * s, ay + b[3] * s));

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap((ax + k[i * 2] * s, ay + k[i * 2 + 1] * s)))
        });

        detections.push(Detection { x1, y1, x2, y2, score, landmarks });
    }
    detections
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
