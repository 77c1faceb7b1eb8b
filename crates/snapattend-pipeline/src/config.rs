use serde::{Deserialize, Serialize};
use snapattend_core::{AssignmentStrategy, CipherError, DetectorModel, PreprocessOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("gamma_value must be a finite value > 0, got {0}")]
    InvalidGamma(f32),
    #[error("recognition_tolerance must be a finite value >= 0, got {0}")]
    InvalidTolerance(f32),
    #[error("embedding_dim must be > 0")]
    InvalidEmbeddingDim,
    #[error("annotation font {path}: {reason}")]
    Font { path: PathBuf, reason: String },
    #[error("key store unusable: {0}")]
    KeyStore(#[from] CipherError),
}

/// Pipeline configuration.
///
/// Loaded from an optional TOML file, then overridden by `SNAPATTEND_*`
/// environment variables, then validated. Missing keys take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Detector variant: `fast` (SCRFD 500M) or `accurate` (SCRFD 10G).
    pub face_detection_model: DetectorModel,
    /// Maximum Euclidean distance for a match.
    ///
    /// Embeddings are L2-normalised, so distance `d` corresponds to cosine
    /// similarity `1 - d²/2`. The default 0.6 therefore requires similarity
    /// of at least 0.82, which is strict for ArcFace; a cosine threshold of
    /// 0.40 is distance ~1.10. Recalibrate against your own enrollment photos.
    pub recognition_tolerance: f32,
    pub use_histogram_equalization: bool,
    pub use_gamma_correction: bool,
    pub gamma_value: f32,
    /// Fold the equalized luminance into the image the detector sees.
    pub equalization_feeds_detection: bool,
    /// Write `<stem>_processed.<ext>` for every processed image.
    pub save_attendance_images: bool,
    /// Also write `equalized_<name>` and `gamma_<name>` diagnostics.
    pub save_intermediate_images: bool,
    pub output_dir: PathBuf,
    /// Directory holding the SCRFD and ArcFace ONNX models.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    /// 32-byte template key. Created with mode 0600 if absent.
    pub key_path: PathBuf,
    pub embedding_dim: usize,
    pub assignment_strategy: AssignmentStrategy,
    /// Per-image detection budget in milliseconds; 0 disables it.
    pub detection_budget_ms: u64,
    /// TTF/OTF font for annotation labels. Without one only boxes are drawn.
    pub annotation_font: Option<PathBuf>,
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            face_detection_model: DetectorModel::Fast,
            recognition_tolerance: 0.6,
            use_histogram_equalization: true,
            use_gamma_correction: true,
            gamma_value: 0.8,
            equalization_feeds_detection: false,
            save_attendance_images: true,
            save_intermediate_images: false,
            output_dir: PathBuf::from("attendance_images"),
            model_dir: PathBuf::from("models"),
            db_path: PathBuf::from("snapattend.db"),
            key_path: PathBuf::from("face_key.key"),
            embedding_dim: 512,
            assignment_strategy: AssignmentStrategy::Greedy,
            detection_budget_ms: 10_000,
            annotation_font: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (if any), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
                Self::from_toml(&text)
                    .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `SNAPATTEND_*` environment variables. Unset or
    /// unparsable variables leave the current value untouched.
    pub fn apply_env(&mut self) {
        if let Some(model) = std::env::var("SNAPATTEND_FACE_DETECTION_MODEL")
            .ok()
            .and_then(|v| DetectorModel::parse(&v))
        {
            self.face_detection_model = model;
        }
        if let Ok(strategy) = std::env::var("SNAPATTEND_ASSIGNMENT_STRATEGY") {
            match strategy.to_ascii_lowercase().as_str() {
                "greedy" => self.assignment_strategy = AssignmentStrategy::Greedy,
                "global" => self.assignment_strategy = AssignmentStrategy::Global,
                other => tracing::warn!(value = other, "ignoring unknown SNAPATTEND_ASSIGNMENT_STRATEGY"),
            }
        }

        self.recognition_tolerance = env_f32("SNAPATTEND_RECOGNITION_TOLERANCE", self.recognition_tolerance);
        self.gamma_value = env_f32("SNAPATTEND_GAMMA_VALUE", self.gamma_value);
        self.use_histogram_equalization =
            env_bool("SNAPATTEND_USE_HISTOGRAM_EQUALIZATION", self.use_histogram_equalization);
        self.use_gamma_correction = env_bool("SNAPATTEND_USE_GAMMA_CORRECTION", self.use_gamma_correction);
        self.equalization_feeds_detection =
            env_bool("SNAPATTEND_EQUALIZATION_FEEDS_DETECTION", self.equalization_feeds_detection);
        self.save_attendance_images = env_bool("SNAPATTEND_SAVE_ATTENDANCE_IMAGES", self.save_attendance_images);
        self.save_intermediate_images =
            env_bool("SNAPATTEND_SAVE_INTERMEDIATE_IMAGES", self.save_intermediate_images);
        self.embedding_dim = env_usize("SNAPATTEND_EMBEDDING_DIM", self.embedding_dim);
        self.detection_budget_ms = env_u64("SNAPATTEND_DETECTION_BUDGET_MS", self.detection_budget_ms);

        if let Ok(v) = std::env::var("SNAPATTEND_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPATTEND_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPATTEND_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPATTEND_KEY_PATH") {
            self.key_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPATTEND_ANNOTATION_FONT") {
            self.annotation_font = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SNAPATTEND_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_gamma_correction && !(self.gamma_value.is_finite() && self.gamma_value > 0.0) {
            return Err(ConfigError::InvalidGamma(self.gamma_value));
        }
        if !(self.recognition_tolerance.is_finite() && self.recognition_tolerance >= 0.0) {
            return Err(ConfigError::InvalidTolerance(self.recognition_tolerance));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::InvalidEmbeddingDim);
        }
        Ok(())
    }

    pub fn preprocess_options(&self) -> PreprocessOptions {
        PreprocessOptions {
            histogram_equalization: self.use_histogram_equalization,
            gamma_correction: self.use_gamma_correction,
            gamma: self.gamma_value,
            equalization_feeds_detection: self.equalization_feeds_detection,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.face_detection_model, DetectorModel::Fast);
        assert_eq!(config.recognition_tolerance, 0.6);
        assert_eq!(config.gamma_value, 0.8);
        assert!(config.use_histogram_equalization && config.use_gamma_correction);
        assert!(config.save_attendance_images);
        assert_eq!(config.output_dir, PathBuf::from("attendance_images"));
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.assignment_strategy, AssignmentStrategy::Greedy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_tolerance_in_cosine_terms() {
        use snapattend_core::Embedding;

        // Unit vectors at cosine similarity c sit at distance sqrt(2 - 2c).
        let unit = |cos: f32| Embedding::new(vec![cos, (1.0 - cos * cos).sqrt()]);
        let anchor = Embedding::new(vec![1.0, 0.0]);
        let tolerance = Config::default().recognition_tolerance;

        assert!((anchor.euclidean_distance(&unit(0.82)) - tolerance).abs() < 1e-3);
        assert!(anchor.euclidean_distance(&unit(0.85)) <= tolerance);
        assert!(anchor.euclidean_distance(&unit(0.40)) > tolerance);
        assert!((anchor.euclidean_distance(&unit(0.40)) - 1.095).abs() < 1e-3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            face_detection_model = "accurate"
            recognition_tolerance = 0.5
            assignment_strategy = "global"
            annotation_font = "/usr/share/fonts/DejaVuSans.ttf"
            "#,
        )
        .unwrap();
        assert_eq!(config.face_detection_model, DetectorModel::Accurate);
        assert_eq!(config.recognition_tolerance, 0.5);
        assert_eq!(config.assignment_strategy, AssignmentStrategy::Global);
        assert_eq!(config.annotation_font, Some(PathBuf::from("/usr/share/fonts/DejaVuSans.ttf")));
        assert_eq!(config.gamma_value, 0.8);
    }

    #[test]
    fn test_unknown_model_rejected() {
        assert!(Config::from_toml(r#"face_detection_model = "yolo""#).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config { gamma_value: 0.0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGamma(_))));

        let config = Config { gamma_value: -1.0, use_gamma_correction: false, ..Config::default() };
        assert!(config.validate().is_ok());

        let config = Config { recognition_tolerance: f32::NAN, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTolerance(_))));

        let config = Config { embedding_dim: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEmbeddingDim)));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/snapattend.toml")));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_invalid_gamma_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapattend.toml");
        std::fs::write(&path, "gamma_value = -0.5\n").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(ConfigError::InvalidGamma(_))));
    }

    #[test]
    fn test_preprocess_options_mapping() {
        let config = Config {
            use_histogram_equalization: false,
            gamma_value: 1.2,
            ..Config::default()
        };
        let options = config.preprocess_options();
        assert!(!options.histogram_equalization);
        assert!(options.gamma_correction);
        assert_eq!(options.gamma, 1.2);
        assert!(!options.equalization_feeds_detection);
    }
}
