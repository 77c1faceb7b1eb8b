//! snapattend-core — face-attendance recognition primitives.
//!
//! Lighting normalization, SCRFD detection, ArcFace embedding (both via ONNX
//! Runtime), template encryption and matching against enrolled students.

pub mod alignment;
pub mod analyzer;
pub mod cipher;
pub mod detector;
pub mod matcher;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use analyzer::{load_image, DetectedFace, DetectionError, FaceAnalyzer, OnnxAnalyzer};
pub use cipher::{
    CipherError, DecryptionError, EncryptedTemplate, FileKeyProvider, KeyProvider, StaticKey,
    TemplateCipher,
};
pub use detector::DetectorModel;
pub use matcher::{assign, AssignmentStrategy, EuclideanMatcher, MatchOutcome, Matcher};
pub use preprocess::{PreprocessError, PreprocessOptions, Preprocessed, Preprocessor};
pub use types::{
    AttendanceRecord, AttendanceStatus, Candidate, Classroom, ClassroomId, Embedding, FaceRegion,
    MarkedBy, RecognitionResult, Session, SessionId, StudentId, UNKNOWN_NAME,
};
