use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub type StudentId = i64;
pub type ClassroomId = i64;
pub type SessionId = i64;

/// Display name reported for faces that match no candidate.
pub const UNKNOWN_NAME: &str = "unknown";

/// Bounding rectangle of a detected face, in pixel coordinates of the image
/// it was computed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    /// Detector score for this region.
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(skip)]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    /// Build a region from a floating-point box, clamped to `width` x `height`.
    pub fn from_box(x: f32, y: f32, w: f32, h: f32, width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        Self {
            top: clamp(y, height),
            right: clamp(x + w, width),
            bottom: clamp(y + h, height),
            left: clamp(x, width),
            confidence: 0.0,
            landmarks: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Face embedding vector. Two embeddings are only comparable when produced by
/// the same model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings. Lower = more similar.
    ///
    /// Embeddings of different length are incomparable and yield `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A student's decrypted embedding, held only for the duration of one
/// matching pass. The values are wiped on drop.
#[derive(Debug)]
pub struct Candidate {
    pub student_id: StudentId,
    pub name: String,
    pub embedding: Embedding,
}

impl Drop for Candidate {
    fn drop(&mut self) {
        self.embedding.values.zeroize();
    }
}

/// Outcome of recognizing one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub student_id: Option<StudentId>,
    pub name: String,
    pub matched: bool,
    /// `1 - distance` clamped to [0, 1]; present only when matched.
    pub confidence: Option<f32>,
    /// Distance to the nearest candidate, if any candidate was comparable.
    pub distance: Option<f32>,
    pub region: FaceRegion,
}

impl RecognitionResult {
    pub fn unknown(region: FaceRegion, distance: Option<f32>) -> Self {
        Self {
            student_id: None,
            name: UNKNOWN_NAME.to_string(),
            matched: false,
            confidence: None,
            distance,
            region,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkedBy {
    System,
    Instructor,
}

impl MarkedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Instructor => "instructor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "instructor" => Some(Self::Instructor),
            _ => None,
        }
    }
}

/// One row of attendance. At most one exists per (session, student).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub attendance_id: i64,
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    pub marked_by: MarkedBy,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A scheduled classroom meeting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub classroom_id: ClassroomId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl Session {
    /// Whether `now` falls inside this session (both bounds inclusive).
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        self.date == now.date() && self.start_time <= now.time() && now.time() <= self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classroom {
    pub classroom_id: ClassroomId,
    pub instructor_id: i64,
    pub name: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        assert!(a.euclidean_distance(&a.clone()).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), f32::INFINITY);
    }

    #[test]
    fn test_face_region_from_box_clamps() {
        let region = FaceRegion::from_box(-10.0, 5.0, 50.0, 500.0, 100, 100);
        assert_eq!(region.left, 0);
        assert_eq!(region.top, 5);
        assert_eq!(region.right, 40);
        assert_eq!(region.bottom, 100);
        assert_eq!(region.width(), 40);
        assert_eq!(region.height(), 95);
    }

    #[test]
    fn test_session_active_bounds_inclusive() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let session = Session {
            session_id: 1,
            classroom_id: 1,
            date,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        };
        assert!(session.is_active_at(date.and_hms_opt(9, 0, 0).unwrap()));
        assert!(session.is_active_at(date.and_hms_opt(10, 0, 0).unwrap()));
        assert!(!session.is_active_at(date.and_hms_opt(10, 0, 1).unwrap()));
        let next_day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(!session.is_active_at(next_day.and_hms_opt(9, 30, 0).unwrap()));
    }

    #[test]
    fn test_status_parse_roundtrip() {
        assert_eq!(AttendanceStatus::parse("present"), Some(AttendanceStatus::Present));
        assert_eq!(MarkedBy::parse(MarkedBy::System.as_str()), Some(MarkedBy::System));
        assert_eq!(AttendanceStatus::parse("late"), None);
    }

    #[test]
    fn test_result_serializes_without_landmarks() {
        let mut region = FaceRegion::from_box(1.0, 2.0, 3.0, 4.0, 10, 10);
        region.landmarks = Some([(0.0, 0.0); 5]);
        let json = serde_json::to_value(RecognitionResult::unknown(region, None)).unwrap();
        assert_eq!(json["name"], "unknown");
        assert_eq!(json["matched"], false);
        assert!(json["region"].get("landmarks").is_none());
        assert_eq!(serde_json::to_value(MarkedBy::System).unwrap(), "system");
    }
}
