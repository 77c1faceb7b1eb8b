//! Per-image and per-batch outcomes, serializable for `--json` output.

use serde::Serialize;
use snapattend_core::{FaceRegion, RecognitionResult, SessionId, StudentId};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A recognized student whose attendance could not be written.
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub student_id: StudentId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageReport {
    pub source: Option<PathBuf>,
    pub session_id: Option<SessionId>,
    /// One entry per detected face, in detection order.
    pub results: Vec<RecognitionResult>,
    /// Set when detection failed; `results` is then empty.
    pub detection_error: Option<String>,
    /// Set when candidates could not be listed; every face is then unknown.
    pub candidate_error: Option<String>,
    /// Students whose template failed to decrypt and were left out.
    pub excluded_candidates: Vec<StudentId>,
    /// Students marked present for `session_id`.
    pub recorded: Vec<StudentId>,
    pub record_failures: Vec<RecordFailure>,
    pub annotated_path: Option<PathBuf>,
    pub elapsed_ms: u64,
}

impl ImageReport {
    pub fn recognized(&self) -> usize {
        self.results.iter().filter(|r| r.matched).count()
    }

    pub fn unknown(&self) -> usize {
        self.results.len() - self.recognized()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentTally {
    pub student_id: StudentId,
    pub name: String,
    pub detections: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub images: Vec<ImageReport>,
    /// Images whose detection failed (unreadable file, inference error,
    /// budget exceeded). They are still listed in `images`.
    pub detection_failures: usize,
    pub total_faces: usize,
    pub recognized: usize,
    pub unknown: usize,
    pub students: BTreeMap<StudentId, StudentTally>,
    /// The batch stopped early on request; `images` holds what completed.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn push(&mut self, report: ImageReport) {
        if report.detection_error.is_some() {
            self.detection_failures += 1;
        }
        self.total_faces += report.results.len();
        self.recognized += report.recognized();
        self.unknown += report.unknown();
        for result in report.results.iter().filter(|r| r.matched) {
            let Some(student_id) = result.student_id else { continue };
            self.students
                .entry(student_id)
                .or_insert_with(|| StudentTally { student_id, name: result.name.clone(), detections: 0 })
                .detections += 1;
        }
        self.images.push(report);
    }
}

/// Outcome of enrolling one student from one image.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReport {
    pub student_id: StudentId,
    pub faces_found: usize,
    /// Face the template was taken from.
    pub region: FaceRegion,
    pub classrooms_added: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(student: Option<StudentId>, name: &str) -> RecognitionResult {
        let region = FaceRegion::from_box(0.0, 0.0, 10.0, 10.0, 20, 20);
        match student {
            Some(id) => RecognitionResult {
                student_id: Some(id),
                name: name.to_string(),
                matched: true,
                confidence: Some(0.8),
                distance: Some(0.2),
                region,
            },
            None => RecognitionResult::unknown(region, None),
        }
    }

    #[test]
    fn test_batch_tallies() {
        let mut batch = BatchReport::default();
        batch.push(ImageReport {
            results: vec![result(Some(1), "Ada"), result(None, "unknown")],
            ..Default::default()
        });
        batch.push(ImageReport { results: vec![result(Some(1), "Ada"), result(Some(2), "Bob")], ..Default::default() });
        batch.push(ImageReport {
            source: Some(PathBuf::from("broken.jpg")),
            detection_error: Some("cannot read image broken.jpg".into()),
            ..Default::default()
        });

        assert_eq!(batch.images.len(), 3);
        assert_eq!(batch.detection_failures, 1);
        assert_eq!((batch.total_faces, batch.recognized, batch.unknown), (4, 3, 1));
        assert_eq!(batch.students[&1].detections, 2);
        assert_eq!(batch.students[&2].name, "Bob");
    }

    #[test]
    fn test_report_json_shape() {
        let report = ImageReport { results: vec![result(Some(7), "Eve")], recorded: vec![7], ..Default::default() };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["student_id"], 7);
        assert_eq!(json["recorded"][0], 7);
        assert!(json["detection_error"].is_null());
    }
}
