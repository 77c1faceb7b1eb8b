//! Image-to-attendance orchestration.
//!
//! Per image: preprocess, detect and embed, decrypt the candidate templates
//! once, match every face, mark matched students present when a session is
//! bound, then annotate. Only configuration problems are fatal; everything
//! else is logged and reported on the image it happened to.

use crate::annotate;
use crate::config::{Config, ConfigError};
use crate::report::{BatchReport, EnrollmentReport, ImageReport, RecordFailure};
use crate::session;
use ab_glyph::FontArc;
use chrono::NaiveDateTime;
use image::{GrayImage, RgbImage};
use snapattend_core::{
    assign, load_image, AssignmentStrategy, Candidate, CipherError, ClassroomId, DetectedFace, DetectionError,
    FaceAnalyzer, FileKeyProvider, OnnxAnalyzer, Preprocessor, Session, SessionId, StudentId,
    TemplateCipher,
};
use snapattend_store::{AttendanceRecorder, EnrollmentRepository, SessionStore, SqliteStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// File extensions picked up by folder processing (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("detection: {0}")]
    Detection(#[from] DetectionError),
    #[error("template cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("no active session for classroom {0}")]
    NoActiveSession(ClassroomId),
    #[error("no face found in enrollment image")]
    NoFaceInEnrollmentImage,
}

/// Shared stop request for batch processing, checked between images.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The store seams the pipeline talks to.
#[derive(Clone)]
pub struct Stores {
    pub enrollment: Arc<dyn EnrollmentRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub attendance: Arc<dyn AttendanceRecorder>,
}

impl Stores {
    pub fn from_sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            enrollment: store.clone(),
            sessions: store.clone(),
            attendance: store,
        }
    }
}

/// Where a capture's attendance goes.
///
/// `classroom` scopes the candidate set. Attendance is only written when
/// `session` is present.
#[derive(Debug, Clone, Default)]
pub struct AttendanceTarget {
    pub classroom: Option<ClassroomId>,
    pub session: Option<Session>,
}

impl AttendanceTarget {
    /// All students with a template, nothing recorded.
    pub fn global() -> Self {
        Self::default()
    }

    /// Recognition scoped to a classroom, nothing recorded.
    pub fn classroom(classroom: ClassroomId) -> Self {
        Self { classroom: Some(classroom), session: None }
    }

    pub fn session(session: Session) -> Self {
        Self { classroom: Some(session.classroom_id), session: Some(session) }
    }
}

struct Settings {
    tolerance: f32,
    strategy: AssignmentStrategy,
    budget: Option<Duration>,
    save_images: bool,
    save_intermediate: bool,
    output_dir: PathBuf,
}

/// Everything produced for one image.
pub struct ProcessedImage {
    pub annotated: RgbImage,
    pub report: ImageReport,
    /// Equalized luminance, kept for diagnostics.
    pub equalized: Option<GrayImage>,
    /// Image the detector saw.
    pub normalized: RgbImage,
}

pub struct Pipeline {
    analyzer: Box<dyn FaceAnalyzer>,
    cipher: Arc<TemplateCipher>,
    stores: Stores,
    preprocessor: Preprocessor,
    settings: Settings,
    font: Option<FontArc>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        analyzer: Box<dyn FaceAnalyzer>,
        cipher: Arc<TemplateCipher>,
        stores: Stores,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let preprocessor = Preprocessor::new(config.preprocess_options())
            .map_err(|_| ConfigError::InvalidGamma(config.gamma_value))?;
        let font = config.annotation_font.as_deref().map(annotate::load_font).transpose()?;
        if config.annotation_font.is_none() {
            tracing::debug!("no annotation font configured; labels will not be drawn");
        }

        Ok(Self {
            analyzer,
            cipher,
            stores,
            preprocessor,
            settings: Settings {
                tolerance: config.recognition_tolerance,
                strategy: config.assignment_strategy,
                budget: (config.detection_budget_ms > 0)
                    .then(|| Duration::from_millis(config.detection_budget_ms)),
                save_images: config.save_attendance_images,
                save_intermediate: config.save_intermediate_images,
                output_dir: config.output_dir.clone(),
            },
            font,
        })
    }

    /// Build the production pipeline: ONNX models, key file and SQLite
    /// database, all located by `config`.
    pub fn from_config(config: &Config) -> Result<(Self, Arc<SqliteStore>), PipelineError> {
        config.validate()?;
        let key = FileKeyProvider::load_or_generate(&config.key_path).map_err(ConfigError::from)?;
        let cipher = Arc::new(TemplateCipher::new(&key));
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        let analyzer =
            OnnxAnalyzer::load(&config.model_dir, config.face_detection_model, config.embedding_dim)?;
        let pipeline = Self::new(config, Box::new(analyzer), cipher, Stores::from_sqlite(store.clone()))?;
        Ok((pipeline, store))
    }

    /// Turn command-line scoping into a target.
    ///
    /// An explicit session wins over a classroom. A classroom without an
    /// active session yields [`PipelineError::NoActiveSession`]; callers
    /// may continue with [`AttendanceTarget::classroom`].
    pub fn resolve_target(
        &self,
        classroom: Option<ClassroomId>,
        session: Option<SessionId>,
        now: NaiveDateTime,
    ) -> Result<AttendanceTarget, PipelineError> {
        if let Some(id) = session {
            return session::resolve_session_by_id(self.stores.sessions.as_ref(), id)?
                .map(AttendanceTarget::session)
                .ok_or(PipelineError::SessionNotFound(id));
        }
        match classroom {
            Some(classroom) => session::resolve_active_session(self.stores.sessions.as_ref(), classroom, now)?
                .map(AttendanceTarget::session)
                .ok_or(PipelineError::NoActiveSession(classroom)),
            None => Ok(AttendanceTarget::global()),
        }
    }

    /// Run one decoded image through the pipeline.
    pub fn process_image(&mut self, image: &RgbImage, target: &AttendanceTarget) -> ProcessedImage {
        let started = Instant::now();
        let preprocessed = self.preprocessor.preprocess(image);
        let mut report = ImageReport {
            session_id: target.session.as_ref().map(|s| s.session_id),
            ..Default::default()
        };

        let faces = match self.detect(&preprocessed.image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; continuing with zero faces");
                report.detection_error = Some(e.to_string());
                Vec::new()
            }
        };

        let mut annotated = image.clone();
        if faces.is_empty() {
            tracing::info!("no faces detected");
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return ProcessedImage {
                annotated,
                report,
                equalized: preprocessed.equalized,
                normalized: preprocessed.image,
            };
        }

        let candidates = self.load_candidates(target.classroom, &mut report);
        let queries: Vec<_> = faces.iter().map(|f| &f.embedding).collect();
        let outcomes = assign(&queries, &candidates, self.settings.tolerance, self.settings.strategy);
        report.results = outcomes
            .into_iter()
            .zip(faces)
            .map(|(outcome, face)| outcome.into_result(face.region, &candidates))
            .collect();
        drop(candidates);

        if let Some(session) = &target.session {
            self.record(session, &mut report);
        }

        annotate::annotate(&mut annotated, &report.results, self.font.as_ref());
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            faces = report.results.len(),
            recognized = report.recognized(),
            recorded = report.recorded.len(),
            elapsed_ms = report.elapsed_ms,
            "image processed"
        );

        ProcessedImage {
            annotated,
            report,
            equalized: preprocessed.equalized,
            normalized: preprocessed.image,
        }
    }

    /// Decode, process and (optionally) save one image file.
    ///
    /// An unreadable or corrupt file is a detection failure: it is logged and
    /// reported with zero faces, nothing is recorded and nothing is saved.
    pub fn process_path(&mut self, path: &Path, target: &AttendanceTarget) -> ImageReport {
        let image = match load_image(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read image; continuing with zero faces");
                return ImageReport {
                    source: Some(path.to_path_buf()),
                    session_id: target.session.as_ref().map(|s| s.session_id),
                    detection_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let processed = self.process_image(&image, target);
        let mut report = processed.report;
        report.source = Some(path.to_path_buf());

        if self.settings.save_images {
            let out = self.settings.output_dir.join(processed_file_name(path));
            match save_image(&out, |p| processed.annotated.save(p)) {
                Ok(()) => {
                    tracing::info!(path = %out.display(), "annotated image saved");
                    report.annotated_path = Some(out);
                }
                Err(e) => tracing::warn!(path = %out.display(), error = %e, "could not save annotated image"),
            }
        }

        if self.settings.save_intermediate {
            let stem = file_stem(path);
            if let Some(eq) = &processed.equalized {
                let out = self.settings.output_dir.join(format!("equalized_{stem}.png"));
                if let Err(e) = save_image(&out, |p| eq.save(p)) {
                    tracing::warn!(path = %out.display(), error = %e, "could not save equalized image");
                }
            }
            let out = self.settings.output_dir.join(format!("gamma_{stem}.png"));
            if let Err(e) = save_image(&out, |p| processed.normalized.save(p)) {
                tracing::warn!(path = %out.display(), error = %e, "could not save gamma-corrected image");
            }
        }

        report
    }

    /// Process every supported image in `dir`, in sorted path order.
    ///
    /// Failures are isolated per image. `cancel` is checked before each image.
    pub fn process_folder(
        &mut self,
        dir: &Path,
        target: &AttendanceTarget,
        cancel: &CancelFlag,
    ) -> Result<BatchReport, PipelineError> {
        let paths = list_images(dir)?;
        tracing::info!(dir = %dir.display(), images = paths.len(), "processing folder");

        let mut batch = BatchReport::default();
        for path in paths {
            if cancel.is_cancelled() {
                tracing::warn!(completed = batch.images.len(), "batch cancelled");
                batch.cancelled = true;
                break;
            }
            batch.push(self.process_path(&path, target));
        }

        tracing::info!(
            processed = batch.images.len(),
            detection_failures = batch.detection_failures,
            faces = batch.total_faces,
            recognized = batch.recognized,
            students = batch.students.len(),
            "folder complete"
        );
        Ok(batch)
    }

    /// Register `name` (keyed by `student_number`) with the face in `image`.
    ///
    /// Several faces: the first detected one is used. No face: error, and the
    /// student is left untouched. The student row and its template are written
    /// together, so a failed write never leaves a student without a template.
    pub fn enroll(
        &mut self,
        student_number: &str,
        name: &str,
        image: &RgbImage,
        all_classrooms: bool,
    ) -> Result<EnrollmentReport, PipelineError> {
        let preprocessed = self.preprocessor.preprocess(image);
        let mut faces = self.analyzer.analyze(&preprocessed.image)?;
        let faces_found = faces.len();
        if faces.is_empty() {
            return Err(PipelineError::NoFaceInEnrollmentImage);
        }
        if faces_found > 1 {
            tracing::warn!(faces = faces_found, student_number, "multiple faces in enrollment image; using the first");
        }
        let face = faces.swap_remove(0);

        let template = self.cipher.encrypt(&face.embedding)?;
        let student_id = self.stores.enrollment.store_enrollment(student_number, name, &template)?;
        let classrooms_added = if all_classrooms {
            self.stores.enrollment.enroll_in_active_classrooms(student_id)?
        } else {
            0
        };

        tracing::info!(student_id, student_number, classrooms_added, "student enrolled");
        Ok(EnrollmentReport { student_id, faces_found, region: face.region, classrooms_added })
    }

    pub fn enroll_path(
        &mut self,
        student_number: &str,
        name: &str,
        path: &Path,
        all_classrooms: bool,
    ) -> Result<EnrollmentReport, PipelineError> {
        let image = load_image(path)?;
        self.enroll(student_number, name, &image, all_classrooms)
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
        let started = Instant::now();
        let faces = self.analyzer.analyze(image)?;
        let elapsed = started.elapsed();
        if let Some(budget) = self.settings.budget {
            if elapsed > budget {
                return Err(DetectionError::BudgetExceeded {
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_ms: budget.as_millis() as u64,
                });
            }
        }
        tracing::debug!(faces = faces.len(), elapsed_ms = elapsed.as_millis() as u64, "detection complete");
        Ok(faces)
    }

    fn load_candidates(&self, classroom: Option<ClassroomId>, report: &mut ImageReport) -> Vec<Candidate> {
        let stored = match self.stores.enrollment.list_candidates(classroom) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(?classroom, error = %e, "could not list candidates; all faces will be unknown");
                report.candidate_error = Some(e.to_string());
                return Vec::new();
            }
        };

        stored
            .into_iter()
            .filter_map(|t| match self.cipher.decrypt(&t.template) {
                Ok(embedding) => Some(Candidate { student_id: t.student_id, name: t.name, embedding }),
                Err(e) => {
                    tracing::warn!(
                        student_id = t.student_id,
                        error = %e,
                        "template failed to decrypt; candidate excluded (data integrity)"
                    );
                    report.excluded_candidates.push(t.student_id);
                    None
                }
            })
            .collect()
    }

    fn record(&self, session: &Session, report: &mut ImageReport) {
        let mut seen: Vec<StudentId> = Vec::new();
        for student_id in report.results.iter().filter_map(|r| r.student_id) {
            if seen.contains(&student_id) {
                continue;
            }
            seen.push(student_id);
            match self.stores.attendance.mark_present(session.session_id, student_id) {
                Ok(_) => report.recorded.push(student_id),
                Err(e) => {
                    tracing::error!(session = session.session_id, student_id, error = %e, "attendance not recorded");
                    report.record_failures.push(RecordFailure { student_id, error: e.to_string() });
                }
            }
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "image".to_string())
}

/// `<stem>_processed.<ext>` for `path`.
pub fn processed_file_name(path: &Path) -> String {
    let stem = file_stem(path);
    match path.extension() {
        Some(ext) => format!("{stem}_processed.{}", ext.to_string_lossy()),
        None => format!("{stem}_processed.png"),
    }
}

fn save_image(
    path: &Path,
    save: impl FnOnce(&Path) -> image::ImageResult<()>,
) -> image::ImageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(image::ImageError::IoError)?;
    }
    save(path)
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let io_err = |source| PipelineError::Io { path: dir.to_path_buf(), source };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && is_supported_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
