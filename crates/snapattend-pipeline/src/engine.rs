use crate::pipeline::{AttendanceTarget, CancelFlag, Pipeline, PipelineError};
use crate::report::{BatchReport, EnrollmentReport, ImageReport};
use chrono::NaiveDateTime;
use snapattend_core::{ClassroomId, SessionId};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("cannot spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    ResolveTarget {
        classroom: Option<ClassroomId>,
        session: Option<SessionId>,
        now: NaiveDateTime,
        reply: oneshot::Sender<Result<AttendanceTarget, PipelineError>>,
    },
    ProcessImage {
        path: PathBuf,
        target: AttendanceTarget,
        reply: oneshot::Sender<Result<ImageReport, PipelineError>>,
    },
    ProcessFolder {
        dir: PathBuf,
        target: AttendanceTarget,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<BatchReport, PipelineError>>,
    },
    Enroll {
        student_number: String,
        name: String,
        path: PathBuf,
        all_classrooms: bool,
        reply: oneshot::Sender<Result<EnrollmentReport, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PipelineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn resolve_target(
        &self,
        classroom: Option<ClassroomId>,
        session: Option<SessionId>,
        now: NaiveDateTime,
    ) -> Result<AttendanceTarget, EngineError> {
        self.request(|reply| EngineRequest::ResolveTarget { classroom, session, now, reply })
            .await
    }

    pub async fn process_image(&self, path: PathBuf, target: AttendanceTarget) -> Result<ImageReport, EngineError> {
        self.request(|reply| EngineRequest::ProcessImage { path, target, reply }).await
    }

    /// Process a folder. Setting `cancel` stops the batch before its next image.
    pub async fn process_folder(
        &self,
        dir: PathBuf,
        target: AttendanceTarget,
        cancel: CancelFlag,
    ) -> Result<BatchReport, EngineError> {
        self.request(|reply| EngineRequest::ProcessFolder { dir, target, cancel, reply })
            .await
    }

    pub async fn enroll(
        &self,
        student_number: String,
        name: String,
        path: PathBuf,
        all_classrooms: bool,
    ) -> Result<EnrollmentReport, EngineError> {
        self.request(|reply| EngineRequest::Enroll { student_number, name, path, all_classrooms, reply })
            .await
    }
}

/// Move `pipeline` onto a dedicated OS thread and serve requests until every
/// handle is dropped. Inference is synchronous, so it stays off the runtime.
pub fn spawn_engine(mut pipeline: Pipeline) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("snapattend-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ResolveTarget { classroom, session, now, reply } => {
                        let _ = reply.send(pipeline.resolve_target(classroom, session, now));
                    }
                    EngineRequest::ProcessImage { path, target, reply } => {
                        let _ = reply.send(Ok(pipeline.process_path(&path, &target)));
                    }
                    EngineRequest::ProcessFolder { dir, target, cancel, reply } => {
                        let _ = reply.send(pipeline.process_folder(&dir, &target, &cancel));
                    }
                    EngineRequest::Enroll { student_number, name, path, all_classrooms, reply } => {
                        let result = pipeline.enroll_path(&student_number, &name, &path, all_classrooms);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::Stores;
    use image::{Rgb, RgbImage};
    use snapattend_core::{
        DetectedFace, DetectionError, Embedding, FaceAnalyzer, FaceRegion, StaticKey, TemplateCipher,
    };
    use snapattend_store::{EnrollmentRepository, SqliteStore};
    use std::sync::Arc;

    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
            let (w, h) = image.dimensions();
            Ok(vec![DetectedFace {
                region: FaceRegion::from_box(0.0, 0.0, w as f32 / 2.0, h as f32 / 2.0, w, h),
                embedding: Embedding::new(vec![0.5, 0.5]),
            }])
        }
    }

    fn engine() -> (EngineHandle, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config {
            use_histogram_equalization: false,
            use_gamma_correction: false,
            save_attendance_images: false,
            ..Config::default()
        };
        let cipher = Arc::new(TemplateCipher::new(&StaticKey::generate(1)));
        let pipeline =
            Pipeline::new(&config, Box::new(OneFace), cipher, Stores::from_sqlite(store.clone())).unwrap();
        (spawn_engine(pipeline).unwrap(), store)
    }

    #[tokio::test]
    async fn test_enroll_and_process_through_engine() {
        let (handle, store) = engine();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(32, 32, Rgb([120, 90, 60])).save(&path).unwrap();

        let enrolled = handle
            .enroll("S1".into(), "Ada".into(), path.clone(), false)
            .await
            .unwrap();
        assert_eq!(store.list_candidates(None).unwrap().len(), 1);

        let report = handle.process_image(path, AttendanceTarget::global()).await.unwrap();
        assert_eq!(report.results[0].student_id, Some(enrolled.student_id));
    }

    #[tokio::test]
    async fn test_pipeline_errors_pass_through() {
        let (handle, _store) = engine();
        let now = chrono::Local::now().naive_local();
        let err = handle.resolve_target(None, Some(42), now).await;
        assert!(matches!(err, Err(EngineError::Pipeline(PipelineError::SessionNotFound(42)))));

        let report = handle
            .process_image(PathBuf::from("/nonexistent/photo.jpg"), AttendanceTarget::global())
            .await
            .unwrap();
        assert!(report.detection_error.is_some());
        assert!(report.results.is_empty());

        let err = handle
            .enroll("S1".into(), "Ada".into(), PathBuf::from("/nonexistent/photo.jpg"), false)
            .await;
        assert!(matches!(
            err,
            Err(EngineError::Pipeline(PipelineError::Detection(DetectionError::Decode { .. })))
        ));
    }

    #[tokio::test]
    async fn test_handles_share_one_engine() {
        let (handle, _store) = engine();
        let other = handle.clone();
        let dir = tempfile::tempdir().unwrap();
        let batch = other
            .process_folder(dir.path().to_path_buf(), AttendanceTarget::global(), CancelFlag::new())
            .await
            .unwrap();
        assert!(batch.images.is_empty());
        assert!(handle.resolve_target(None, None, chrono::Local::now().naive_local()).await.is_ok());
    }
}
