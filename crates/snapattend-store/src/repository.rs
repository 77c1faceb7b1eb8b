use snapattend_core::{
    AttendanceRecord, Classroom, ClassroomId, EncryptedTemplate, Session, SessionId, StudentId,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Encrypted template as persisted, with the owning student.
#[derive(Debug, Clone)]
pub struct StoredTemplate {
    pub student_id: StudentId,
    pub name: String,
    pub template: EncryptedTemplate,
}

/// Students and their enrolled face templates.
pub trait EnrollmentRepository: Send + Sync {
    /// Students with a template, enrolled in `classroom` when given, else all.
    /// Students without a template are never returned.
    fn list_candidates(&self, classroom: Option<ClassroomId>) -> Result<Vec<StoredTemplate>, StoreError>;

    /// Replace the student's template.
    fn save_template(&self, student: StudentId, template: &EncryptedTemplate) -> Result<(), StoreError>;

    /// Create the student, or rename an existing one with the same number.
    fn upsert_student(&self, student_number: &str, name: &str) -> Result<StudentId, StoreError>;

    /// Create or rename the student and replace their template in one write.
    /// Either both land or neither does.
    fn store_enrollment(
        &self,
        student_number: &str,
        name: &str,
        template: &EncryptedTemplate,
    ) -> Result<StudentId, StoreError>;

    /// Enroll the student into every active classroom. Returns how many new
    /// enrollments were made.
    fn enroll_in_active_classrooms(&self, student: StudentId) -> Result<usize, StoreError>;
}

pub trait SessionStore: Send + Sync {
    /// Sessions of `classroom`, ordered by date, start time, then id.
    fn list_sessions(&self, classroom: ClassroomId) -> Result<Vec<Session>, StoreError>;

    fn get_session(&self, session: SessionId) -> Result<Option<Session>, StoreError>;

    fn get_classroom(&self, classroom: ClassroomId) -> Result<Option<Classroom>, StoreError>;
}

/// Idempotent attendance writes keyed by (session, student).
pub trait AttendanceRecorder: Send + Sync {
    /// Create or update the record so that it reads present / system.
    fn mark_present(&self, session: SessionId, student: StudentId) -> Result<AttendanceRecord, StoreError>;

    fn get_attendance(
        &self,
        session: SessionId,
        student: StudentId,
    ) -> Result<Option<AttendanceRecord>, StoreError>;
}
