//! snapattend-store — persistence seams for the attendance pipeline.
//!
//! The pipeline only sees the traits in [`repository`]. [`SqliteStore`] is the
//! bundled backend.

pub mod repository;
pub mod sqlite;

pub use repository::{AttendanceRecorder, EnrollmentRepository, SessionStore, StoreError, StoredTemplate};
pub use sqlite::SqliteStore;
