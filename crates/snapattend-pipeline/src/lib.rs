//! snapattend-pipeline — from a classroom photo to attendance records.
//!
//! [`Pipeline`] owns the analyzer, template cipher and store handles and runs
//! synchronously. [`spawn_engine`] moves it onto its own thread for async
//! callers.

pub mod annotate;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod report;
pub mod session;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use pipeline::{AttendanceTarget, CancelFlag, Pipeline, PipelineError, ProcessedImage, Stores};
pub use report::{BatchReport, EnrollmentReport, ImageReport, RecordFailure, StudentTally};
