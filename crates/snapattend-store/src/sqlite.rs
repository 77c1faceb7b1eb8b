//! SQLite backend for every store trait.
//!
//! One connection behind a mutex. Attendance uniqueness is enforced by the
//! schema and the upsert runs as a single statement, so concurrent callers
//! cannot create duplicate rows.

use crate::repository::{AttendanceRecorder, EnrollmentRepository, SessionStore, StoreError, StoredTemplate};
use chrono::{Local, NaiveDate, NaiveTime};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use snapattend_core::{
    AttendanceRecord, AttendanceStatus, Classroom, ClassroomId, EncryptedTemplate, MarkedBy, Session,
    SessionId, StudentId,
};
use std::path::Path;

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS students (
        student_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        student_number  TEXT NOT NULL UNIQUE,
        name            TEXT NOT NULL,
        face_template   BLOB
    );

    CREATE TABLE IF NOT EXISTS classrooms (
        classroom_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        instructor_id   INTEGER NOT NULL,
        name            TEXT NOT NULL,
        is_active       INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS classroom_enrollments (
        classroom_id    INTEGER NOT NULL REFERENCES classrooms(classroom_id) ON DELETE CASCADE,
        student_id      INTEGER NOT NULL REFERENCES students(student_id) ON DELETE CASCADE,
        PRIMARY KEY (classroom_id, student_id)
    );

    CREATE TABLE IF NOT EXISTS class_sessions (
        session_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        classroom_id    INTEGER NOT NULL REFERENCES classrooms(classroom_id) ON DELETE CASCADE,
        session_date    TEXT NOT NULL,
        start_time      TEXT NOT NULL,
        end_time        TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendances (
        attendance_id   INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id      INTEGER NOT NULL REFERENCES class_sessions(session_id) ON DELETE CASCADE,
        student_id      INTEGER NOT NULL REFERENCES students(student_id) ON DELETE CASCADE,
        status          TEXT NOT NULL,
        marked_by       TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        UNIQUE (session_id, student_id)
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_classroom ON class_sessions(classroom_id, session_date);
"#;

const ATTENDANCE_COLUMNS: &str =
    "attendance_id, session_id, student_id, status, marked_by, created_at, updated_at";
const SESSION_COLUMNS: &str = "session_id, classroom_id, session_date, start_time, end_time";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the tables exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened attendance database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create_classroom(&self, instructor_id: i64, name: &str, is_active: bool) -> Result<ClassroomId, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO classrooms (instructor_id, name, is_active) VALUES (?1, ?2, ?3)",
            params![instructor_id, name, is_active],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_session(
        &self,
        classroom: ClassroomId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<SessionId, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO class_sessions (classroom_id, session_date, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
            params![classroom, date, start, end],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enroll one student into one classroom. Re-enrolling is a no-op.
    pub fn enroll_student(&self, classroom: ClassroomId, student: StudentId) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO classroom_enrollments (classroom_id, student_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![classroom, student],
        )?;
        Ok(())
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(StoreError::Corrupt(msg)))
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = row.get(3)?;
    let marked_by: String = row.get(4)?;
    Ok(AttendanceRecord {
        attendance_id: row.get(0)?,
        session_id: row.get(1)?,
        student_id: row.get(2)?,
        status: AttendanceStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown attendance status {status:?}")))?,
        marked_by: MarkedBy::parse(&marked_by)
            .ok_or_else(|| conversion_error(4, format!("unknown marked_by {marked_by:?}")))?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        classroom_id: row.get(1)?,
        date: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<StoredTemplate> {
    let bytes: Vec<u8> = row.get(2)?;
    Ok(StoredTemplate {
        student_id: row.get(0)?,
        name: row.get(1)?,
        template: EncryptedTemplate::from(bytes),
    })
}

impl EnrollmentRepository for SqliteStore {
    fn list_candidates(&self, classroom: Option<ClassroomId>) -> Result<Vec<StoredTemplate>, StoreError> {
        let conn = self.conn.lock();
        let candidates = match classroom {
            Some(classroom) => {
                let mut stmt = conn.prepare(
                    "SELECT s.student_id, s.name, s.face_template
                       FROM students s
                       JOIN classroom_enrollments ce ON s.student_id = ce.student_id
                      WHERE ce.classroom_id = ?1 AND s.face_template IS NOT NULL
                      ORDER BY s.student_id",
                )?;
                let rows = stmt.query_map(params![classroom], template_from_row)?;
                let scoped = rows.collect::<Result<Vec<_>, _>>()?;
                scoped
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT student_id, name, face_template FROM students
                      WHERE face_template IS NOT NULL ORDER BY student_id",
                )?;
                let rows = stmt.query_map([], template_from_row)?;
                let all = rows.collect::<Result<Vec<_>, _>>()?;
                all
            }
        };
        tracing::debug!(?classroom, count = candidates.len(), "listed candidate templates");
        Ok(candidates)
    }

    fn save_template(&self, student: StudentId, template: &EncryptedTemplate) -> Result<(), StoreError> {
        let updated = self.conn.lock().execute(
            "UPDATE students SET face_template = ?1 WHERE student_id = ?2",
            params![template.as_bytes(), student],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound { entity: "student", id: student });
        }
        Ok(())
    }

    fn upsert_student(&self, student_number: &str, name: &str) -> Result<StudentId, StoreError> {
        let id = self.conn.lock().query_row(
            "INSERT INTO students (student_number, name) VALUES (?1, ?2)
             ON CONFLICT (student_number) DO UPDATE SET name = excluded.name
             RETURNING student_id",
            params![student_number, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn store_enrollment(
        &self,
        student_number: &str,
        name: &str,
        template: &EncryptedTemplate,
    ) -> Result<StudentId, StoreError> {
        let id = self.conn.lock().query_row(
            "INSERT INTO students (student_number, name, face_template) VALUES (?1, ?2, ?3)
             ON CONFLICT (student_number) DO UPDATE
                SET name = excluded.name, face_template = excluded.face_template
             RETURNING student_id",
            params![student_number, name, template.as_bytes()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn enroll_in_active_classrooms(&self, student: StudentId) -> Result<usize, StoreError> {
        let added = self.conn.lock().execute(
            "INSERT INTO classroom_enrollments (classroom_id, student_id)
             SELECT classroom_id, ?1 FROM classrooms WHERE is_active = 1
             ON CONFLICT DO NOTHING",
            params![student],
        )?;
        Ok(added)
    }
}

impl SessionStore for SqliteStore {
    fn list_sessions(&self, classroom: ClassroomId) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM class_sessions
              WHERE classroom_id = ?1
              ORDER BY session_date, start_time, session_id"
        ))?;
        let sessions = stmt
            .query_map(params![classroom], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn get_session(&self, session: SessionId) -> Result<Option<Session>, StoreError> {
        let found = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM class_sessions WHERE session_id = ?1"),
                params![session],
                session_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn get_classroom(&self, classroom: ClassroomId) -> Result<Option<Classroom>, StoreError> {
        let found = self
            .conn
            .lock()
            .query_row(
                "SELECT classroom_id, instructor_id, name, is_active FROM classrooms WHERE classroom_id = ?1",
                params![classroom],
                |row| {
                    Ok(Classroom {
                        classroom_id: row.get(0)?,
                        instructor_id: row.get(1)?,
                        name: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }
}

impl AttendanceRecorder for SqliteStore {
    fn mark_present(&self, session: SessionId, student: StudentId) -> Result<AttendanceRecord, StoreError> {
        let now = Local::now().naive_local();
        let record = self.conn.lock().query_row(
            &format!(
                "INSERT INTO attendances (session_id, student_id, status, marked_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (session_id, student_id)
                 DO UPDATE SET status = excluded.status, marked_by = excluded.marked_by,
                               updated_at = excluded.updated_at
                 RETURNING {ATTENDANCE_COLUMNS}"
            ),
            params![
                session,
                student,
                AttendanceStatus::Present.as_str(),
                MarkedBy::System.as_str(),
                now
            ],
            attendance_from_row,
        )?;
        tracing::debug!(session, student, attendance_id = record.attendance_id, "attendance marked present");
        Ok(record)
    }

    fn get_attendance(
        &self,
        session: SessionId,
        student: StudentId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let found = self
            .conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {ATTENDANCE_COLUMNS} FROM attendances WHERE session_id = ?1 AND student_id = ?2"
                ),
                params![session, student],
                attendance_from_row,
            )
            .optional()?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn fixture() -> (SqliteStore, ClassroomId, SessionId, StudentId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let classroom = store.create_classroom(1, "Physics 101", true).unwrap();
        let session = store.create_session(classroom, date(), time(9, 0), time(10, 0)).unwrap();
        let student = store.upsert_student("S-001", "Ada").unwrap();
        (store, classroom, session, student)
    }

    #[test]
    fn test_mark_present_twice_yields_one_record() {
        let (store, _, session, student) = fixture();
        let first = store.mark_present(session, student).unwrap();
        let second = store.mark_present(session, student).unwrap();

        assert_eq!(first.attendance_id, second.attendance_id);
        assert_eq!(second.status, AttendanceStatus::Present);
        assert_eq!(second.marked_by, MarkedBy::System);
        assert_eq!(second.created_at, first.created_at);

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM attendances", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_concurrent_mark_present_serializes_to_one_record() {
        let (store, _, session, student) = fixture();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.mark_present(session, student).unwrap())
            })
            .collect();
        let records: Vec<AttendanceRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let first = records[0].attendance_id;
        assert!(records.iter().all(|r| r.attendance_id == first));
        assert!(records.iter().all(|r| r.status == AttendanceStatus::Present));

        let count: i64 = store
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM attendances WHERE session_id = ?1 AND student_id = ?2",
                params![session, student],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        let stored = store.get_attendance(session, student).unwrap().unwrap();
        assert_eq!(stored.status, AttendanceStatus::Present);
        assert_eq!(stored.attendance_id, first);
    }

    #[test]
    fn test_mark_present_overwrites_absent_instructor_row() {
        let (store, _, session, student) = fixture();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO attendances (session_id, student_id, status, marked_by, created_at, updated_at)
                 VALUES (?1, ?2, 'absent', 'instructor', '2024-09-02 08:00:00', '2024-09-02 08:00:00')",
                params![session, student],
            )
            .unwrap();

        let record = store.mark_present(session, student).unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.marked_by, MarkedBy::System);
        assert_eq!(store.get_attendance(session, student).unwrap(), Some(record));
    }

    #[test]
    fn test_mark_present_unknown_session_fails() {
        let (store, _, _, student) = fixture();
        assert!(matches!(store.mark_present(999, student), Err(StoreError::Database(_))));
    }

    #[test]
    fn test_list_candidates_excludes_missing_templates() {
        let (store, classroom, _, ada) = fixture();
        let bob = store.upsert_student("S-002", "Bob").unwrap();
        let eve = store.upsert_student("S-003", "Eve").unwrap();
        store.enroll_student(classroom, ada).unwrap();
        store.enroll_student(classroom, bob).unwrap();

        store.save_template(ada, &EncryptedTemplate::from(vec![1, 2, 3])).unwrap();
        store.save_template(eve, &EncryptedTemplate::from(vec![4, 5])).unwrap();

        let scoped = store.list_candidates(Some(classroom)).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "Ada");
        assert_eq!(scoped[0].template.as_bytes(), &[1, 2, 3]);

        let global: Vec<StudentId> =
            store.list_candidates(None).unwrap().iter().map(|c| c.student_id).collect();
        assert_eq!(global, vec![ada, eve]);
    }

    #[test]
    fn test_save_template_replaces_and_rejects_unknown() {
        let (store, _, _, ada) = fixture();
        store.save_template(ada, &EncryptedTemplate::from(vec![1])).unwrap();
        store.save_template(ada, &EncryptedTemplate::from(vec![2])).unwrap();
        let all = store.list_candidates(None).unwrap();
        assert_eq!(all[0].template.as_bytes(), &[2]);

        assert!(matches!(
            store.save_template(404, &EncryptedTemplate::from(vec![1])),
            Err(StoreError::NotFound { entity: "student", id: 404 })
        ));
    }

    #[test]
    fn test_upsert_student_keeps_id_and_renames() {
        let (store, _, _, ada) = fixture();
        let again = store.upsert_student("S-001", "Ada Lovelace").unwrap();
        assert_eq!(again, ada);
        let name: String = store
            .conn
            .lock()
            .query_row("SELECT name FROM students WHERE student_id = ?1", params![ada], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ada Lovelace");
    }

    #[test]
    fn test_store_enrollment_creates_and_replaces() {
        let (store, _, _, ada) = fixture();
        let grace = store.store_enrollment("S-9", "Grace", &EncryptedTemplate::from(vec![7])).unwrap();
        let again = store.store_enrollment("S-001", "Ada L.", &EncryptedTemplate::from(vec![8])).unwrap();
        assert_eq!(again, ada);

        let all = store.list_candidates(None).unwrap();
        let summary: Vec<_> = all.iter().map(|c| (c.student_id, c.name.as_str(), c.template.as_bytes())).collect();
        assert_eq!(summary, vec![(ada, "Ada L.", &[8u8][..]), (grace, "Grace", &[7u8][..])]);
    }

    #[test]
    fn test_store_enrollment_is_all_or_nothing() {
        let (store, _, _, ada) = fixture();
        store.save_template(ada, &EncryptedTemplate::from(vec![1])).unwrap();
        store
            .conn
            .lock()
            .execute_batch(
                "CREATE TRIGGER reject_template BEFORE UPDATE OF face_template ON students
                 WHEN NEW.name = 'Mallory'
                 BEGIN SELECT RAISE(ABORT, 'template rejected'); END;",
            )
            .unwrap();

        let err = store.store_enrollment("S-001", "Mallory", &EncryptedTemplate::from(vec![2]));
        assert!(matches!(err, Err(StoreError::Database(_))));

        let all = store.list_candidates(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Ada");
        assert_eq!(all[0].template.as_bytes(), &[1]);
    }

    #[test]
    fn test_enroll_in_active_classrooms_only() {
        let (store, active, _, ada) = fixture();
        let inactive = store.create_classroom(1, "Archived", false).unwrap();
        let other = store.create_classroom(2, "Chemistry", true).unwrap();
        store.enroll_student(active, ada).unwrap();
        store.save_template(ada, &EncryptedTemplate::from(vec![9])).unwrap();

        assert_eq!(store.enroll_in_active_classrooms(ada).unwrap(), 1);
        assert_eq!(store.enroll_in_active_classrooms(ada).unwrap(), 0);
        assert_eq!(store.list_candidates(Some(other)).unwrap().len(), 1);
        assert!(store.list_candidates(Some(inactive)).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_ordered_by_start_then_id() {
        let (store, classroom, first, _) = fixture();
        let early = store.create_session(classroom, date(), time(8, 0), time(9, 30)).unwrap();
        let same_start = store.create_session(classroom, date(), time(9, 0), time(9, 45)).unwrap();

        let ids: Vec<SessionId> =
            store.list_sessions(classroom).unwrap().iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec![early, first, same_start]);

        let session = store.get_session(first).unwrap().unwrap();
        assert_eq!(session.start_time, time(9, 0));
        assert_eq!(session.date, date());
        assert!(store.get_session(12345).unwrap().is_none());
    }

    #[test]
    fn test_get_classroom() {
        let (store, classroom, _, _) = fixture();
        let found = store.get_classroom(classroom).unwrap().unwrap();
        assert_eq!(found.name, "Physics 101");
        assert!(found.is_active);
        assert!(store.get_classroom(77).unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let student = {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_student("S-9", "Grace").unwrap()
        };
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.upsert_student("S-9", "Grace").unwrap(), student);
    }
}
