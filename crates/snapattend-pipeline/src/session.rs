//! Which class session a capture belongs to.

use chrono::NaiveDateTime;
use snapattend_core::{ClassroomId, Session, SessionId};
use snapattend_store::{SessionStore, StoreError};

/// First session in `sessions` active at `now`.
///
/// `sessions` is expected in store order (date, start time, id), so on
/// overlap the earliest-starting session wins. Overlaps are logged.
pub fn find_active(sessions: &[Session], now: NaiveDateTime) -> Option<&Session> {
    let mut active = sessions.iter().filter(|s| s.is_active_at(now));
    let chosen = active.next()?;
    let overlapping: Vec<SessionId> = active.map(|s| s.session_id).collect();
    if !overlapping.is_empty() {
        tracing::warn!(
            classroom = chosen.classroom_id,
            chosen = chosen.session_id,
            ?overlapping,
            "overlapping sessions active; using the earliest"
        );
    }
    Some(chosen)
}

/// Active session of `classroom` at `now`. Unknown or inactive classrooms
/// have no active session.
pub fn resolve_active_session(
    store: &dyn SessionStore,
    classroom: ClassroomId,
    now: NaiveDateTime,
) -> Result<Option<Session>, StoreError> {
    match store.get_classroom(classroom)? {
        None => {
            tracing::warn!(classroom, "classroom not found");
            return Ok(None);
        }
        Some(c) if !c.is_active => {
            tracing::info!(classroom, name = %c.name, "classroom is inactive");
            return Ok(None);
        }
        Some(_) => {}
    }

    let sessions = store.list_sessions(classroom)?;
    let active = find_active(&sessions, now).cloned();
    match &active {
        Some(s) => tracing::debug!(classroom, session = s.session_id, "active session resolved"),
        None => tracing::debug!(classroom, %now, "no active session"),
    }
    Ok(active)
}

pub fn resolve_session_by_id(store: &dyn SessionStore, session: SessionId) -> Result<Option<Session>, StoreError> {
    store.get_session(session)
}
