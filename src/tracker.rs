//! Session status tracker - derives a session's status from lifecycle events
//!
//! The tracker holds no session registry of its own. Callers hand it the
//! current session snapshot and it updates the matching entry in place.
//! Events for unknown session ids are ignored; sessions are never created
//! implicitly.

use crate::dispatcher::{EventDispatcher, Handler};
use crate::{
    EventType, LifecycleEvent, ManagedSession, RemoteTaskStatus, SessionStatus, SharedSessions,
};
use std::sync::{Arc, PoisonError};
use tracing::{debug, trace};

/// Status a newly started session begins in
pub fn initial_status(pending_remote: bool) -> SessionStatus {
    if pending_remote {
        SessionStatus::Waiting
    } else {
        SessionStatus::Idle
    }
}

/// Status `session` moves to when `event` arrives.
///
/// Only `session_start` revives an offline session.
pub fn transition(session: &ManagedSession, event: &LifecycleEvent) -> SessionStatus {
    let current = session.status;
    match event {
        LifecycleEvent::SessionStart { .. } => {
            let pending_remote = session.is_remote() && current == SessionStatus::Waiting;
            initial_status(pending_remote)
        }
        _ if current == SessionStatus::Offline => current,
        LifecycleEvent::UserPromptSubmit { .. }
        | LifecycleEvent::PreToolUse { .. }
        | LifecycleEvent::PostToolUse { .. } => SessionStatus::Working,
        LifecycleEvent::Notification { .. } if event.requires_input() => SessionStatus::Waiting,
        LifecycleEvent::Notification { .. } => current,
        LifecycleEvent::Stop { .. } => SessionStatus::Idle,
        LifecycleEvent::SessionEnd { .. } => SessionStatus::Offline,
    }
}

/// Apply `event` to the matching session, returning its new status.
///
/// Returns `None` if no session in the snapshot has the event's id.
pub fn apply(sessions: &mut [ManagedSession], event: &LifecycleEvent) -> Option<SessionStatus> {
    let session_id = event.session_id();
    let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
        trace!(%session_id, event_type = %event.event_type(), "event for unknown session ignored");
        return None;
    };

    let next = transition(session, event);
    if next != session.status {
        debug!(%session_id, from = session.status.label(), to = next.label(), "status transition");
        session.status = next;
    }
    session.touch(event.timestamp());
    Some(next)
}

/// Apply a remote task status update to the matching session.
pub fn apply_task_status(
    sessions: &mut [ManagedSession],
    session_id: &str,
    status: RemoteTaskStatus,
    progress: Option<u8>,
) -> Option<SessionStatus> {
    let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
        trace!(%session_id, ?status, "task status for unknown session ignored");
        return None;
    };

    let next = status.session_status();
    if next != session.status {
        debug!(%session_id, ?status, from = session.status.label(), to = next.label(), "task status transition");
        session.status = next;
    }
    if let Some(progress) = progress {
        session.progress = Some(progress.min(100));
    }
    session.touch(crate::now_millis());
    Some(next)
}

/// Register the tracker with `dispatcher` for every event type.
///
/// The dispatch context is the registry's shared session snapshot. A lock
/// poisoned by another handler's panic is recovered, so one bad listener
/// cannot freeze status tracking. Returns the handler so it can be passed to
/// [`detach`].
pub fn attach(dispatcher: &EventDispatcher<SharedSessions>) -> Handler<SharedSessions> {
    let handler: Handler<SharedSessions> =
        Arc::new(|event: &LifecycleEvent, sessions: &SharedSessions| -> anyhow::Result<()> {
            let mut sessions = sessions.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut sessions, event);
            Ok(())
        });

    for event_type in EventType::ALL {
        dispatcher.register(event_type, Arc::clone(&handler));
    }
    handler
}

/// Undo [`attach`]
pub fn detach(dispatcher: &EventDispatcher<SharedSessions>, handler: &Handler<SharedSessions>) {
    for event_type in EventType::ALL {
        dispatcher.unregister(event_type, handler);
    }
}
