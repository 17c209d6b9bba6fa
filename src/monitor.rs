//! Session monitor - dispatcher, tracker and attention queue wired together
//!
//! The monitor stands in for the external session registry: it owns the
//! shared session snapshot, registers a session when its `session_start`
//! arrives, and feeds every status change into the attention queue.
//!
//! Calls that change session status are serialized, so each call's result
//! covers exactly its own event even when several threads ingest at once.
//! Handlers registered on [`Monitor::dispatcher`] must not call back into the
//! monitor; publishing follow-up events on the dispatcher is fine.

use crate::attention::{AttentionOptions, AttentionQueue};
use crate::dispatcher::EventDispatcher;
use crate::tracker;
use crate::{LifecycleEvent, ManagedSession, RemoteTaskStatus, SessionStatus, SharedSessions};
use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub struct Monitor {
    sessions: SharedSessions,
    dispatcher: EventDispatcher<SharedSessions>,
    attention: AttentionQueue,
    /// Held across dispatch + attention processing
    ingest: Mutex<()>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(AttentionOptions::default())
    }
}

/// Display name for a session started in `cwd`
fn session_name(session_id: &str, cwd: Option<&str>) -> String {
    cwd.and_then(|cwd| Path::new(cwd).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| session_id.chars().take(8).collect())
}

impl Monitor {
    pub fn new(options: AttentionOptions) -> Self {
        let dispatcher = EventDispatcher::new();
        tracker::attach(&dispatcher);
        Self {
            sessions: Arc::new(Mutex::new(Vec::new())),
            dispatcher,
            attention: AttentionQueue::new(options),
            ingest: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ManagedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.ingest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatcher events flow through; register extra handlers here.
    pub fn dispatcher(&self) -> &EventDispatcher<SharedSessions> {
        &self.dispatcher
    }

    pub fn attention(&self) -> &AttentionQueue {
        &self.attention
    }

    /// Add `session` unless one with the same id exists.
    pub fn register_session(&self, session: ManagedSession) -> bool {
        let mut sessions = self.lock();
        if sessions.iter().any(|s| s.id == session.id) {
            return false;
        }
        info!(session_id = %session.id, name = %session.name, "session registered");
        sessions.push(session);
        true
    }

    /// Drop a session and any attention entry it holds.
    pub fn remove_session(&self, session_id: &str) -> Option<ManagedSession> {
        let _serial = self.serialize();
        let removed = {
            let mut sessions = self.lock();
            let index = sessions.iter().position(|s| s.id == session_id)?;
            sessions.remove(index)
        };
        info!(%session_id, "session removed");
        self.attention.remove(session_id);
        self.process_changes();
        Some(removed)
    }

    /// Current session snapshot
    pub fn sessions(&self) -> Vec<ManagedSession> {
        self.lock().clone()
    }

    pub fn session(&self, session_id: &str) -> Option<ManagedSession> {
        self.lock().iter().find(|s| s.id == session_id).cloned()
    }

    /// Dispatch one event and route the resulting status changes.
    ///
    /// Returns the sessions that just finished working.
    pub fn ingest(&self, event: LifecycleEvent) -> Vec<ManagedSession> {
        let _serial = self.serialize();
        if let LifecycleEvent::SessionStart {
            session_id, cwd, ..
        } = &event
        {
            let name = session_name(session_id, cwd.as_deref());
            self.register_session(ManagedSession::local(session_id.clone(), name, cwd.clone()));
        }

        self.dispatcher.publish(event, Arc::clone(&self.sessions));
        self.process_changes()
    }

    /// Apply a remote task update and route the resulting status change.
    pub fn update_task(
        &self,
        session_id: &str,
        status: RemoteTaskStatus,
        progress: Option<u8>,
    ) -> Option<SessionStatus> {
        let _serial = self.serialize();
        let next = tracker::apply_task_status(&mut self.lock(), session_id, status, progress);
        self.process_changes();
        next
    }

    /// Pop the next session needing attention.
    pub fn next_attention(&self) -> Option<ManagedSession> {
        let sessions = self.sessions();
        self.attention.get_next(&sessions)
    }

    fn process_changes(&self) -> Vec<ManagedSession> {
        let sessions = self.sessions();
        self.attention.process_status_changes(&sessions)
    }
}

/// Totals from a [`replay`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub skipped: usize,
    pub finished: usize,
}

/// Feed a JSONL stream of lifecycle events through `monitor`.
///
/// Blank lines are ignored and malformed lines are logged and skipped; only
/// read errors abort the replay.
pub fn replay<R: BufRead>(monitor: &Monitor, reader: R) -> std::io::Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<LifecycleEvent>(line) {
            Ok(event) => {
                summary.events += 1;
                summary.finished += monitor.ingest(event).len();
            }
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping malformed event");
                summary.skipped += 1;
            }
        }
    }

    debug!(
        events = summary.events,
        skipped = summary.skipped,
        finished = summary.finished,
        "replay complete"
    );
    Ok(summary)
}
