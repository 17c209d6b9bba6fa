//! Attention queue - ordered backlog of sessions waiting on a human
//!
//! The backlog is a FIFO with set semantics: a session id appears at most
//! once. Every mutating call runs under one lock, so `process_status_changes`
//! and `get_next` never interleave. Change callbacks run after the lock is
//! released (still inside the mutating call) so they may read the queue.

use crate::{ManagedSession, SessionStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info};

/// Called with the new backlog after every actual mutation
pub type QueueChangeHandler = Box<dyn Fn(&[String]) + Send + Sync>;

/// Called for each session that just became idle, when alerts are enabled
pub type AlertHandler = Box<dyn Fn(&AttentionAlert) + Send + Sync>;

/// A request to tell the user that a session finished its turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionAlert {
    pub session_id: String,
    pub session_name: String,
    /// Play the attention chime
    pub sound: bool,
    /// Show a desktop notification
    pub notification: bool,
}

pub struct AttentionOptions {
    pub on_queue_change: Option<QueueChangeHandler>,
    pub on_alert: Option<AlertHandler>,
    pub sound_enabled: bool,
    pub notifications_enabled: bool,
}

impl Default for AttentionOptions {
    fn default() -> Self {
        Self {
            on_queue_change: None,
            on_alert: None,
            sound_enabled: true,
            notifications_enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<String>,
    members: HashSet<String>,
    /// Status each session had on the previous `process_status_changes` pass
    previous: HashMap<String, SessionStatus>,
}

impl QueueState {
    fn push(&mut self, session_id: &str) -> bool {
        if !self.members.insert(session_id.to_string()) {
            return false;
        }
        self.order.push_back(session_id.to_string());
        true
    }

    fn remove(&mut self, session_id: &str) -> bool {
        if !self.members.remove(session_id) {
            return false;
        }
        self.order.retain(|id| id != session_id);
        true
    }

    fn pop_front(&mut self) -> Option<String> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    fn snapshot(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

pub struct AttentionQueue {
    state: Mutex<QueueState>,
    on_queue_change: Option<QueueChangeHandler>,
    on_alert: Option<AlertHandler>,
    sound_enabled: AtomicBool,
    notifications_enabled: AtomicBool,
}

impl Default for AttentionQueue {
    fn default() -> Self {
        Self::new(AttentionOptions::default())
    }
}

impl fmt::Debug for AttentionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionQueue")
            .field("queue", &self.get_queue())
            .field("sound_enabled", &self.sound_enabled())
            .field("notifications_enabled", &self.notifications_enabled())
            .finish()
    }
}

impl AttentionQueue {
    pub fn new(options: AttentionOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            on_queue_change: options.on_queue_change,
            on_alert: options.on_alert,
            sound_enabled: AtomicBool::new(options.sound_enabled),
            notifications_enabled: AtomicBool::new(options.notifications_enabled),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, queue: &[String]) {
        if let Some(handler) = &self.on_queue_change {
            handler(queue);
        }
    }

    /// Append `session_id` unless it is already queued.
    ///
    /// Returns `true` if the queue changed.
    pub fn add(&self, session_id: &str) -> bool {
        let snapshot = {
            let mut state = self.lock();
            if !state.push(session_id) {
                return false;
            }
            state.snapshot()
        };
        debug!(%session_id, queued = snapshot.len(), "added to attention queue");
        self.notify(&snapshot);
        true
    }

    /// Drop `session_id` from the queue. Returns `true` if it was queued.
    pub fn remove(&self, session_id: &str) -> bool {
        let snapshot = {
            let mut state = self.lock();
            if !state.remove(session_id) {
                return false;
            }
            state.snapshot()
        };
        debug!(%session_id, queued = snapshot.len(), "removed from attention queue");
        self.notify(&snapshot);
        true
    }

    /// Empty the queue. Previous-status memory is kept.
    pub fn clear(&self) {
        {
            let mut state = self.lock();
            if state.order.is_empty() {
                return;
            }
            state.order.clear();
            state.members.clear();
        }
        self.notify(&[]);
    }

    /// Copy of the backlog, oldest first
    pub fn get_queue(&self) -> Vec<String> {
        self.lock().snapshot()
    }

    pub fn needs_attention(&self, session_id: &str) -> bool {
        self.lock().members.contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Pop the oldest queued session that still exists in `sessions`.
    ///
    /// Entries whose session has been deleted are discarded along the way.
    /// The returned session is removed from the queue.
    pub fn get_next(&self, sessions: &[ManagedSession]) -> Option<ManagedSession> {
        let (next, snapshot) = {
            let mut state = self.lock();
            let mut popped = false;
            let mut next = None;
            while let Some(id) = state.pop_front() {
                popped = true;
                if let Some(session) = sessions.iter().find(|s| s.id == id) {
                    next = Some(session.clone());
                    break;
                }
                debug!(session_id = %id, "discarding attention entry for deleted session");
            }
            (next, popped.then(|| state.snapshot()))
        };

        if let Some(snapshot) = snapshot {
            self.notify(&snapshot);
        }
        next
    }

    /// Diff each session's status against the previous pass.
    ///
    /// Sessions that went `working -> idle` are queued and returned. Sessions
    /// that went back to `working` are dequeued. Memory of sessions missing
    /// from `sessions` is dropped, so a reused id starts fresh.
    pub fn process_status_changes(&self, sessions: &[ManagedSession]) -> Vec<ManagedSession> {
        let mut newly_idle = Vec::new();
        let mut snapshots = Vec::new();

        {
            let mut state = self.lock();

            for session in sessions {
                let previous = state.previous.insert(session.id.clone(), session.status);

                if previous == Some(SessionStatus::Working) && session.status == SessionStatus::Idle
                {
                    if state.push(&session.id) {
                        snapshots.push(state.snapshot());
                    }
                    newly_idle.push(session.clone());
                } else if session.status.is_working()
                    && previous != Some(SessionStatus::Working)
                    && state.remove(&session.id)
                {
                    snapshots.push(state.snapshot());
                }
            }

            let live: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
            state.previous.retain(|id, _| live.contains(id.as_str()));
        }

        for snapshot in &snapshots {
            self.notify(snapshot);
        }
        for session in &newly_idle {
            self.alert(session);
        }
        newly_idle
    }

    fn alert(&self, session: &ManagedSession) {
        let sound = self.sound_enabled();
        let notification = self.notifications_enabled();
        info!(session_id = %session.id, sound, notification, "session needs attention");

        if !sound && !notification {
            return;
        }
        if let Some(handler) = &self.on_alert {
            handler(&AttentionAlert {
                session_id: session.id.clone(),
                session_name: session.name.clone(),
                sound,
                notification,
            });
        }
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.sound_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled.load(Ordering::Relaxed)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled.load(Ordering::Relaxed)
    }
}
