//! Managed session snapshot and status definitions

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Session status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Agent finished its turn, waiting for the next prompt
    #[default]
    Idle,
    /// Actively running tools
    Working,
    /// Blocked on a permission or input prompt, or a pending remote task
    Waiting,
    /// Remote task failed and needs review
    Attention,
    /// Session ended or remote task stopped
    Offline,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Attention => "attention",
            Self::Offline => "offline",
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working)
    }
}

/// One tracked agent session (local tmux-backed or remote task-backed).
///
/// Sessions are owned by an external registry; the core reads snapshots
/// and writes back `status` and `last_activity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSession {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: SessionStatus,
    /// Working directory (absent for remote-only sessions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds of the last applied event
    pub last_activity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Remote task progress, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

impl ManagedSession {
    fn new(id: String, name: String, status: SessionStatus) -> Self {
        let now = crate::now_millis();
        Self {
            id,
            name,
            status,
            cwd: None,
            created_at: now,
            last_activity: now,
            tmux_session: None,
            claude_session_id: None,
            task_id: None,
            repo_url: None,
            branch: None,
            progress: None,
            pr_url: None,
        }
    }

    /// A local session running in a working directory
    pub fn local(id: impl Into<String>, name: impl Into<String>, cwd: Option<String>) -> Self {
        let mut session = Self::new(id.into(), name.into(), SessionStatus::Idle);
        session.cwd = cwd;
        session
    }

    /// A session backed by a pending remote task
    pub fn remote(
        id: impl Into<String>,
        name: impl Into<String>,
        task_id: impl Into<String>,
        repo_url: Option<String>,
    ) -> Self {
        let mut session = Self::new(id.into(), name.into(), SessionStatus::Waiting);
        session.task_id = Some(task_id.into());
        session.repo_url = repo_url;
        session.progress = Some(0);
        session
    }

    pub fn is_remote(&self) -> bool {
        self.task_id.is_some()
    }

    /// Record activity, never moving `last_activity` backwards
    pub fn touch(&mut self, timestamp: i64) {
        self.last_activity = self.last_activity.max(timestamp);
    }
}

/// Session snapshot shared between the registry and event handlers.
pub type SharedSessions = Arc<Mutex<Vec<ManagedSession>>>;
