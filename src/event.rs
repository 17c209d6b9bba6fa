//! Agent lifecycle events
//!
//! These events are decoded by the transport layer (hook relay, WebSocket
//! bridge, etc.) and handed to the [`EventDispatcher`](crate::dispatcher::EventDispatcher).
//! The wire format is JSON with a `type` discriminant and camelCase fields.

use crate::SessionStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Discriminant of a [`LifecycleEvent`], used to key dispatcher handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Notification,
    Stop,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::SessionStart,
        EventType::SessionEnd,
        EventType::UserPromptSubmit,
        EventType::PreToolUse,
        EventType::PostToolUse,
        EventType::Notification,
        EventType::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::UserPromptSubmit => "user_prompt_submit",
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::Notification => "notification",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a notification event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// A lifecycle event emitted by a coding agent.
///
/// Events are immutable once constructed; handlers only ever see `&LifecycleEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    /// Agent session started
    SessionStart {
        timestamp: i64,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Agent session ended
    SessionEnd {
        timestamp: i64,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// User submitted a prompt
    UserPromptSubmit {
        timestamp: i64,
        session_id: String,
        #[serde(default)]
        prompt: String,
    },
    /// Tool execution about to start
    PreToolUse {
        timestamp: i64,
        session_id: String,
        tool: String,
        tool_use_id: String,
        #[serde(default)]
        input: Value,
    },
    /// Tool execution finished
    PostToolUse {
        timestamp: i64,
        session_id: String,
        tool: String,
        tool_use_id: String,
        #[serde(default = "default_success")]
        success: bool,
        /// Execution time in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    /// Agent notification (permission prompt, idle prompt, info)
    Notification {
        timestamp: i64,
        session_id: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        level: NotificationLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notification_type: Option<String>,
    },
    /// Agent finished its turn
    Stop {
        timestamp: i64,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

fn default_success() -> bool {
    true
}

/// Notification types that block the agent until a human responds
const INPUT_NOTIFICATION_TYPES: &[&str] = &["permission_prompt", "idle_prompt"];

impl LifecycleEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SessionStart { .. } => EventType::SessionStart,
            Self::SessionEnd { .. } => EventType::SessionEnd,
            Self::UserPromptSubmit { .. } => EventType::UserPromptSubmit,
            Self::PreToolUse { .. } => EventType::PreToolUse,
            Self::PostToolUse { .. } => EventType::PostToolUse,
            Self::Notification { .. } => EventType::Notification,
            Self::Stop { .. } => EventType::Stop,
        }
    }

    /// Get session_id from any event
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::SessionEnd { session_id, .. }
            | Self::UserPromptSubmit { session_id, .. }
            | Self::PreToolUse { session_id, .. }
            | Self::PostToolUse { session_id, .. }
            | Self::Notification { session_id, .. }
            | Self::Stop { session_id, .. } => session_id,
        }
    }

    /// Epoch milliseconds at which the agent produced the event
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::SessionStart { timestamp, .. }
            | Self::SessionEnd { timestamp, .. }
            | Self::UserPromptSubmit { timestamp, .. }
            | Self::PreToolUse { timestamp, .. }
            | Self::PostToolUse { timestamp, .. }
            | Self::Notification { timestamp, .. }
            | Self::Stop { timestamp, .. } => *timestamp,
        }
    }

    /// True for notifications that ask the user for permission or input.
    ///
    /// Typed notifications are matched on `notificationType`; untyped ones
    /// fall back to the message text.
    pub fn requires_input(&self) -> bool {
        let Self::Notification {
            message,
            notification_type,
            ..
        } = self
        else {
            return false;
        };

        match notification_type.as_deref() {
            Some(kind) => INPUT_NOTIFICATION_TYPES.contains(&kind),
            None => {
                let message = message.to_lowercase();
                message.contains("permission") || message.contains("waiting for your input")
            }
        }
    }
}

/// Status of a remote (cloud) task backing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl RemoteTaskStatus {
    /// Session status a remote task in this state maps to
    pub fn session_status(&self) -> SessionStatus {
        match self {
            Self::Pending => SessionStatus::Waiting,
            Self::Running => SessionStatus::Working,
            Self::Completed => SessionStatus::Idle,
            Self::Failed => SessionStatus::Attention,
            Self::Stopped | Self::Cancelled => SessionStatus::Offline,
        }
    }
}
