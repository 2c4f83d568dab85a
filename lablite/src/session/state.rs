//! Session lifecycle states and the per-attempt session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::compiler::LabDefinition;

/// Lab session lifecycle status.
///
/// ```text
/// PROVISIONING → READY → RUNNING ⇄ VALIDATING
///                                   → COMPLETED | EXPIRED | FAILED | DESTROYED
/// ```
///
/// Terminal states are final: no operation transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Provisioning,
    Ready,
    Running,
    Validating,
    Completed,
    Expired,
    Failed,
    Destroyed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Expired
                | SessionStatus::Failed
                | SessionStatus::Destroyed
        )
    }

    /// Whether a terminal channel may bind to a session in this state.
    pub fn terminal_attachable(self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Provisioning => "PROVISIONING",
            SessionStatus::Ready => "READY",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Validating => "VALIDATING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

/// Authoritative in-memory record for one lab attempt.
///
/// `current_step_index` is always a valid index into `plan.steps` while the
/// session is non-terminal. `sandbox_id` stays `None` until provisioning
/// completes (and stays `None` forever if provisioning fails).
#[derive(Debug, Clone)]
pub struct LabSession {
    pub id: String,
    pub user_id: String,
    pub lab_definition_id: String,
    pub plan: Arc<LabDefinition>,
    pub status: SessionStatus,
    pub current_step_index: usize,
    pub sandbox_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl LabSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at < now
    }
}
