//! Session repository.
//!
//! The state machine talks to sessions through [`SessionStore`] so the
//! in-memory default can be swapped for a persistent store without touching
//! lifecycle logic. All mutations go through [`SessionStore::update`] under
//! the store's own lock; callers never hold references into the store.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use super::state::LabSession;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Per-user concurrency cap hit. Checked atomically with insertion.
    #[error("user already has {active} active session(s), limit is {limit}")]
    LimitReached { active: usize, limit: usize },
}

pub trait SessionStore: Send + Sync {
    /// Snapshot of a session by id.
    fn get(&self, id: &str) -> Option<LabSession>;

    /// Insert a new session, enforcing the per-user non-terminal cap in the
    /// same critical section so two concurrent creates cannot both pass.
    fn try_insert(&self, session: LabSession, max_active_per_user: usize)
    -> Result<(), StoreError>;

    /// Mutate a session in place under the store lock. Returns the updated
    /// snapshot, or `None` for an unknown id.
    fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut LabSession)) -> Option<LabSession>;

    /// Non-terminal sessions whose deadline has passed.
    fn list_expired(&self, now: DateTime<Utc>) -> Vec<LabSession>;

    /// Count of non-terminal sessions across all users.
    fn active_count(&self) -> usize;
}

/// Default single-process store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, LabSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, id: &str) -> Option<LabSession> {
        self.sessions.read().get(id).cloned()
    }

    fn try_insert(
        &self,
        session: LabSession,
        max_active_per_user: usize,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let active = sessions
            .values()
            .filter(|s| s.user_id == session.user_id && !s.status.is_terminal())
            .count();
        if active >= max_active_per_user {
            return Err(StoreError::LimitReached {
                active,
                limit: max_active_per_user,
            });
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut LabSession)) -> Option<LabSession> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        mutate(session);
        Some(session.clone())
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Vec<LabSession> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_expired(now))
            .cloned()
            .collect()
    }

    fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_lab_definition;
    use crate::session::state::SessionStatus;
    use chrono::Duration;
    use std::sync::Arc;

    fn session(id: &str, user: &str, status: SessionStatus) -> LabSession {
        let plan = compile_lab_definition(
            r#"
metadata:
  title: T
environment:
  image: alpine:3.20
steps:
  - title: S
    instructions: do it
    checks:
      - name: c
        command: "true"
        expected: ok
"#,
        )
        .unwrap();
        let now = Utc::now();
        LabSession {
            id: id.into(),
            user_id: user.into(),
            lab_definition_id: "lab-1".into(),
            plan: Arc::new(plan),
            status,
            current_step_index: 0,
            sandbox_id: None,
            expires_at: now + Duration::minutes(60),
            started_at: now,
            completed_at: None,
            destroyed_at: None,
        }
    }

    #[test]
    fn insert_enforces_per_user_cap_atomically() {
        let store = MemoryStore::new();
        store
            .try_insert(session("a", "u1", SessionStatus::Provisioning), 1)
            .unwrap();
        let err = store
            .try_insert(session("b", "u1", SessionStatus::Provisioning), 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::LimitReached { active: 1, limit: 1 }));
        // Rejected create leaves no record behind.
        assert!(store.get("b").is_none());
        // Other users are unaffected.
        store
            .try_insert(session("c", "u2", SessionStatus::Provisioning), 1)
            .unwrap();
    }

    #[test]
    fn terminal_sessions_free_the_slot() {
        let store = MemoryStore::new();
        store
            .try_insert(session("a", "u1", SessionStatus::Destroyed), 1)
            .unwrap();
        store
            .try_insert(session("b", "u1", SessionStatus::Provisioning), 1)
            .unwrap();
    }

    #[test]
    fn update_returns_snapshot() {
        let store = MemoryStore::new();
        store
            .try_insert(session("a", "u1", SessionStatus::Provisioning), 1)
            .unwrap();
        let updated = store
            .update("a", &mut |s| s.status = SessionStatus::Ready)
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Ready);
        assert!(store.update("missing", &mut |_| {}).is_none());
    }

    #[test]
    fn list_expired_skips_terminal_sessions() {
        let store = MemoryStore::new();
        let mut expired = session("a", "u1", SessionStatus::Running);
        expired.expires_at = Utc::now() - Duration::minutes(1);
        let mut done = session("b", "u2", SessionStatus::Destroyed);
        done.expires_at = Utc::now() - Duration::minutes(1);
        store.try_insert(expired, 1).unwrap();
        store.try_insert(done, 1).unwrap();

        let hits = store.list_expired(Utc::now());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn active_count_ignores_terminal() {
        let store = MemoryStore::new();
        store
            .try_insert(session("a", "u1", SessionStatus::Running), 1)
            .unwrap();
        store
            .try_insert(session("b", "u2", SessionStatus::Failed), 1)
            .unwrap();
        assert_eq!(store.active_count(), 1);
    }
}
