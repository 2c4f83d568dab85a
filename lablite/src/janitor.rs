//! Expiry janitor.
//!
//! Periodically sweeps the store for sessions past their deadline, tears
//! down their sandboxes best-effort, and marks them EXPIRED. The record
//! transition is unconditional for non-terminal sessions: an unreachable
//! runtime must not keep an expired session pinned as active.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::ContainerProvider;
use crate::session::{SessionStatus, SessionStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STOP_TIMEOUT_SECS: i64 = 5;

pub struct Janitor {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn ContainerProvider>,
    interval: Duration,
}

impl Janitor {
    pub fn new(store: Arc<dyn SessionStore>, provider: Arc<dyn ContainerProvider>) -> Self {
        Self {
            store,
            provider,
            interval: SWEEP_INTERVAL,
        }
    }

    /// Override the sweep interval (tests).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the sweep loop until the token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_once().await,
                    _ = shutdown.cancelled() => {
                        debug!("janitor shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// One sweep pass over the store.
    pub async fn sweep_once(&self) {
        let expired = self.store.list_expired(Utc::now());
        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "sweeping expired sessions");

        for session in expired {
            if let Some(sandbox_id) = &session.sandbox_id {
                if let Err(error) = self.provider.stop(sandbox_id, STOP_TIMEOUT_SECS).await {
                    warn!(session_id = %session.id, sandbox_id = %sandbox_id, %error,
                        "stop failed while expiring session");
                }
                if let Err(error) = self.provider.remove(sandbox_id, true).await {
                    warn!(session_id = %session.id, sandbox_id = %sandbox_id, %error,
                        "remove failed while expiring session");
                }
            }

            self.store.update(&session.id, &mut |s| {
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Expired;
                    s.destroyed_at = Some(Utc::now());
                }
            });
            info!(session_id = %session.id, "session expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_lab_definition;
    use crate::provider::MockProvider;
    use crate::session::{LabSession, MemoryStore};
    use chrono::Duration as ChronoDuration;

    fn expired_session(id: &str, sandbox_id: Option<&str>) -> LabSession {
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
            user_id: "u1".into(),
            lab_definition_id: "lab-1".into(),
            plan: Arc::new(plan),
            status: SessionStatus::Running,
            current_step_index: 0,
            sandbox_id: sandbox_id.map(String::from),
            expires_at: now - ChronoDuration::minutes(1),
            started_at: now - ChronoDuration::minutes(61),
            completed_at: None,
            destroyed_at: None,
        }
    }

    #[tokio::test]
    async fn sweep_expires_and_tears_down() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        store
            .try_insert(expired_session("a", Some("sbx-a")), 10)
            .unwrap();

        let janitor = Janitor::new(store.clone(), provider.clone());
        janitor.sweep_once().await;

        let after = store.get("a").unwrap();
        assert_eq!(after.status, SessionStatus::Expired);
        assert!(after.destroyed_at.is_some());
        assert_eq!(provider.stopped_ids(), vec!["sbx-a"]);
        assert_eq!(provider.removed_ids(), vec!["sbx-a"]);
    }

    #[tokio::test]
    async fn sweep_marks_expired_even_when_teardown_fails() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new().failing_teardown());
        store
            .try_insert(expired_session("a", Some("sbx-a")), 10)
            .unwrap();

        Janitor::new(store.clone(), provider).sweep_once().await;

        assert_eq!(store.get("a").unwrap().status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_handles_sessions_without_a_sandbox() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        store.try_insert(expired_session("a", None), 10).unwrap();

        Janitor::new(store.clone(), provider.clone()).sweep_once().await;

        assert_eq!(store.get("a").unwrap().status, SessionStatus::Expired);
        assert!(provider.removed_ids().is_empty());
    }

    #[tokio::test]
    async fn sweep_ignores_live_sessions() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let mut live = expired_session("a", Some("sbx-a"));
        live.expires_at = Utc::now() + ChronoDuration::minutes(30);
        store.try_insert(live, 10).unwrap();

        Janitor::new(store.clone(), provider.clone()).sweep_once().await;

        assert_eq!(store.get("a").unwrap().status, SessionStatus::Running);
        assert!(provider.removed_ids().is_empty());
    }
}
