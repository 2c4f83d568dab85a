//! Session manager: owns every lifecycle transition.
//!
//! Creation returns immediately; sandbox provisioning happens in a spawned
//! task that reports back into the store. The store update is the only side
//! effect other readers can observe, so there is no partially-applied state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::state::{LabSession, SessionStatus};
use super::store::{SessionStore, StoreError};
use crate::compiler::LabDefinition;
use crate::provider::{ContainerProvider, CreateContainerOptions};
use crate::validator::{ValidationResult, run_validation};

/// Delay between READY and the RUNNING promotion. Decouples "container
/// process started" from "terminal attach is safe"; the engine exposes no
/// TTY-readiness probe to replace it with.
const PROMOTION_DELAY: Duration = Duration::from_secs(1);

/// Container label carrying the owning session id.
pub const SESSION_LABEL: &str = "lablite.session";
/// Container label carrying the owning user id.
pub const USER_LABEL: &str = "lablite.user";

#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions_per_user: usize,
    pub default_ttl_minutes: u32,
    pub max_ttl_minutes: u32,
}

/// Per-session environment overrides supplied at creation time.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub ttl_minutes: Option<u32>,
    pub network_mode: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("user {user_id} already has {active} active session(s), limit is {limit}")]
    LimitReached {
        user_id: String,
        active: usize,
        limit: usize,
    },
    #[error("no session found with id {0}")]
    NotFound(String),
    #[error("session {id} is in {status} state")]
    NotRunning { id: String, status: SessionStatus },
    #[error("step index {index} out of range (0-{last})")]
    InvalidStep { index: usize, last: usize },
}

impl SessionError {
    /// Stable machine-readable code for the API surface.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::LimitReached { .. } => "SESSION_LIMIT_REACHED",
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
            SessionError::NotRunning { .. } => "SESSION_NOT_RUNNING",
            SessionError::InvalidStep { .. } => "INVALID_STEP",
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn ContainerProvider>,
    limits: SessionLimits,
    promotion_delay: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ContainerProvider>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            store,
            provider,
            limits,
            promotion_delay: PROMOTION_DELAY,
        }
    }

    /// Shorten the READY→RUNNING promotion delay (tests).
    pub fn with_promotion_delay(mut self, delay: Duration) -> Self {
        self.promotion_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn ContainerProvider> {
        &self.provider
    }

    /// Non-terminal session count, for the health surface.
    pub fn active_sessions(&self) -> usize {
        self.store.active_count()
    }

    /// Create a session and kick off sandbox provisioning in the background.
    ///
    /// Returns the freshly inserted PROVISIONING record; callers observe
    /// progress through the event feed or by polling the session.
    pub fn create_session(
        &self,
        user_id: &str,
        lab_definition_id: &str,
        plan: LabDefinition,
        env: EnvConfig,
    ) -> Result<LabSession, SessionError> {
        let ttl_minutes = env
            .ttl_minutes
            .unwrap_or(self.limits.default_ttl_minutes)
            .clamp(1, self.limits.max_ttl_minutes);

        let id = generate_session_id();
        let now = Utc::now();
        let session = LabSession {
            id: id.clone(),
            user_id: user_id.to_string(),
            lab_definition_id: lab_definition_id.to_string(),
            plan: Arc::new(plan),
            status: SessionStatus::Provisioning,
            current_step_index: 0,
            sandbox_id: None,
            expires_at: now + chrono::Duration::minutes(i64::from(ttl_minutes)),
            started_at: now,
            completed_at: None,
            destroyed_at: None,
        };

        self.store
            .try_insert(session.clone(), self.limits.max_sessions_per_user)
            .map_err(|StoreError::LimitReached { active, limit }| SessionError::LimitReached {
                user_id: user_id.to_string(),
                active,
                limit,
            })?;

        info!(session_id = %id, user_id, lab_definition_id, "lab session created");
        self.spawn_provisioning(&session, env);

        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<LabSession, SessionError> {
        self.store
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Destroy a session: best-effort sandbox removal, then an unconditional
    /// terminal transition. The record must reach DESTROYED even when the
    /// runtime teardown fails, otherwise a stuck session would hold the
    /// user's concurrency slot forever.
    pub async fn destroy_session(&self, id: &str) -> Result<LabSession, SessionError> {
        let session = self.get_session(id)?;

        if let Some(sandbox_id) = &session.sandbox_id {
            if let Err(error) = self.provider.remove(sandbox_id, true).await {
                warn!(session_id = %id, sandbox_id = %sandbox_id, %error,
                    "sandbox removal failed during destroy");
            }
        }

        let updated = self
            .store
            .update(id, &mut |s| {
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Destroyed;
                    s.destroyed_at = Some(Utc::now());
                }
            })
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        info!(session_id = %id, "lab session destroyed");
        Ok(updated)
    }

    /// Validate one step of a RUNNING session and apply the resulting
    /// transition. Blocks until all checks finish or time out; independent
    /// sessions validate concurrently since no lock is held across the
    /// sandbox calls.
    pub async fn validate_step(
        &self,
        id: &str,
        requested_step: Option<usize>,
    ) -> Result<ValidationResult, SessionError> {
        let session = self.get_session(id)?;

        let Some(sandbox_id) = session.sandbox_id.clone() else {
            return Err(SessionError::NotRunning {
                id: id.to_string(),
                status: session.status,
            });
        };
        if session.status != SessionStatus::Running {
            return Err(SessionError::NotRunning {
                id: id.to_string(),
                status: session.status,
            });
        }

        let total_steps = session.plan.steps.len();
        let step_index = requested_step.unwrap_or(session.current_step_index);
        if step_index >= total_steps {
            return Err(SessionError::InvalidStep {
                index: step_index,
                last: total_steps - 1,
            });
        }

        // Flip to VALIDATING under the store lock; a concurrent destroy or
        // janitor sweep wins the race and fails this call cleanly.
        let mut flipped = false;
        let current = self
            .store
            .update(id, &mut |s| {
                if s.status == SessionStatus::Running {
                    s.status = SessionStatus::Validating;
                    flipped = true;
                }
            })
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if !flipped {
            return Err(SessionError::NotRunning {
                id: id.to_string(),
                status: current.status,
            });
        }

        let checks = &session.plan.steps[step_index].checks;
        let result =
            run_validation(self.provider.as_ref(), &sandbox_id, step_index, checks, total_steps)
                .await;

        self.store.update(id, &mut |s| {
            // A terminal transition while validating (destroy/expiry) wins.
            if s.status != SessionStatus::Validating {
                return;
            }
            if result.passed {
                match result.advanced_to_step {
                    Some(next) => {
                        s.current_step_index = next;
                        s.status = SessionStatus::Running;
                    }
                    None => {
                        s.status = SessionStatus::Completed;
                        s.completed_at = Some(Utc::now());
                        info!(session_id = %s.id, "lab completed");
                    }
                }
            } else {
                s.status = SessionStatus::Running;
            }
        });

        Ok(result)
    }

    fn spawn_provisioning(&self, session: &LabSession, env: EnvConfig) {
        let store = Arc::clone(&self.store);
        let provider = Arc::clone(&self.provider);
        let promotion_delay = self.promotion_delay;
        let id = session.id.clone();
        let user_id = session.user_id.clone();
        let plan_env = session.plan.environment.clone();

        tokio::spawn(async move {
            let labels: HashMap<String, String> = HashMap::from([
                (SESSION_LABEL.to_string(), id.clone()),
                (USER_LABEL.to_string(), user_id),
            ]);

            let created = provider
                .create(CreateContainerOptions {
                    image: env.image,
                    name: format!("lab-{id}"),
                    memory_limit: env.memory_limit,
                    cpu_limit: env.cpu_limit,
                    network_mode: env.network_mode,
                    env: plan_env.env,
                    labels: Some(labels),
                    working_dir: plan_env.working_dir,
                })
                .await;

            match created {
                Ok(info) => {
                    let mut bound = false;
                    store.update(&id, &mut |s| {
                        if s.status == SessionStatus::Provisioning {
                            s.sandbox_id = Some(info.container_id.clone());
                            s.status = SessionStatus::Ready;
                            bound = true;
                        }
                    });

                    if !bound {
                        // Destroyed or expired while provisioning: the record
                        // never saw the sandbox, so reclaim it here.
                        warn!(session_id = %id, sandbox_id = %info.container_id,
                            "session ended during provisioning, reclaiming sandbox");
                        let _ = provider.remove(&info.container_id, true).await;
                        return;
                    }

                    info!(session_id = %id, sandbox_id = %info.container_id, "sandbox ready");

                    tokio::time::sleep(promotion_delay).await;
                    store.update(&id, &mut |s| {
                        if s.status == SessionStatus::Ready {
                            s.status = SessionStatus::Running;
                        }
                    });
                }
                Err(error) => {
                    error!(session_id = %id, %error, "sandbox provisioning failed");
                    store.update(&id, &mut |s| {
                        if !s.status.is_terminal() {
                            s.status = SessionStatus::Failed;
                        }
                    });
                }
            }
        });
    }
}

fn generate_session_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("sess_{}", &raw[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_lab_definition;
    use crate::provider::MockProvider;
    use crate::session::store::MemoryStore;

    const PLAN_SOURCE: &str = r#"
metadata:
  title: Two step lab
environment:
  image: alpine:3.20
steps:
  - title: First
    instructions: make hello
    checks:
      - name: hello exists
        command: cat /tmp/hello
        expected: hello
  - title: Second
    instructions: make done
    checks:
      - name: done exists
        command: cat /tmp/done
        expected: done
"#;

    fn plan() -> LabDefinition {
        compile_lab_definition(PLAN_SOURCE).unwrap()
    }

    fn env() -> EnvConfig {
        EnvConfig {
            image: "alpine:3.20".into(),
            memory_limit: "512m".into(),
            cpu_limit: "1.0".into(),
            ttl_minutes: Some(60),
            network_mode: "none".into(),
        }
    }

    fn limits() -> SessionLimits {
        SessionLimits {
            max_sessions_per_user: 1,
            default_ttl_minutes: 60,
            max_ttl_minutes: 120,
        }
    }

    fn manager(provider: MockProvider) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(provider),
            limits(),
        )
        .with_promotion_delay(Duration::from_millis(20))
    }

    async fn wait_for_status(m: &SessionManager, id: &str, status: SessionStatus) {
        for _ in 0..200 {
            if m.get_session(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "session {id} never reached {status}, still {}",
            m.get_session(id).unwrap().status
        );
    }

    #[tokio::test]
    async fn fresh_session_is_provisioning_with_no_sandbox() {
        let m = manager(MockProvider::new().with_create_delay(Duration::from_millis(200)));
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        assert_eq!(s.status, SessionStatus::Provisioning);
        assert!(s.sandbox_id.is_none());
        assert_eq!(s.current_step_index, 0);
        assert!(s.id.starts_with("sess_"));
    }

    #[tokio::test]
    async fn session_reaches_running_after_promotion() {
        let m = manager(MockProvider::new());
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();

        wait_for_status(&m, &s.id, SessionStatus::Running).await;
        let running = m.get_session(&s.id).unwrap();
        assert!(running.sandbox_id.is_some());
    }

    #[tokio::test]
    async fn second_create_for_same_user_hits_the_limit() {
        let m = manager(MockProvider::new());
        m.create_session("u1", "lab-1", plan(), env()).unwrap();
        let err = m.create_session("u1", "lab-2", plan(), env()).unwrap_err();
        assert_eq!(err.code(), "SESSION_LIMIT_REACHED");
        // Other users still get a slot.
        m.create_session("u2", "lab-1", plan(), env()).unwrap();
    }

    #[tokio::test]
    async fn failed_provisioning_flips_to_failed() {
        let m = manager(MockProvider::new().failing_create());
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();

        wait_for_status(&m, &s.id, SessionStatus::Failed).await;
        assert!(m.get_session(&s.id).unwrap().sandbox_id.is_none());
    }

    #[tokio::test]
    async fn destroy_reaches_terminal_even_when_teardown_fails() {
        let m = manager(MockProvider::new().failing_teardown());
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        wait_for_status(&m, &s.id, SessionStatus::Running).await;

        let destroyed = m.destroy_session(&s.id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Destroyed);
        assert!(destroyed.destroyed_at.is_some());
    }

    #[tokio::test]
    async fn destroy_frees_the_concurrency_slot() {
        let m = manager(MockProvider::new());
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        wait_for_status(&m, &s.id, SessionStatus::Running).await;
        m.destroy_session(&s.id).await.unwrap();

        m.create_session("u1", "lab-2", plan(), env()).unwrap();
    }

    #[tokio::test]
    async fn destroy_unknown_session_is_not_found() {
        let m = manager(MockProvider::new());
        let err = m.destroy_session("sess_missing").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn destroy_during_provisioning_reclaims_the_sandbox() {
        let provider = MockProvider::new().with_create_delay(Duration::from_millis(50));
        let m = manager(provider);
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();

        let destroyed = m.destroy_session(&s.id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Destroyed);

        // Let the provisioning task finish and reclaim.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = m.get_session(&s.id).unwrap();
        assert_eq!(after.status, SessionStatus::Destroyed);
        assert!(after.sandbox_id.is_none());
    }

    #[tokio::test]
    async fn validate_advances_then_completes() {
        let provider = MockProvider::new()
            .with_exec_response("cat /tmp/hello", 0, "hello")
            .with_exec_response("cat /tmp/done", 0, "done");
        let m = manager(provider);
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        wait_for_status(&m, &s.id, SessionStatus::Running).await;

        let first = m.validate_step(&s.id, None).await.unwrap();
        assert!(first.passed);
        assert_eq!(first.advanced_to_step, Some(1));
        let mid = m.get_session(&s.id).unwrap();
        assert_eq!(mid.current_step_index, 1);
        assert_eq!(mid.status, SessionStatus::Running);

        let second = m.validate_step(&s.id, None).await.unwrap();
        assert!(second.passed);
        assert_eq!(second.advanced_to_step, None);
        let done = m.get_session(&s.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_validation_returns_to_running() {
        let provider = MockProvider::new().with_exec_response("cat /tmp/hello", 1, "");
        let m = manager(provider);
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        wait_for_status(&m, &s.id, SessionStatus::Running).await;

        let result = m.validate_step(&s.id, None).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.advanced_to_step, None);
        let after = m.get_session(&s.id).unwrap();
        assert_eq!(after.status, SessionStatus::Running);
        assert_eq!(after.current_step_index, 0);
    }

    #[tokio::test]
    async fn validate_rejects_non_running_session() {
        let m = manager(MockProvider::new().with_create_delay(Duration::from_millis(200)));
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        let err = m.validate_step(&s.id, None).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_RUNNING");
    }

    #[tokio::test]
    async fn validate_rejects_out_of_range_step() {
        let m = manager(MockProvider::new());
        let s = m.create_session("u1", "lab-1", plan(), env()).unwrap();
        wait_for_status(&m, &s.id, SessionStatus::Running).await;

        let err = m.validate_step(&s.id, Some(7)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STEP");
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_the_configured_max() {
        let m = manager(MockProvider::new());
        let mut e = env();
        e.ttl_minutes = Some(10_000);
        let s = m.create_session("u1", "lab-1", plan(), e).unwrap();
        let max = s.started_at + chrono::Duration::minutes(120);
        assert!(s.expires_at <= max);
    }
}
