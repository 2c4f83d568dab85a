//! Lablite: short-lived sandboxed lab sessions for guided exercises.
//!
//! The engine compiles declarative lab definitions into execution plans,
//! provisions one isolated container per session, validates step progress by
//! running checks inside the sandbox, and reaps sessions at their TTL.
//!
//! The HTTP/WS surface lives in the `lablite-server` crate; this crate is the
//! engine and holds no transport code.

pub mod compiler;
pub mod config;
pub mod janitor;
pub mod provider;
pub mod sanitizer;
pub mod session;
pub mod validator;

pub use compiler::{
    CompileDefaults, CompileError, LabDefinition, compile_lab_definition, compile_with_defaults,
};
pub use config::{Config, ConfigError};
pub use janitor::Janitor;
pub use provider::{ContainerProvider, DockerProvider, MockProvider, ProviderError};
pub use session::{
    EnvConfig, LabSession, MemoryStore, SessionError, SessionLimits, SessionManager,
    SessionStatus, SessionStore,
};
pub use validator::{CheckResult, ValidationResult, run_validation};
