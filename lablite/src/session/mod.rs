//! Session lifecycle: state machine, repository, and manager.

pub mod manager;
pub mod state;
pub mod store;

pub use manager::{EnvConfig, SessionError, SessionLimits, SessionManager};
pub use state::{LabSession, SessionStatus};
pub use store::{MemoryStore, SessionStore, StoreError};
