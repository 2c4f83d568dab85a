//! Container runtime abstraction.
//!
//! The session engine never talks to a container engine directly; it goes
//! through [`ContainerProvider`]. Docker is the one concrete backend
//! ([`docker::DockerProvider`]); [`mock::MockProvider`] is the scriptable
//! test double used across the engine's tests.
//!
//! Callers must treat any provider failure as "sandbox state unknown" and
//! never assume cleanup already happened.

pub mod docker;
pub mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use docker::DockerProvider;
pub use mock::MockProvider;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Could not reach the runtime daemon at all.
    #[error("runtime connection failed: {0}")]
    Connect(String),
    /// The runtime accepted the request and returned an error.
    #[error("container runtime error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("{0}")]
    Other(String),
}

/// Options for creating a long-lived interactive sandbox container.
#[derive(Debug, Clone)]
pub struct CreateContainerOptions {
    pub image: String,
    pub name: String,
    /// String form with optional k/m/g suffix, e.g. "512m".
    pub memory_limit: String,
    /// Decimal core count, e.g. "1.0".
    pub cpu_limit: String,
    /// "none", "internal", or a runtime-specific mode.
    pub network_mode: String,
    pub env: Option<HashMap<String, String>>,
    pub labels: Option<HashMap<String, String>>,
    pub working_dir: Option<String>,
}

/// Coarse container status as tracked by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
}

/// Provider-owned view of a container. The session engine holds only the
/// `container_id` as a foreign reference.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    pub name: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Hard wall-clock bound; the exec is torn down when exceeded.
    pub timeout_ms: u64,
    pub working_dir: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    /// -1 when the exec timed out or the runtime reported no code.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Full-duplex channel bound to a sandbox's TTY.
pub struct AttachHandle {
    /// Raw output chunks from the sandbox.
    pub output: BoxStream<'static, ProviderResult<Vec<u8>>>,
    /// Writer connected to the sandbox's stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    resize_fn: Box<dyn Fn(u16, u16) + Send + Sync>,
}

impl AttachHandle {
    pub fn new(
        output: BoxStream<'static, ProviderResult<Vec<u8>>>,
        input: Pin<Box<dyn AsyncWrite + Send>>,
        resize_fn: Box<dyn Fn(u16, u16) + Send + Sync>,
    ) -> Self {
        Self {
            output,
            input,
            resize_fn,
        }
    }

    /// Resize the attached TTY. Fire-and-forget; resize failures are not
    /// interesting to the caller.
    pub fn resize(&self, cols: u16, rows: u16) {
        (self.resize_fn)(cols, rows)
    }

    /// Take the handle apart so the output pump, the input writer, and the
    /// resize hook can live on different tasks.
    pub fn split(
        self,
    ) -> (
        BoxStream<'static, ProviderResult<Vec<u8>>>,
        Pin<Box<dyn AsyncWrite + Send>>,
        Box<dyn Fn(u16, u16) + Send + Sync>,
    ) {
        (self.output, self.input, self.resize_fn)
    }
}

/// Liveness probe result for the runtime daemon.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Narrow seam over a container runtime.
///
/// `stop` and `remove` are idempotent: calling them on an already
/// stopped/removed container is success, not an error.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Create and start a long-lived interactive container.
    async fn create(&self, options: CreateContainerOptions) -> ProviderResult<ContainerInfo>;

    /// Run a one-shot command inside the sandbox and capture its output.
    /// Enforces `options.timeout_ms` by tearing the exec down and returning
    /// exit code -1 with a `[timeout]` marker appended to stdout.
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        options: ExecOptions,
    ) -> ProviderResult<ExecResult>;

    /// Bind a duplex channel to the sandbox's TTY.
    async fn attach(&self, container_id: &str) -> ProviderResult<AttachHandle>;

    /// Stop the container, allowing `timeout_secs` for a graceful exit.
    async fn stop(&self, container_id: &str, timeout_secs: i64) -> ProviderResult<()>;

    /// Remove the container (force skips the graceful stop).
    async fn remove(&self, container_id: &str, force: bool) -> ProviderResult<()>;

    /// Probe the runtime daemon.
    async fn health_check(&self) -> HealthStatus;
}
