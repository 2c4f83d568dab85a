//! Docker backend for [`ContainerProvider`], speaking to a local
//! Docker-compatible engine over its unix socket.

use std::time::Duration;

use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder,
    ResizeContainerTTYOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    AttachHandle, ContainerInfo, ContainerProvider, ContainerStatus, CreateContainerOptions,
    ExecOptions, ExecResult, HealthStatus, ProviderError, ProviderResult,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Linux capabilities retained by sandbox containers. Everything else is
/// dropped, and no-new-privileges is set.
const ALLOWED_CAPABILITIES: &[&str] = &[
    "CHOWN",
    "SETUID",
    "SETGID",
    "DAC_OVERRIDE",
    "FOWNER",
    "NET_RAW",
];

pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connect to the engine over the given unix socket path.
    pub fn connect(socket_path: &str) -> ProviderResult<Self> {
        let docker = Docker::connect_with_socket(socket_path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl ContainerProvider for DockerProvider {
    async fn create(&self, options: CreateContainerOptions) -> ProviderResult<ContainerInfo> {
        info!(image = %options.image, name = %options.name, "creating sandbox container");

        let env = options
            .env
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>());

        let body = ContainerCreateBody {
            image: Some(options.image.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            working_dir: Some(
                options
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| DEFAULT_WORKING_DIR.into()),
            ),
            env,
            labels: options.labels.clone(),
            host_config: Some(HostConfig {
                memory: Some(parse_memory_limit(&options.memory_limit)),
                nano_cpus: Some(parse_cpu_limit(&options.cpu_limit)),
                network_mode: Some(resolve_network_mode(&options.network_mode)),
                security_opt: Some(vec!["no-new-privileges".into()]),
                cap_drop: Some(vec!["ALL".into()]),
                cap_add: Some(ALLOWED_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&options.name).build()),
                body,
            )
            .await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;

        info!(container_id = %created.id, "sandbox container started");

        Ok(ContainerInfo {
            container_id: created.id,
            name: options.name,
            status: ContainerStatus::Running,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        options: ExecOptions,
    ) -> ProviderResult<ExecResult> {
        let env = options
            .env
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>());

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: options.working_dir.clone(),
                    env,
                    ..Default::default()
                },
            )
            .await?;

        let mut output = match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ProviderError::Other("exec started detached".into()));
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        let drained = tokio::time::timeout(Duration::from_millis(options.timeout_ms), async {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(ProviderError::from(e)),
                }
            }
            Ok(())
        })
        .await;

        match drained {
            Ok(Ok(())) => {
                let inspected = self.docker.inspect_exec(&exec.id).await?;
                Ok(ExecResult {
                    exit_code: inspected.exit_code.unwrap_or(-1),
                    stdout: stdout.trim().to_string(),
                    stderr: stderr.trim().to_string(),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                // Dropping the output stream tears down the hijacked exec
                // connection; the caller must never hang on a stuck check.
                warn!(container_id, timeout_ms = options.timeout_ms, "exec timed out");
                stdout.push_str("\n[timeout]");
                Ok(ExecResult {
                    exit_code: -1,
                    stdout,
                    stderr,
                })
            }
        }
    }

    async fn attach(&self, container_id: &str) -> ProviderResult<AttachHandle> {
        let results = self
            .docker
            .attach_container(
                container_id,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stream(true)
                        .stdin(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .await?;

        let output = results
            .output
            .map(|chunk| {
                chunk
                    .map(|log| log.into_bytes().to_vec())
                    .map_err(ProviderError::from)
            })
            .boxed();

        let docker = self.docker.clone();
        let id = container_id.to_string();
        let resize_fn = Box::new(move |cols: u16, rows: u16| {
            let docker = docker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let opts = ResizeContainerTTYOptionsBuilder::new()
                    .w(cols as i32)
                    .h(rows as i32)
                    .build();
                if let Err(e) = docker.resize_container_tty(&id, opts).await {
                    debug!(container_id = %id, error = %e, "tty resize failed");
                }
            });
        });

        Ok(AttachHandle::new(output, results.input, resize_fn))
    }

    async fn stop(&self, container_id: &str, timeout_secs: i64) -> ProviderResult<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(timeout_secs as i32).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> ProviderResult<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(force)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        match self.docker.version().await {
            Ok(version) => HealthStatus {
                connected: true,
                version: version.version,
                error: None,
            },
            Err(e) => HealthStatus {
                connected: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// 304 (already stopped) and 404 (already removed) make stop/remove
/// idempotent.
fn is_already_gone(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. }
            if *status_code == 304 || *status_code == 404
    )
}

/// Parse a memory limit string ("512m", "2G", "1024k") into bytes.
/// Unrecognized input falls back to 512 MiB.
fn parse_memory_limit(limit: &str) -> i64 {
    const DEFAULT: i64 = 512 * 1024 * 1024;

    let trimmed = limit.trim();
    let (digits, suffix) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };

    let Ok(value) = digits.parse::<i64>() else {
        return DEFAULT;
    };

    match suffix.to_ascii_lowercase().as_str() {
        "k" => value * 1024,
        "m" => value * 1024 * 1024,
        "g" => value * 1024 * 1024 * 1024,
        "" => value,
        _ => DEFAULT,
    }
}

/// Convert a decimal core count ("1.0", "0.5") into the engine's
/// nano-CPU unit.
fn parse_cpu_limit(limit: &str) -> i64 {
    let cores: f64 = limit.trim().parse().unwrap_or(1.0);
    (cores * 1e9) as i64
}

/// "internal" labs get no network at all; other values pass through.
fn resolve_network_mode(mode: &str) -> String {
    if mode == "internal" {
        "none".to_string()
    } else {
        mode.to_string()
    }
}
