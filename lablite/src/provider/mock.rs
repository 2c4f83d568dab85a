//! Scriptable in-memory provider used by the engine's tests.
//!
//! Behaves like a well-behaved runtime by default; individual operations
//! can be told to fail, and exec output can be scripted per command.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;

use super::{
    AttachHandle, ContainerInfo, ContainerProvider, ContainerStatus, CreateContainerOptions,
    ExecOptions, ExecResult, HealthStatus, ProviderError, ProviderResult,
};

#[derive(Default)]
struct MockState {
    next_id: u64,
    created: Vec<CreateContainerOptions>,
    stopped: Vec<String>,
    removed: Vec<String>,
    exec_log: Vec<Vec<String>>,
}

pub struct MockProvider {
    state: Mutex<MockState>,
    exec_responses: Mutex<HashMap<String, ExecResult>>,
    attach_output: Mutex<Vec<Vec<u8>>>,
    fail_create: bool,
    fail_exec: bool,
    fail_stop: bool,
    fail_remove: bool,
    create_delay: Option<Duration>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            exec_responses: Mutex::new(HashMap::new()),
            attach_output: Mutex::new(Vec::new()),
            fail_create: false,
            fail_exec: false,
            fail_stop: false,
            fail_remove: false,
            create_delay: None,
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_exec(mut self) -> Self {
        self.fail_exec = true;
        self
    }

    /// Make stop and remove fail, for teardown-path tests.
    pub fn failing_teardown(mut self) -> Self {
        self.fail_stop = true;
        self.fail_remove = true;
        self
    }

    /// Delay `create` to widen provisioning-race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Script the result for a given shell command (the `sh -c` argument).
    pub fn with_exec_response(self, command: &str, exit_code: i64, stdout: &str) -> Self {
        self.exec_responses.lock().unwrap().insert(
            command.to_string(),
            ExecResult {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
        self
    }

    /// Pre-load chunks for the attach output stream.
    pub fn with_attach_output(self, chunks: Vec<Vec<u8>>) -> Self {
        *self.attach_output.lock().unwrap() = chunks;
        self
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    pub fn created_options(&self) -> Vec<CreateContainerOptions> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn stopped_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().exec_log.clone()
    }
}

#[async_trait::async_trait]
impl ContainerProvider for MockProvider {
    async fn create(&self, options: CreateContainerOptions) -> ProviderResult<ContainerInfo> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create {
            return Err(ProviderError::Other("mock create failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("mock-container-{}", state.next_id);
        let name = options.name.clone();
        state.created.push(options);
        Ok(ContainerInfo {
            container_id: id,
            name,
            status: ContainerStatus::Running,
        })
    }

    async fn exec(
        &self,
        _container_id: &str,
        command: &[String],
        _options: ExecOptions,
    ) -> ProviderResult<ExecResult> {
        if self.fail_exec {
            return Err(ProviderError::Other("mock exec failure".into()));
        }
        self.state.lock().unwrap().exec_log.push(command.to_vec());
        // Commands arrive as ["sh", "-c", <command>]; script by the last arg.
        let key = command.last().cloned().unwrap_or_default();
        let scripted = self.exec_responses.lock().unwrap().get(&key).cloned();
        Ok(scripted.unwrap_or(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn attach(&self, _container_id: &str) -> ProviderResult<AttachHandle> {
        let chunks = std::mem::take(&mut *self.attach_output.lock().unwrap());
        let output = futures::stream::iter(chunks.into_iter().map(Ok)).boxed();
        let input = Box::pin(tokio::io::sink());
        Ok(AttachHandle::new(output, input, Box::new(|_, _| {})))
    }

    async fn stop(&self, container_id: &str, _timeout_secs: i64) -> ProviderResult<()> {
        if self.fail_stop {
            return Err(ProviderError::Other("mock stop failure".into()));
        }
        self.state.lock().unwrap().stopped.push(container_id.to_string());
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> ProviderResult<()> {
        if self.fail_remove {
            return Err(ProviderError::Other("mock remove failure".into()));
        }
        self.state.lock().unwrap().removed.push(container_id.to_string());
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            connected: true,
            version: Some("mock".into()),
            error: None,
        }
    }
}
