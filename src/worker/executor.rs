use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{SandboxConfig, ServiceConfig};
use crate::request::{PayloadRef, Settings};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Invocation failed: {0}")]
    Failed(String),

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    /// The runtime is unusable; the worker holding it must be discarded.
    #[error("Runtime failed unrecoverably: {0}")]
    Unrecoverable(String),
}

impl InvokeError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, InvokeError::Unrecoverable(_))
    }
}

/// Runs one transformation: payload handle and settings in, payload handle out.
///
/// Backed by a local worker's runtime or by a remote service; callers cannot
/// tell which.
#[async_trait]
pub trait InferenceInvoker: Send + Sync {
    async fn invoke(
        &self,
        service_id: &str,
        payload: &PayloadRef,
        settings: &Settings,
    ) -> Result<PayloadRef, InvokeError>;
}

/// Performs the expensive model/runtime load a worker does on first use.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, service: &ServiceConfig) -> Result<Arc<dyn InferenceInvoker>, InvokeError>;
}

/// Run a child process and collect its output.
///
/// The child is killed when the returned future is dropped, so a step
/// abandoned on timeout or cancellation does not leave a container running.
async fn run_to_completion(mut command: Command) -> std::io::Result<std::process::Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command.spawn()?.wait_with_output().await
}

/// Loads services as container images.
///
/// Loading checks that the image is present; the returned runtime executes
/// one sandboxed container per invocation with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct ContainerLoader {
    config: SandboxConfig,
}

impl ContainerLoader {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModelLoader for ContainerLoader {
    async fn load(&self, service: &ServiceConfig) -> Result<Arc<dyn InferenceInvoker>, InvokeError> {
        let image = service
            .image
            .clone()
            .unwrap_or_else(|| self.config.image.clone());
        tracing::info!(service = %service.id, image = %image, "Loading container runtime");

        let mut inspect = Command::new(&self.config.runtime);
        inspect.args(["image", "inspect", "--format", "{{.Id}}", &image]);
        let output = run_to_completion(inspect)
            .await
            .map_err(|e| InvokeError::Failed(format!("{} unavailable: {}", self.config.runtime, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InvokeError::Failed(format!(
                "image {} not available: {}",
                image, stderr
            )));
        }

        Ok(Arc::new(ContainerRuntime {
            config: self.config.clone(),
            image,
            model: service.model.clone(),
        }))
    }
}

/// A loaded container image for one service.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    config: SandboxConfig,
    image: String,
    model: String,
}

impl ContainerRuntime {
    fn build_args(&self, service_id: &str, payload: &PayloadRef, settings_json: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push("-e".to_string());
        args.push(format!("PIXEL_SERVICE={}", service_id));
        args.push("-e".to_string());
        args.push(format!("PIXEL_MODEL={}", self.model));

        args.push(self.image.clone());
        args.push(payload.as_str().to_string());
        args.push(settings_json.to_string());
        args
    }

    /// Map the container's exit into an output handle.
    ///
    /// Exit code 0 with a non-empty first stdout line is success. A
    /// container killed by a signal (no exit code) or failing to spawn
    /// leaves the runtime in an unknown state.
    pub fn parse_output(
        result: std::io::Result<std::process::Output>,
    ) -> Result<PayloadRef, InvokeError> {
        let output = result.map_err(|e| InvokeError::Unrecoverable(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                Some(handle) => Ok(PayloadRef::new(handle)),
                None => Err(InvokeError::Failed("runtime produced no output handle".into())),
            },
            Some(code) => Err(InvokeError::Failed(if stderr.is_empty() {
                format!("Exit code: {}", code)
            } else {
                stderr
            })),
            None => Err(InvokeError::Unrecoverable(
                "runtime terminated by signal".to_string(),
            )),
        }
    }
}

#[async_trait]
impl InferenceInvoker for ContainerRuntime {
    async fn invoke(
        &self,
        service_id: &str,
        payload: &PayloadRef,
        settings: &Settings,
    ) -> Result<PayloadRef, InvokeError> {
        let settings_json =
            serde_json::to_string(settings).map_err(|e| InvokeError::Failed(e.to_string()))?;
        let args = self.build_args(service_id, payload, &settings_json);
        tracing::debug!(service = service_id, image = %self.image, payload = %payload, "Running container");

        let mut run = Command::new(&self.config.runtime);
        run.args(&args);
        let result = run_to_completion(run).await;

        let outcome = Self::parse_output(result);
        match &outcome {
            Ok(out) => tracing::debug!(service = service_id, output = %out, "Container finished"),
            Err(e) => tracing::warn!(service = service_id, error = %e, "Container failed"),
        }
        outcome
    }
}
