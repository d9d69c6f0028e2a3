//! Container runtime management module.
//!
//! Drives Docker or Podman through their CLI. The runtime is auto-detected or
//! can be configured explicitly. Every command is bounded by a deadline so a
//! wedged engine cannot hang a request.

mod container;
mod error;

pub use container::{Container, ContainerConfig, Mount, parse_ports};
pub use error::{ContainerError, ContainerResult};

use container::{PS_FORMAT, validate_container_name};

use std::pin::Pin;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;

/// Lines of container output, stdout and stderr interleaved.
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Default deadline for a single engine command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container engine abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// List running containers.
    async fn list_containers(&self) -> ContainerResult<Vec<Container>>;

    /// Create (but do not start) a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;

    /// Follow a container's output from its start, timestamped.
    async fn follow_logs(&self, container_id: &str) -> ContainerResult<LogStream>;
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
    command_timeout: Duration,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn list_containers(&self) -> ContainerResult<Vec<Container>> {
        self.list_containers().await
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn follow_logs(&self, container_id: &str) -> ContainerResult<LogStream> {
        self.follow_logs(container_id)
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falling back to Podman.
    pub fn new() -> Self {
        let runtime_type = if !Self::is_binary_available("docker")
            && Self::is_binary_available("podman")
        {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound every engine command by `timeout`.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run an engine command to completion within the command deadline.
    ///
    /// A non-zero exit status is reported as `CommandFailed` with stderr.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| ContainerError::TimedOut {
                command: command.to_string(),
                seconds: self.command_timeout.as_secs(),
            })?
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = ["version".to_string(), "--format".to_string(), "json".to_string()];
        let output = self.run("version", &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// List running containers.
    pub async fn list_containers(&self) -> ContainerResult<Vec<Container>> {
        let args = [
            "ps".to_string(),
            "--no-trunc".to_string(),
            "--format".to_string(),
            PS_FORMAT.to_string(),
        ];
        let output = self.run("ps", &args).await?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Container::from_ps_json)
            .collect()
    }

    /// Create a container without starting it.
    ///
    /// The configuration is validated first so nothing malformed reaches the
    /// engine's argument parser.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let output = self.run("create", &config.create_args()).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.run("start", &["start".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    /// Follow the container's full log, stdout and stderr merged line by line.
    ///
    /// The `logs` child process lives as long as the returned stream and is
    /// killed when the stream is dropped.
    pub fn follow_logs(&self, container_id: &str) -> ContainerResult<LogStream> {
        validate_container_name(container_id)?;

        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", "--timestamps", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: "log output pipes unavailable".to_string(),
            });
        };

        let merged = futures::stream::select(
            LinesStream::new(BufReader::new(stdout).lines()),
            LinesStream::new(BufReader::new(stderr).lines()),
        );

        // Carry the child along with the stream so it is reaped or killed with it.
        let stream = futures::stream::unfold((child, merged), |(child, mut merged)| async move {
            let item = merged.next().await?;
            Some((item, (child, merged)))
        });

        Ok(Box::pin(stream))
    }
}
