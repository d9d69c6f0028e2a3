//! Test utilities and common setup.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use futures::StreamExt;
use puws_broker::api::{self, AppState};
use puws_broker::broker::SessionBroker;
use puws_broker::config::AppConfig;
use puws_broker::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, LogStream,
};
use puws_broker::host::{HostIdentity, HostIdentityError, HostIdentityProvisioner};
use puws_broker::seed::Seed;

pub const TEST_SEED: &[u8] = b"00112233445566778899aabbccddeeff";

/// What a freshly started fake desktop prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopOutput {
    /// Boot chatter, the readiness marker, then nothing more.
    Ready,
    /// Two lines, then the process exits.
    ExitsEarly,
    /// Nothing at all.
    Silent,
}

/// In-memory container engine.
///
/// Mirrors `ps` semantics: only started containers are listed.
pub struct FakeRuntime {
    containers: Mutex<Vec<Container>>,
    output: DesktopOutput,
    creates: AtomicUsize,
    next_id: AtomicUsize,
    last_config: Mutex<Option<ContainerConfig>>,
    lists: AtomicUsize,
    fail_list: AtomicBool,
    fail_start: AtomicBool,
    late_arrival: Mutex<Option<(String, u16)>>,
}

impl FakeRuntime {
    pub fn new(output: DesktopOutput) -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            output,
            creates: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            last_config: Mutex::new(None),
            lists: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            late_arrival: Mutex::new(None),
        }
    }

    /// Make every `ps` fail.
    pub fn failing_list(self) -> Self {
        self.fail_list.store(true, Ordering::SeqCst);
        self
    }

    /// Make every `start` fail; created containers stay in place.
    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    /// Have another request's container show up from the second `ps` on.
    pub fn appearing_on_second_list(self, name: &str, port: u16) -> Self {
        *self.late_arrival.lock().unwrap() = Some((name.to_string(), port));
        self
    }

    /// Add an already running container.
    pub fn with_running(self, name: &str, port: u16) -> Self {
        let id = self.allocate_id();
        self.containers.lock().unwrap().push(Container {
            id,
            names: vec![name.to_string()],
            image: "desktop:test".to_string(),
            ports: vec![port],
            state: "running".to_string(),
        });
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Containers in any state.
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<ContainerConfig> {
        self.last_config.lock().unwrap().clone()
    }

    fn allocate_id(&self) -> String {
        format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn list_containers(&self) -> ContainerResult<Vec<Container>> {
        tokio::task::yield_now().await;
        let call = self.lists.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "ps".to_string(),
                message: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        if call == 2 {
            if let Some((name, port)) = self.late_arrival.lock().unwrap().take() {
                let id = self.allocate_id();
                self.containers.lock().unwrap().push(Container {
                    id,
                    names: vec![name],
                    image: "desktop:test".to_string(),
                    ports: vec![port],
                    state: "running".to_string(),
                });
            }
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.state == "running")
            .cloned()
            .collect())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        tokio::task::yield_now().await;

        let name = config.name.clone().unwrap_or_default();
        let mut containers = self.containers.lock().unwrap();
        if containers.iter().any(|c| c.names.contains(&name)) {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: format!("name {name} is already in use"),
            });
        }

        let id = self.allocate_id();
        containers.push(Container {
            id: id.clone(),
            names: vec![name],
            image: config.image.clone(),
            ports: config.exposed_ports.clone(),
            state: "created".to_string(),
        });
        self.creates.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "port is already allocated".to_string(),
            });
        }
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| ContainerError::CommandFailed {
                command: "start".to_string(),
                message: format!("no such container: {container_id}"),
            })?;
        container.state = "running".to_string();
        Ok(())
    }

    async fn follow_logs(&self, _container_id: &str) -> ContainerResult<LogStream> {
        let lines = |items: &[&str]| {
            items
                .iter()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<std::io::Result<String>>>()
        };
        let stream: LogStream = match self.output {
            DesktopOutput::Ready => Box::pin(
                futures::stream::iter(lines(&[
                    "Creating user",
                    "Mounting drive",
                    "Starting VNC server on :1",
                ]))
                .chain(futures::stream::pending()),
            ),
            DesktopOutput::ExitsEarly => {
                Box::pin(futures::stream::iter(lines(&["Creating user", "fatal: no display"])))
            }
            DesktopOutput::Silent => Box::pin(futures::stream::pending()),
        };
        Ok(stream)
    }
}

/// Host accounts that always resolve, numbered from 1000.
#[derive(Default)]
pub struct FakeHost {
    calls: AtomicUsize,
}

impl FakeHost {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostIdentityProvisioner for FakeHost {
    async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, HostIdentityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HostIdentity {
            uid: 1000,
            gid: 1000,
            storage_dir: PathBuf::from("/var/www").join(username),
        })
    }
}

/// Host provisioning that always fails.
pub struct BrokenHost;

#[async_trait]
impl HostIdentityProvisioner for BrokenHost {
    async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, HostIdentityError> {
        Err(HostIdentityError::CreateFailed {
            username: username.to_string(),
            message: "useradd: permission denied".to_string(),
        })
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.readiness.timeout_secs = 5;
    config
}

pub fn test_broker(runtime: Arc<FakeRuntime>, host: Arc<dyn HostIdentityProvisioner>) -> SessionBroker {
    SessionBroker::new(
        &test_config(),
        runtime,
        host,
        Seed::from_bytes(TEST_SEED.to_vec()),
    )
}

pub fn test_app_with(runtime: Arc<FakeRuntime>) -> Router {
    let broker = test_broker(runtime, Arc::new(FakeHost::default()));
    api::create_router(AppState::new(broker))
}

pub fn test_app() -> (Router, Arc<FakeRuntime>) {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    (test_app_with(Arc::clone(&runtime)), runtime)
}

