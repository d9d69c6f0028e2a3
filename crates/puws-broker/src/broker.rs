//! Session broker - finds or starts a user's desktop.
//!
//! The broker keeps no session records. Each request re-reads the container
//! inventory, recomputes the password from the seed, and only provisions a
//! new desktop when the user has none running.
//!
//! Ordering:
//! - a per-username lock serialises check-then-create for one user, so two
//!   requests for the same new user produce a single container;
//! - a global provisioning lock covers snapshot -> allocate port -> create ->
//!   start, so two different users never receive the same port;
//! - the readiness wait runs outside the global lock.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{AppConfig, ReadinessConfig};
use crate::container::{ContainerError, ContainerRuntimeApi};
use crate::credential::{Credential, CredentialError, derive_password};
use crate::host::{HostIdentity, HostIdentityError, HostIdentityProvisioner, validate_username};
use crate::inventory::{InventoryScanner, SessionContainer, SessionLookup};
use crate::ports::{PortRange, PortsExhausted};
use crate::provision::{SessionProvisioner, SessionSpec};
use crate::readiness::{ReadinessError, await_ready};
use crate::seed::Seed;

/// Lifecycle of a session as seen by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Absent,
    Starting,
    Ready,
    Failed,
}

/// Connection details for a ready session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub username: String,
    pub port: u16,
    pub password: Credential,
    pub container_id: String,
    pub status: SessionStatus,
    /// Whether this request started the container.
    pub created: bool,
}

/// Broker failures, by cause.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("No free sessions: {0}")]
    Capacity(#[from] PortsExhausted),

    #[error("{operation} failed for user {username}: {source}")]
    Engine {
        username: String,
        operation: String,
        #[source]
        source: ContainerError,
    },

    #[error("listing session containers: {0}")]
    Inventory(#[source] ContainerError),

    #[error("preparing host user {username}: {source}")]
    Identity {
        username: String,
        #[source]
        source: HostIdentityError,
    },

    #[error("desktop for user {username} (container {container_id}) is not ready: {source}")]
    Readiness {
        username: String,
        container_id: String,
        #[source]
        source: ReadinessError,
    },

    #[error(transparent)]
    Crypto(#[from] CredentialError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable code for the error.
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::InvalidUsername(_) => "invalid_username",
            BrokerError::Capacity(_) => "no_free_sessions",
            BrokerError::Engine { .. } | BrokerError::Inventory(_) => "engine_error",
            BrokerError::Identity {
                source: HostIdentityError::Storage { .. },
                ..
            } => "storage_error",
            BrokerError::Identity { .. } => "identity_provisioning_failed",
            BrokerError::Readiness {
                source: ReadinessError::TimedOut { .. },
                ..
            } => "readiness_timeout",
            BrokerError::Readiness { .. } => "readiness_failed",
            BrokerError::Crypto(_) => "crypto_error",
            BrokerError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller supplied bad input (as opposed to a server-side failure).
    pub fn is_client_error(&self) -> bool {
        matches!(self, BrokerError::InvalidUsername(_))
    }
}

/// Finds or starts per-user desktop sessions.
pub struct SessionBroker {
    runtime: Arc<dyn ContainerRuntimeApi>,
    host: Arc<dyn HostIdentityProvisioner>,
    seed: Arc<Seed>,
    scanner: InventoryScanner,
    provisioner: SessionProvisioner,
    ports: PortRange,
    display_base: u16,
    readiness: ReadinessConfig,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    provision_lock: Mutex<()>,
}

impl SessionBroker {
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn ContainerRuntimeApi>,
        host: Arc<dyn HostIdentityProvisioner>,
        seed: Seed,
    ) -> Self {
        Self {
            runtime,
            host,
            seed: Arc::new(seed),
            scanner: InventoryScanner::new(&config.container.name_prefix, config.ports.range()),
            provisioner: SessionProvisioner::new(
                config.container.clone(),
                config.drive.clone(),
                config.storage.clone(),
            ),
            ports: config.ports.range(),
            display_base: config.ports.display_base,
            readiness: config.readiness.clone(),
            user_locks: DashMap::new(),
            provision_lock: Mutex::new(()),
        }
    }

    /// Return the user's running session, starting one if there is none.
    pub async fn connect_or_start(&self, username: &str) -> Result<SessionInfo, BrokerError> {
        let username = username.trim();
        validate_username(username).map_err(BrokerError::InvalidUsername)?;

        // Declared first so it drops last, after the lock clone is gone.
        let _release = UserLockRelease {
            broker: self,
            username,
        };
        let lock = self.user_lock(username);
        let _guard = lock.lock().await;
        self.connect_or_start_locked(username).await
    }

    /// All sessions currently running, without credentials.
    pub async fn list_sessions(&self) -> Result<Vec<SessionContainer>, BrokerError> {
        self.scanner
            .list_sessions(self.runtime.as_ref())
            .await
            .map_err(BrokerError::Inventory)
    }

    /// Recompute a user's session password.
    pub async fn password_for(&self, username: &str) -> Result<Credential, BrokerError> {
        let seed = Arc::clone(&self.seed);
        let username = username.to_string();
        tokio::task::spawn_blocking(move || derive_password(&seed, &username))
            .await
            .map_err(|e| BrokerError::Internal(format!("password derivation task: {e}")))?
            .map_err(BrokerError::from)
    }

    async fn connect_or_start_locked(&self, username: &str) -> Result<SessionInfo, BrokerError> {
        debug!("Looking for session for user {}", username);
        let lookup = self.find_session(username).await?;
        if let Some(existing) = lookup.existing {
            return self.existing_session(existing).await;
        }
        info!(
            "No session for {} ({:?}); starting one",
            username,
            SessionStatus::Absent
        );

        let password = self.password_for(username).await?;

        let (container_id, port) = {
            let _provisioning = self.provision_lock.lock().await;

            // Fresh snapshot: ports may have been taken since the first lookup.
            let lookup = self.find_session(username).await?;
            if let Some(existing) = lookup.existing {
                warn!(
                    "Session for {} appeared while waiting to provision; reusing {}",
                    username, existing.container_id
                );
                return self.existing_session(existing).await;
            }

            let port = self.ports.allocate(&lookup.occupied)?;
            let display = port.checked_sub(self.display_base).ok_or_else(|| {
                BrokerError::Internal(format!(
                    "port {} is below display base {}",
                    port, self.display_base
                ))
            })?;
            let identity = self.ensure_host_identity(username).await?;
            let container_name = self.scanner.container_name(username);
            let spec = SessionSpec {
                username,
                container_name: &container_name,
                port,
                display,
                identity: &identity,
                password: &password,
            };

            let container_id = self
                .provisioner
                .provision(self.runtime.as_ref(), &spec)
                .await
                .map_err(|e| BrokerError::Engine {
                    username: username.to_string(),
                    operation: format!("{} container {}", e.stage, e.container),
                    source: e.source,
                })?;
            (container_id, port)
        };

        info!(
            "Session for {} is {:?} in container {} on port {}",
            username,
            SessionStatus::Starting,
            container_id,
            port
        );
        if let Err(e) = self.wait_until_ready(username, &container_id).await {
            warn!(
                "Session for {} is {:?}; container {} left for cleanup",
                username,
                SessionStatus::Failed,
                container_id
            );
            return Err(e);
        }
        info!("Session for {} is ready on port {}", username, port);

        Ok(SessionInfo {
            username: username.to_string(),
            port,
            password,
            container_id,
            status: SessionStatus::Ready,
            created: true,
        })
    }

    async fn existing_session(&self, existing: SessionContainer) -> Result<SessionInfo, BrokerError> {
        info!(
            "Found session for {} on port {} ({})",
            existing.username, existing.port, existing.container_id
        );
        let password = self.password_for(&existing.username).await?;
        Ok(SessionInfo {
            username: existing.username,
            port: existing.port,
            password,
            container_id: existing.container_id,
            status: SessionStatus::Ready,
            created: false,
        })
    }

    async fn find_session(&self, username: &str) -> Result<SessionLookup, BrokerError> {
        self.scanner
            .find_session(self.runtime.as_ref(), username)
            .await
            .map_err(|source| BrokerError::Engine {
                username: username.to_string(),
                operation: "listing containers".to_string(),
                source,
            })
    }

    async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, BrokerError> {
        self.host
            .ensure_host_identity(username)
            .await
            .map_err(|source| BrokerError::Identity {
                username: username.to_string(),
                source,
            })
    }

    async fn wait_until_ready(&self, username: &str, container_id: &str) -> Result<(), BrokerError> {
        let logs = self
            .runtime
            .follow_logs(container_id)
            .await
            .map_err(|source| BrokerError::Engine {
                username: username.to_string(),
                operation: format!("following logs of {container_id}"),
                source,
            })?;

        let ready = await_ready(
            logs,
            &self.readiness.marker,
            self.readiness.timeout(),
            username,
        )
        .await
        .map_err(|source| BrokerError::Readiness {
            username: username.to_string(),
            container_id: container_id.to_string(),
            source,
        })?;

        debug!(
            "Readiness marker for {} seen after {} lines",
            username, ready.lines_read
        );
        Ok(())
    }

    fn user_lock(&self, username: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.user_locks.entry(username.to_string()).or_default())
    }

    /// Drop the user's lock entry once no request holds or awaits it.
    fn release_user_lock(&self, username: &str) {
        self.user_locks
            .remove_if(username, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn tracked_user_locks(&self) -> usize {
        self.user_locks.len()
    }
}

/// Removes a user's lock entry when a request ends, including when the
/// request future is dropped mid-wait.
struct UserLockRelease<'a> {
    broker: &'a SessionBroker,
    username: &'a str,
}

impl Drop for UserLockRelease<'_> {
    fn drop(&mut self) {
        self.broker.release_user_lock(self.username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerConfig, ContainerResult, LogStream};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct EmptyEngine;

    #[async_trait]
    impl ContainerRuntimeApi for EmptyEngine {
        async fn list_containers(&self) -> ContainerResult<Vec<Container>> {
            Ok(Vec::new())
        }
        async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "engine offline".to_string(),
            })
        }
        async fn start_container(&self, _id: &str) -> ContainerResult<()> {
            Ok(())
        }
        async fn follow_logs(&self, _id: &str) -> ContainerResult<LogStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    /// An engine that never answers.
    struct HungEngine;

    #[async_trait]
    impl ContainerRuntimeApi for HungEngine {
        async fn list_containers(&self) -> ContainerResult<Vec<Container>> {
            futures::future::pending().await
        }
        async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            futures::future::pending().await
        }
        async fn start_container(&self, _id: &str) -> ContainerResult<()> {
            futures::future::pending().await
        }
        async fn follow_logs(&self, _id: &str) -> ContainerResult<LogStream> {
            futures::future::pending().await
        }
    }

    struct FixedHost;

    #[async_trait]
    impl HostIdentityProvisioner for FixedHost {
        async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, HostIdentityError> {
            Ok(HostIdentity {
                uid: 1000,
                gid: 1000,
                storage_dir: PathBuf::from("/var/www").join(username),
            })
        }
    }

    fn broker() -> SessionBroker {
        SessionBroker::new(
            &AppConfig::default(),
            Arc::new(EmptyEngine),
            Arc::new(FixedHost),
            Seed::from_bytes(b"0123456789abcdef".to_vec()),
        )
    }

    #[tokio::test]
    async fn test_invalid_username_is_rejected_before_engine() {
        let err = broker().connect_or_start("  ").await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.error_code(), "invalid_username");
    }

    #[tokio::test]
    async fn test_create_failure_is_engine_error_with_context() {
        let broker = broker();
        let err = broker.connect_or_start("alice").await.unwrap_err();
        assert_eq!(err.error_code(), "engine_error");
        let message = err.to_string();
        assert!(message.contains("alice"), "{message}");
        assert!(message.contains("create container desktop-alice"), "{message}");
        assert_eq!(broker.tracked_user_locks(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_user_lock() {
        let broker = SessionBroker::new(
            &AppConfig::default(),
            Arc::new(HungEngine),
            Arc::new(FixedHost),
            Seed::from_bytes(b"0123456789abcdef".to_vec()),
        );

        let mut request = Box::pin(broker.connect_or_start("alice"));
        assert!(futures::poll!(&mut request).is_pending());
        assert_eq!(broker.tracked_user_locks(), 1);

        drop(request);
        assert_eq!(broker.tracked_user_locks(), 0);
    }

    #[tokio::test]
    async fn test_port_below_display_base_is_internal_error() {
        let mut config = AppConfig::default();
        config.ports.display_base = config.ports.end + 1;
        let broker = SessionBroker::new(
            &config,
            Arc::new(EmptyEngine),
            Arc::new(FixedHost),
            Seed::from_bytes(b"0123456789abcdef".to_vec()),
        );

        let err = broker.connect_or_start("alice").await.unwrap_err();
        assert_eq!(err.error_code(), "internal_error");
        assert!(err.to_string().contains("below display base"), "{err}");
        assert_eq!(broker.tracked_user_locks(), 0);
    }

    #[test]
    fn test_error_codes() {
        let capacity = BrokerError::from(PortsExhausted(PortRange::default()));
        assert_eq!(capacity.error_code(), "no_free_sessions");
        assert!(!capacity.is_client_error());

        let timeout = BrokerError::Readiness {
            username: "a".to_string(),
            container_id: "c".to_string(),
            source: ReadinessError::TimedOut {
                timeout: std::time::Duration::from_secs(1),
                lines_read: 0,
            },
        };
        assert_eq!(timeout.error_code(), "readiness_timeout");

        let storage = BrokerError::Identity {
            username: "a".to_string(),
            source: HostIdentityError::Storage {
                path: PathBuf::from("/var/www/a"),
                message: "denied".to_string(),
            },
        };
        assert_eq!(storage.error_code(), "storage_error");
    }
}
