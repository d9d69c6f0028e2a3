//! Desktop container provisioning.

use std::path::Path;

use log::info;
use thiserror::Error;

use crate::config::{ContainerSettings, DriveConfig, StorageConfig};
use crate::container::{ContainerConfig, ContainerError, ContainerRuntimeApi, Mount};
use crate::credential::Credential;
use crate::host::HostIdentity;

/// Label recording the session's user on its container.
pub const USERNAME_LABEL: &str = "puws.username";
/// Label recording the session's port on its container.
pub const PORT_LABEL: &str = "puws.port";

/// Which engine call failed while provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Create,
    Start,
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionStage::Create => f.write_str("create"),
            ProvisionStage::Start => f.write_str("start"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage} container {container}: {source}")]
pub struct ProvisionError {
    pub stage: ProvisionStage,
    /// Container name, or the ID once it exists.
    pub container: String,
    #[source]
    pub source: ContainerError,
}

/// Everything needed to start one user's desktop.
#[derive(Debug, Clone)]
pub struct SessionSpec<'a> {
    pub username: &'a str,
    pub container_name: &'a str,
    pub port: u16,
    /// VNC display number passed to the startup script.
    pub display: u16,
    pub identity: &'a HostIdentity,
    pub password: &'a Credential,
}

/// Builds desktop container configurations and starts them.
#[derive(Debug, Clone)]
pub struct SessionProvisioner {
    container: ContainerSettings,
    drive: DriveConfig,
    storage: StorageConfig,
}

impl SessionProvisioner {
    pub fn new(container: ContainerSettings, drive: DriveConfig, storage: StorageConfig) -> Self {
        Self {
            container,
            drive,
            storage,
        }
    }

    /// The container configuration for a session.
    pub fn container_config(&self, spec: &SessionSpec<'_>) -> ContainerConfig {
        let home = format!("/home/{}", spec.username);

        let mut config = ContainerConfig::new(&self.container.image)
            .name(spec.container_name)
            .expose(spec.port)
            .network(&self.container.network)
            .label(USERNAME_LABEL, spec.username)
            .label(PORT_LABEL, spec.port.to_string());
        for (key, value) in &self.container.env {
            config = config.env(key, value);
        }

        // The mount points under /home/<user> exist before the user does; the
        // startup script creates the in-container user with the host UID/GID.
        if self.drive.enabled {
            let mut options = self.drive.options.clone();
            options.insert("remote".to_string(), self.drive.remote.clone());
            options.insert(
                "drive-impersonate".to_string(),
                format!("{}@{}", spec.username, self.drive.impersonation_domain),
            );
            config = config.mount(Mount::Volume {
                driver: self.drive.driver.clone(),
                options,
                target: join_home(&home, &self.drive.target),
            });
        }

        config = config.mount(Mount::Bind {
            source: spec.identity.storage_dir.to_string_lossy().into_owned(),
            target: join_home(&home, &self.storage.target),
            read_only: false,
        });

        config.command(self.container.startup_command.iter().cloned()).command([
            spec.username.to_string(),
            spec.identity.uid.to_string(),
            spec.identity.gid.to_string(),
            spec.password.as_str().to_string(),
            spec.display.to_string(),
        ])
    }

    /// Create and start the session container, returning its ID.
    ///
    /// A container that was created but failed to start is left in place for
    /// the operator; it is not removed or retried here.
    pub async fn provision(
        &self,
        runtime: &dyn ContainerRuntimeApi,
        spec: &SessionSpec<'_>,
    ) -> Result<String, ProvisionError> {
        let config = self.container_config(spec);

        let container_id =
            runtime
                .create_container(&config)
                .await
                .map_err(|source| ProvisionError {
                    stage: ProvisionStage::Create,
                    container: spec.container_name.to_string(),
                    source,
                })?;
        info!(
            "Created container {} ({}) for {} on port {}",
            spec.container_name, container_id, spec.username, spec.port
        );

        runtime
            .start_container(&container_id)
            .await
            .map_err(|source| ProvisionError {
                stage: ProvisionStage::Start,
                container: container_id.clone(),
                source,
            })?;
        info!("Started container {} for {}", container_id, spec.username);

        Ok(container_id)
    }
}

fn join_home(home: &str, relative: &str) -> String {
    Path::new(home)
        .join(relative.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned()
}
