//! Broker configuration.
//!
//! Loaded from TOML by the binary (see `main.rs`), layered with
//! `PUWS_BROKER__*` environment overrides. Every section has working
//! defaults for the reference deployment.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;
use crate::host::HostUsersConfig;
use crate::ports::PortRange;
use crate::readiness::{DEFAULT_READY_MARKER, DEFAULT_READY_TIMEOUT};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub seed: SeedConfig,
    pub ports: PortsConfig,
    pub container: ContainerSettings,
    pub drive: DriveConfig,
    pub storage: StorageConfig,
    pub host_users: HostUsersConfig,
    pub readiness: ReadinessConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8091,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Location of the credential seed. Created on first start.
    pub path: String,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            path: "/etc/puws/seed.txt".to_string(),
        }
    }
}

/// Session port range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First session port (inclusive).
    pub start: u16,
    /// Last session port (inclusive).
    pub end: u16,
    /// VNC display numbers are counted from here: display = port - display_base.
    pub display_base: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        let range = PortRange::default();
        Self {
            start: range.start,
            end: range.end,
            display_base: 5900,
        }
    }
}

impl PortsConfig {
    pub fn range(&self) -> PortRange {
        PortRange::new(self.start, self.end)
    }
}

/// Container engine and desktop image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Engine to use; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the engine binary.
    pub binary: Option<String>,
    /// Desktop image.
    pub image: String,
    /// Session containers are named `<name_prefix><username>`.
    pub name_prefix: String,
    /// Network shared with the remote-display gateway.
    pub network: String,
    /// Command run in the container; the session arguments are appended.
    pub startup_command: Vec<String>,
    /// Deadline for each engine and host command, in seconds.
    pub command_timeout_secs: u64,
    /// Extra environment variables for every desktop.
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "sansay.co.uk-dockerdesktop:0.1-beta.3".to_string(),
            name_prefix: "desktop-".to_string(),
            network: "pangolin_main".to_string(),
            startup_command: vec![
                "bash".to_string(),
                "/root/docker-desktop-root-startup.sh".to_string(),
            ],
            command_timeout_secs: 60,
            env: BTreeMap::new(),
        }
    }
}

impl ContainerSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Remote-drive volume mounted into every desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub enabled: bool,
    /// Volume driver plugin name.
    pub driver: String,
    /// Driver `remote` option.
    pub remote: String,
    /// The drive is opened as `<username>@<impersonation_domain>`.
    pub impersonation_domain: String,
    /// Mount point relative to the user's in-container home.
    pub target: String,
    /// Extra driver options.
    pub options: BTreeMap<String, String>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        let mut options = BTreeMap::new();
        options.insert("allow_other".to_string(), "true".to_string());
        options.insert("vfs-cache-mode".to_string(), "full".to_string());
        Self {
            enabled: true,
            driver: "rclone".to_string(),
            remote: "gdrive:".to_string(),
            impersonation_domain: "knightsbridgeschool.com".to_string(),
            target: "Documents".to_string(),
            options,
        }
    }
}

/// Host-side per-user storage, bind mounted into the desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Each user gets `<base_dir>/<username>`.
    pub base_dir: String,
    /// Bind target relative to the user's in-container home.
    pub target: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "/var/www".to_string(),
            target: "www".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Output substring that marks a desktop as ready.
    pub marker: String,
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_READY_MARKER.to_string(),
            timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Reject configurations the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.start > self.ports.end {
            bail!(
                "ports.start ({}) must not exceed ports.end ({})",
                self.ports.start,
                self.ports.end
            );
        }
        if self.ports.start == 0 {
            bail!("ports.start must be non-zero");
        }
        if self.ports.display_base >= self.ports.start {
            bail!(
                "ports.display_base ({}) must be below ports.start ({})",
                self.ports.display_base,
                self.ports.start
            );
        }
        if self.container.image.trim().is_empty() {
            bail!("container.image must be set");
        }
        if self.container.name_prefix.is_empty() {
            bail!("container.name_prefix must be set");
        }
        if self.container.startup_command.is_empty() {
            bail!("container.startup_command must not be empty");
        }
        if self.container.command_timeout_secs == 0 {
            bail!("container.command_timeout_secs must be non-zero");
        }
        if self.readiness.marker.is_empty() {
            bail!("readiness.marker must be set");
        }
        if self.readiness.timeout_secs == 0 {
            bail!("readiness.timeout_secs must be non-zero");
        }
        if self.seed.path.trim().is_empty() {
            bail!("seed.path must be set");
        }
        if self.storage.base_dir.trim().is_empty() {
            bail!("storage.base_dir must be set");
        }
        Ok(())
    }
}
