//! Linux account provisioning for desktop users.
//!
//! Accounts are looked up with `id` and created with `useradd`, optionally
//! through `sudo -n` when the broker does not run as root. Every command is
//! bounded by the same deadline as container engine calls.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{HostIdentity, HostIdentityError, HostIdentityProvisioner};
use crate::container::DEFAULT_COMMAND_TIMEOUT;

/// Configuration for host account provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostUsersConfig {
    /// Login shell for new accounts.
    pub shell: String,
    /// Create home directories for new accounts.
    pub create_home: bool,
    /// Run `useradd`/`chown` through `sudo -n` when not root.
    pub use_sudo: bool,
}

impl Default for HostUsersConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            create_home: true,
            use_sudo: false,
        }
    }
}

/// Provisions desktop users as Linux accounts with storage under `storage_base`.
#[derive(Debug, Clone)]
pub struct LinuxHostIdentity {
    config: HostUsersConfig,
    storage_base: PathBuf,
    command_timeout: Duration,
}

impl LinuxHostIdentity {
    pub fn new(config: HostUsersConfig, storage_base: impl Into<PathBuf>) -> Self {
        Self {
            config,
            storage_base: storage_base.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound every host command by `timeout`.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Storage directory for a user: `<storage_base>/<username>`.
    pub fn storage_dir(&self, username: &str) -> PathBuf {
        self.storage_base.join(username)
    }

    async fn create_user(&self, username: &str) -> Result<(), HostIdentityError> {
        let mut args = vec![if self.config.create_home { "-m" } else { "-M" }];
        args.extend(["-s", self.config.shell.as_str(), username]);

        info!("Creating host user '{}'", username);
        run_privileged_command(self.config.use_sudo, "useradd", &args, self.command_timeout)
            .await
            .map_err(|message| HostIdentityError::CreateFailed {
                username: username.to_string(),
                message,
            })
    }

    /// Resolve the account, creating it and retrying the lookup once if absent.
    async fn ensure_user(&self, username: &str) -> Result<(u32, u32), HostIdentityError> {
        if let Some(ids) = lookup_user(username, self.command_timeout).await? {
            debug!("Host user '{}' exists as {}:{}", username, ids.0, ids.1);
            return Ok(ids);
        }

        self.create_user(username).await?;

        lookup_user(username, self.command_timeout)
            .await?
            .ok_or_else(|| HostIdentityError::Unresolved(username.to_string()))
    }

    /// Make sure the storage directory exists and belongs to `uid:gid`.
    async fn ensure_storage_dir(
        &self,
        path: &Path,
        uid: u32,
        gid: u32,
    ) -> Result<(), HostIdentityError> {
        let storage_err = |message: String| HostIdentityError::Storage {
            path: path.to_path_buf(),
            message,
        };

        tokio::time::timeout(self.command_timeout, tokio::fs::create_dir_all(path))
            .await
            .map_err(|_| storage_err(timed_out("mkdir", self.command_timeout)))?
            .map_err(|e| storage_err(e.to_string()))?;

        let path_str = path.to_string_lossy();
        let owner = format!("{uid}:{gid}");
        run_privileged_command(
            self.config.use_sudo,
            "chown",
            &[&owner, &path_str],
            self.command_timeout,
        )
        .await
        .map_err(storage_err)?;

        debug!("Storage directory {} owned by {}", path_str, owner);
        Ok(())
    }
}

#[async_trait]
impl HostIdentityProvisioner for LinuxHostIdentity {
    async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, HostIdentityError> {
        let (uid, gid) = self.ensure_user(username).await?;
        let storage_dir = self.storage_dir(username);
        self.ensure_storage_dir(&storage_dir, uid, gid).await?;

        Ok(HostIdentity {
            uid,
            gid,
            storage_dir,
        })
    }
}

/// Look up the UID and primary GID of a Linux account.
///
/// Returns `Ok(None)` when the account does not exist.
async fn lookup_user(
    username: &str,
    timeout: Duration,
) -> Result<Option<(u32, u32)>, HostIdentityError> {
    let Some(uid) = id_query(username, "-u", timeout).await? else {
        return Ok(None);
    };
    let Some(gid) = id_query(username, "-g", timeout).await? else {
        return Ok(None);
    };
    Ok(Some((uid, gid)))
}

async fn id_query(
    username: &str,
    flag: &str,
    timeout: Duration,
) -> Result<Option<u32>, HostIdentityError> {
    let lookup_err = |message: String| HostIdentityError::Lookup {
        username: username.to_string(),
        message,
    };

    let mut command = Command::new("id");
    command.args([flag, "--", username]);
    let output = output_within(command, "id", timeout).await.map_err(lookup_err)?;

    if !output.status.success() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| lookup_err(format!("parsing id {flag} output '{}': {e}", text.trim())))
}

/// Run a command, through `sudo -n` if requested and not already root.
///
/// Returns stderr as the error message on failure.
async fn run_privileged_command(
    use_sudo: bool,
    cmd: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<(), String> {
    let is_root = rustix::process::geteuid().is_root();

    let command = if use_sudo && !is_root {
        debug!("Running: sudo {} {:?}", cmd, args);
        let mut command = Command::new("sudo");
        command.arg("-n").arg(cmd).args(args);
        command
    } else {
        debug!("Running: {} {:?}", cmd, args);
        let mut command = Command::new(cmd);
        command.args(args);
        command
    };
    let output = output_within(command, cmd, timeout).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{cmd} exited with {}: {}", output.status, stderr.trim()));
    }

    Ok(())
}

/// Run `command` to completion, killing it if it outlives `timeout`.
async fn output_within(mut command: Command, name: &str, timeout: Duration) -> Result<Output, String> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| timed_out(name, timeout))?
        .map_err(|e| format!("running {name}: {e}"))
}

fn timed_out(name: &str, timeout: Duration) -> String {
    format!("{name} timed out after {}ms", timeout.as_millis())
}
