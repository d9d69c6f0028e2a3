//! Host-side identity and storage for desktop users.
//!
//! Every desktop user gets a matching OS account on the host so the files
//! they create through bind mounts have a real owner, plus a per-user storage
//! directory owned by that account.

mod linux_users;

pub use linux_users::{HostUsersConfig, LinuxHostIdentity};

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

/// Account names accepted for desktop users. They become an OS account, a
/// path component and part of a container name, so the set is narrow.
static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,31}$").expect("username pattern is valid")
});

/// Check that `username` is usable as a host account name.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("username cannot be empty".to_string());
    }
    if !USERNAME_RE.is_match(username) || username.ends_with('.') {
        return Err(format!(
            "username '{username}' must start with a letter or underscore, \
             contain only letters, digits, '.', '_' or '-', and be at most 32 characters"
        ));
    }
    Ok(())
}

/// A resolved host account together with its storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
    /// Per-user storage directory, owned by `uid:gid`.
    pub storage_dir: PathBuf,
}

/// Errors from host identity provisioning.
#[derive(Debug, Error)]
pub enum HostIdentityError {
    /// Creating the account failed.
    #[error("creating host user {username}: {message}")]
    CreateFailed { username: String, message: String },

    /// The account still could not be resolved after creating it.
    #[error("host user {0} could not be resolved after creation")]
    Unresolved(String),

    /// Looking the account up failed outright.
    #[error("looking up host user {username}: {message}")]
    Lookup { username: String, message: String },

    /// Creating or chowning the storage directory failed.
    #[error("preparing storage directory {path}: {message}")]
    Storage { path: PathBuf, message: String },
}

/// Ensures a host account and storage directory exist for a username.
///
/// Implementations must be idempotent: repeating the call for an existing
/// user changes nothing and returns the same identity.
#[async_trait]
pub trait HostIdentityProvisioner: Send + Sync {
    async fn ensure_host_identity(&self, username: &str) -> Result<HostIdentity, HostIdentityError>;
}
