//! Durable secret seed used for credential derivation.
//!
//! The seed is written once and never rewritten: every session password is
//! derived from it, so changing it would invalidate all of them.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

/// Number of random bytes in a freshly generated seed.
pub const SEED_BYTES: usize = 16;

/// Errors from reading or creating the seed file.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("creating seed directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("writing seed file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("reading seed file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("seed file {0} is empty")]
    Empty(PathBuf),

    #[error("sourcing randomness for a new seed: {0}")]
    Randomness(String),
}

/// The secret seed, as stored on disk.
///
/// The on-disk bytes are used verbatim (a hex string for seeds created
/// here), so seeds written by earlier deployments keep producing the same
/// passwords.
#[derive(Clone, PartialEq, Eq)]
pub struct Seed(Vec<u8>);

impl Seed {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed(<{} bytes>)", self.0.len())
    }
}

/// Return the seed stored at `path`, creating it first if it does not exist.
///
/// An existing file is never truncated or rewritten; if another process wins
/// the race to create it, its value is read back.
pub fn get_or_create_seed(path: &Path) -> Result<Seed, SeedError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SeedError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(mut file) => {
            let mut bytes = [0u8; SEED_BYTES];
            OsRng
                .try_fill_bytes(&mut bytes)
                .map_err(|e| SeedError::Randomness(e.to_string()))?;
            let encoded = hex::encode(bytes);

            file.write_all(encoded.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(|source| SeedError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!("Created new session seed at {}", path.display());
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!("Using existing session seed at {}", path.display());
        }
        Err(source) => {
            return Err(SeedError::Write {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    load_seed(path)
}

/// Read an existing seed without creating one.
pub fn load_seed(path: &Path) -> Result<Seed, SeedError> {
    let bytes = fs::read(path).map_err(|source| SeedError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(SeedError::Empty(path.to_path_buf()));
    }

    if let Ok(meta) = fs::metadata(path)
        && meta.permissions().mode() & 0o077 != 0
    {
        warn!(
            "Seed file {} is readable by other users (mode {:o})",
            path.display(),
            meta.permissions().mode() & 0o777
        );
    }

    Ok(Seed(bytes))
}
