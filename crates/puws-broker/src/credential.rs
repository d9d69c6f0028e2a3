//! Session password derivation.
//!
//! Passwords are never stored. Each one is recomputed from the seed and the
//! username with Argon2id, so an existing session can be rediscovered after a
//! restart without any session records.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

use crate::seed::Seed;

/// Argon2id passes over memory.
pub const ARGON2_ITERATIONS: u32 = 1;
/// Argon2id memory cost in KiB (64 MiB).
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id lanes.
pub const ARGON2_PARALLELISM: u32 = 4;
/// Derived key length in bytes; the password is its lowercase hex encoding.
pub const ARGON2_OUTPUT_LEN: usize = 32;

#[derive(Debug, Error)]
#[error("deriving session password: {0}")]
pub struct CredentialError(String);

/// A derived session password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Derive the session password for `username`.
///
/// The username is the Argon2 password input and the seed is the salt.
/// Nothing else feeds the derivation: the same `(seed, username)` always
/// produces the same credential, whatever port the session ends up on.
pub fn derive_password(seed: &Seed, username: &str) -> Result<Credential, CredentialError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| CredentialError(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; ARGON2_OUTPUT_LEN];
    argon2
        .hash_password_into(username.as_bytes(), seed.as_bytes(), &mut output)
        .map_err(|e| CredentialError(e.to_string()))?;

    Ok(Credential(hex::encode(output)))
}
