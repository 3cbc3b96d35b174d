//! Password hashing seam.
//!
//! The core never hashes inline; everything goes through [`PasswordHasher`]
//! so tests can substitute a cheap implementation and deployments can tune
//! the cost factor without touching call sites.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier, Version};

use crate::config::HashConfig;

pub trait PasswordHasher: Send + Sync {
    /// Salted slow hash in PHC string format.
    fn hash(&self, password: &str) -> Result<String>;

    /// `Ok(false)` on mismatch; `Err` only for malformed stored hashes.
    fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

/// Argon2id with a configurable memory/iteration cost.
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    /// # Errors
    /// Fails when the configured cost is outside argon2's accepted range.
    pub fn new(config: HashConfig) -> Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, 1, None)
            .map_err(|err| anyhow!("invalid argon2 cost parameters: {err}"))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?;
        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(hash).map_err(|err| anyhow!("malformed password hash: {err}"))?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(anyhow!("failed to verify password: {err}")),
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_hasher() -> Argon2Hasher {
    // Minimum legal cost; only for tests.
    Argon2Hasher::new(HashConfig {
        memory_kib: 8,
        iterations: 1,
    })
    .expect("fast test hasher")
}
