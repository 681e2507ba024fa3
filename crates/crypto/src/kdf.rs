//! Passphrase-based key derivation for protected shares.
//!
//! Argon2id with tunable memory/time/lane cost. Two independent artifacts
//! come out of one passphrase:
//!
//! - a 32-byte wrapping key (salt carried inside the share's wrapped key
//!   material), used to seal the folder key;
//! - a PHC-string verifier under its own salt, stored on the share row so a
//!   wrong passphrase fails fast without touching the network.

use argon2::password_hash::rand_core::OsRng as PhcOsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, Result};
use crate::KEY_LEN;

/// Tunable Argon2id cost. The defaults follow the argon2 crate's own
/// (19 MiB, 2 passes, 1 lane) and are embedded in the share envelope so
/// old shares keep decrypting after defaults move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(self.m_cost_kib, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derive a 32-byte wrapping key from a passphrase and salt.
pub fn derive_wrap_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; KEY_LEN]> {
    let mut out = [0u8; KEY_LEN];
    params
        .argon2()?
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(out)
}

/// Produce a PHC-string verifier for fail-fast passphrase checks.
pub fn make_verifier(passphrase: &str, params: &KdfParams) -> Result<String> {
    let salt = SaltString::generate(&mut PhcOsRng);
    let hash = params
        .argon2()?
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(hash.to_string())
}

/// Check a passphrase against a stored verifier. A mismatch is `Denied`;
/// a verifier that does not parse is `Integrity`.
pub fn verify_passphrase(verifier: &str, passphrase: &str) -> Result<()> {
    let parsed =
        PasswordHash::new(verifier).map_err(|e| CryptoError::MalformedVerifier(e.to_string()))?;
    Argon2::default()
        .verify_password(passphrase.as_bytes(), &parsed)
        .map_err(|_| CryptoError::VerifierMismatch)
}
