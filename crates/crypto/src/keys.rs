//! Key material and per-purpose derivation.
//!
//! A folder owns one symmetric root key. Subkeys for segment encryption and
//! subject obfuscation are derived from it with HKDF-SHA256 under fixed
//! context strings, so the two purposes can never collide even though they
//! share a root. Users own an X25519 keypair for private-share wrapping.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::KEY_LEN;

const HKDF_SALT_DOMAIN: &[u8] = b"usenetsync-hkdf-salt-v1";

/// Symmetric root key of a folder. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FolderKey([u8; KEY_LEN]);

impl FolderKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the subkey for one purpose. Deterministic: the receiver
    /// re-derives the same subkeys from the unwrapped folder key.
    pub fn derive(&self, purpose: KeyPurpose) -> SubKey {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT_DOMAIN), &self.0);
        let mut okm = [0u8; KEY_LEN];
        // Expand cannot fail for a 32-byte output.
        hk.expand(purpose.info(), &mut okm)
            .expect("hkdf expand of 32 bytes");
        SubKey(okm)
    }
}

impl std::fmt::Debug for FolderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderKey").field("key", &"[REDACTED]").finish()
    }
}

/// Purposes a folder subkey can be derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    SubjectObfuscation,
    SegmentEncryption,
    /// Sealing the folder's own private key at rest.
    KeySealing,
}

impl KeyPurpose {
    fn info(&self) -> &'static [u8] {
        match self {
            KeyPurpose::SubjectObfuscation => b"usenetsync:subject_obfuscation:v1",
            KeyPurpose::SegmentEncryption => b"usenetsync:segment_encryption:v1",
            KeyPurpose::KeySealing => b"usenetsync:key_sealing:v1",
        }
    }
}

/// Purpose-bound symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SubKey(pub(crate) [u8; KEY_LEN]);

impl SubKey {
    /// Wrap externally derived key material (KDF outputs, wrapping keys).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubKey").field("key", &"[REDACTED]").finish()
    }
}

/// X25519 identity keypair for a user.
pub struct UserKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl UserKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for UserKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkeys_differ_by_purpose() {
        let root = FolderKey::generate();
        let subject = root.derive(KeyPurpose::SubjectObfuscation);
        let segment = root.derive(KeyPurpose::SegmentEncryption);
        assert_ne!(subject.as_bytes(), segment.as_bytes());
    }

    #[test]
    fn derivation_is_deterministic() {
        let root = FolderKey::from_bytes([9u8; 32]);
        let a = root.derive(KeyPurpose::SegmentEncryption);
        let b = root.derive(KeyPurpose::SegmentEncryption);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn debug_redacts_key_material() {
        let root = FolderKey::generate();
        let rendered = format!("{root:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(root.as_bytes())));
    }

    #[test]
    fn keypair_roundtrips_through_secret_bytes() {
        let pair = UserKeyPair::generate();
        let restored = UserKeyPair::from_secret_bytes(pair.secret_bytes());
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }
}
