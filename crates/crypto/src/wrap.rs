//! X25519 sealed-box key wrapping for private shares.
//!
//! `seal_for` wraps a folder key to a recipient's static public key using an
//! ephemeral keypair: the wrapping key is HKDF-SHA256 over the ECDH shared
//! secret, salted with both public keys so the same folder key wrapped for
//! two users shares no structure. Layout: `eph_pk(32) || aead_payload`.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::aead;
use crate::error::{CryptoError, Result};
use crate::keys::{SubKey, UserKeyPair};
use crate::{KEY_LEN, NONCE_LEN, TAG_LEN};

const WRAP_INFO: &[u8] = b"usenetsync:share_key_wrap:v1";

fn wrap_key(shared: &[u8; 32], eph_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> SubKey {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pk);
    salt[32..].copy_from_slice(recipient_pk);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut okm).expect("hkdf expand of 32 bytes");
    SubKey(okm)
}

/// Seal `plaintext` to the holder of `recipient_pk`.
pub fn seal_for(recipient_pk: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let eph_pk = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_pk));

    let key = wrap_key(shared.as_bytes(), eph_pk.as_bytes(), recipient_pk);
    let sealed = aead::encrypt(&key, plaintext)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a sealed box with the recipient's keypair.
pub fn open_sealed(recipient: &UserKeyPair, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 32 + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedWrapping);
    }
    let (eph_pk_bytes, payload) = sealed.split_at(32);
    let eph_pk: [u8; 32] = eph_pk_bytes.try_into().expect("split at 32");

    let shared = recipient.secret().diffie_hellman(&PublicKey::from(eph_pk));
    let key = wrap_key(shared.as_bytes(), &eph_pk, &recipient.public_bytes());
    aead::decrypt(&key, payload)
}
