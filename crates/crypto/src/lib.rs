//! Cryptographic primitives for the publish/retrieve pipeline.
//!
//! Everything downstream components need is behind five small surfaces:
//!
//! - AEAD segment encryption (AES-256-GCM, random 96-bit nonce per call)
//! - SHA-256 content hashing
//! - Argon2id passphrase derivation for protected shares
//! - HKDF-SHA256 per-purpose subkeys derived from a folder key
//! - two-layer subject obfuscation and X25519 key wrapping for shares
//!
//! Key material is held in zeroize-on-drop newtypes and never logged.

pub mod aead;
pub mod error;
pub mod hashing;
pub mod kdf;
pub mod keys;
pub mod obfuscate;
pub mod token;
pub mod wrap;

pub use aead::{decrypt, encrypt};
pub use error::{CryptoError, Result};
pub use hashing::{sha256, Sha256Stream};
pub use kdf::{derive_wrap_key, make_verifier, verify_passphrase, KdfParams};
pub use keys::{FolderKey, KeyPurpose, SubKey, UserKeyPair};
pub use obfuscate::{inner_subject, outer_matches_inner, outer_subject};
pub use token::{generate_api_key, generate_share_token};
pub use wrap::{open_sealed, seal_for};

/// AEAD key length (AES-256).
pub const KEY_LEN: usize = 32;

/// AEAD nonce length (96 bits, random per call).
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// Deterministic inner subject token length.
pub const SUBJECT_INNER_LEN: usize = 16;

/// One-time random prefix prepended to the wire subject.
pub const SUBJECT_OUTER_LEN: usize = 8;
