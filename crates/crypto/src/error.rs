use common::error::{ErrorKind, Kinded};
use thiserror::Error;

/// Crypto-layer errors. Variants avoid echoing key material or plaintext.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("authentication failed: AEAD tag mismatch")]
    AuthenticationFailed,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("malformed wrapped key material")]
    MalformedWrapping,

    #[error("verifier rejected passphrase")]
    VerifierMismatch,

    #[error("malformed password verifier: {0}")]
    MalformedVerifier(String),
}

impl Kinded for CryptoError {
    fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::AuthenticationFailed => ErrorKind::Integrity,
            CryptoError::VerifierMismatch => ErrorKind::Denied,
            CryptoError::MalformedWrapping | CryptoError::MalformedVerifier(_) => {
                ErrorKind::Integrity
            }
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
