use common::error::{ErrorKind, Kinded};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccessError {
    /// Uniform refusal. Deliberately carries no detail: a wrong passphrase,
    /// an unknown user, an expired share, and a token that never existed
    /// all land here.
    #[error("access denied")]
    Denied,

    #[error("malformed share material: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
}

impl Kinded for AccessError {
    fn kind(&self) -> ErrorKind {
        match self {
            AccessError::Denied => ErrorKind::Denied,
            AccessError::Malformed(_) => ErrorKind::Integrity,
            AccessError::Crypto(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;
