use common::error::{ErrorKind, Kinded};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmenterError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("content hash mismatch for {path}")]
    HashMismatch { path: String },

    #[error("pack member too large: {path} ({size} bytes)")]
    MemberTooLarge { path: String, size: u64 },

    #[error("malformed pack directory: {0}")]
    MalformedPack(String),

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl Kinded for SegmenterError {
    fn kind(&self) -> ErrorKind {
        match self {
            SegmenterError::Io(_) => ErrorKind::Internal,
            SegmenterError::HashMismatch { .. } | SegmenterError::MalformedPack(_) => {
                ErrorKind::Integrity
            }
            SegmenterError::MemberTooLarge { .. } => ErrorKind::Usage,
            SegmenterError::Crypto(e) => e.kind(),
            SegmenterError::Codec(e) => e.kind(),
            SegmenterError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SegmenterError>;
