use common::error::{ErrorKind, Kinded};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("folder not found: {0}")]
    FolderMissing(String),

    #[error("folder {0} is not indexed yet")]
    NotIndexed(String),

    #[error("folder {0} is not uploaded yet")]
    NotUploaded(String),

    #[error("user name taken: {0}")]
    NameTaken(String),

    #[error("path does not exist: {0}")]
    PathMissing(String),

    #[error("unknown transfer handle {0}")]
    UnknownHandle(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    #[error(transparent)]
    Access(#[from] access::AccessError),

    #[error(transparent)]
    Segmenter(#[from] segmenter::SegmenterError),

    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
}

impl Kinded for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::FolderMissing(_) | EngineError::UnknownHandle(_) => ErrorKind::NotFound,
            EngineError::NotIndexed(_)
            | EngineError::NotUploaded(_)
            | EngineError::NameTaken(_)
            | EngineError::PathMissing(_) => ErrorKind::Usage,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Io(_) => ErrorKind::Internal,
            EngineError::Store(e) => e.kind(),
            EngineError::Transport(e) => e.kind(),
            EngineError::Access(e) => e.kind(),
            EngineError::Segmenter(e) => e.kind(),
            EngineError::Manifest(e) => e.kind(),
            EngineError::Codec(e) => e.kind(),
            EngineError::Crypto(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
