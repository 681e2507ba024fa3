use common::error::{ErrorKind, Kinded};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed yEnc article: {0}")]
    YencMalformed(String),

    #[error("yEnc size mismatch: header says {expected}, decoded {actual}")]
    YencSizeMismatch { expected: u64, actual: u64 },

    #[error("yEnc pcrc32 mismatch")]
    YencCrcMismatch,

    #[error("{algorithm} backend failure: {message}")]
    CompressionBackend {
        algorithm: &'static str,
        message: String,
    },

    #[error("unknown compression envelope tag {0:#04x}")]
    UnknownEnvelopeTag(u8),

    #[error("compression envelope truncated")]
    EnvelopeTruncated,
}

impl Kinded for CodecError {
    fn kind(&self) -> ErrorKind {
        match self {
            CodecError::CompressionBackend { .. } => ErrorKind::Internal,
            _ => ErrorKind::Integrity,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
