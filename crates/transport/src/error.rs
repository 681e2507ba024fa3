use common::error::{ErrorKind, Kinded};
use thiserror::Error;

/// Types that can classify themselves for the shared retry utility.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("malformed server response: {0}")]
    Protocol(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("article not found")]
    NotFound,

    #[error("article exceeds server limit ({limit} bytes)")]
    ArticleTooLarge { limit: usize },

    #[error("server rejected {command}: {code} {message}")]
    Status {
        command: &'static str,
        code: u16,
        message: String,
    },

    #[error("server rate limit: {0}")]
    RateLimited(String),
}

impl TransportError {
    /// Transient failures are retried with exponential backoff; permanent
    /// ones surface immediately.
    pub fn classify(command: &'static str, code: u16, message: String) -> Self {
        match code {
            430 => TransportError::NotFound,
            480 | 481 | 482 | 502 => TransportError::AuthRejected(message),
            400 if message.to_ascii_lowercase().contains("too many") => {
                TransportError::RateLimited(message)
            }
            _ => TransportError::Status {
                command,
                code,
                message,
            },
        }
    }
}

impl IsTransient for TransportError {
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(_)
            | TransportError::Timeout { .. }
            | TransportError::ConnectionClosed
            | TransportError::Protocol(_)
            | TransportError::RateLimited(_) => true,
            TransportError::Status { code, .. } => (400..500).contains(code),
            TransportError::Tls(_)
            | TransportError::AuthRejected(_)
            | TransportError::NotFound
            | TransportError::ArticleTooLarge { .. } => false,
        }
    }
}

impl Kinded for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::AuthRejected(_) => ErrorKind::Denied,
            TransportError::NotFound => ErrorKind::NotFound,
            TransportError::RateLimited(_) => ErrorKind::RateLimited,
            TransportError::ArticleTooLarge { .. } => ErrorKind::Usage,
            _ => ErrorKind::Transport,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert!(TransportError::ConnectionClosed.is_transient());
        assert!(TransportError::classify("POST", 441, "posting failed".into()).is_transient());
        assert!(!TransportError::classify("POST", 502, "no permission".into()).is_transient());
        assert!(!TransportError::classify("ARTICLE", 430, "no such".into()).is_transient());
        assert!(matches!(
            TransportError::classify("ARTICLE", 430, "no such".into()),
            TransportError::NotFound
        ));
    }

    #[test]
    fn auth_rejection_is_denied() {
        let err = TransportError::classify("AUTHINFO", 481, "bad creds".into());
        assert_eq!(err.kind(), ErrorKind::Denied);
        assert!(!err.is_transient());
    }
}
