use serde::{Deserialize, Serialize};

/// Coarse failure taxonomy shared by every crate. Crate-local error enums
/// map into one of these kinds; process surfaces derive exit codes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller error: bad arguments, missing prerequisites.
    Usage,
    NotFound,
    /// Access verification failed. Indistinguishable from NotFound at the
    /// user-facing surface for shares that might not exist.
    Denied,
    /// Hash mismatch or AEAD authentication failure.
    Integrity,
    /// Network-level failure, retried before it reaches a queue item.
    Transport,
    RateLimited,
    Cancelled,
    /// Invariant violation or store corruption. Never silently retried.
    Internal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Usage => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Denied => 4,
            ErrorKind::Transport | ErrorKind::RateLimited => 5,
            ErrorKind::Integrity => 6,
            ErrorKind::Cancelled => 7,
            ErrorKind::Internal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Usage => "usage",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Denied => "denied",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Transport => "transport",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by crate error enums so the engines and the CLI can act on
/// the kind without matching concrete variants across crate boundaries.
pub trait Kinded {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_contract() {
        assert_eq!(ErrorKind::Usage.exit_code(), 2);
        assert_eq!(ErrorKind::NotFound.exit_code(), 3);
        assert_eq!(ErrorKind::Denied.exit_code(), 4);
        assert_eq!(ErrorKind::Transport.exit_code(), 5);
        assert_eq!(ErrorKind::Integrity.exit_code(), 6);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 7);
    }
}
