//! Two-layer subject obfuscation.
//!
//! The *inner* token is an HMAC-SHA256 over `(folder_id, version,
//! segment_index)` under the folder's subject subkey, truncated to 16
//! bytes. It is deterministic, so a receiver holding the folder key can
//! regenerate it, yet indistinguishable from random without the key.
//!
//! The *outer* subject on the wire prefixes 8 one-time random bytes, so
//! reposts of the same segment (redundancy copies, retries) cannot be
//! clustered by subject even by an observer holding two articles side by
//! side.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use common::FolderId;

use crate::keys::SubKey;
use crate::{SUBJECT_INNER_LEN, SUBJECT_OUTER_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Deterministic 16-byte inner token for one segment position.
pub fn inner_subject(
    subject_key: &SubKey,
    folder_id: &FolderId,
    version: u32,
    segment_index: u32,
) -> [u8; SUBJECT_INNER_LEN] {
    let mut mac = HmacSha256::new_from_slice(subject_key.as_bytes())
        .expect("hmac accepts 32-byte keys");
    mac.update(folder_id.as_bytes());
    mac.update(&version.to_le_bytes());
    mac.update(&segment_index.to_le_bytes());
    let digest = mac.finalize().into_bytes();

    let mut token = [0u8; SUBJECT_INNER_LEN];
    token.copy_from_slice(&digest[..SUBJECT_INNER_LEN]);
    token
}

/// Wire subject: hex of `random8 || inner16`. Fresh randomness per call.
pub fn outer_subject(inner: &[u8; SUBJECT_INNER_LEN]) -> String {
    let mut raw = [0u8; SUBJECT_OUTER_LEN + SUBJECT_INNER_LEN];
    OsRng.fill_bytes(&mut raw[..SUBJECT_OUTER_LEN]);
    raw[SUBJECT_OUTER_LEN..].copy_from_slice(inner);
    hex::encode(raw)
}

/// Whether a wire subject carries the given inner token. Constant-time on
/// the token comparison.
pub fn outer_matches_inner(outer: &str, inner: &[u8; SUBJECT_INNER_LEN]) -> bool {
    let Ok(raw) = hex::decode(outer) else {
        return false;
    };
    if raw.len() != SUBJECT_OUTER_LEN + SUBJECT_INNER_LEN {
        return false;
    }
    raw[SUBJECT_OUTER_LEN..].ct_eq(inner).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FolderKey, KeyPurpose};

    fn subject_key() -> SubKey {
        FolderKey::from_bytes([11u8; 32]).derive(KeyPurpose::SubjectObfuscation)
    }

    #[test]
    fn inner_is_deterministic() {
        let key = subject_key();
        let folder = FolderId([1u8; 16]);
        let a = inner_subject(&key, &folder, 1, 42);
        let b = inner_subject(&key, &folder, 1, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn inner_varies_with_position() {
        let key = subject_key();
        let folder = FolderId([1u8; 16]);
        assert_ne!(
            inner_subject(&key, &folder, 1, 0),
            inner_subject(&key, &folder, 1, 1)
        );
        assert_ne!(
            inner_subject(&key, &folder, 1, 0),
            inner_subject(&key, &folder, 2, 0)
        );
    }

    #[test]
    fn inner_varies_with_key() {
        let folder = FolderId([1u8; 16]);
        let a = inner_subject(&subject_key(), &folder, 1, 0);
        let other = FolderKey::from_bytes([12u8; 32]).derive(KeyPurpose::SubjectObfuscation);
        let b = inner_subject(&other, &folder, 1, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn reposts_get_distinct_outer_subjects() {
        let key = subject_key();
        let inner = inner_subject(&key, &FolderId([2u8; 16]), 1, 7);
        let first = outer_subject(&inner);
        let second = outer_subject(&inner);
        assert_ne!(first, second);
        assert!(outer_matches_inner(&first, &inner));
        assert!(outer_matches_inner(&second, &inner));
    }

    #[test]
    fn mismatched_inner_is_rejected() {
        let key = subject_key();
        let inner = inner_subject(&key, &FolderId([2u8; 16]), 1, 7);
        let other = inner_subject(&key, &FolderId([2u8; 16]), 1, 8);
        let wire = outer_subject(&inner);
        assert!(!outer_matches_inner(&wire, &other));
        assert!(!outer_matches_inner("zz-not-hex", &inner));
    }
}
