//! Share creation and the verification entry point.

use common::{unix_now, FolderId, MessageId, ShareRecord, ShareState, UserId};
use crypto::kdf::KdfParams;
use crypto::{FolderKey, UserKeyPair};
use tracing::info;

use crate::error::{AccessError, Result};
use crate::token::{encode_token, new_seed, share_id_from_seed, ShareToken};
use crate::wrapping::{
    unwrap_private, unwrap_protected, unwrap_public, wrap_private, wrap_protected, wrap_public,
    WrappedKeyMaterial,
};

/// One allowed identity of a private share.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: UserId,
    pub public_key: [u8; 32],
}

/// How a share is to be protected.
#[derive(Debug, Clone)]
pub enum AccessSpec {
    Public,
    Protected {
        passphrase: String,
        kdf: KdfParams,
    },
    Private {
        recipients: Vec<Recipient>,
    },
}

/// What a receiver presents to `verify_access`.
pub enum Credentials {
    Anonymous,
    Passphrase(String),
    User {
        user_id: UserId,
        keypair: UserKeyPair,
    },
}

/// Wrap the folder key for the chosen access type, mint the token, and
/// produce the row the store keeps. `index_refs` are the Message-IDs of
/// the posted core index segments.
pub fn build_share(
    folder_id: &FolderId,
    folder_key: &FolderKey,
    spec: &AccessSpec,
    index_refs: &[MessageId],
    expires_at: Option<u64>,
) -> Result<(ShareRecord, String)> {
    let wrapped = match spec {
        AccessSpec::Public => wrap_public(folder_key)?,
        AccessSpec::Protected { passphrase, kdf } => wrap_protected(folder_key, passphrase, kdf)?,
        AccessSpec::Private { recipients } => {
            let pairs: Vec<(UserId, [u8; 32])> = recipients
                .iter()
                .map(|r| (r.user_id, r.public_key))
                .collect();
            wrap_private(folder_key, &pairs)?
        }
    };

    let seed = new_seed();
    let token = encode_token(&seed, folder_id, &wrapped, index_refs, expires_at)?;
    let password_verifier = match &wrapped {
        WrappedKeyMaterial::Protected { verifier, .. } => Some(verifier.clone()),
        _ => None,
    };

    let record = ShareRecord {
        share_id: share_id_from_seed(&seed),
        folder_id: *folder_id,
        access_type: wrapped.access_type(),
        wrapped_key_material: wrapped.encode(),
        index_refs: index_refs.to_vec(),
        expires_at,
        password_verifier,
        state: ShareState::Active,
        created_at: unix_now(),
    };
    info!(
        share = %record.share_id,
        access = ?record.access_type,
        refs = index_refs.len(),
        "share created"
    );
    Ok((record, token))
}

/// The single gate the download engine passes through. Success yields the
/// folder key; every failure mode is the same `Denied`.
pub fn verify_access(token: &ShareToken, credentials: &Credentials) -> Result<FolderKey> {
    if let Some(expiry) = token.expires_at {
        if unix_now() >= expiry {
            return Err(AccessError::Denied);
        }
    }
    match (&token.wrapped, credentials) {
        (WrappedKeyMaterial::Public { version, sealed }, _) => unwrap_public(*version, sealed),
        (
            WrappedKeyMaterial::Protected {
                salt,
                params,
                verifier,
                sealed,
            },
            Credentials::Passphrase(passphrase),
        ) => unwrap_protected(salt, params, verifier, sealed, passphrase),
        (
            WrappedKeyMaterial::Private {
                commit_salt,
                entries,
            },
            Credentials::User { user_id, keypair },
        ) => unwrap_private(commit_salt, entries, user_id, keypair),
        // Wrong credential shape for the access type.
        _ => Err(AccessError::Denied),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::parse_token;

    fn fast_kdf() -> KdfParams {
        KdfParams {
            m_cost_kib: 8 * 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn refs() -> Vec<MessageId> {
        vec![MessageId::parse("<index@news.example.com>").unwrap()]
    }

    #[test]
    fn public_share_end_to_end() {
        let folder_id = FolderId([1u8; 16]);
        let key = FolderKey::generate();
        let (record, token) =
            build_share(&folder_id, &key, &AccessSpec::Public, &refs(), None).unwrap();
        assert_eq!(record.access_type, common::AccessType::Public);

        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.share_id(), record.share_id);
        let opened = verify_access(&parsed, &Credentials::Anonymous).unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn protected_share_accepts_only_exact_passphrase() {
        let folder_id = FolderId([2u8; 16]);
        let key = FolderKey::generate();
        let spec = AccessSpec::Protected {
            passphrase: "correct horse battery staple".to_string(),
            kdf: fast_kdf(),
        };
        let (record, token) = build_share(&folder_id, &key, &spec, &refs(), None).unwrap();
        assert!(record.password_verifier.is_some());

        let parsed = parse_token(&token).unwrap();
        let opened = verify_access(
            &parsed,
            &Credentials::Passphrase("correct horse battery staple".to_string()),
        )
        .unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());

        // One character off: denied, and no network was ever involved.
        assert!(matches!(
            verify_access(
                &parsed,
                &Credentials::Passphrase("correct horse battery stapl3".to_string()),
            ),
            Err(AccessError::Denied)
        ));
        // Wrong credential shape is the same denial.
        assert!(matches!(
            verify_access(&parsed, &Credentials::Anonymous),
            Err(AccessError::Denied)
        ));
    }

    #[test]
    fn private_share_membership() {
        let folder_id = FolderId([3u8; 16]);
        let key = FolderKey::generate();
        let u1 = (UserId([1u8; 32]), UserKeyPair::generate());
        let u2 = (UserId([2u8; 32]), UserKeyPair::generate());
        let u3 = (UserId([3u8; 32]), UserKeyPair::generate());

        let spec = AccessSpec::Private {
            recipients: vec![
                Recipient {
                    user_id: u1.0,
                    public_key: u1.1.public_bytes(),
                },
                Recipient {
                    user_id: u2.0,
                    public_key: u2.1.public_bytes(),
                },
            ],
        };
        let (_, token) = build_share(&folder_id, &key, &spec, &refs(), None).unwrap();
        let parsed = parse_token(&token).unwrap();

        let opened = verify_access(
            &parsed,
            &Credentials::User {
                user_id: u1.0,
                keypair: UserKeyPair::from_secret_bytes(u1.1.secret_bytes()),
            },
        )
        .unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());

        assert!(matches!(
            verify_access(
                &parsed,
                &Credentials::User {
                    user_id: u3.0,
                    keypair: u3.1,
                },
            ),
            Err(AccessError::Denied)
        ));
    }

    #[test]
    fn expired_share_is_denied() {
        let folder_id = FolderId([4u8; 16]);
        let key = FolderKey::generate();
        let (_, token) = build_share(
            &folder_id,
            &key,
            &AccessSpec::Public,
            &refs(),
            Some(unix_now() - 10),
        )
        .unwrap();
        let parsed = parse_token(&token).unwrap();
        assert!(matches!(
            verify_access(&parsed, &Credentials::Anonymous),
            Err(AccessError::Denied)
        ));
    }

    #[test]
    fn revocation_by_republish_rotates_the_key() {
        // The old token keeps decrypting only the historical manifest: a
        // fresh folder key means a fresh share whose key the old token
        // cannot produce.
        let folder_id = FolderId([5u8; 16]);
        let old_key = FolderKey::generate();
        let (_, old_token) =
            build_share(&folder_id, &old_key, &AccessSpec::Public, &refs(), None).unwrap();

        let new_key = FolderKey::generate();
        let (_, new_token) =
            build_share(&folder_id, &new_key, &AccessSpec::Public, &refs(), None).unwrap();

        let old_opened =
            verify_access(&parse_token(&old_token).unwrap(), &Credentials::Anonymous).unwrap();
        let new_opened =
            verify_access(&parse_token(&new_token).unwrap(), &Credentials::Anonymous).unwrap();
        assert_eq!(old_opened.as_bytes(), old_key.as_bytes());
        assert_ne!(old_opened.as_bytes(), new_opened.as_bytes());
    }
}
