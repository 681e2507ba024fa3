//! Folder-key wrapping per access type.
//!
//! - Public: sealed under a well-known per-major-version constant, so the
//!   token alone suffices.
//! - Protected: sealed under an Argon2id-derived key; an independent PHC
//!   verifier rides along for fail-fast rejection before any network work.
//! - Private: sealed once per allowed user via X25519, with a salted
//!   commitment table so membership can be checked without revealing the
//!   folder key or the user list.

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use common::UserId;
use crypto::kdf::KdfParams;
use crypto::{sha256, FolderKey, SubKey, UserKeyPair};

use crate::error::{AccessError, Result};

const TAG_PUBLIC: u8 = 0;
const TAG_PROTECTED: u8 = 1;
const TAG_PRIVATE: u8 = 2;

/// The well-known wrapping key for public shares, fixed per major
/// version. A future major bumps the derivation string; readers walk the
/// known versions.
fn public_wrap_key(version: u8) -> Option<SubKey> {
    match version {
        1 => Some(SubKey::from_bytes(
            sha256(b"usenetsync:public-share-wrap:v1").0,
        )),
        _ => None,
    }
}

const PUBLIC_WRAP_CURRENT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateEntry {
    /// `sha256(commit_salt || user_id)`.
    pub commitment: [u8; 32],
    pub sealed: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedKeyMaterial {
    Public {
        version: u8,
        sealed: Vec<u8>,
    },
    Protected {
        salt: [u8; 16],
        params: KdfParams,
        verifier: String,
        sealed: Vec<u8>,
    },
    Private {
        commit_salt: [u8; 16],
        entries: Vec<PrivateEntry>,
    },
}

pub fn wrap_public(folder_key: &FolderKey) -> Result<WrappedKeyMaterial> {
    let key = public_wrap_key(PUBLIC_WRAP_CURRENT).expect("current version exists");
    let sealed = crypto::encrypt(&key, folder_key.as_bytes())?;
    Ok(WrappedKeyMaterial::Public {
        version: PUBLIC_WRAP_CURRENT,
        sealed,
    })
}

pub fn wrap_protected(
    folder_key: &FolderKey,
    passphrase: &str,
    params: &KdfParams,
) -> Result<WrappedKeyMaterial> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let wrap = SubKey::from_bytes(crypto::derive_wrap_key(passphrase, &salt, params)?);
    let sealed = crypto::encrypt(&wrap, folder_key.as_bytes())?;
    let verifier = crypto::make_verifier(passphrase, params)?;
    Ok(WrappedKeyMaterial::Protected {
        salt,
        params: *params,
        verifier,
        sealed,
    })
}

pub fn wrap_private(
    folder_key: &FolderKey,
    recipients: &[(UserId, [u8; 32])],
) -> Result<WrappedKeyMaterial> {
    let mut commit_salt = [0u8; 16];
    OsRng.fill_bytes(&mut commit_salt);
    let mut entries = Vec::with_capacity(recipients.len());
    for (user_id, public_key) in recipients {
        let commitment = commitment_for(&commit_salt, user_id);
        let sealed = crypto::seal_for(public_key, folder_key.as_bytes())?;
        entries.push(PrivateEntry { commitment, sealed });
    }
    Ok(WrappedKeyMaterial::Private {
        commit_salt,
        entries,
    })
}

fn commitment_for(commit_salt: &[u8; 16], user_id: &UserId) -> [u8; 32] {
    let mut input = Vec::with_capacity(48);
    input.extend_from_slice(commit_salt);
    input.extend_from_slice(&user_id.0);
    sha256(&input).0
}

fn folder_key_from(plain: Vec<u8>) -> Result<FolderKey> {
    FolderKey::from_slice(&plain).map_err(AccessError::from)
}

pub fn unwrap_public(version: u8, sealed: &[u8]) -> Result<FolderKey> {
    let key = public_wrap_key(version).ok_or(AccessError::Denied)?;
    let plain = crypto::decrypt(&key, sealed).map_err(|_| AccessError::Denied)?;
    folder_key_from(plain)
}

/// The verifier runs first: a wrong passphrase is rejected without paying
/// the Argon2 derivation twice or touching the network.
pub fn unwrap_protected(
    salt: &[u8; 16],
    params: &KdfParams,
    verifier: &str,
    sealed: &[u8],
    passphrase: &str,
) -> Result<FolderKey> {
    crypto::verify_passphrase(verifier, passphrase).map_err(|_| AccessError::Denied)?;
    let wrap = SubKey::from_bytes(
        crypto::derive_wrap_key(passphrase, salt, params).map_err(|_| AccessError::Denied)?,
    );
    let plain = crypto::decrypt(&wrap, sealed).map_err(|_| AccessError::Denied)?;
    folder_key_from(plain)
}

pub fn unwrap_private(
    commit_salt: &[u8; 16],
    entries: &[PrivateEntry],
    user_id: &UserId,
    keypair: &UserKeyPair,
) -> Result<FolderKey> {
    let commitment = commitment_for(commit_salt, user_id);
    // Scan every entry regardless of match position.
    let mut matched: Option<&PrivateEntry> = None;
    for entry in entries {
        if bool::from(entry.commitment.ct_eq(&commitment)) {
            matched = Some(entry);
        }
    }
    let entry = matched.ok_or(AccessError::Denied)?;
    let plain = crypto::open_sealed(keypair, &entry.sealed).map_err(|_| AccessError::Denied)?;
    folder_key_from(plain)
}

// -- binary layout --------------------------------------------------------

fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    out.extend_from_slice(&buf);
}

impl WrappedKeyMaterial {
    pub fn access_type(&self) -> common::AccessType {
        match self {
            WrappedKeyMaterial::Public { .. } => common::AccessType::Public,
            WrappedKeyMaterial::Protected { .. } => common::AccessType::Protected,
            WrappedKeyMaterial::Private { .. } => common::AccessType::Private,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            WrappedKeyMaterial::Public { version, sealed } => {
                out.push(TAG_PUBLIC);
                out.push(*version);
                put_u32(&mut out, sealed.len() as u32);
                out.extend_from_slice(sealed);
            }
            WrappedKeyMaterial::Protected {
                salt,
                params,
                verifier,
                sealed,
            } => {
                out.push(TAG_PROTECTED);
                out.extend_from_slice(salt);
                put_u32(&mut out, params.m_cost_kib);
                put_u32(&mut out, params.t_cost);
                put_u32(&mut out, params.p_cost);
                put_u16(&mut out, verifier.len() as u16);
                out.extend_from_slice(verifier.as_bytes());
                put_u32(&mut out, sealed.len() as u32);
                out.extend_from_slice(sealed);
            }
            WrappedKeyMaterial::Private {
                commit_salt,
                entries,
            } => {
                out.push(TAG_PRIVATE);
                out.extend_from_slice(commit_salt);
                put_u16(&mut out, entries.len() as u16);
                for entry in entries {
                    out.extend_from_slice(&entry.commitment);
                    put_u32(&mut out, entry.sealed.len() as u32);
                    out.extend_from_slice(&entry.sealed);
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cur { data: bytes, pos: 0 };
        match cur.u8("tag")? {
            TAG_PUBLIC => {
                let version = cur.u8("version")?;
                let len = cur.u32("sealed len")? as usize;
                let sealed = cur.take(len, "sealed")?.to_vec();
                Ok(WrappedKeyMaterial::Public { version, sealed })
            }
            TAG_PROTECTED => {
                let salt: [u8; 16] = cur.take(16, "salt")?.try_into().expect("16 bytes");
                let params = KdfParams {
                    m_cost_kib: cur.u32("m_cost")?,
                    t_cost: cur.u32("t_cost")?,
                    p_cost: cur.u32("p_cost")?,
                };
                let vlen = cur.u16("verifier len")? as usize;
                let verifier = String::from_utf8(cur.take(vlen, "verifier")?.to_vec())
                    .map_err(|_| AccessError::Malformed("verifier".to_string()))?;
                let slen = cur.u32("sealed len")? as usize;
                let sealed = cur.take(slen, "sealed")?.to_vec();
                Ok(WrappedKeyMaterial::Protected {
                    salt,
                    params,
                    verifier,
                    sealed,
                })
            }
            TAG_PRIVATE => {
                let commit_salt: [u8; 16] =
                    cur.take(16, "commit salt")?.try_into().expect("16 bytes");
                let count = cur.u16("entry count")? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let commitment: [u8; 32] =
                        cur.take(32, "commitment")?.try_into().expect("32 bytes");
                    let len = cur.u32("sealed len")? as usize;
                    let sealed = cur.take(len, "sealed")?.to_vec();
                    entries.push(PrivateEntry { commitment, sealed });
                }
                Ok(WrappedKeyMaterial::Private {
                    commit_salt,
                    entries,
                })
            }
            other => Err(AccessError::Malformed(format!("unknown wrap tag {other}"))),
        }
    }
}

struct Cur<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| AccessError::Malformed(format!("truncated {what}")))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, what)?))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4, what)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            m_cost_kib: 8 * 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn public_wrap_roundtrip() {
        let key = FolderKey::generate();
        let material = wrap_public(&key).unwrap();
        let WrappedKeyMaterial::Public { version, sealed } = &material else {
            panic!("wrong variant");
        };
        let opened = unwrap_public(*version, sealed).unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
        // An unknown major version is a plain denial.
        assert!(matches!(unwrap_public(9, sealed), Err(AccessError::Denied)));
    }

    #[test]
    fn protected_wrap_checks_verifier_first() {
        let key = FolderKey::generate();
        let material = wrap_protected(&key, "correct horse battery staple", &fast_params()).unwrap();
        let WrappedKeyMaterial::Protected {
            salt,
            params,
            verifier,
            sealed,
        } = &material
        else {
            panic!("wrong variant");
        };
        let opened =
            unwrap_protected(salt, params, verifier, sealed, "correct horse battery staple")
                .unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
        assert!(matches!(
            unwrap_protected(salt, params, verifier, sealed, "correct horse battery stapl3"),
            Err(AccessError::Denied)
        ));
    }

    #[test]
    fn private_wrap_admits_only_listed_users() {
        let key = FolderKey::generate();
        let u1 = (UserId([1u8; 32]), UserKeyPair::generate());
        let u2 = (UserId([2u8; 32]), UserKeyPair::generate());
        let u3 = (UserId([3u8; 32]), UserKeyPair::generate());

        let material = wrap_private(
            &key,
            &[(u1.0, u1.1.public_bytes()), (u2.0, u2.1.public_bytes())],
        )
        .unwrap();
        let WrappedKeyMaterial::Private {
            commit_salt,
            entries,
        } = &material
        else {
            panic!("wrong variant");
        };

        let opened = unwrap_private(commit_salt, entries, &u1.0, &u1.1).unwrap();
        assert_eq!(opened.as_bytes(), key.as_bytes());
        unwrap_private(commit_salt, entries, &u2.0, &u2.1).unwrap();
        assert!(matches!(
            unwrap_private(commit_salt, entries, &u3.0, &u3.1),
            Err(AccessError::Denied)
        ));
        // Right id with the wrong private key is the same denial.
        assert!(matches!(
            unwrap_private(commit_salt, entries, &u1.0, &u3.1),
            Err(AccessError::Denied)
        ));
    }

    #[test]
    fn commitments_do_not_leak_user_ids() {
        let key = FolderKey::generate();
        let user = UserId([7u8; 32]);
        let pair = UserKeyPair::generate();
        let material = wrap_private(&key, &[(user, pair.public_bytes())]).unwrap();
        let encoded = material.encode();
        // The raw user id must not appear anywhere in the wrapping.
        assert!(!encoded
            .windows(32)
            .any(|w| w == user.0.as_slice()));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = FolderKey::generate();
        for material in [
            wrap_public(&key).unwrap(),
            wrap_protected(&key, "pw", &fast_params()).unwrap(),
            wrap_private(&key, &[(UserId([5u8; 32]), UserKeyPair::generate().public_bytes())])
                .unwrap(),
        ] {
            let decoded = WrappedKeyMaterial::decode(&material.encode()).unwrap();
            assert_eq!(decoded, material);
        }
    }
}
