//! The share-token envelope.
//!
//! `usenetsync://<base64url(seed || aead_envelope)>`. The 16-byte seed
//! keys the envelope (and doubles as the share's store id), so everything
//! structured — version, access-type byte, folder id, index Message-IDs,
//! wrapped key material, expiry — is ciphertext on the wire.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::OsRng;
use rand::RngCore;

use common::{AccessType, FolderId, MessageId};
use crypto::{sha256, SubKey};

use crate::error::{AccessError, Result};
use crate::wrapping::WrappedKeyMaterial;

pub const TOKEN_SCHEME: &str = "usenetsync://";
const TOKEN_VERSION: u8 = 1;
const SEED_LEN: usize = 16;

/// Decrypted token contents.
#[derive(Debug, Clone)]
pub struct ShareToken {
    pub seed: [u8; SEED_LEN],
    pub access_type: AccessType,
    pub folder_id: FolderId,
    pub index_refs: Vec<MessageId>,
    pub wrapped: WrappedKeyMaterial,
    pub expires_at: Option<u64>,
}

impl ShareToken {
    /// The store-side share id: the seed, base64url.
    pub fn share_id(&self) -> String {
        share_id_from_seed(&self.seed)
    }
}

pub fn share_id_from_seed(seed: &[u8; SEED_LEN]) -> String {
    URL_SAFE_NO_PAD.encode(seed)
}

fn envelope_key(seed: &[u8; SEED_LEN]) -> SubKey {
    let mut input = Vec::with_capacity(SEED_LEN + 32);
    input.extend_from_slice(b"usenetsync:token-envelope:v1");
    input.extend_from_slice(seed);
    SubKey::from_bytes(sha256(&input).0)
}

pub fn new_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    seed
}

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

/// Assemble the token string for a share.
pub fn encode_token(
    seed: &[u8; SEED_LEN],
    folder_id: &FolderId,
    wrapped: &WrappedKeyMaterial,
    index_refs: &[MessageId],
    expires_at: Option<u64>,
) -> Result<String> {
    let mut plain = Vec::new();
    plain.push(TOKEN_VERSION);
    plain.push(wrapped.access_type().as_byte());
    plain.extend_from_slice(folder_id.as_bytes());
    put_u16(&mut plain, index_refs.len() as u16);
    for message_id in index_refs {
        put_u16(&mut plain, message_id.as_str().len() as u16);
        plain.extend_from_slice(message_id.as_str().as_bytes());
    }
    let wkm = wrapped.encode();
    put_u32(&mut plain, wkm.len() as u32);
    plain.extend_from_slice(&wkm);
    match expires_at {
        Some(ts) => {
            plain.push(1);
            let mut buf = [0u8; 8];
            LittleEndian::write_u64(&mut buf, ts);
            plain.extend_from_slice(&buf);
        }
        None => plain.push(0),
    }

    let sealed = crypto::encrypt(&envelope_key(seed), &plain)?;
    let mut raw = Vec::with_capacity(SEED_LEN + sealed.len());
    raw.extend_from_slice(seed);
    raw.extend_from_slice(&sealed);
    Ok(format!("{TOKEN_SCHEME}{}", URL_SAFE_NO_PAD.encode(raw)))
}

/// Open a token string. Every malformation is the same `Denied`: parsing
/// reveals nothing about whether a share exists.
pub fn parse_token(token: &str) -> Result<ShareToken> {
    let encoded = token.strip_prefix(TOKEN_SCHEME).ok_or(AccessError::Denied)?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|_| AccessError::Denied)?;
    if raw.len() <= SEED_LEN {
        return Err(AccessError::Denied);
    }
    let seed: [u8; SEED_LEN] = raw[..SEED_LEN].try_into().expect("seed split");
    let plain =
        crypto::decrypt(&envelope_key(&seed), &raw[SEED_LEN..]).map_err(|_| AccessError::Denied)?;

    parse_envelope(seed, &plain).map_err(|_| AccessError::Denied)
}

fn take<'a>(plain: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let slice = plain
        .get(*pos..*pos + n)
        .ok_or_else(|| AccessError::Malformed("token envelope".to_string()))?;
    *pos += n;
    Ok(slice)
}

fn parse_envelope(seed: [u8; SEED_LEN], plain: &[u8]) -> Result<ShareToken> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| take(plain, pos, n);

    let version = take(&mut pos, 1)?[0];
    if version != TOKEN_VERSION {
        return Err(AccessError::Malformed("token version".to_string()));
    }
    let access_byte = take(&mut pos, 1)?[0];
    let access_type = AccessType::from_byte(access_byte)
        .ok_or_else(|| AccessError::Malformed("access type".to_string()))?;
    let folder_id = FolderId(take(&mut pos, 16)?.try_into().expect("16 bytes"));

    let ref_count = LittleEndian::read_u16(take(&mut pos, 2)?) as usize;
    let mut index_refs = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        let len = LittleEndian::read_u16(take(&mut pos, 2)?) as usize;
        let raw = take(&mut pos, len)?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| AccessError::Malformed("message id".to_string()))?;
        index_refs.push(
            MessageId::parse(text).ok_or_else(|| AccessError::Malformed("message id".to_string()))?,
        );
    }

    let wkm_len = LittleEndian::read_u32(take(&mut pos, 4)?) as usize;
    let wrapped = WrappedKeyMaterial::decode(take(&mut pos, wkm_len)?)?;
    if wrapped.access_type() != access_type {
        return Err(AccessError::Malformed("access type mismatch".to_string()));
    }

    let expires_at = match take(&mut pos, 1)?[0] {
        0 => None,
        1 => Some(LittleEndian::read_u64(take(&mut pos, 8)?)),
        _ => return Err(AccessError::Malformed("expiry flag".to_string())),
    };

    Ok(ShareToken {
        seed,
        access_type,
        folder_id,
        index_refs,
        wrapped,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapping::wrap_public;
    use crypto::FolderKey;

    fn sample_token() -> (String, FolderId) {
        let folder_id = FolderId([0xAB; 16]);
        let wrapped = wrap_public(&FolderKey::generate()).unwrap();
        let refs = vec![
            MessageId::parse("<idx0@news.example.com>").unwrap(),
            MessageId::parse("<idx1@news.example.com>").unwrap(),
        ];
        let token = encode_token(&new_seed(), &folder_id, &wrapped, &refs, Some(4_000_000_000))
            .unwrap();
        (token, folder_id)
    }

    #[test]
    fn token_roundtrip() {
        let (token, folder_id) = sample_token();
        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.folder_id, folder_id);
        assert_eq!(parsed.access_type, AccessType::Public);
        assert_eq!(parsed.index_refs.len(), 2);
        assert_eq!(parsed.expires_at, Some(4_000_000_000));
    }

    #[test]
    fn surface_is_opaque() {
        let (token, folder_id) = sample_token();
        let raw = URL_SAFE_NO_PAD
            .decode(token.strip_prefix(TOKEN_SCHEME).unwrap())
            .unwrap();
        // Neither the folder id nor any Message-ID text is visible.
        assert!(!raw.windows(16).any(|w| w == folder_id.as_bytes()));
        let needle = b"news.example.com";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn tampering_is_denied() {
        let (token, _) = sample_token();
        let mut raw = URL_SAFE_NO_PAD
            .decode(token.strip_prefix(TOKEN_SCHEME).unwrap())
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("{TOKEN_SCHEME}{}", URL_SAFE_NO_PAD.encode(raw));
        assert!(matches!(parse_token(&tampered), Err(AccessError::Denied)));
    }

    #[test]
    fn foreign_strings_are_denied() {
        assert!(matches!(parse_token("https://nope"), Err(AccessError::Denied)));
        assert!(matches!(
            parse_token("usenetsync://%%%not-base64%%%"),
            Err(AccessError::Denied)
        ));
        assert!(matches!(parse_token("usenetsync://AAAA"), Err(AccessError::Denied)));
    }
}
