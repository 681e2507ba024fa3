use serde::{Deserialize, Serialize};

pub mod config;
pub mod entities;
pub mod error;
pub mod policy;

pub use config::{EngineConfig, ServerProfile};
pub use entities::*;
pub use error::ErrorKind;
pub use policy::{CompressionPolicy, SegmentPolicy};

/// Default payload size of one posted segment. Providers typically accept
/// 500 KiB - 1 MiB articles; 750 KB keeps headroom for yEnc expansion.
pub const SEGMENT_SIZE: usize = 768_000;

/// Files below this size are routed to the packer instead of the chunker.
pub const PACK_THRESHOLD: u64 = 50 * 1024;

/// A pack stops accepting members once it holds this fraction of a segment.
pub const PACK_FILL: f64 = 0.8;

/// yEnc encoded line width on the wire.
pub const YENC_LINE: usize = 128;

/// Opaque 256-bit user identity. Generated once at bootstrap, never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserId({}..)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 128-bit folder identity derived from `(path, creation_time)`.
/// Stable across re-indexing runs of the same folder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderId(pub [u8; 16]);

impl FolderId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 16] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FolderId({})", self.to_hex())
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackId(pub i64);

/// Handle for a queued upload or download operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest of plaintext or ciphertext bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({}..)", &self.to_hex()[..12])
    }
}

/// Server-assigned article identifier, always carried in `<...>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Accepts only a concrete `<local@domain>` identifier. The `<posted>`
    /// placeholder some servers echo is not a retrievable id.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if !raw.starts_with('<') || !raw.ends_with('>') || raw.len() < 5 {
            return None;
        }
        if raw == "<posted>" || !raw.contains('@') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seconds since the Unix epoch. All persisted timestamps use this form.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_rejects_placeholder() {
        assert!(MessageId::parse("<posted>").is_none());
        assert!(MessageId::parse("no-brackets@example.com").is_none());
        assert!(MessageId::parse("<abc123@news.example.com>").is_some());
    }

    #[test]
    fn folder_id_hex_roundtrip() {
        let id = FolderId([7u8; 16]);
        assert_eq!(FolderId::from_hex(&id.to_hex()), Some(id));
    }

    #[test]
    fn content_hash_hex_roundtrip() {
        let h = ContentHash([0xAB; 32]);
        let parsed = ContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(parsed, h);
    }
}
