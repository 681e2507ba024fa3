//! Core index: the compressed binary manifest a receiver bootstraps from.
//!
//! Little-endian layout:
//!
//! ```text
//! magic "USIX" | u16 version | u32 folder_name_len | folder_name_utf8
//!             | u32 file_count
//!   per file: u16 path_len | path_utf8 | u64 size | [u8; 32] content_hash
//!             | u64 mtime | u32 version | u32 segment_count
//!             | u32 segment_count_total
//!   per segment: u64 file_ref_index | u32 seg_index | u32 size
//!             | [u8; 32] ciphertext_hash | u16 msgid_len | msgid
//! ```
//!
//! Packed files reference their shared pack segment once per member, so a
//! receiver can group rows by `(file_ref, seg_index)` and serve later
//! members from the segment cache. The sealed form wraps the encoding in
//! the codec's compression envelope, xz preferred with a gzip fallback.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use common::error::{ErrorKind, Kinded};
use common::{CompressionPolicy, ContentHash, MessageId};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"USIX";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("bad magic: not a core index")]
    BadMagic,

    #[error("unsupported index version {0}")]
    UnsupportedVersion(u16),

    #[error("truncated index at {0}")]
    Truncated(&'static str),

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

impl Kinded for ManifestError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Integrity
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub relative_path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub mtime: u64,
    pub version: u32,
    pub segment_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSegment {
    /// Position of the owning file in `files`.
    pub file_ref: u64,
    pub index: u32,
    /// Plaintext size of the segment.
    pub size: u32,
    pub ciphertext_hash: ContentHash,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreIndex {
    pub folder_name: String,
    pub files: Vec<ManifestFile>,
    pub segments: Vec<ManifestSegment>,
}

impl CoreIndex {
    /// Redundancy copies of one position, in posting order.
    pub fn copies_for(&self, file_ref: u64, index: u32) -> Vec<&ManifestSegment> {
        self.segments
            .iter()
            .filter(|s| s.file_ref == file_ref && s.index == index)
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
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

fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    out.extend_from_slice(&buf);
}

/// Serialize to the uncompressed binary layout.
pub fn encode(index: &CoreIndex) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        16 + index.folder_name.len()
            + index.files.iter().map(|f| 58 + f.relative_path.len()).sum::<usize>()
            + index
                .segments
                .iter()
                .map(|s| 50 + s.message_id.as_str().len())
                .sum::<usize>(),
    );
    out.extend_from_slice(MAGIC);
    put_u16(&mut out, FORMAT_VERSION);
    put_u32(&mut out, index.folder_name.len() as u32);
    out.extend_from_slice(index.folder_name.as_bytes());

    put_u32(&mut out, index.files.len() as u32);
    for file in &index.files {
        put_u16(&mut out, file.relative_path.len() as u16);
        out.extend_from_slice(file.relative_path.as_bytes());
        put_u64(&mut out, file.size);
        out.extend_from_slice(file.content_hash.as_bytes());
        put_u64(&mut out, file.mtime);
        put_u32(&mut out, file.version);
        put_u32(&mut out, file.segment_count);
    }

    put_u32(&mut out, index.segments.len() as u32);
    for seg in &index.segments {
        put_u64(&mut out, seg.file_ref);
        put_u32(&mut out, seg.index);
        put_u32(&mut out, seg.size);
        out.extend_from_slice(seg.ciphertext_hash.as_bytes());
        put_u16(&mut out, seg.message_id.as_str().len() as u16);
        out.extend_from_slice(seg.message_id.as_str().as_bytes());
    }
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(ManifestError::Truncated(what))?;
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, what)?))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4, what)?))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8, what)?))
    }

    fn string(&mut self, len: usize, what: &'static str) -> Result<String> {
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ManifestError::Malformed(what))
    }

    fn hash(&mut self, what: &'static str) -> Result<ContentHash> {
        let bytes = self.take(32, what)?;
        Ok(ContentHash(bytes.try_into().expect("took 32 bytes")))
    }
}

/// Parse the uncompressed binary layout.
pub fn decode(bytes: &[u8]) -> Result<CoreIndex> {
    let mut cur = Cursor { data: bytes, pos: 0 };
    if cur.take(4, "magic")? != MAGIC {
        return Err(ManifestError::BadMagic);
    }
    let version = cur.u16("version")?;
    if version != FORMAT_VERSION {
        return Err(ManifestError::UnsupportedVersion(version));
    }
    let name_len = cur.u32("folder_name_len")? as usize;
    let folder_name = cur.string(name_len, "folder_name")?;

    let file_count = cur.u32("file_count")? as usize;
    let mut files = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let path_len = cur.u16("path_len")? as usize;
        let relative_path = cur.string(path_len, "path")?;
        let size = cur.u64("file size")?;
        let content_hash = cur.hash("content_hash")?;
        let mtime = cur.u64("mtime")?;
        let version = cur.u32("file version")?;
        let segment_count = cur.u32("segment_count")?;
        files.push(ManifestFile {
            relative_path,
            size,
            content_hash,
            mtime,
            version,
            segment_count,
        });
    }

    let segment_total = cur.u32("segment_count_total")? as usize;
    let mut segments = Vec::with_capacity(segment_total);
    for _ in 0..segment_total {
        let file_ref = cur.u64("file_ref_index")?;
        if file_ref as usize >= files.len() {
            return Err(ManifestError::Malformed("file_ref_index"));
        }
        let index = cur.u32("seg_index")?;
        let size = cur.u32("seg size")?;
        let ciphertext_hash = cur.hash("ciphertext_hash")?;
        let msgid_len = cur.u16("msgid_len")? as usize;
        let raw = cur.string(msgid_len, "msgid")?;
        let message_id = MessageId::parse(&raw).ok_or(ManifestError::Malformed("msgid"))?;
        segments.push(ManifestSegment {
            file_ref,
            index,
            size,
            ciphertext_hash,
            message_id,
        });
    }

    Ok(CoreIndex {
        folder_name,
        files,
        segments,
    })
}

/// Encode and compress. LZMA preferred; gzip if the xz backend fails.
pub fn seal(index: &CoreIndex) -> Result<Vec<u8>> {
    let raw = encode(index);
    match codec::compress_segment(&raw, &CompressionPolicy::Xz { level: 6 }, 1.0) {
        Ok((envelope, result)) => {
            debug!(
                raw = raw.len(),
                sealed = envelope.len(),
                algorithm = result.algorithm,
                "core index sealed"
            );
            Ok(envelope)
        }
        Err(codec::CodecError::CompressionBackend { .. }) => {
            let (envelope, _) =
                codec::compress_segment(&raw, &CompressionPolicy::Gzip { level: 6 }, 1.0)?;
            Ok(envelope)
        }
        Err(err) => Err(err.into()),
    }
}

/// Decompress and parse a sealed core index.
pub fn open(bytes: &[u8]) -> Result<CoreIndex> {
    let raw = codec::decompress_envelope(bytes)?;
    decode(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CoreIndex {
        let mid = |s: &str| MessageId::parse(s).unwrap();
        CoreIndex {
            folder_name: "photos-2026".to_string(),
            files: vec![
                ManifestFile {
                    relative_path: "a/doc.txt".to_string(),
                    size: 2_595_088,
                    content_hash: ContentHash([1u8; 32]),
                    mtime: 1_700_000_000,
                    version: 1,
                    segment_count: 4,
                },
                ManifestFile {
                    relative_path: "b.bin".to_string(),
                    size: 100,
                    content_hash: ContentHash([2u8; 32]),
                    mtime: 1_700_000_001,
                    version: 3,
                    segment_count: 1,
                },
            ],
            segments: vec![
                ManifestSegment {
                    file_ref: 0,
                    index: 0,
                    size: 768_000,
                    ciphertext_hash: ContentHash([3u8; 32]),
                    message_id: mid("<s0@news.example.com>"),
                },
                ManifestSegment {
                    file_ref: 0,
                    index: 0,
                    size: 768_000,
                    ciphertext_hash: ContentHash([4u8; 32]),
                    message_id: mid("<s0r1@news.example.com>"),
                },
                ManifestSegment {
                    file_ref: 1,
                    index: 0,
                    size: 100,
                    ciphertext_hash: ContentHash([5u8; 32]),
                    message_id: mid("<s1@news.example.com>"),
                },
            ],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let index = sample();
        let decoded = decode(&encode(&index)).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn seal_open_roundtrip() {
        let index = sample();
        let sealed = seal(&index).unwrap();
        assert_eq!(open(&sealed).unwrap(), index);
    }

    #[test]
    fn copies_group_redundant_posts() {
        let index = sample();
        let copies = index.copies_for(0, 0);
        assert_eq!(copies.len(), 2);
        assert_ne!(copies[0].message_id, copies[1].message_id);
        assert_eq!(index.copies_for(1, 0).len(), 1);
    }

    #[test]
    fn header_starts_with_magic() {
        let bytes = encode(&sample());
        assert_eq!(&bytes[..4], b"USIX");
        assert_eq!(LittleEndian::read_u16(&bytes[4..6]), FORMAT_VERSION);
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(decode(b"not an index"), Err(ManifestError::BadMagic)));
        let mut bytes = encode(&sample());
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(decode(&bytes), Err(ManifestError::Truncated(_))));
    }

    #[test]
    fn rejects_dangling_file_ref() {
        let mut index = sample();
        index.segments[0].file_ref = 99;
        assert!(matches!(
            decode(&encode(&index)),
            Err(ManifestError::Malformed("file_ref_index"))
        ));
    }
}
