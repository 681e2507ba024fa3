//! Streaming chunker and the per-segment prepare/open pair.
//!
//! A file is read in `segment_size` buffers; whole files are never held in
//! memory. Preparing a chunk compresses it (margin-gated), encrypts under
//! the folder's segment subkey, and hashes both sides. Opening inverts the
//! pair on the receiver.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use common::{ContentHash, SegmentPolicy};
use crypto::{decrypt, encrypt, sha256, SubKey};

use crate::error::Result;

/// One segment ready to post: the payload is what goes on the wire after
/// yEnc encoding, and `ciphertext_hash` is its digest (the receiver-side
/// cache key).
#[derive(Debug, Clone)]
pub struct PreparedSegment {
    pub index: u32,
    pub plaintext_len: u32,
    pub plaintext_hash: ContentHash,
    pub ciphertext_hash: ContentHash,
    pub payload: Vec<u8>,
}

/// Compress, encrypt, and hash one plaintext chunk.
pub fn prepare_chunk(
    chunk: &[u8],
    index: u32,
    key: &SubKey,
    policy: &SegmentPolicy,
) -> Result<PreparedSegment> {
    let plaintext_hash = sha256(chunk);
    let (envelope, _) =
        codec::compress_segment(chunk, &policy.compression, policy.compression_margin)?;
    let payload = encrypt(key, &envelope)?;
    let ciphertext_hash = sha256(&payload);
    Ok(PreparedSegment {
        index,
        plaintext_len: chunk.len() as u32,
        plaintext_hash,
        ciphertext_hash,
        payload,
    })
}

/// Authenticate, decrypt, and decompress a fetched payload back to the
/// plaintext chunk.
pub fn open_segment(payload: &[u8], key: &SubKey) -> Result<Vec<u8>> {
    let envelope = decrypt(key, payload)?;
    Ok(codec::decompress_envelope(&envelope)?)
}

/// Sequential fixed-size reader over one file.
pub struct ChunkReader {
    reader: BufReader<File>,
    segment_size: usize,
    next_index: u32,
    done: bool,
}

impl ChunkReader {
    pub fn open(path: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            reader: BufReader::new(file),
            segment_size,
            next_index: 0,
            done: false,
        })
    }

    /// Next `(index, chunk)`; the final chunk may be short, every earlier
    /// one is exactly `segment_size` bytes.
    pub fn next_chunk(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.segment_size];
        let mut filled = 0usize;
        while filled < self.segment_size {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            self.done = true;
            return Ok(None);
        }
        buf.truncate(filled);
        if filled < self.segment_size {
            self.done = true;
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some((index, buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{FolderKey, KeyPurpose};
    use std::io::Write;

    fn key() -> SubKey {
        FolderKey::from_bytes([1u8; 32]).derive(KeyPurpose::SegmentEncryption)
    }

    #[test]
    fn chunker_sizes_match_expectation() {
        // 2.5 MiB at 768000-byte segments: 768000 + 768000 + 768000 + 317440
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        let data: Vec<u8> = (0..2_621_440u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let mut reader = ChunkReader::open(&path, 768_000).unwrap();
        let mut sizes = Vec::new();
        while let Some((index, chunk)) = reader.next_chunk().unwrap() {
            assert_eq!(index as usize, sizes.len());
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![768_000, 768_000, 768_000, 317_440]);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("even.bin");
        std::fs::write(&path, vec![9u8; 2048]).unwrap();

        let mut reader = ChunkReader::open(&path, 1024).unwrap();
        let mut count = 0;
        while let Some((_, chunk)) = reader.next_chunk().unwrap() {
            assert_eq!(chunk.len(), 1024);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn prepare_open_roundtrip() {
        let policy = SegmentPolicy::default();
        let chunk = b"segment plaintext ".repeat(5000);
        let k = key();

        let prepared = prepare_chunk(&chunk, 3, &k, &policy).unwrap();
        assert_eq!(prepared.index, 3);
        assert_eq!(prepared.plaintext_len as usize, chunk.len());
        assert_eq!(prepared.plaintext_hash, sha256(&chunk));
        assert_eq!(prepared.ciphertext_hash, sha256(&prepared.payload));

        let opened = open_segment(&prepared.payload, &k).unwrap();
        assert_eq!(opened, chunk);
    }

    #[test]
    fn reprepare_changes_payload_not_plaintext_hash() {
        let policy = SegmentPolicy::default();
        let chunk = vec![0x42u8; 4096];
        let k = key();
        let a = prepare_chunk(&chunk, 0, &k, &policy).unwrap();
        let b = prepare_chunk(&chunk, 0, &k, &policy).unwrap();
        assert_eq!(a.plaintext_hash, b.plaintext_hash);
        assert_ne!(a.ciphertext_hash, b.ciphertext_hash);
    }

    #[test]
    fn wrong_key_cannot_open() {
        let policy = SegmentPolicy::default();
        let prepared = prepare_chunk(b"secret", 0, &key(), &policy).unwrap();
        let other = FolderKey::from_bytes([2u8; 32]).derive(KeyPurpose::SegmentEncryption);
        assert!(open_segment(&prepared.payload, &other).is_err());
    }
}
