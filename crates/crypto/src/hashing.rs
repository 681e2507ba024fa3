use common::ContentHash;
use sha2::{Digest, Sha256};

/// SHA-256 over a complete buffer.
pub fn sha256(bytes: &[u8]) -> ContentHash {
    let digest = Sha256::digest(bytes);
    ContentHash(digest.into())
}

/// Incremental SHA-256 for streamed file reads. The segmenter feeds each
/// chunk as it goes so whole files are never held in memory.
#[derive(Default)]
pub struct Sha256Stream {
    inner: Sha256,
    bytes: u64,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        let data = b"chunked hashing input ".repeat(1000);
        let mut stream = Sha256Stream::new();
        for chunk in data.chunks(313) {
            stream.update(chunk);
        }
        assert_eq!(stream.bytes_seen(), data.len() as u64);
        assert_eq!(stream.finalize(), sha256(&data));
    }

    #[test]
    fn known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
