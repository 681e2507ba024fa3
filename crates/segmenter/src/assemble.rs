//! File reassembly on the receiver.
//!
//! Segments arrive in `index` order from the download engine's reassembly
//! worker; the writer streams them to disk, verifies the recorded content
//! hash at the end, and restores the original mtime.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;

use common::ContentHash;
use crypto::Sha256Stream;

use crate::error::{Result, SegmenterError};

pub struct FileWriter {
    out: BufWriter<File>,
    path: PathBuf,
    hasher: Sha256Stream,
    expected: ContentHash,
    mtime: u64,
}

impl FileWriter {
    /// Creates the destination (and parent directories) for writing.
    pub fn create(path: impl AsRef<Path>, expected: ContentHash, mtime: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
            hasher: Sha256Stream::new(),
            expected,
            mtime,
        })
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.out.write_all(chunk)?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.hasher.bytes_seen()
    }

    /// Flush, verify the content hash, and restore the mtime. On hash
    /// mismatch the partial file is removed.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        drop(self.out);
        let bytes = self.hasher.bytes_seen();
        let actual = self.hasher.finalize();
        if actual != self.expected {
            let _ = std::fs::remove_file(&self.path);
            return Err(SegmenterError::HashMismatch {
                path: self.path.display().to_string(),
            });
        }
        filetime::set_file_mtime(&self.path, FileTime::from_unix_time(self.mtime as i64, 0))?;
        debug!(path = %self.path.display(), bytes, "file reassembled");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::sha256;

    #[test]
    fn reassembles_and_restores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("restored/doc.txt");
        let data = b"reassembled file contents ".repeat(100);
        let mtime = 1_600_000_000u64;

        let mut writer = FileWriter::create(&dest, sha256(&data), mtime).unwrap();
        for chunk in data.chunks(64) {
            writer.append(chunk).unwrap();
        }
        assert_eq!(writer.bytes_written(), data.len() as u64);
        writer.finish().unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        let meta = std::fs::metadata(&dest).unwrap();
        let restored = FileTime::from_last_modification_time(&meta);
        assert_eq!(restored.unix_seconds(), mtime as i64);
    }

    #[test]
    fn hash_mismatch_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bad.bin");
        let mut writer = FileWriter::create(&dest, sha256(b"expected"), 0).unwrap();
        writer.append(b"something else").unwrap();
        assert!(matches!(
            writer.finish(),
            Err(SegmenterError::HashMismatch { .. })
        ));
        assert!(!dest.exists());
    }
}
