use serde::{Deserialize, Serialize};

use crate::{PACK_FILL, PACK_THRESHOLD, SEGMENT_SIZE};

/// Compression algorithm selection for segment payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPolicy {
    /// Store plaintext as-is.
    None,
    /// gzip via DEFLATE (level 1-9)
    Gzip { level: u32 },
    /// LZMA/xz deep compression (level 0-9)
    Xz { level: u32 },
    /// Zstd balanced compression (level 1-22)
    Zstd { level: i32 },
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        // Zstd 3 is the balanced default; the index path overrides with Xz.
        CompressionPolicy::Zstd { level: 3 }
    }
}

impl CompressionPolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionPolicy::None)
    }
}

/// Segmentation and posting policy for one folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentPolicy {
    /// Payload bytes per segment. Validated against the server's advertised
    /// article limit on first connect.
    pub segment_size: usize,
    /// Files below this many bytes are packed together.
    pub pack_threshold: u64,
    /// Fraction of a segment a pack may fill before a new pack starts.
    pub pack_fill: f64,
    /// Number of copies posted per segment (1 = no extra copies).
    pub redundancy: u8,
    pub compression: CompressionPolicy,
    /// Keep compressed output only if `compressed_len <= margin * original_len`.
    pub compression_margin: f64,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE,
            pack_threshold: PACK_THRESHOLD,
            pack_fill: PACK_FILL,
            redundancy: 1,
            compression: CompressionPolicy::default(),
            compression_margin: 0.95,
        }
    }
}

impl SegmentPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size < 16 * 1024 {
            return Err(format!("segment_size {} below 16 KiB floor", self.segment_size));
        }
        if !(0.1..=1.0).contains(&self.pack_fill) {
            return Err(format!("pack_fill {} outside (0.1, 1.0]", self.pack_fill));
        }
        if self.redundancy == 0 || self.redundancy > 8 {
            return Err(format!("redundancy {} outside 1..=8", self.redundancy));
        }
        if self.pack_threshold as usize >= self.segment_size {
            return Err("pack_threshold must be below segment_size".to_string());
        }
        Ok(())
    }

    /// Bytes a pack accepts before it is sealed.
    pub fn pack_budget(&self) -> usize {
        (self.segment_size as f64 * self.pack_fill) as usize
    }
}
