//! Adaptive segment compression behind a self-describing envelope.
//!
//! The first payload byte tags the algorithm, so decompression needs no
//! side channel. Compression is skipped up front for high-entropy input
//! and reverted when the output misses the configured margin.

use std::io::{Read, Write};

use common::CompressionPolicy;
use tracing::{debug, instrument};

use crate::error::{CodecError, Result};

const TAG_STORED: u8 = 0;
const TAG_GZIP: u8 = 1;
const TAG_XZ: u8 = 2;
const TAG_ZSTD: u8 = 3;

/// Why a segment was stored uncompressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionSkipReason {
    /// Sampled entropy close to random; compression would be wasted work.
    Entropy { bits_per_byte: f32 },
    /// Output missed the margin and the original was kept.
    Ineffective { ratio: f32 },
    PolicyDisabled,
}

impl std::fmt::Display for CompressionSkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionSkipReason::Entropy { bits_per_byte } => {
                write!(f, "entropy {bits_per_byte:.2} bits/byte")
            }
            CompressionSkipReason::Ineffective { ratio } => {
                write!(f, "ineffective ratio {ratio:.2}")
            }
            CompressionSkipReason::PolicyDisabled => f.write_str("compression disabled"),
        }
    }
}

/// Outcome of one segment compression attempt.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub original_size: usize,
    /// Envelope size including the tag byte.
    pub output_size: usize,
    pub compressed: bool,
    pub algorithm: &'static str,
    pub reason: Option<CompressionSkipReason>,
}

impl CompressionResult {
    pub fn ratio(&self) -> f32 {
        if self.output_size == 0 {
            return 1.0;
        }
        self.original_size as f32 / self.output_size as f32
    }
}

/// Shannon entropy of a sample, in bits per byte (0.0 constant, 8.0 random).
fn estimate_entropy(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }
    let total = data.len() as f32;
    let mut entropy = 0.0;
    for &count in freq.iter() {
        if count > 0 {
            let p = count as f32 / total;
            entropy -= p * p.log2();
        }
    }
    entropy
}

fn entropy_skip(data: &[u8]) -> Option<CompressionSkipReason> {
    if data.len() < 1024 {
        return None;
    }
    let entropy = estimate_entropy(&data[..data.len().min(1024)]);
    (entropy >= 7.5).then_some(CompressionSkipReason::Entropy {
        bits_per_byte: entropy,
    })
}

fn gzip_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level.clamp(1, 9)));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| CodecError::CompressionBackend {
            algorithm: "gzip",
            message: err.to_string(),
        })
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| CodecError::CompressionBackend {
            algorithm: "gzip",
            message: err.to_string(),
        })?;
    Ok(out)
}

fn xz_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), level.clamp(0, 9));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| CodecError::CompressionBackend {
            algorithm: "xz",
            message: err.to_string(),
        })
}

fn xz_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| CodecError::CompressionBackend {
            algorithm: "xz",
            message: err.to_string(),
        })?;
    Ok(out)
}

fn zstd_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(data, level.clamp(1, 22)).map_err(|err| CodecError::CompressionBackend {
        algorithm: "zstd",
        message: err.to_string(),
    })
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(|err| CodecError::CompressionBackend {
        algorithm: "zstd",
        message: err.to_string(),
    })
}

fn stored(data: &[u8], reason: CompressionSkipReason) -> (Vec<u8>, CompressionResult) {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(TAG_STORED);
    out.extend_from_slice(data);
    let result = CompressionResult {
        original_size: data.len(),
        output_size: out.len(),
        compressed: false,
        algorithm: "stored",
        reason: Some(reason),
    };
    (out, result)
}

/// Compress a segment into its envelope. `margin` gates acceptance: output
/// is kept only when `compressed_len <= margin * original_len`.
#[instrument(skip(data, policy), fields(input_len = data.len()))]
pub fn compress_segment(
    data: &[u8],
    policy: &CompressionPolicy,
    margin: f64,
) -> Result<(Vec<u8>, CompressionResult)> {
    if !policy.is_enabled() {
        return Ok(stored(data, CompressionSkipReason::PolicyDisabled));
    }
    if let Some(reason) = entropy_skip(data) {
        debug!(%reason, "skipping compression");
        return Ok(stored(data, reason));
    }

    let (tag, algorithm, compressed) = match policy {
        CompressionPolicy::None => unreachable!("disabled handled above"),
        CompressionPolicy::Gzip { level } => (TAG_GZIP, "gzip", gzip_compress(data, *level)?),
        CompressionPolicy::Xz { level } => (TAG_XZ, "xz", xz_compress(data, *level)?),
        CompressionPolicy::Zstd { level } => (TAG_ZSTD, "zstd", zstd_compress(data, *level)?),
    };

    let budget = (data.len() as f64 * margin) as usize;
    if compressed.len() > budget {
        let ratio = compressed.len() as f32 / data.len().max(1) as f32;
        debug!(ratio, algorithm, "compression missed margin, storing raw");
        return Ok(stored(data, CompressionSkipReason::Ineffective { ratio }));
    }

    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(tag);
    out.extend_from_slice(&compressed);
    let result = CompressionResult {
        original_size: data.len(),
        output_size: out.len(),
        compressed: true,
        algorithm,
        reason: None,
    };
    Ok((out, result))
}

/// Invert a compression envelope.
pub fn decompress_envelope(envelope: &[u8]) -> Result<Vec<u8>> {
    let (&tag, payload) = envelope.split_first().ok_or(CodecError::EnvelopeTruncated)?;
    match tag {
        TAG_STORED => Ok(payload.to_vec()),
        TAG_GZIP => gzip_decompress(payload),
        TAG_XZ => xz_decompress(payload),
        TAG_ZSTD => zstd_decompress(payload),
        other => Err(CodecError::UnknownEnvelopeTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARGIN: f64 = 0.95;

    #[test]
    fn roundtrip_zstd() {
        let original = b"usenet segment payload ".repeat(4000);
        let (envelope, result) =
            compress_segment(&original, &CompressionPolicy::Zstd { level: 3 }, MARGIN).unwrap();
        assert!(result.compressed);
        assert!(envelope.len() < original.len());
        assert_eq!(decompress_envelope(&envelope).unwrap(), original);
    }

    #[test]
    fn roundtrip_xz_and_gzip() {
        let original = b"core index manifest bytes ".repeat(2000);
        for policy in [
            CompressionPolicy::Xz { level: 6 },
            CompressionPolicy::Gzip { level: 6 },
        ] {
            let (envelope, result) = compress_segment(&original, &policy, MARGIN).unwrap();
            assert!(result.compressed, "{policy:?} should compress text");
            assert_eq!(decompress_envelope(&envelope).unwrap(), original);
        }
    }

    #[test]
    fn high_entropy_is_stored() {
        // xorshift-ish pseudo-random fill defeats the sample entropy gate
        let mut state = 0x2545F4914F6CDD1Du64;
        let random: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let (envelope, result) =
            compress_segment(&random, &CompressionPolicy::Zstd { level: 3 }, MARGIN).unwrap();
        assert!(!result.compressed);
        assert!(matches!(
            result.reason,
            Some(CompressionSkipReason::Entropy { .. })
        ));
        assert_eq!(decompress_envelope(&envelope).unwrap(), random);
    }

    #[test]
    fn disabled_policy_stores() {
        let data = b"tiny".to_vec();
        let (envelope, result) =
            compress_segment(&data, &CompressionPolicy::None, MARGIN).unwrap();
        assert!(!result.compressed);
        assert_eq!(envelope[0], TAG_STORED);
        assert_eq!(decompress_envelope(&envelope).unwrap(), data);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            decompress_envelope(&[0x7F, 1, 2, 3]),
            Err(CodecError::UnknownEnvelopeTag(0x7F))
        ));
        assert!(matches!(
            decompress_envelope(&[]),
            Err(CodecError::EnvelopeTruncated)
        ));
    }

    #[tracing_test::traced_test]
    #[test]
    fn entropy_skip_emits_telemetry() {
        let mut state = 0x9E3779B97F4A7C15u64;
        let random: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let (_, result) =
            compress_segment(&random, &CompressionPolicy::Zstd { level: 3 }, MARGIN).unwrap();
        assert!(!result.compressed);
        assert!(logs_contain("skipping compression"));
    }
}
