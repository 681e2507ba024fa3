//! yEnc encoding, the Usenet convention for binary payloads.
//!
//! Every byte is mapped by `(b + 42) mod 256`; the critical bytes NUL, LF,
//! CR and `=` are escaped as `=` followed by `(c + 64) mod 256`. Encoded
//! lines stay within 128 characters and an escape pair never splits across
//! a line break. Dot-stuffing is the transport's job, not the codec's.

use common::YENC_LINE;

use crate::error::{CodecError, Result};

const ESCAPE: u8 = b'=';

/// Header fields for one encoded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencParams {
    /// 1-based part number within the object.
    pub part: u32,
    pub total: u32,
    /// Total object size in bytes (the file size for multi-part posts).
    pub size: u64,
    /// 1-based inclusive first byte offset of this part.
    pub begin: u64,
    /// Inclusive last byte offset of this part.
    pub end: u64,
    /// Advertised object name. Obfuscated payloads use the outer subject.
    pub name: String,
}

fn must_escape(mapped: u8) -> bool {
    matches!(mapped, 0x00 | 0x0A | 0x0D | ESCAPE)
}

/// Encode `data` as a complete yEnc part: `=ybegin`, `=ypart`, payload
/// lines, `=yend` with a pcrc32 trailer. Output is ASCII with CRLF line
/// endings, ready to stream as an article body.
pub fn yenc_encode(data: &[u8], params: &YencParams) -> Vec<u8> {
    // Worst case doubles the payload; headers are small.
    let mut out = Vec::with_capacity(data.len() * 2 + 256);

    out.extend_from_slice(
        format!(
            "=ybegin part={} total={} line={} size={} name={}\r\n",
            params.part, params.total, YENC_LINE, params.size, params.name
        )
        .as_bytes(),
    );
    out.extend_from_slice(
        format!("=ypart begin={} end={}\r\n", params.begin, params.end).as_bytes(),
    );

    let mut col = 0usize;
    for &b in data {
        let mapped = b.wrapping_add(42);
        let width = if must_escape(mapped) { 2 } else { 1 };
        if col + width > YENC_LINE {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
        if width == 2 {
            out.push(ESCAPE);
            out.push(mapped.wrapping_add(64));
        } else {
            out.push(mapped);
        }
        col += width;
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let mut crc = crc32fast::Hasher::new();
    crc.update(data);
    out.extend_from_slice(
        format!(
            "=yend size={} part={} pcrc32={:08x}\r\n",
            data.len(),
            params.part,
            crc.finalize()
        )
        .as_bytes(),
    );
    out
}

/// A decoded yEnc part with the trailer already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPart {
    pub data: Vec<u8>,
    pub part: u32,
    pub total: u32,
    /// Object size advertised by `=ybegin`.
    pub size: u64,
    pub begin: Option<u64>,
    pub end: Option<u64>,
    pub name: String,
}

fn attr<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("{key}=");
    let start = line
        .find(&format!(" {marker}"))
        .map(|i| i + 1 + marker.len())
        .or_else(|| line.starts_with(&marker).then_some(marker.len()))?;
    let rest = &line[start..];
    // name= consumes the remainder of the line by convention.
    if key == "name" {
        return Some(rest.trim_end());
    }
    Some(rest.split_whitespace().next().unwrap_or(""))
}

fn attr_u64(line: &str, key: &str) -> Option<u64> {
    attr(line, key)?.parse().ok()
}

/// Decode an article body. Validates the `=yend` size and, when present,
/// the pcrc32 trailer.
pub fn yenc_decode(body: &[u8]) -> Result<DecodedPart> {
    let mut data = Vec::with_capacity(body.len());
    let mut part = 1u32;
    let mut total = 1u32;
    let mut size = None;
    let mut begin = None;
    let mut end = None;
    let mut name = String::new();
    let mut seen_begin = false;
    let mut trailer: Option<(u64, Option<u32>)> = None;

    for raw_line in body.split(|&b| b == b'\n') {
        let line = match raw_line.last() {
            Some(b'\r') => &raw_line[..raw_line.len() - 1],
            _ => raw_line,
        };
        if line.is_empty() {
            continue;
        }

        if line.starts_with(b"=ybegin ") {
            let header = String::from_utf8_lossy(line);
            part = attr_u64(&header, "part").unwrap_or(1) as u32;
            total = attr_u64(&header, "total").unwrap_or(1) as u32;
            size = attr_u64(&header, "size");
            name = attr(&header, "name").unwrap_or_default().to_string();
            seen_begin = true;
            continue;
        }
        if line.starts_with(b"=ypart ") {
            let header = String::from_utf8_lossy(line);
            begin = attr_u64(&header, "begin");
            end = attr_u64(&header, "end");
            continue;
        }
        if line.starts_with(b"=yend ") {
            let header = String::from_utf8_lossy(line);
            let declared = attr_u64(&header, "size")
                .ok_or_else(|| CodecError::YencMalformed("=yend without size".to_string()))?;
            let crc = attr(&header, "pcrc32")
                .and_then(|v| u32::from_str_radix(v, 16).ok());
            trailer = Some((declared, crc));
            break;
        }
        if !seen_begin {
            return Err(CodecError::YencMalformed(
                "payload before =ybegin".to_string(),
            ));
        }

        let mut iter = line.iter().copied();
        while let Some(b) = iter.next() {
            if b == ESCAPE {
                let escaped = iter.next().ok_or_else(|| {
                    CodecError::YencMalformed("dangling escape at end of line".to_string())
                })?;
                data.push(escaped.wrapping_sub(64).wrapping_sub(42));
            } else {
                data.push(b.wrapping_sub(42));
            }
        }
    }

    if !seen_begin {
        return Err(CodecError::YencMalformed("missing =ybegin".to_string()));
    }
    let (declared, crc) =
        trailer.ok_or_else(|| CodecError::YencMalformed("missing =yend".to_string()))?;

    if declared != data.len() as u64 {
        return Err(CodecError::YencSizeMismatch {
            expected: declared,
            actual: data.len() as u64,
        });
    }
    if let Some(expected_crc) = crc {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        if hasher.finalize() != expected_crc {
            return Err(CodecError::YencCrcMismatch);
        }
    }

    Ok(DecodedPart {
        data,
        part,
        total,
        size: size.unwrap_or(declared),
        begin,
        end,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(len: usize) -> YencParams {
        YencParams {
            part: 1,
            total: 1,
            size: len as u64,
            begin: 1,
            end: len as u64,
            name: "0a1b2c3d".to_string(),
        }
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let encoded = yenc_encode(&data, &params(data.len()));
        let decoded = yenc_decode(&encoded).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.part, 1);
        assert_eq!(decoded.size, data.len() as u64);
    }

    #[test]
    fn critical_bytes_are_escaped() {
        // Bytes that map onto NUL, LF, CR and '=' after +42.
        let tricky = [214u8, 224, 227, 19];
        let encoded = yenc_encode(&tricky, &params(tricky.len()));
        let decoded = yenc_decode(&encoded).unwrap();
        assert_eq!(decoded.data, tricky);
    }

    #[test]
    fn lines_stay_within_limit() {
        let data = vec![0xD6u8; 10_000]; // every byte escapes
        let encoded = yenc_encode(&data, &params(data.len()));
        for line in encoded.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            assert!(line.len() <= YENC_LINE, "line of {} chars", line.len());
        }
        assert_eq!(yenc_decode(&encoded).unwrap().data, data);
    }

    #[test]
    fn escape_pair_never_splits() {
        let encoded = yenc_encode(&vec![0xD6u8; 1000], &params(1000));
        for line in encoded.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            if line.last() == Some(&ESCAPE) && !line.starts_with(b"=y") {
                panic!("escape split across line break");
            }
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let data = b"some payload".to_vec();
        let mut encoded = yenc_encode(&data, &params(data.len()));
        let text = String::from_utf8(encoded.clone()).unwrap();
        let patched = text.replace("=yend size=12", "=yend size=13");
        encoded = patched.into_bytes();
        assert!(matches!(
            yenc_decode(&encoded),
            Err(CodecError::YencSizeMismatch { expected: 13, actual: 12 })
        ));
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let data = b"crc guarded payload".to_vec();
        let encoded = yenc_encode(&data, &params(data.len()));
        let text = String::from_utf8(encoded).unwrap();
        let crc_start = text.find("pcrc32=").unwrap() + "pcrc32=".len();
        let mut patched = text.clone();
        let original = &text[crc_start..crc_start + 8];
        let flipped = if original.starts_with('0') { "1" } else { "0" };
        patched.replace_range(crc_start..crc_start + 1, flipped);
        assert!(matches!(
            yenc_decode(patched.as_bytes()),
            Err(CodecError::YencCrcMismatch)
        ));
    }

    #[test]
    fn headers_surface_part_geometry() {
        let data = vec![7u8; 100];
        let p = YencParams {
            part: 3,
            total: 7,
            size: 768_000,
            begin: 1_536_001,
            end: 1_536_100,
            name: "f00fabcd".to_string(),
        };
        let decoded = yenc_decode(&yenc_encode(&data, &p)).unwrap();
        assert_eq!(decoded.part, 3);
        assert_eq!(decoded.total, 7);
        assert_eq!(decoded.begin, Some(1_536_001));
        assert_eq!(decoded.end, Some(1_536_100));
        assert_eq!(decoded.size, 768_000);
    }

    #[test]
    fn missing_trailer_is_malformed() {
        let data = b"x".repeat(64);
        let encoded = yenc_encode(&data, &params(64));
        let text = String::from_utf8(encoded).unwrap();
        let truncated = text.split("=yend").next().unwrap();
        assert!(matches!(
            yenc_decode(truncated.as_bytes()),
            Err(CodecError::YencMalformed(_))
        ));
    }
}
