//! Small-file packing.
//!
//! Files under the pack threshold share one logical segment. The payload is
//! self-describing: a length-prefixed inner directory of `(relative_path,
//! size)` entries followed by the member bytes in directory order. Member
//! order is stable by `(relative_path, mtime)` so re-indexing the same tree
//! packs identically.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use common::{FileRecord, PackMember};

use crate::error::{Result, SegmenterError};

/// Fixed directory overhead: u32 header length + u16 entry count.
const DIR_FIXED: usize = 6;

/// Per-entry overhead around the path bytes: u16 path length + u64 size.
const ENTRY_FIXED: usize = 10;

/// Decoded inner-directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub relative_path: String,
    pub size: u64,
}

fn entry_overhead(file: &FileRecord) -> usize {
    ENTRY_FIXED + file.relative_path.len()
}

/// Group packable files into pack-sized batches. Input order does not
/// matter; the plan is stable by `(relative_path, mtime)`.
pub fn plan_packs(files: &[FileRecord], budget: usize) -> Vec<Vec<FileRecord>> {
    let mut sorted: Vec<FileRecord> = files.to_vec();
    sorted.sort_by(|a, b| {
        a.relative_path
            .cmp(&b.relative_path)
            .then(a.mtime.cmp(&b.mtime))
    });

    let mut packs = Vec::new();
    let mut current: Vec<FileRecord> = Vec::new();
    let mut used = DIR_FIXED;
    for file in sorted {
        let cost = file.size as usize + entry_overhead(&file);
        if !current.is_empty() && used + cost > budget {
            packs.push(std::mem::take(&mut current));
            used = DIR_FIXED;
        }
        used += cost;
        current.push(file);
    }
    if !current.is_empty() {
        packs.push(current);
    }
    packs
}

/// Assemble one pack payload, reading each member from disk under `root`.
/// Returns the payload plus the member rows for the pack record.
pub fn build_pack_payload(
    root: &Path,
    members: &[FileRecord],
) -> Result<(Vec<u8>, Vec<PackMember>)> {
    let mut directory = Vec::with_capacity(members.len() * 24);
    let mut count = [0u8; 2];
    LittleEndian::write_u16(&mut count, members.len() as u16);
    directory.extend_from_slice(&count);

    let mut data = Vec::new();
    let mut rows = Vec::with_capacity(members.len());
    for member in members {
        let path_bytes = member.relative_path.as_bytes();
        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, path_bytes.len() as u16);
        directory.extend_from_slice(&len);
        directory.extend_from_slice(path_bytes);
        let mut size = [0u8; 8];
        LittleEndian::write_u64(&mut size, member.size);
        directory.extend_from_slice(&size);

        let bytes = std::fs::read(root.join(&member.relative_path))?;
        if bytes.len() as u64 != member.size {
            return Err(SegmenterError::HashMismatch {
                path: member.relative_path.clone(),
            });
        }
        data.extend_from_slice(&bytes);
        rows.push(PackMember {
            file_id: member.file_id,
            relative_path: member.relative_path.clone(),
            size: member.size,
        });
    }

    let mut payload = Vec::with_capacity(4 + directory.len() + data.len());
    let mut header_len = [0u8; 4];
    LittleEndian::write_u32(&mut header_len, directory.len() as u32);
    payload.extend_from_slice(&header_len);
    payload.extend_from_slice(&directory);
    payload.extend_from_slice(&data);
    Ok((payload, rows))
}

/// Split a pack payload back into `(entry, bytes)` pairs.
pub fn unpack_payload(payload: &[u8]) -> Result<Vec<(PackEntry, Vec<u8>)>> {
    if payload.len() < 4 {
        return Err(SegmenterError::MalformedPack("short header".to_string()));
    }
    let header_len = LittleEndian::read_u32(&payload[..4]) as usize;
    let directory = payload
        .get(4..4 + header_len)
        .ok_or_else(|| SegmenterError::MalformedPack("directory out of bounds".to_string()))?;
    let mut data_offset = 4 + header_len;

    if directory.len() < 2 {
        return Err(SegmenterError::MalformedPack("missing entry count".to_string()));
    }
    let count = LittleEndian::read_u16(&directory[..2]) as usize;
    let mut cursor = 2usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let path_len = directory
            .get(cursor..cursor + 2)
            .map(LittleEndian::read_u16)
            .ok_or_else(|| SegmenterError::MalformedPack("truncated entry".to_string()))?
            as usize;
        cursor += 2;
        let path_bytes = directory
            .get(cursor..cursor + path_len)
            .ok_or_else(|| SegmenterError::MalformedPack("truncated path".to_string()))?;
        let relative_path = std::str::from_utf8(path_bytes)
            .map_err(|_| SegmenterError::MalformedPack("non-utf8 path".to_string()))?
            .to_string();
        cursor += path_len;
        let size = directory
            .get(cursor..cursor + 8)
            .map(LittleEndian::read_u64)
            .ok_or_else(|| SegmenterError::MalformedPack("truncated size".to_string()))?;
        cursor += 8;

        let bytes = payload
            .get(data_offset..data_offset + size as usize)
            .ok_or_else(|| SegmenterError::MalformedPack("truncated member data".to_string()))?
            .to_vec();
        data_offset += size as usize;
        out.push((PackEntry { relative_path, size }, bytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ContentHash, FileId, FileState, FolderId};
    use std::io::Write;

    fn record(path: &str, size: u64, id: i64) -> FileRecord {
        FileRecord {
            file_id: FileId(id),
            folder_id: FolderId([0u8; 16]),
            relative_path: path.to_string(),
            size,
            content_hash: ContentHash([0u8; 32]),
            mtime: 1_700_000_000,
            version: 1,
            segment_count: 0,
            state: FileState::Indexed,
        }
    }

    #[test]
    fn hundred_small_files_fit_one_pack() {
        // 100 x 1 KiB with PACK_FILL 0.8 of a 768000-byte segment
        let files: Vec<FileRecord> = (0..100)
            .map(|i| record(&format!("small/file{i:03}.dat"), 1024, i))
            .collect();
        let packs = plan_packs(&files, 614_400);
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].len(), 100);
    }

    #[test]
    fn overflow_starts_a_new_pack() {
        let files: Vec<FileRecord> = (0..10)
            .map(|i| record(&format!("f{i}.bin"), 30_000, i))
            .collect();
        // Budget fits 3 members and a sliver, not 4.
        let packs = plan_packs(&files, 100_000);
        assert_eq!(packs.len(), 4);
        assert!(packs.iter().take(3).all(|p| p.len() == 3));
        assert_eq!(packs[3].len(), 1);
    }

    #[test]
    fn plan_is_stable_under_input_order() {
        let mut files: Vec<FileRecord> = (0..20)
            .map(|i| record(&format!("d/{i:02}.txt"), 500, i))
            .collect();
        let forward = plan_packs(&files, 10_000);
        files.reverse();
        let reversed = plan_packs(&files, 10_000);
        let names = |packs: &Vec<Vec<FileRecord>>| -> Vec<Vec<String>> {
            packs
                .iter()
                .map(|p| p.iter().map(|f| f.relative_path.clone()).collect())
                .collect()
        };
        assert_eq!(names(&forward), names(&reversed));
    }

    #[test]
    fn payload_roundtrips_members() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        let contents: Vec<(&str, Vec<u8>)> = vec![
            ("a.txt", b"alpha".to_vec()),
            ("sub/b.txt", b"bravo bytes".to_vec()),
            ("zz.bin", vec![0u8; 300]),
        ];
        let mut records = Vec::new();
        for (i, (path, bytes)) in contents.iter().enumerate() {
            let full = dir.path().join(path);
            std::fs::File::create(&full).unwrap().write_all(bytes).unwrap();
            records.push(record(path, bytes.len() as u64, i as i64));
        }

        let (payload, rows) = build_pack_payload(dir.path(), &records).unwrap();
        assert_eq!(rows.len(), 3);

        let unpacked = unpack_payload(&payload).unwrap();
        assert_eq!(unpacked.len(), 3);
        for ((entry, bytes), (path, original)) in unpacked.iter().zip(&contents) {
            assert_eq!(entry.relative_path, *path);
            assert_eq!(bytes, original);
        }
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"payload").unwrap();
        let (payload, _) =
            build_pack_payload(dir.path(), &[record("x.txt", 7, 0)]).unwrap();
        assert!(matches!(
            unpack_payload(&payload[..payload.len() - 3]),
            Err(SegmenterError::MalformedPack(_))
        ));
    }
}
