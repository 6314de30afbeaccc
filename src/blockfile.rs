//! Block file format v1 — fixed directory, checksummed payloads.
//!
//! # On-disk layout (all numeric fields little-endian)
//!
//! ```text
//! Offset        Size  Field
//!    0             4  magic      = "IBLK" (4 ASCII bytes)
//!    4             4  version    = 1               (LE u32)
//!    8             4  n          = blocksperfile   (LE u32)
//!   12          n*20  block directory, one entry per block in file
//!   ...              zero padding to PAYLOAD_ALIGN
//!   aligned     ...  payload region (append-only)
//! ```
//!
//! Directory entry (20 bytes):
//!
//! ```text
//! Offset  Size  Field
//!    0      1   codec      frozen on-disk codec id
//!    1      1   flags      bit0 = present, bit1 = lossy
//!    2      2   reserved   = 0
//!    4      4   comp_size  on-disk payload bytes     (LE u32)
//!    8      8   offset     file-absolute             (LE u64)
//!   16      4   checksum   CRC32 of the payload      (LE u32)
//! ```
//!
//! A block with `flags.present = 0` is absent — a hole; its other fields
//! are meaningless. Directory entries are rewritten in place when a block
//! is (re)written; payloads only ever append, so a torn write can orphan
//! payload bytes but never corrupt a committed block.
//!
//! # Checksums
//! `checksum` covers the encoded payload exactly as stored. It is verified
//! on every read before the codec runs; a mismatch is corruption, not a
//! codec error. There is no opt-out.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::codec::CodecTag;
use crate::error::Error;

pub const BLOCKFILE_MAGIC: &[u8; 4] = b"IBLK";
pub const BLOCKFILE_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: u64 = 12;
pub const DIR_ENTRY_SIZE: u64 = 20;
pub const PAYLOAD_ALIGN: u64 = 512;

pub const FLAG_PRESENT: u8 = 0x01;
pub const FLAG_LOSSY: u8 = 0x02;

// ── Directory entry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    pub codec:     u8,
    pub flags:     u8,
    pub comp_size: u32,
    pub offset:    u64,
    pub checksum:  u32,
}

impl DirEntry {
    #[inline]
    pub fn present(&self) -> bool {
        self.flags & FLAG_PRESENT != 0
    }

    #[inline]
    pub fn lossy(&self) -> bool {
        self.flags & FLAG_LOSSY != 0
    }

    pub fn codec_tag(&self) -> Option<CodecTag> {
        CodecTag::from_disk_id(self.codec)
    }

    fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u8(self.codec)?;
        w.write_u8(self.flags)?;
        w.write_u16::<LittleEndian>(0)?; // reserved
        w.write_u32::<LittleEndian>(self.comp_size)?;
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.checksum)
    }

    fn read<R: Read>(mut r: R) -> io::Result<DirEntry> {
        let codec = r.read_u8()?;
        let flags = r.read_u8()?;
        let _reserved = r.read_u16::<LittleEndian>()?;
        let comp_size = r.read_u32::<LittleEndian>()?;
        let offset = r.read_u64::<LittleEndian>()?;
        let checksum = r.read_u32::<LittleEndian>()?;
        Ok(DirEntry { codec, flags, comp_size, offset, checksum })
    }
}

// ── File-level operations ────────────────────────────────────────────────────
//
// All functions take an exclusive `&mut File`; the open-file cache holds
// one slot lock per path, which is the only writer at any time.

/// First payload byte: header + directory rounded up to PAYLOAD_ALIGN.
pub fn payload_start(nblocks: u32) -> u64 {
    let end = FILE_HEADER_SIZE + nblocks as u64 * DIR_ENTRY_SIZE;
    end.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}

fn entry_offset(index: u32) -> u64 {
    FILE_HEADER_SIZE + index as u64 * DIR_ENTRY_SIZE
}

/// Initialize a fresh block file: header, all-absent directory, padding.
pub fn create(file: &mut File, nblocks: u32) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(BLOCKFILE_MAGIC)?;
    file.write_u32::<LittleEndian>(BLOCKFILE_VERSION)?;
    file.write_u32::<LittleEndian>(nblocks)?;
    let zeros = vec![0u8; (payload_start(nblocks) - FILE_HEADER_SIZE) as usize];
    file.write_all(&zeros)?;
    file.flush()
}

/// Validate magic and version; returns the directory length `n`.
pub fn read_header(file: &mut File) -> Result<u32, Error> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != BLOCKFILE_MAGIC {
        return Err(Error::MalformedHeader(format!(
            "bad block file magic {magic:02x?}"
        )));
    }
    let version = file.read_u32::<LittleEndian>()?;
    if version != BLOCKFILE_VERSION {
        return Err(Error::MalformedHeader(format!(
            "unsupported block file version {version} (this build handles v{BLOCKFILE_VERSION})"
        )));
    }
    let n = file.read_u32::<LittleEndian>()?;
    if n == 0 {
        return Err(Error::MalformedHeader("block file directory is empty".into()));
    }
    Ok(n)
}

pub fn read_entry(file: &mut File, nblocks: u32, index: u32) -> Result<DirEntry, Error> {
    debug_assert!(index < nblocks);
    file.seek(SeekFrom::Start(entry_offset(index)))?;
    Ok(DirEntry::read(file)?)
}

pub fn write_entry(file: &mut File, index: u32, entry: &DirEntry) -> Result<(), Error> {
    file.seek(SeekFrom::Start(entry_offset(index)))?;
    entry.write(&mut *file)?;
    file.flush()?;
    Ok(())
}

pub fn read_directory(file: &mut File) -> Result<Vec<DirEntry>, Error> {
    let n = read_header(file)?;
    file.seek(SeekFrom::Start(entry_offset(0)))?;
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        entries.push(DirEntry::read(&mut *file)?);
    }
    Ok(entries)
}

/// Read and checksum-verify the payload named by `entry`.
pub fn read_payload(file: &mut File, entry: &DirEntry) -> Result<Vec<u8>, Error> {
    debug_assert!(entry.present());
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut payload = vec![0u8; entry.comp_size as usize];
    file.read_exact(&mut payload)?;
    let mut h = Hasher::new();
    h.update(&payload);
    let actual = h.finalize();
    if actual != entry.checksum {
        return Err(Error::MalformedHeader(format!(
            "block payload CRC32 mismatch: expected {:#010x}, got {actual:#010x}",
            entry.checksum
        )));
    }
    Ok(payload)
}

/// Append a payload at end of file; returns `(offset, checksum)`.
pub fn append_payload(
    file: &mut File,
    nblocks: u32,
    payload: &[u8],
) -> Result<(u64, u32), Error> {
    let end = file.seek(SeekFrom::End(0))?;
    let offset = end.max(payload_start(nblocks));
    if offset > end {
        // First payload in a freshly created file: honor the alignment.
        file.seek(SeekFrom::Start(offset))?;
    }
    file.write_all(payload)?;
    file.flush()?;
    let mut h = Hasher::new();
    h.update(payload);
    Ok((offset, h.finalize()))
}

// ── Health scan ──────────────────────────────────────────────────────────────

/// Per-block verdict produced by [`verify_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHealth {
    Absent,
    Healthy,
    /// Payload CRC32 does not match the directory.
    ChecksumMismatch,
    /// Directory points past end of file.
    Truncated { declared: u32, available: u64 },
    UnknownCodec { codec_id: u8 },
}

/// Walk a block file's directory and checksum every present payload.
/// Used by the `verify` CLI command; never called on the query path.
pub fn verify_file(path: &Path) -> Result<Vec<BlockHealth>, Error> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let entries = read_directory(&mut file)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in &entries {
        if !entry.present() {
            out.push(BlockHealth::Absent);
            continue;
        }
        if entry.codec_tag().is_none() {
            out.push(BlockHealth::UnknownCodec { codec_id: entry.codec });
            continue;
        }
        if entry.offset + entry.comp_size as u64 > file_len {
            out.push(BlockHealth::Truncated {
                declared:  entry.comp_size,
                available: file_len.saturating_sub(entry.offset),
            });
            continue;
        }
        match read_payload(&mut file, entry) {
            Ok(_) => out.push(BlockHealth::Healthy),
            Err(_) => out.push(BlockHealth::ChecksumMismatch),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn temp_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.blk");
        (dir, path)
    }

    fn open_rw(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn create_then_all_absent() {
        let (_dir, path) = temp_file();
        let mut f = open_rw(&path);
        create(&mut f, 8).unwrap();
        assert_eq!(read_header(&mut f).unwrap(), 8);
        for i in 0..8 {
            assert!(!read_entry(&mut f, 8, i).unwrap().present());
        }
        assert_eq!(f.metadata().unwrap().len(), payload_start(8));
    }

    #[test]
    fn write_read_roundtrip() {
        let (_dir, path) = temp_file();
        let mut f = open_rw(&path);
        create(&mut f, 4).unwrap();

        let payload = b"compressed bytes".to_vec();
        let (offset, checksum) = append_payload(&mut f, 4, &payload).unwrap();
        assert_eq!(offset % PAYLOAD_ALIGN, 0);
        let entry = DirEntry {
            codec: CodecTag::Raw.disk_id(),
            flags: FLAG_PRESENT,
            comp_size: payload.len() as u32,
            offset,
            checksum,
        };
        write_entry(&mut f, 2, &entry).unwrap();

        let back = read_entry(&mut f, 4, 2).unwrap();
        assert_eq!(back, entry);
        assert!(back.present());
        assert!(!back.lossy());
        assert_eq!(read_payload(&mut f, &back).unwrap(), payload);
    }

    #[test]
    fn corruption_is_detected() {
        let (_dir, path) = temp_file();
        let mut f = open_rw(&path);
        create(&mut f, 1).unwrap();
        let payload = vec![9u8; 64];
        let (offset, checksum) = append_payload(&mut f, 1, &payload).unwrap();
        let entry = DirEntry {
            codec: CodecTag::Raw.disk_id(),
            flags: FLAG_PRESENT,
            comp_size: 64,
            offset,
            checksum,
        };
        write_entry(&mut f, 0, &entry).unwrap();

        // Flip one payload byte.
        f.seek(SeekFrom::Start(offset + 10)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        assert!(read_payload(&mut f, &entry).is_err());
        assert_eq!(verify_file(&path).unwrap(), vec![BlockHealth::ChecksumMismatch]);
    }

    #[test]
    fn verify_reports_truncation_and_unknown_codec() {
        let (_dir, path) = temp_file();
        let mut f = open_rw(&path);
        create(&mut f, 2).unwrap();
        write_entry(
            &mut f,
            0,
            &DirEntry {
                codec: 250,
                flags: FLAG_PRESENT,
                comp_size: 1,
                offset: payload_start(2),
                checksum: 0,
            },
        )
        .unwrap();
        write_entry(
            &mut f,
            1,
            &DirEntry {
                codec: CodecTag::Raw.disk_id(),
                flags: FLAG_PRESENT,
                comp_size: 4096,
                offset: payload_start(2),
                checksum: 0,
            },
        )
        .unwrap();
        let health = verify_file(&path).unwrap();
        assert_eq!(health[0], BlockHealth::UnknownCodec { codec_id: 250 });
        assert!(matches!(health[1], BlockHealth::Truncated { declared: 4096, .. }));
    }

    #[test]
    fn rejects_foreign_files() {
        let (_dir, path) = temp_file();
        std::fs::write(&path, b"not a block file at all").unwrap();
        let mut f = open_rw(&path);
        assert!(matches!(read_header(&mut f), Err(Error::MalformedHeader(_))));
    }
}
