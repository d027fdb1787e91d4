//! VFS multi-title archive.
//!
//! # Layout
//! ```text
//! [0x00] magic              (u32 LE)  0x00534656 "VFS\0"
//! [0x04] record count       (u32 LE)
//! [0x08] first data sector  (u32 LE)
//! [0x0C] records            (84 bytes each)
//!          name[64]         zero padded, at most 63 encoded bytes
//!          size             (u32 LE)  payload bytes
//!          sector           (u32 LE)  address / 2048
//!          sectors          (u32 LE)  padded size / 2048
//!          address          (u32 LE)  byte offset of the payload
//!          type tag         (u32 LE)
//! [....] zero padding to the next 2048-byte boundary
//! [....] payloads, each zero padded to a sector boundary
//! ```
//!
//! # Type tags
//! Program members carry their absolute load address as the type tag.
//! `0xFFFFFF18` / `0xFFFFFF19` mark SSF / DSF library groups whose payload is
//! a list of `i32` record indices followed by the negated position of the
//! primary member within that list.  Other `0xFFFFFFxx` values name resource
//! types and only affect the extension of extracted files.

pub mod collect;
pub mod pack;
pub mod unpack;

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use encoding_rs::Encoding;
use serde::Serialize;
use thiserror::Error;

use crate::codec::CodecError;
use crate::emit::EmitError;
use crate::format::Family;
use crate::library::ResolveError;

pub use collect::{CollectOptions, TitleCollector};
pub use pack::{pack, PackEntry, PackOptions, PackPayload, PackReport};
pub use unpack::{unpack, UnpackOptions, UnpackReport};

pub const VFS_MAGIC: u32 = 0x0053_4656;
pub const SECTOR_SIZE: u32 = 2048;
pub const DIRECTORY_HEADER_SIZE: u32 = 12;
pub const RECORD_SIZE: u32 = 84;
pub const NAME_SIZE: usize = 64;

pub const DRIVER_TAG: u32 = 0xFFFF_FF1A;
pub const MOD_TAG: u32 = 0xFFFF_FF1B;
pub const VGM_TAG: u32 = 0xFFFF_FF1C;
pub const MDX_TAG: u32 = 0xFFFF_FF1D;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("not a VFS archive (magic {0:#010x})")]
    BadMagic(u32),
    #[error("truncated archive ({0})")]
    Truncated(&'static str),
    #[error("record {index} is not a library group")]
    NotAGroup { index: usize },
    #[error("group {group} references record {member}, archive has {count}")]
    BadMember { group: usize, member: i64, count: usize },
    #[error("group {group} has primary slot {slot} for {members} members")]
    BadPrimary { group: usize, slot: i64, members: usize },
    #[error("program slice {start:#x}..{end:#x} is outside an image of {len:#x} bytes")]
    SliceOutOfBounds { start: u32, end: u32, len: usize },
    #[error("archive exceeds the 32-bit address space")]
    TooLarge,
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Directory records ─────────────────────────────────────────────────────────

/// One directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveRecord {
    pub index:    usize,
    pub name:     String,
    pub size:     u32,
    pub sector:   u32,
    pub sectors:  u32,
    pub address:  u32,
    pub type_tag: u32,
}

impl ArchiveRecord {
    pub fn group_family(&self) -> Option<Family> {
        Family::from_group_tag(self.type_tag)
    }

    /// Short label for listings.
    pub fn kind_label(&self) -> &'static str {
        match self.type_tag {
            t if Family::from_group_tag(t).is_some() => "group",
            DRIVER_TAG => "driver",
            t if t >= 0xFFFF_FF00 => "resource",
            _ => "program",
        }
    }
}

/// Extension (with dot) for a raw extracted payload.
pub fn passthrough_extension(type_tag: u32) -> &'static str {
    match type_tag {
        0xFFFF_FF01 => ".hit",
        0xFFFF_FF02 => ".pxm",
        0xFFFF_FF03 => ".psq",
        0xFFFF_FF04 => ".psp",
        0xFFFF_FF05 => ".vag",
        0xFFFF_FF08 => ".tim",
        0xFFFF_FF0F => ".vab",
        0xFFFF_FF13 => ".exe",
        0xFFFF_FF14 => ".psx",
        0xFFFF_FF16 => ".cnf",
        0xFFFF_FF18 => ".ssflibs",
        0xFFFF_FF19 => ".dsflibs",
        DRIVER_TAG  => ".bin",
        MOD_TAG     => ".mod",
        VGM_TAG     => ".vgm",
        MDX_TAG     => ".mdx",
        0x0102_0000..=0x0102_FFFF => ".seq",
        _ => "",
    }
}

/// Decoded group payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryGroup {
    pub family:  Family,
    /// Record indices in load order.
    pub members: Vec<usize>,
    /// Position of the primary title within `members`.
    pub primary: usize,
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Random access to an archive's directory and payloads.
pub struct VfsReader<R> {
    reader:            R,
    records:           Vec<ArchiveRecord>,
    first_data_sector: u32,
}

impl VfsReader<BufReader<File>> {
    pub fn open(path: &Path, name_encoding: &'static Encoding) -> Result<Self, VfsError> {
        Self::new(BufReader::new(File::open(path)?), name_encoding)
    }
}

impl<R: Read + Seek> VfsReader<R> {
    pub fn new(mut reader: R, name_encoding: &'static Encoding) -> Result<Self, VfsError> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let magic = reader.read_u32::<LittleEndian>().map_err(|_| VfsError::Truncated("header"))?;
        if magic != VFS_MAGIC {
            return Err(VfsError::BadMagic(magic));
        }
        let count = reader.read_u32::<LittleEndian>().map_err(|_| VfsError::Truncated("header"))?;
        let first_data_sector = reader.read_u32::<LittleEndian>().map_err(|_| VfsError::Truncated("header"))?;
        if DIRECTORY_HEADER_SIZE as u64 + count as u64 * RECORD_SIZE as u64 > stream_len {
            return Err(VfsError::Truncated("directory"));
        }

        let mut records = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let mut raw_name = [0u8; NAME_SIZE];
            reader.read_exact(&mut raw_name)?;
            let used = raw_name.iter().position(|b| *b == 0).unwrap_or(NAME_SIZE);
            let (name, _, _) = name_encoding.decode(&raw_name[..used]);
            records.push(ArchiveRecord {
                index,
                name:     name.into_owned(),
                size:     reader.read_u32::<LittleEndian>()?,
                sector:   reader.read_u32::<LittleEndian>()?,
                sectors:  reader.read_u32::<LittleEndian>()?,
                address:  reader.read_u32::<LittleEndian>()?,
                type_tag: reader.read_u32::<LittleEndian>()?,
            });
        }
        Ok(Self { reader, records, first_data_sector })
    }

    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    pub fn first_data_sector(&self) -> u32 {
        self.first_data_sector
    }

    pub fn read_payload(&mut self, index: usize) -> Result<Vec<u8>, VfsError> {
        let rec = self.records.get(index).ok_or(VfsError::Truncated("record index"))?;
        let mut buf = vec![0u8; rec.size as usize];
        self.reader.seek(SeekFrom::Start(rec.address as u64))?;
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| VfsError::Truncated("payload"))?;
        Ok(buf)
    }

    /// Decode the index list of group record `index`.
    pub fn read_group(&mut self, index: usize) -> Result<LibraryGroup, VfsError> {
        let family = self
            .records
            .get(index)
            .and_then(ArchiveRecord::group_family)
            .ok_or(VfsError::NotAGroup { index })?;
        let payload = self.read_payload(index)?;
        if payload.len() < 4 || payload.len() % 4 != 0 {
            return Err(VfsError::Truncated("group index list"));
        }
        let mut slots = payload
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
            .collect::<Vec<_>>();
        let last = slots.pop().unwrap_or(0);

        let count = self.records.len();
        let members = slots
            .into_iter()
            .map(|m| {
                usize::try_from(m)
                    .ok()
                    .filter(|m| *m < count)
                    .ok_or(VfsError::BadMember { group: index, member: m, count })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let primary = usize::try_from(-last)
            .ok()
            .filter(|p| *p < members.len())
            .ok_or(VfsError::BadPrimary { group: index, slot: last, members: members.len() })?;
        Ok(LibraryGroup { family, members, primary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use encoding_rs::WINDOWS_1252;
    use std::io::Cursor;

    fn archive(records: &[(&str, u32, u32)], payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(VFS_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(records.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap();
        let mut addr = SECTOR_SIZE;
        for ((name, size, tag), _) in records.iter().zip(payloads) {
            let mut raw = [0u8; NAME_SIZE];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&raw);
            for v in [*size, addr / SECTOR_SIZE, 1, addr, *tag] {
                out.write_u32::<LittleEndian>(v).unwrap();
            }
            addr += SECTOR_SIZE;
        }
        out.resize(SECTOR_SIZE as usize, 0);
        for p in payloads {
            let at = out.len();
            out.extend_from_slice(p);
            out.resize(at + SECTOR_SIZE as usize, 0);
        }
        out
    }

    fn group_bytes(slots: &[i32]) -> Vec<u8> {
        slots.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn reads_directory_and_group() {
        let g = group_bytes(&[0, 1, -1]);
        let bytes = archive(
            &[("lib.ssflib", 4, 0x05A0_1000), ("song.minissf", 4, 0x05A0_1004), ("Song", 12, 0xFFFF_FF18)],
            &[b"aaaa", b"bbbb", &g],
        );
        let mut r = VfsReader::new(Cursor::new(bytes), WINDOWS_1252).unwrap();
        assert_eq!(r.records().len(), 3);
        assert_eq!(r.records()[1].name, "song.minissf");
        assert_eq!(r.read_payload(1).unwrap(), b"bbbb");
        let group = r.read_group(2).unwrap();
        assert_eq!(group, LibraryGroup { family: Family::Ssf, members: vec![0, 1], primary: 1 });
        assert!(matches!(r.read_group(0), Err(VfsError::NotAGroup { index: 0 })));
    }

    #[test]
    fn rejects_bad_group_slots() {
        let out_of_range = group_bytes(&[7, 0]);
        let bad_primary = group_bytes(&[0, -3]);
        let bytes = archive(
            &[("a", 8, 0xFFFF_FF18), ("b", 8, 0xFFFF_FF19)],
            &[&out_of_range, &bad_primary],
        );
        let mut r = VfsReader::new(Cursor::new(bytes), WINDOWS_1252).unwrap();
        assert!(matches!(r.read_group(0), Err(VfsError::BadMember { member: 7, .. })));
        assert!(matches!(r.read_group(1), Err(VfsError::BadPrimary { slot: -3, .. })));
    }

    #[test]
    fn rejects_wrong_magic_and_short_directory() {
        assert!(matches!(
            VfsReader::new(Cursor::new(vec![0u8; 16]), WINDOWS_1252),
            Err(VfsError::BadMagic(0))
        ));
        let mut short = Vec::new();
        short.write_u32::<LittleEndian>(VFS_MAGIC).unwrap();
        short.write_u32::<LittleEndian>(10).unwrap();
        short.write_u32::<LittleEndian>(1).unwrap();
        assert!(matches!(
            VfsReader::new(Cursor::new(short), WINDOWS_1252),
            Err(VfsError::Truncated("directory"))
        ));
    }

    #[test]
    fn extension_table() {
        assert_eq!(passthrough_extension(0xFFFF_FF1C), ".vgm");
        assert_eq!(passthrough_extension(0x0102_0042), ".seq");
        assert_eq!(passthrough_extension(0x05A0_1000), "");
    }
}
