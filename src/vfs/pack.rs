//! Archive writer.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use encoding_rs::Encoding;
use tracing::{debug, error, info};

use super::{ArchiveRecord, VfsError, DIRECTORY_HEADER_SIZE, NAME_SIZE, RECORD_SIZE, SECTOR_SIZE, VFS_MAGIC};
use crate::format::padding;
use crate::library::{self, LoadOptions};
use crate::text;

/// Where a record's payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackPayload {
    /// A file copied verbatim.
    Direct { source: PathBuf },
    /// `[file_start, file_end)` of the loaded image of `source`.
    Program { source: PathBuf, file_start: u32, file_end: u32, load_libs: bool },
    /// A library group over other entries of the same pack list.
    Group { members: Vec<usize>, primary: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name:     String,
    pub type_tag: u32,
    pub payload:  PackPayload,
}

#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    /// Encoding of directory names.
    pub name_encoding: &'static Encoding,
    /// Used to load program payloads.
    pub load:          LoadOptions,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            name_encoding: text::default_name_encoding(),
            load:          LoadOptions::default(),
        }
    }
}

/// Result of [`pack`].  Failed entries are still present in `records` with a
/// zero-length payload so group indices stay valid.
#[derive(Debug, Default)]
pub struct PackReport {
    pub records:  Vec<ArchiveRecord>,
    pub failures: Vec<(usize, VfsError)>,
}

/// Write `entries` as an archive at `path`.
pub fn pack(path: &Path, entries: &[PackEntry], opts: &PackOptions) -> Result<PackReport, VfsError> {
    let mut report = PackReport::default();
    let mut payloads = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        match materialize(entry, i, entries.len(), &opts.load) {
            Ok(bytes) => payloads.push(bytes),
            Err(e) => {
                error!(index = i, name = %entry.name, "cannot pack entry: {}", e);
                report.failures.push((i, e));
                payloads.push(Vec::new());
            }
        }
    }

    let count = u32::try_from(entries.len()).map_err(|_| VfsError::TooLarge)?;
    let directory_end = count
        .checked_mul(RECORD_SIZE)
        .and_then(|n| n.checked_add(DIRECTORY_HEADER_SIZE))
        .ok_or(VfsError::TooLarge)?;
    let directory_pad = padding(directory_end, SECTOR_SIZE);
    let first_data = directory_end.checked_add(directory_pad).ok_or(VfsError::TooLarge)?;

    let mut addr = first_data;
    for (index, (entry, payload)) in entries.iter().zip(&payloads).enumerate() {
        let size = u32::try_from(payload.len()).map_err(|_| VfsError::TooLarge)?;
        let padded = size.checked_add(padding(size, SECTOR_SIZE)).ok_or(VfsError::TooLarge)?;
        report.records.push(ArchiveRecord {
            index,
            name: entry.name.clone(),
            size,
            sector: addr / SECTOR_SIZE,
            sectors: padded / SECTOR_SIZE,
            address: addr,
            type_tag: entry.type_tag,
        });
        addr = addr.checked_add(padded).ok_or(VfsError::TooLarge)?;
    }

    let mut w = BufWriter::new(File::create(path)?);
    w.write_u32::<LittleEndian>(VFS_MAGIC)?;
    w.write_u32::<LittleEndian>(count)?;
    w.write_u32::<LittleEndian>(first_data / SECTOR_SIZE)?;
    for rec in &report.records {
        let mut name = [0u8; NAME_SIZE];
        let encoded = text::encode_truncated(&rec.name, opts.name_encoding, NAME_SIZE - 1);
        name[..encoded.len()].copy_from_slice(&encoded);
        w.write_all(&name)?;
        w.write_u32::<LittleEndian>(rec.size)?;
        w.write_u32::<LittleEndian>(rec.sector)?;
        w.write_u32::<LittleEndian>(rec.sectors)?;
        w.write_u32::<LittleEndian>(rec.address)?;
        w.write_u32::<LittleEndian>(rec.type_tag)?;
    }
    w.write_all(&vec![0u8; directory_pad as usize])?;
    for payload in &payloads {
        w.write_all(payload)?;
        w.write_all(&vec![0u8; padding(payload.len() as u32, SECTOR_SIZE) as usize])?;
    }
    w.flush()?;

    info!(path = %path.display(), records = count, failed = report.failures.len(), "packed archive");
    Ok(report)
}

fn materialize(entry: &PackEntry, index: usize, count: usize, load: &LoadOptions) -> Result<Vec<u8>, VfsError> {
    match &entry.payload {
        PackPayload::Direct { source } => Ok(fs::read(source)?),
        PackPayload::Program { source, file_start, file_end, load_libs } => {
            let opts = LoadOptions { load_libs: *load_libs, load_payload: true, ..*load };
            let table = library::load_title(source, &opts)?;
            let slice = table
                .image
                .get(*file_start as usize..*file_end as usize)
                .ok_or(VfsError::SliceOutOfBounds {
                    start: *file_start,
                    end:   *file_end,
                    len:   table.image.len(),
                })?;
            debug!(index, source = %source.display(), "{} program bytes", slice.len());
            Ok(slice.to_vec())
        }
        PackPayload::Group { members, primary } => {
            for &m in members {
                if m >= count {
                    return Err(VfsError::BadMember { group: index, member: m as i64, count });
                }
            }
            if *primary >= members.len() {
                return Err(VfsError::BadPrimary { group: index, slot: *primary as i64, members: members.len() });
            }
            let mut out = Vec::with_capacity((members.len() + 1) * 4);
            for &m in members {
                let m = i32::try_from(m).map_err(|_| VfsError::TooLarge)?;
                out.write_i32::<LittleEndian>(m)?;
            }
            let slot = i32::try_from(*primary).map_err(|_| VfsError::TooLarge)?;
            out.write_i32::<LittleEndian>(-slot)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{VfsReader, MOD_TAG, VGM_TAG};
    use encoding_rs::WINDOWS_1252;
    use tempfile::tempdir;

    #[test]
    fn layout_is_sector_aligned() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.vgm");
        let b = dir.path().join("b.mod");
        fs::write(&a, vec![1u8; 3000]).unwrap();
        fs::write(&b, vec![2u8; 10]).unwrap();
        let entries = vec![
            PackEntry { name: "a".into(), type_tag: VGM_TAG, payload: PackPayload::Direct { source: a } },
            PackEntry { name: "b".into(), type_tag: MOD_TAG, payload: PackPayload::Direct { source: b } },
        ];
        let out = dir.path().join("out.vfs");
        let report = pack(&out, &entries, &PackOptions::default()).unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.records[0].address, 2048);
        assert_eq!(report.records[0].sectors, 2);
        assert_eq!(report.records[1].address, 2048 * 3);
        assert_eq!(fs::metadata(&out).unwrap().len(), 2048 * 4);

        let mut r = VfsReader::open(&out, WINDOWS_1252).unwrap();
        assert_eq!(r.first_data_sector(), 1);
        assert_eq!(r.read_payload(1).unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn failed_entry_keeps_its_slot() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("x.mdx");
        fs::write(&good, b"mdx").unwrap();
        let entries = vec![
            PackEntry { name: "gone".into(), type_tag: 0, payload: PackPayload::Direct { source: dir.path().join("nope") } },
            PackEntry { name: "x".into(), type_tag: 0, payload: PackPayload::Direct { source: good } },
            PackEntry { name: "bad".into(), type_tag: 0xFFFF_FF18, payload: PackPayload::Group { members: vec![9], primary: 0 } },
        ];
        let out = dir.path().join("out.vfs");
        let report = pack(&out, &entries, &PackOptions::default()).unwrap();
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.failures.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(report.records[0].size, 0);
        let mut r = VfsReader::open(&out, WINDOWS_1252).unwrap();
        assert_eq!(r.read_payload(1).unwrap(), b"mdx");
    }

    #[test]
    fn long_names_are_truncated() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"z").unwrap();
        let name = "n".repeat(100);
        let entries = vec![PackEntry { name, type_tag: 0, payload: PackPayload::Direct { source: f } }];
        let out = dir.path().join("out.vfs");
        pack(&out, &entries, &PackOptions::default()).unwrap();
        let r = VfsReader::open(&out, WINDOWS_1252).unwrap();
        assert_eq!(r.records()[0].name.len(), 63);
    }
}
