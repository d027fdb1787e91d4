//! Single-container codec.
//!
//! # Layout
//! ```text
//! [0x00] magic            (u32 LE)  SSF 0x11465350, DSF 0x12465350
//! [0x04] reserved size    (u32 LE)
//! [0x08] compressed size  (u32 LE)
//! [0x0C] CRC32            (u32 LE)  over the compressed bytes
//! [0x10] reserved area    (reserved size bytes, opaque)
//! [....] zlib block       (compressed size bytes) -> [header][program]
//! [....] tag block        (rest of file, optional "[TAG]key=value\n...")
//! ```
//! A file whose magic is not a known family is a raw BIN dump: the whole file
//! is the image and its first `header_size` bytes are the header.

pub mod block;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::format::{BinaryKind, Family, CONTAINER_PREAMBLE};
use crate::table::{ContainerEntry, FormatTable};
use crate::text::TextOptions;

pub use block::{crc32, decode_block, encode_block, CompressedBlock};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{}: not an SSF/DSF container (magic {magic:#010x})", .path.display())]
    BadMagic { path: PathBuf, magic: u32 },
    #[error("{}: truncated container ({what})", .path.display())]
    Truncated { path: PathBuf, what: &'static str },
    #[error("{}: file too small for a {family:?} header", .path.display())]
    ShortBin { path: PathBuf, family: Family },
    #[error("unsupported format family for {0}")]
    UnsupportedFamily(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("load address {header:#x} does not fit the address space")]
    AddressOverflow { header: u32 },
    #[error("entry span {start:#x}..{end:#x} is outside an image of {len:#x} bytes")]
    OutOfBounds { start: u32, end: u32, len: usize },
    #[error("no entry {index} in a table of {count}")]
    NoEntry { index: usize, count: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── ReadOptions ───────────────────────────────────────────────────────────────

/// Hints for [`load`].
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Force a storage kind.  `Some(Bin)` reads even a valid container raw.
    pub kind:         Option<BinaryKind>,
    /// Family to assume for raw dumps.
    pub family:       Option<Family>,
    pub text:         TextOptions,
    /// Decompress the program.  When false only tags are read.
    pub load_payload: bool,
    /// Compute the BLAKE3 content hash of the decompressed block.
    pub hash:         bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            kind:         None,
            family:       None,
            text:         TextOptions::default(),
            load_payload: true,
            hash:         false,
        }
    }
}

/// One file as read from disk.
#[derive(Debug, Clone)]
pub struct LoadedContainer {
    pub kind:    BinaryKind,
    pub family:  Family,
    /// `start`/`end` use full-image coordinates (`header value + header size`).
    pub entry:   ContainerEntry,
    /// Decompressed program bytes, header excluded.  Empty when the payload
    /// was not requested.
    pub program: Vec<u8>,
}

// ── Load ──────────────────────────────────────────────────────────────────────

pub fn load(path: &Path, opts: &ReadOptions) -> Result<LoadedContainer, CodecError> {
    let mut reader = BufReader::new(File::open(path)?);
    let file_len = reader.get_ref().metadata()?.len();
    let magic = match reader.read_u32::<LittleEndian>() {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
        Err(e) => return Err(e.into()),
    };

    let container_family = Family::from_magic(magic);
    match (opts.kind, container_family) {
        (Some(BinaryKind::Bin), _) | (None, None) => {
            reader.seek(SeekFrom::Start(0))?;
            load_bin(reader, path, magic, opts)
        }
        (Some(_), None) => Err(CodecError::BadMagic { path: path.to_owned(), magic }),
        (_, Some(family)) => {
            if let Some(hint) = opts.family.filter(|h| *h != family) {
                warn!(path = %path.display(), "format hint {:?} ignored, magic says {:?}", hint, family);
            }
            load_container(reader, path, family, file_len, opts)
        }
    }
}

fn load_bin<R: Read>(mut reader: R, path: &Path, first_word: u32, opts: &ReadOptions) -> Result<LoadedContainer, CodecError> {
    let family = opts.family.unwrap_or_else(|| Family::guess_from_bin(first_word));
    let hs = family.header_size();
    let mut raw = Vec::new();
    if opts.load_payload {
        reader.read_to_end(&mut raw)?;
    } else {
        raw.resize(hs, 0);
        reader.read_exact(&mut raw).map_err(|_| CodecError::ShortBin { path: path.to_owned(), family })?;
    }
    if raw.len() < hs {
        return Err(CodecError::ShortBin { path: path.to_owned(), family });
    }
    let program = raw.split_off(hs);
    let len = u32::try_from(program.len() + hs)
        .map_err(|_| CodecError::AddressOverflow { header: first_word })?;

    let mut entry = ContainerEntry::new(absolute(path), raw);
    entry.start = hs as u32;
    entry.end = if opts.load_payload { len } else { hs as u32 };
    entry.tag_encoding = opts.text.input.unwrap_or(encoding_rs::UTF_8);
    if opts.hash && opts.load_payload {
        let mut h = blake3::Hasher::new();
        h.update(&entry.header);
        h.update(&program);
        entry.content_hash = Some(h.finalize().into());
    }
    Ok(LoadedContainer { kind: BinaryKind::Bin, family, entry, program })
}

fn load_container<R: Read + Seek>(
    mut reader: R,
    path:       &Path,
    family:     Family,
    file_len:   u64,
    opts:       &ReadOptions,
) -> Result<LoadedContainer, CodecError> {
    let truncated = |what| CodecError::Truncated { path: path.to_owned(), what };
    let reserved_size = reader.read_u32::<LittleEndian>().map_err(|_| truncated("reserved size"))?;
    let compressed_size = reader.read_u32::<LittleEndian>().map_err(|_| truncated("compressed size"))?;
    let stored_crc = reader.read_u32::<LittleEndian>().map_err(|_| truncated("crc"))?;
    let tag_offset = CONTAINER_PREAMBLE + reserved_size as u64 + compressed_size as u64;

    let mut entry = ContainerEntry::new(absolute(path), Vec::new());
    entry.crc = stored_crc;
    let mut program = Vec::new();

    if opts.load_payload {
        if tag_offset > file_len {
            return Err(truncated("compressed block"));
        }
        let mut reserved = vec![0u8; reserved_size as usize];
        reader.read_exact(&mut reserved)?;
        let mut payload = vec![0u8; compressed_size as usize];
        reader.read_exact(&mut payload)?;

        let block = CompressedBlock { payload, crc: stored_crc };
        if !block.crc_matches() {
            warn!(path = %path.display(), "wrong CRC (stored {:#010x}, computed {:#010x})",
                stored_crc, crc32(&block.payload));
        }
        let mut raw = decode_block(&block.payload)?;
        if opts.hash {
            entry.content_hash = Some(blake3::hash(&raw).into());
        }
        let hs = family.header_size();
        if raw.len() < hs {
            return Err(truncated("header"));
        }
        program = raw.split_off(hs);
        let header_value = family
            .header_value(&raw)
            .ok_or_else(|| truncated("header"))?;
        entry.header = raw;
        entry.reserved = reserved;

        let start = header_value
            .checked_add(hs as u32)
            .ok_or(CodecError::AddressOverflow { header: header_value })?;
        let end = u32::try_from(program.len())
            .ok()
            .and_then(|n| start.checked_add(n))
            .ok_or(CodecError::AddressOverflow { header: header_value })?;
        entry.start = start;
        entry.end = end;
        debug!(path = %path.display(), "loaded {} program bytes at {:#x}", program.len(), header_value);
    }

    entry.tags = read_tags(&mut reader, tag_offset, file_len)?;
    entry.tag_encoding = opts.text.resolve_input(&entry.tags);

    Ok(LoadedContainer { kind: BinaryKind::MiniXsf, family, entry, program })
}

fn read_tags<R: Read + Seek>(reader: &mut R, tag_offset: u64, file_len: u64) -> io::Result<Vec<u8>> {
    if tag_offset >= file_len {
        return Ok(Vec::new());
    }
    reader.seek(SeekFrom::Start(tag_offset))?;
    let mut tags = Vec::with_capacity((file_len - tag_offset) as usize);
    reader.read_to_end(&mut tags)?;
    Ok(tags)
}

/// Read only the tag block of a container, without touching the payload.
///
/// Raw dumps and unreadable preambles yield no tags.
pub fn peek_tags(path: &Path) -> Result<Vec<u8>, CodecError> {
    let mut reader = BufReader::new(File::open(path)?);
    let file_len = reader.get_ref().metadata()?.len();
    if file_len < CONTAINER_PREAMBLE {
        return Ok(Vec::new());
    }
    let magic = reader.read_u32::<LittleEndian>()?;
    if Family::from_magic(magic).is_none() {
        return Ok(Vec::new());
    }
    let reserved_size = reader.read_u32::<LittleEndian>()?;
    let compressed_size = reader.read_u32::<LittleEndian>()?;
    let tag_offset = CONTAINER_PREAMBLE + reserved_size as u64 + compressed_size as u64;
    Ok(read_tags(&mut reader, tag_offset, file_len)?)
}

// ── Save ──────────────────────────────────────────────────────────────────────

/// Serialize `entry` of `family`, taking its program from `image`.
pub fn encode_container(family: Family, entry: &ContainerEntry, image: &[u8]) -> Result<Vec<u8>, CodecError> {
    let program = image
        .get(entry.start as usize..entry.end as usize)
        .ok_or(CodecError::OutOfBounds { start: entry.start, end: entry.end, len: image.len() })?;
    let hs = family.header_size();
    if entry.header.len() != hs {
        return Err(CodecError::UnsupportedFamily(format!(
            "{:?} entry with a {}-byte header", family, entry.header.len()
        )));
    }
    let block = encode_block(&entry.header, program)?;

    let mut out = Vec::with_capacity(CONTAINER_PREAMBLE as usize + entry.reserved.len() + block.payload.len() + entry.tags.len());
    out.write_u32::<LittleEndian>(family.magic())?;
    out.write_u32::<LittleEndian>(entry.reserved.len() as u32)?;
    out.write_u32::<LittleEndian>(block.payload.len() as u32)?;
    out.write_u32::<LittleEndian>(block.crc)?;
    out.write_all(&entry.reserved)?;
    out.write_all(&block.payload)?;
    out.write_all(&entry.tags)?;
    Ok(out)
}

/// Write entry `index` of `table` to `out`.
pub fn save(table: &FormatTable, index: usize, out: &Path) -> Result<(), CodecError> {
    let entry = table
        .entries
        .get(index)
        .ok_or(CodecError::NoEntry { index, count: table.entries.len() })?;
    let bytes = encode_container(table.family, entry, &table.image)?;
    let mut w = BufWriter::new(File::create(out)?);
    w.write_all(&bytes)?;
    w.flush()?;
    debug!(path = %out.display(), "saved {} program bytes", entry.len());
    Ok(())
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_8;
    use tempfile::tempdir;

    fn table_with(program: &[u8], tags: &[u8]) -> FormatTable {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, program.len() + 4);
        t.image[..4].copy_from_slice(&0x1000u32.to_le_bytes());
        t.image[4..].copy_from_slice(program);
        let mut e = ContainerEntry::new("a.minissf", Family::Ssf.header_bytes(0x1000));
        e.start = 4;
        e.end = t.image.len() as u32;
        e.tags = tags.to_vec();
        e.reserved = vec![0xAA, 0xBB];
        t.entries.push(e);
        t
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.minissf");
        let t = table_with(b"hello program", b"[TAG]title=Hello");
        save(&t, 0, &path).unwrap();

        let opts = ReadOptions { text: TextOptions::utf8(), hash: true, ..Default::default() };
        let loaded = load(&path, &opts).unwrap();
        assert_eq!(loaded.family, Family::Ssf);
        assert_eq!(loaded.program, b"hello program");
        assert_eq!(loaded.entry.start, 0x1004);
        assert_eq!(loaded.entry.end, 0x1004 + 13);
        assert_eq!(loaded.entry.reserved, vec![0xAA, 0xBB]);
        assert_eq!(loaded.entry.tags, b"[TAG]title=Hello");
        assert_eq!(loaded.entry.tag_encoding, UTF_8);
        assert!(loaded.entry.content_hash.is_some());
    }

    #[test]
    fn stored_crc_matches_compressed_block() {
        let t = table_with(&[3u8; 300], b"");
        let bytes = encode_container(Family::Ssf, &t.entries[0], &t.image).unwrap();
        let reserved = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let clen = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(crc32(&bytes[16 + reserved..16 + reserved + clen]), crc);
    }

    #[test]
    fn metadata_only_load_reads_tags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.minissf");
        save(&table_with(b"xyz", b"[TAG]_lib=base.ssflib"), 0, &path).unwrap();
        let opts = ReadOptions { load_payload: false, text: TextOptions::utf8(), ..Default::default() };
        let loaded = load(&path, &opts).unwrap();
        assert!(loaded.program.is_empty());
        assert_eq!(loaded.entry.tags, b"[TAG]_lib=base.ssflib");
        assert_eq!(peek_tags(&path).unwrap(), b"[TAG]_lib=base.ssflib");
    }

    #[test]
    fn crc_mismatch_is_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.minissf");
        let t = table_with(b"payload", b"");
        let mut bytes = encode_container(Family::Ssf, &t.entries[0], &t.image).unwrap();
        bytes[12] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        let loaded = load(&path, &ReadOptions::default()).unwrap();
        assert_eq!(loaded.program, b"payload");
        assert!(loaded.entry.tags.is_empty());
    }

    #[test]
    fn unknown_magic_loads_as_bin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ram.ssfbin");
        let mut raw = 0x2000u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, &raw).unwrap();
        let loaded = load(&path, &ReadOptions::default()).unwrap();
        assert_eq!(loaded.kind, BinaryKind::Bin);
        assert_eq!(loaded.family, Family::Ssf);
        assert_eq!(loaded.entry.start, 4);
        assert_eq!(loaded.entry.end, 7);
        assert_eq!(loaded.program, vec![1, 2, 3]);
    }

    #[test]
    fn forced_container_kind_rejects_raw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ram.bin");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let opts = ReadOptions { kind: Some(BinaryKind::MiniXsf), ..Default::default() };
        assert!(matches!(load(&path, &opts), Err(CodecError::BadMagic { .. })));
    }

    #[test]
    fn zero_length_program_saves() {
        let mut t = table_with(b"abcd", b"[TAG]");
        t.entries[0].end = t.entries[0].start;
        let bytes = encode_container(Family::Ssf, &t.entries[0], &t.image).unwrap();
        let clen = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let raw = decode_block(&bytes[18..18 + clen]).unwrap();
        assert_eq!(raw.len(), 4);
    }

    #[test]
    fn save_rejects_unknown_index() {
        let dir = tempdir().unwrap();
        let t = table_with(b"abcd", b"[TAG]");
        let out = dir.path().join("x.minissf");
        assert!(matches!(save(&t, 5, &out), Err(CodecError::NoEntry { index: 5, count: 1 })));
        assert!(!out.exists());
    }
}
