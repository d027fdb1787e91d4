//! In-memory representation of a title: one shared image plus the entries
//! whose bytes it holds.
//!
//! Entries are addressed by index into [`FormatTable::entries`]; mutation goes
//! through the table, never through detached copies.
//!
//! # Coordinates
//! Before [`FormatTable::normalize`], entry offsets index the family's full
//! scratch image (`header value + header size`).  After it, offsets index the
//! compacted image, whose first `header_size` bytes encode the load address of
//! the byte that follows them.

use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use thiserror::Error;

use crate::format::{BinaryKind, Family};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("table has no entries")]
    Empty,
    #[error("{family:?} header is {size} bytes; only 4-byte load-address headers are supported")]
    UnsupportedHeader { family: Family, size: usize },
    #[error("entry {index} spans {start:#x}..{end:#x}, outside an image of {len:#x} bytes")]
    OutOfBounds { index: usize, start: u32, end: u32, len: usize },
    #[error("lowest entry start {lowest:#x} is below the header width")]
    Underflow { lowest: u32 },
    #[error("no entry {index} in a table of {count}")]
    NoEntry { index: usize, count: usize },
}

/// One container (a title or one of its libraries).
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    /// Set when the entry must be written back out.
    pub modified:     bool,
    pub path:         PathBuf,
    /// Fixed-width header, [`Family::header_size`] bytes.
    pub header:       Vec<u8>,
    /// Offset of the first program byte in the owning table's image.
    pub start:        u32,
    /// Exclusive end offset.
    pub end:          u32,
    /// CRC32 of the compressed block as stored in the file.
    pub crc:          u32,
    /// Reserved area, preserved verbatim.
    pub reserved:     Vec<u8>,
    /// Raw tag bytes including the `[TAG]` signature.
    pub tags:         Vec<u8>,
    pub tag_encoding: &'static Encoding,
    pub is_library:   bool,
    /// BLAKE3 of the decompressed block, when requested.
    pub content_hash: Option<[u8; 32]>,
}

impl ContainerEntry {
    pub fn new(path: impl Into<PathBuf>, header: Vec<u8>) -> Self {
        Self {
            modified:     false,
            path:         path.into(),
            header,
            start:        0,
            end:          0,
            crc:          0,
            reserved:     Vec::new(),
            tags:         Vec::new(),
            tag_encoding: UTF_8,
            is_library:   false,
            content_hash: None,
        }
    }

    /// Program bytes held by this entry.
    #[inline]
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// File name of [`ContainerEntry::path`].
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn title(&self) -> String {
        crate::tags::title(&self.tags, self.tag_encoding, &self.path)
    }

    pub fn content_hash_hex(&self) -> Option<String> {
        self.content_hash.map(hex::encode)
    }
}

/// A title's entries and their shared image.
#[derive(Debug, Clone)]
pub struct FormatTable {
    pub kind:    BinaryKind,
    pub family:  Family,
    pub image:   Vec<u8>,
    /// Libraries in load order, then the primary entry.
    pub entries: Vec<ContainerEntry>,
}

impl FormatTable {
    pub fn new(kind: BinaryKind, family: Family, image_size: usize) -> Self {
        Self { kind, family, image: vec![0u8; image_size], entries: Vec::new() }
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.family.header_size()
    }

    /// Index of the non-library entry, if any.
    pub fn primary_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| !e.is_library)
    }

    pub fn primary(&self) -> Option<&ContainerEntry> {
        self.primary_index().map(|i| &self.entries[i])
    }

    pub fn primary_mut(&mut self) -> Option<&mut ContainerEntry> {
        self.primary_index().map(move |i| &mut self.entries[i])
    }

    /// Replace the primary entry, or append `entry` if there is none.
    pub fn set_primary(&mut self, mut entry: ContainerEntry) -> usize {
        entry.is_library = false;
        match self.primary_index() {
            Some(i) => {
                self.entries[i] = entry;
                i
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    /// Load address encoded in the image header.
    pub fn image_header_value(&self) -> Option<u32> {
        self.family.header_value(&self.image)
    }

    /// Program bytes of entry `index`.
    pub fn entry_bytes(&self, index: usize) -> Result<&[u8], ImageError> {
        let e = self
            .entries
            .get(index)
            .ok_or(ImageError::NoEntry { index, count: self.entries.len() })?;
        self.image
            .get(e.start as usize..e.end as usize)
            .ok_or(ImageError::OutOfBounds {
                index,
                start: e.start,
                end:   e.end,
                len:   self.image.len(),
            })
    }

    /// Check that every entry lies inside the image.
    pub fn validate(&self) -> Result<(), ImageError> {
        for (index, e) in self.entries.iter().enumerate() {
            if e.start > e.end || e.end as usize > self.image.len() {
                return Err(ImageError::OutOfBounds {
                    index,
                    start: e.start,
                    end:   e.end,
                    len:   self.image.len(),
                });
            }
        }
        Ok(())
    }

    /// Shrink the image to the window covered by the entries and rebase all
    /// entry offsets onto it.
    ///
    /// The new image is `highest - lowest + header_size` bytes.  Its header
    /// holds `lowest - header_size`, the load address of the first byte after
    /// the header.
    pub fn normalize(&mut self) -> Result<(), ImageError> {
        let hs = self.header_size();
        if hs != 4 {
            return Err(ImageError::UnsupportedHeader { family: self.family, size: hs });
        }
        self.validate()?;
        let lowest = self.entries.iter().map(|e| e.start).min().ok_or(ImageError::Empty)?;
        let highest = self.entries.iter().map(|e| e.end).max().ok_or(ImageError::Empty)?;
        let shift = lowest
            .checked_sub(hs as u32)
            .ok_or(ImageError::Underflow { lowest })?;

        let mut image = vec![0u8; (highest - lowest) as usize + hs];
        image[hs..].copy_from_slice(&self.image[lowest as usize..highest as usize]);
        image[..hs].copy_from_slice(&self.family.header_bytes(shift));

        for e in &mut self.entries {
            e.start -= shift;
            e.end -= shift;
        }
        self.image = image;
        Ok(())
    }

    /// File stem of the primary entry (or the last entry).
    pub fn primary_stem(&self) -> String {
        self.primary()
            .or(self.entries.last())
            .map(|e| crate::tags::file_stem(&e.path))
            .unwrap_or_else(|| "output".to_owned())
    }

    pub fn primary_dir(&self) -> Option<&Path> {
        self.primary().and_then(|e| e.path.parent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u32, end: u32, lib: bool) -> ContainerEntry {
        let mut e = ContainerEntry::new("t.minissf", Family::Ssf.header_bytes(start - 4));
        e.start = start;
        e.end = end;
        e.is_library = lib;
        e
    }

    #[test]
    fn normalize_rebases_entries() {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, 0x80004);
        t.image[0x1004..0x1008].copy_from_slice(&[1, 2, 3, 4]);
        t.image[0x2000] = 9;
        t.entries.push(entry(0x1004, 0x1100, true));
        t.entries.push(entry(0x1800, 0x2001, false));
        t.normalize().unwrap();

        assert_eq!(t.image.len(), 0x2001 - 0x1004 + 4);
        assert_eq!(t.image_header_value(), Some(0x1000));
        assert_eq!(&t.image[4..8], &[1, 2, 3, 4]);
        assert_eq!(t.entries[0].start, 4);
        assert_eq!(t.entries[1].end as usize, t.image.len());
        assert_eq!(t.image[t.image.len() - 1], 9);
        for e in &t.entries {
            assert!(e.start <= e.end && e.end as usize <= t.image.len());
        }
    }

    #[test]
    fn normalize_rejects_empty() {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Dsf, 16);
        assert!(matches!(t.normalize(), Err(ImageError::Empty)));
    }

    #[test]
    fn primary_is_last_non_library() {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, 0x80004);
        t.entries.push(entry(4, 8, true));
        t.entries.push(entry(8, 12, false));
        t.entries.push(entry(12, 16, true));
        assert_eq!(t.primary_index(), Some(1));
        let mut replacement = entry(4, 4, true);
        replacement.modified = true;
        assert_eq!(t.set_primary(replacement), 1);
        assert!(t.entries[1].modified && !t.entries[1].is_library);
    }

    #[test]
    fn entry_bytes_rejects_unknown_index() {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, 16);
        t.entries.push(entry(4, 8, false));
        assert_eq!(t.entry_bytes(0).unwrap().len(), 4);
        assert!(matches!(t.entry_bytes(3), Err(ImageError::NoEntry { index: 3, count: 1 })));
    }
}
