//! Writing a loaded table back to disk as a raw dump, a single container or a
//! container chain.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::format::BinaryKind;
use crate::table::{FormatTable, ImageError};
use crate::tags::{self, TagRewrite};
use crate::text::TextOptions;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("table has no primary entry to write")]
    NoPrimary,
}

impl From<std::io::Error> for EmitError {
    fn from(e: std::io::Error) -> Self {
        EmitError::Codec(CodecError::Io(e))
    }
}

// ── SaveOptions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Output kind.  `None` keeps the table's own.
    pub kind:       Option<BinaryKind>,
    /// Take the kind from the first output name's extension when it has a
    /// recognizable one.
    pub auto_kind:  bool,
    /// Replace existing files.
    pub overwrite:  bool,
    pub text:       TextOptions,
    /// Directory for default and relative output names.
    pub output_dir: Option<PathBuf>,
}

impl SaveOptions {
    fn resolve_kind(&self, table: &FormatTable, names: &[PathBuf]) -> BinaryKind {
        if self.auto_kind {
            let guessed = names
                .first()
                .and_then(|n| n.file_name())
                .and_then(|n| BinaryKind::from_extension(&n.to_string_lossy()));
            if let Some(kind) = guessed {
                return kind;
            }
        }
        self.kind.unwrap_or(table.kind)
    }

    fn place(&self, name: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) if name.is_relative() => dir.join(name),
            _ => name.to_owned(),
        }
    }

    fn default_path(&self, table: &FormatTable, kind: BinaryKind) -> PathBuf {
        let file = format!("{}.{}", table.primary_stem(), table.family.extension(kind));
        let dir = self
            .output_dir
            .clone()
            .or_else(|| table.primary_dir().map(Path::to_path_buf))
            .unwrap_or_default();
        dir.join(file)
    }

    /// False when `path` exists and overwriting is off.
    fn writable(&self, path: &Path) -> bool {
        if !self.overwrite && path.exists() {
            info!(path = %path.display(), "exists, skipping");
            return false;
        }
        true
    }
}

// ── save_table ────────────────────────────────────────────────────────────────

/// Write `table` according to its (or the overridden) kind.  Returns the
/// number of files written.
///
/// - `Bin`: the whole image to `names[0]` or `<stem>.<fam>bin`.
/// - `Xsf`: the primary entry widened to the whole image, without `_lib`
///   tags, to `names[0]` or `<stem>.<fam>`.
/// - `MiniXsf`: every modified entry, to the next unused name or its own path.
pub fn save_table(table: &FormatTable, names: &[PathBuf], opts: &SaveOptions) -> Result<usize, EmitError> {
    let kind = opts.resolve_kind(table, names);
    match kind {
        BinaryKind::Bin => {
            let out = names.first().map(|n| opts.place(n)).unwrap_or_else(|| opts.default_path(table, kind));
            if !opts.writable(&out) {
                return Ok(0);
            }
            fs::write(&out, &table.image)?;
            info!(path = %out.display(), "wrote {} byte image", table.image.len());
            Ok(1)
        }
        BinaryKind::Xsf => {
            let out = names.first().map(|n| opts.place(n)).unwrap_or_else(|| opts.default_path(table, kind));
            if !opts.writable(&out) {
                return Ok(0);
            }
            let hs = table.header_size();
            let primary = table.primary().or(table.entries.last()).ok_or(EmitError::NoPrimary)?;
            let header = table.image.get(..hs).ok_or(ImageError::UnsupportedHeader {
                family: table.family,
                size:   hs,
            })?;

            let mut entry = primary.clone();
            entry.header = header.to_vec();
            entry.start = hs as u32;
            entry.end = u32::try_from(table.image.len())
                .map_err(|_| CodecError::OutOfBounds { start: 0, end: u32::MAX, len: table.image.len() })?;
            if !entry.tags.is_empty() {
                let mut how = TagRewrite::strip_libs(entry.tag_encoding);
                how.output = opts.text.resolve_output(entry.tag_encoding);
                entry.tags = tags::rewrite(&entry.tags, &how);
                entry.tag_encoding = how.output;
            }
            let bytes = codec::encode_container(table.family, &entry, &table.image)?;
            fs::write(&out, bytes)?;
            info!(path = %out.display(), "wrote single {:?} container", table.family);
            Ok(1)
        }
        BinaryKind::MiniXsf => {
            let mut names = names.iter();
            let mut written = 0;
            for (i, entry) in table.entries.iter().enumerate() {
                if !entry.modified {
                    continue;
                }
                let out = names.next().map(|n| opts.place(n)).unwrap_or_else(|| entry.path.clone());
                if !opts.writable(&out) {
                    continue;
                }
                let target = opts.text.output.filter(|o| *o != entry.tag_encoding && !entry.tags.is_empty());
                let bytes = match target {
                    Some(output) => {
                        let mut converted = entry.clone();
                        let how = TagRewrite {
                            input:     entry.tag_encoding,
                            output,
                            lines:     &[],
                            keep_libs: true,
                            replace:   false,
                        };
                        converted.tags = tags::rewrite(&entry.tags, &how);
                        converted.tag_encoding = output;
                        codec::encode_container(table.family, &converted, &table.image)?
                    }
                    None => codec::encode_container(table.family, entry, &table.image)?,
                };
                fs::write(&out, bytes)?;
                debug!(index = i, path = %out.display(), "wrote {} program bytes", entry.len());
                written += 1;
            }
            Ok(written)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReadOptions;
    use crate::format::Family;
    use crate::table::ContainerEntry;
    use tempfile::tempdir;

    fn table(dir: &Path) -> FormatTable {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, 12);
        t.image[..4].copy_from_slice(&0x100u32.to_le_bytes());
        t.image[4..].copy_from_slice(b"libbsong");
        let mut lib = ContainerEntry::new(dir.join("base.ssflib"), Family::Ssf.header_bytes(0x100));
        lib.start = 4;
        lib.end = 8;
        lib.is_library = true;
        let mut song = ContainerEntry::new(dir.join("song.minissf"), Family::Ssf.header_bytes(0x104));
        song.start = 8;
        song.end = 12;
        song.tags = b"[TAG]_lib=base.ssflib\ntitle=Song".to_vec();
        song.modified = true;
        t.entries.push(lib);
        t.entries.push(song);
        t
    }

    fn utf8(overwrite: bool) -> SaveOptions {
        SaveOptions { text: TextOptions::utf8(), overwrite, ..Default::default() }
    }

    #[test]
    fn mini_writes_only_modified_entries() {
        let dir = tempdir().unwrap();
        let t = table(dir.path());
        assert_eq!(save_table(&t, &[], &utf8(true)).unwrap(), 1);
        assert!(dir.path().join("song.minissf").exists());
        assert!(!dir.path().join("base.ssflib").exists());
    }

    #[test]
    fn single_container_covers_whole_image() {
        let dir = tempdir().unwrap();
        let t = table(dir.path());
        let opts = SaveOptions { kind: Some(BinaryKind::Xsf), ..utf8(true) };
        assert_eq!(save_table(&t, &[], &opts).unwrap(), 1);

        let out = dir.path().join("song.ssf");
        let loaded = codec::load(&out, &ReadOptions { text: TextOptions::utf8(), ..Default::default() }).unwrap();
        assert_eq!(loaded.program, b"libbsong");
        assert_eq!(loaded.entry.start, 0x104);
        assert_eq!(loaded.entry.tags, b"[TAG]title=Song");
    }

    #[test]
    fn bin_dump_and_no_overwrite() {
        let dir = tempdir().unwrap();
        let t = table(dir.path());
        let out = dir.path().join("ram.ssfbin");
        let opts = SaveOptions { auto_kind: true, ..utf8(false) };
        assert_eq!(save_table(&t, &[out.clone()], &opts).unwrap(), 1);
        assert_eq!(fs::read(&out).unwrap(), t.image);
        assert_eq!(save_table(&t, &[out], &opts).unwrap(), 0);
    }
}
