//! Library-chain resolver: load a title and every container it depends on
//! into one normalized image.
//!
//! # Load order
//! For each file, recursively:
//! 1. its `_lib=` dependencies, read from the tag block before the payload is
//!    decompressed,
//! 2. the file itself,
//! 3. its `_libN=` dependencies in ascending `N`.
//!
//! All payloads land in one shared image at their own load addresses, so
//! later copies overwrite earlier ones.  This order makes the title's bytes
//! the final content wherever it defines them.
//!
//! A reference back into the current chain is a [`ResolveError::Cycle`]; a
//! dangling reference is a [`ResolveError::MissingLibrary`].  Diamonds (one
//! library reached along two paths) are fine and load twice.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, absolute, CodecError, LoadedContainer, ReadOptions};
use crate::format::{BinaryKind, DsfSpan, Family};
use crate::table::{FormatTable, ImageError};
use crate::tags;
use crate::text::TextOptions;

/// Default bound on `_lib` nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("cyclic library reference: {}", format_chain(.chain))]
    Cycle { chain: Vec<PathBuf> },
    #[error("missing library {} (referenced by {})", .path.display(), .referenced_by.display())]
    MissingLibrary { path: PathBuf, referenced_by: PathBuf },
    #[error("library chain deeper than {limit} at {}", .path.display())]
    TooDeep { limit: usize, path: PathBuf },
    #[error("{} is {found:?}, expected {expected:?}", .path.display())]
    FamilyMismatch { path: PathBuf, expected: Family, found: Family },
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

// ── LoadOptions ───────────────────────────────────────────────────────────────

/// Configuration for [`load_title`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Force a storage kind instead of sniffing the magic.
    pub kind:         Option<BinaryKind>,
    /// Family to assume for raw dumps.
    pub family:       Option<Family>,
    pub text:         TextOptions,
    pub dsf_span:     DsfSpan,
    /// Follow `_lib` references.
    pub load_libs:    bool,
    /// Decompress payloads.  When false entries carry tags only and the
    /// table is not normalized.
    pub load_payload: bool,
    /// Compute per-entry content hashes.
    pub hash:         bool,
    pub max_depth:    usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            kind:         None,
            family:       None,
            text:         TextOptions::default(),
            dsf_span:     DsfSpan::default(),
            load_libs:    true,
            load_payload: true,
            hash:         false,
            max_depth:    DEFAULT_MAX_DEPTH,
        }
    }
}

impl LoadOptions {
    fn read_options(&self, kind: Option<BinaryKind>) -> ReadOptions {
        ReadOptions {
            kind,
            family:       self.family,
            text:         self.text,
            load_payload: self.load_payload,
            hash:         self.hash,
        }
    }
}

// ── Entry points ──────────────────────────────────────────────────────────────

/// Load `path` with all its dependencies into one table.
pub fn load_title(path: &Path, opts: &LoadOptions) -> Result<FormatTable, ResolveError> {
    let sniffed = sniff(path).map_err(CodecError::from)?;
    let as_bin = match (opts.kind, sniffed) {
        (Some(BinaryKind::Bin), _) => true,
        (None, None) => true,
        (Some(_), None) => {
            let magic = first_word(path).map_err(CodecError::from)?;
            return Err(CodecError::BadMagic { path: path.to_owned(), magic }.into());
        }
        (_, Some(_)) => false,
    };
    if as_bin {
        return load_bin_table(path, opts);
    }

    let family = sniffed.ok_or_else(|| CodecError::UnsupportedFamily(path.display().to_string()))?;
    let mut table = FormatTable::new(BinaryKind::MiniXsf, family, family.image_size(opts.dsf_span));
    let mut resolver = Resolver { opts, stack: Vec::new() };
    resolver.resolve(path, 0, &mut table)?;

    if opts.load_payload {
        table.normalize()?;
    } else {
        table.image.clear();
    }
    info!(path = %path.display(), entries = table.entries.len(), "loaded {:?} title", family);
    Ok(table)
}

/// Load one file without following its libraries.
pub fn load_single(path: &Path, opts: &LoadOptions) -> Result<FormatTable, ResolveError> {
    let opts = LoadOptions { load_libs: false, ..*opts };
    load_title(path, &opts)
}

fn load_bin_table(path: &Path, opts: &LoadOptions) -> Result<FormatTable, ResolveError> {
    let LoadedContainer { family, entry, program, .. } = codec::load(path, &opts.read_options(Some(BinaryKind::Bin)))?;
    let mut image = entry.header.clone();
    image.extend_from_slice(&program);
    let table = FormatTable { kind: BinaryKind::Bin, family, image, entries: vec![entry] };
    if opts.load_payload {
        table.validate()?;
    }
    Ok(table)
}

/// Family named by the file's magic, if it is a container.
pub fn sniff(path: &Path) -> io::Result<Option<Family>> {
    match first_word(path) {
        Ok(magic) => Ok(Family::from_magic(magic)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn first_word(path: &Path) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    File::open(path)?.read_exact(&mut buf)?;
    (&buf[..]).read_u32::<LittleEndian>()
}

// ── Resolver ──────────────────────────────────────────────────────────────────

struct Resolver<'a> {
    opts:  &'a LoadOptions,
    /// Files on the current recursion path, outermost first.
    stack: Vec<PathBuf>,
}

impl Resolver<'_> {
    fn resolve(&mut self, path: &Path, depth: usize, table: &mut FormatTable) -> Result<(), ResolveError> {
        let canon = absolute(path);
        if depth > 0 && !canon.is_file() {
            return Err(ResolveError::MissingLibrary {
                path:          path.to_owned(),
                referenced_by: self.stack.last().cloned().unwrap_or_default(),
            });
        }
        if self.stack.contains(&canon) {
            let mut chain = self.stack.clone();
            chain.push(canon);
            return Err(ResolveError::Cycle { chain });
        }
        if depth > self.opts.max_depth {
            return Err(ResolveError::TooDeep { limit: self.opts.max_depth, path: canon });
        }
        self.stack.push(canon.clone());
        let dir = canon.parent().map(Path::to_path_buf).unwrap_or_default();

        if self.opts.load_libs {
            let peeked = codec::peek_tags(&canon)?;
            let enc = self.opts.text.resolve_input(&peeked);
            for lib in tags::library_refs(&peeked, enc).main {
                debug!(parent = %canon.display(), "main library {}", lib);
                self.resolve(&library_path(&dir, &lib), depth + 1, table)?;
            }
        }

        let loaded = codec::load(&canon, &self.opts.read_options(Some(BinaryKind::MiniXsf)))?;
        if loaded.family != table.family {
            return Err(ResolveError::FamilyMismatch {
                path:     canon,
                expected: table.family,
                found:    loaded.family,
            });
        }
        let index = self.place(table, loaded, depth > 0)?;

        if self.opts.load_libs {
            let entry = &table.entries[index];
            let aux = tags::library_refs(&entry.tags, entry.tag_encoding).aux;
            for (n, lib) in aux {
                debug!(parent = %canon.display(), "auxiliary library {} ({})", lib, n);
                self.resolve(&library_path(&dir, &lib), depth + 1, table)?;
            }
        }

        self.stack.pop();
        Ok(())
    }

    /// Copy a loaded payload into the shared image and append its entry.
    fn place(&self, table: &mut FormatTable, loaded: LoadedContainer, is_library: bool) -> Result<usize, ResolveError> {
        let LoadedContainer { mut entry, program, .. } = loaded;
        entry.is_library = is_library;
        if self.opts.load_payload {
            let len = table.image.len();
            let start = entry.start as usize;
            if start > len {
                return Err(CodecError::OutOfBounds { start: entry.start, end: entry.end, len }.into());
            }
            let n = program.len().min(len - start);
            table.image[start..start + n].copy_from_slice(&program[..n]);
            entry.end = entry.start + n as u32;
        }
        table.entries.push(entry);
        Ok(table.entries.len() - 1)
    }
}

/// Resolve a `_lib` value against the referencing file's directory.  Both
/// `/` and `\` separate components.
fn library_path(dir: &Path, value: &str) -> PathBuf {
    dir.join(value.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ContainerEntry;
    use tempfile::tempdir;

    fn write_container(path: &Path, load: u32, program: &[u8], tags: &str) {
        let hs = Family::Ssf.header_size();
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, program.len() + hs);
        t.image[hs..].copy_from_slice(program);
        let mut e = ContainerEntry::new(path, Family::Ssf.header_bytes(load));
        e.start = hs as u32;
        e.end = t.image.len() as u32;
        e.tags = tags.as_bytes().to_vec();
        t.entries.push(e);
        codec::save(&t, 0, path).unwrap();
    }

    fn utf8() -> LoadOptions {
        LoadOptions { text: TextOptions::utf8(), ..Default::default() }
    }

    #[test]
    fn chain_loads_main_then_title_then_aux() {
        let dir = tempdir().unwrap();
        write_container(&dir.path().join("base.ssflib"), 0x100, &[1; 16], "[TAG]");
        write_container(&dir.path().join("aux.ssflib"), 0x108, &[3; 4], "[TAG]");
        write_container(
            &dir.path().join("song.minissf"),
            0x104,
            &[2; 4],
            "[TAG]_lib=base.ssflib\n_lib2=aux.ssflib\ntitle=Song",
        );

        let t = load_title(&dir.path().join("song.minissf"), &utf8()).unwrap();
        assert_eq!(t.entries.len(), 3);
        assert!(t.entries[0].is_library && !t.entries[1].is_library && t.entries[2].is_library);
        assert_eq!(t.primary_index(), Some(1));
        assert_eq!(t.image_header_value(), Some(0x100));

        // base 0x100..0x110, song 0x104..0x108, aux 0x108..0x10C
        let img = &t.image[4..];
        assert_eq!(&img[0..4], &[1; 4]);
        assert_eq!(&img[4..8], &[2; 4]);
        assert_eq!(&img[8..12], &[3; 4]);
        assert_eq!(&img[12..16], &[1; 4]);
        for e in &t.entries {
            assert!(e.start <= e.end && e.end as usize <= t.image.len());
        }
    }

    #[test]
    fn backslash_library_paths_resolve() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("libs")).unwrap();
        write_container(&dir.path().join("libs").join("base.ssflib"), 0x100, &[1; 8], "[TAG]");
        write_container(&dir.path().join("song.minissf"), 0x104, &[2; 4], "[TAG]_lib=libs\\base.ssflib");

        let t = load_title(&dir.path().join("song.minissf"), &utf8()).unwrap();
        assert_eq!(t.entries.len(), 2);
        assert_eq!(t.entries[0].path.file_name().unwrap(), "base.ssflib");
        assert_eq!(&t.image[4..12], &[1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn cycle_is_reported() {
        let dir = tempdir().unwrap();
        write_container(&dir.path().join("a.ssflib"), 0, &[0; 4], "[TAG]_lib=b.ssflib");
        write_container(&dir.path().join("b.ssflib"), 0, &[0; 4], "[TAG]_lib=a.ssflib");
        let err = load_title(&dir.path().join("a.ssflib"), &utf8()).unwrap_err();
        assert!(matches!(err, ResolveError::Cycle { ref chain } if chain.len() == 3));
    }

    #[test]
    fn missing_library_is_distinct() {
        let dir = tempdir().unwrap();
        write_container(&dir.path().join("a.minissf"), 0, &[0; 4], "[TAG]_lib=gone.ssflib");
        let err = load_title(&dir.path().join("a.minissf"), &utf8()).unwrap_err();
        assert!(matches!(err, ResolveError::MissingLibrary { .. }));
    }

    #[test]
    fn depth_limit() {
        let dir = tempdir().unwrap();
        write_container(&dir.path().join("c.ssflib"), 0, &[0; 4], "[TAG]");
        write_container(&dir.path().join("b.ssflib"), 0, &[0; 4], "[TAG]_lib=c.ssflib");
        write_container(&dir.path().join("a.minissf"), 0, &[0; 4], "[TAG]_lib=b.ssflib");
        let opts = LoadOptions { max_depth: 1, ..utf8() };
        let err = load_title(&dir.path().join("a.minissf"), &opts).unwrap_err();
        assert!(matches!(err, ResolveError::TooDeep { limit: 1, .. }));
    }

    #[test]
    fn metadata_only_scan() {
        let dir = tempdir().unwrap();
        write_container(&dir.path().join("base.ssflib"), 0, &[1; 8], "[TAG]");
        write_container(&dir.path().join("s.minissf"), 4, &[2; 4], "[TAG]_lib=base.ssflib");
        let opts = LoadOptions { load_payload: false, ..utf8() };
        let t = load_title(&dir.path().join("s.minissf"), &opts).unwrap();
        assert_eq!(t.entries.len(), 2);
        assert!(t.entries.iter().all(|e| e.header.is_empty()));
    }
}
