//! Building a pack list from title files.
//!
//! Every title contributes one program record per file in its library chain
//! plus one group record.  Files shared between titles are stored once,
//! keyed by content hash (or by path when hashing is off).  Program records
//! come first in the final list, followed by groups and direct resources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use super::pack::{PackEntry, PackPayload};
use super::{VfsError, DRIVER_TAG, MDX_TAG, MOD_TAG, VGM_TAG};
use crate::codec::absolute;
use crate::format::Family;
use crate::library::{self, LoadOptions};
use crate::tags::file_stem;

/// File name of the sound driver bundled with tracker-style resources.
pub const DRIVER_FILE_NAME: &str = "vgm68.bin";

#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    pub load:          LoadOptions,
    /// Deduplicate members by BLAKE3 of their decompressed block.
    pub dedup_by_hash: bool,
    /// Only accept titles of this family.
    pub family:        Option<Family>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self { load: LoadOptions::default(), dedup_by_hash: true, family: None }
    }
}

/// Accumulates pack entries title by title.
#[derive(Debug, Default)]
pub struct TitleCollector {
    opts:     CollectOptions,
    members:  Vec<PackEntry>,
    titles:   Vec<PackEntry>,
    seen:     HashMap<String, usize>,
    failures: Vec<(PathBuf, VfsError)>,
}

impl TitleCollector {
    pub fn new(opts: CollectOptions) -> Self {
        Self { opts, ..Default::default() }
    }

    /// Add a title and its library chain.
    pub fn add_title(&mut self, path: &Path) -> Result<(), VfsError> {
        let scan_opts = LoadOptions { load_payload: false, hash: false, ..self.opts.load };
        let scan = library::load_title(path, &scan_opts)?;
        if let Some(want) = self.opts.family.filter(|f| *f != scan.family) {
            debug!(path = %path.display(), "skipping {:?} title, want {:?}", scan.family, want);
            return Ok(());
        }

        let member_opts = LoadOptions { load_payload: true, hash: self.opts.dedup_by_hash, ..self.opts.load };
        let mut pending: Vec<PackEntry> = Vec::new();
        let mut pending_keys: HashMap<String, usize> = HashMap::new();
        let mut group = Vec::with_capacity(scan.entries.len());
        let mut primary = None;

        for (pos, scanned) in scan.entries.iter().enumerate() {
            let member = library::load_single(&scanned.path, &member_opts)?;
            let Some(e) = member.entries.first() else { continue };
            let key = match (self.opts.dedup_by_hash, e.content_hash_hex()) {
                (true, Some(h)) => h,
                _ => absolute(&e.path).to_string_lossy().into_owned(),
            };
            let index = match self.seen.get(&key).or_else(|| pending_keys.get(&key)) {
                Some(&i) => i,
                None => {
                    let i = self.members.len() + pending.len();
                    let type_tag = member
                        .family
                        .absolute_address(&e.header)
                        .ok_or(VfsError::Truncated("member header"))?;
                    pending.push(PackEntry {
                        name:    e.file_name(),
                        type_tag,
                        payload: PackPayload::Program {
                            source:     e.path.clone(),
                            file_start: e.start,
                            file_end:   e.end,
                            load_libs:  false,
                        },
                    });
                    pending_keys.insert(key, i);
                    i
                }
            };
            group.push(index);
            if !scanned.is_library {
                primary = Some((pos, scanned.title()));
            }
        }

        let Some((primary, name)) = primary else {
            debug!(path = %path.display(), "no primary title, skipped");
            return Ok(());
        };
        self.members.extend(pending);
        self.seen.extend(pending_keys);
        info!(title = %name, members = group.len(), "collected");
        self.titles.push(PackEntry {
            name,
            type_tag: scan.family.group_tag(),
            payload:  PackPayload::Group { members: group, primary },
        });
        Ok(())
    }

    /// Add the sound driver.  It goes with the program records.
    pub fn add_driver(&mut self, path: &Path) {
        self.members.push(PackEntry {
            name:     "VGM/MOD/MDX 68K Driver".to_owned(),
            type_tag: DRIVER_TAG,
            payload:  PackPayload::Direct { source: absolute(path) },
        });
    }

    /// Add a direct resource file, typed by its extension.  Returns false for
    /// unknown extensions.
    pub fn add_resource(&mut self, path: &Path) -> bool {
        let Some(type_tag) = resource_tag(path) else {
            return false;
        };
        self.titles.push(PackEntry {
            name:     file_stem(path),
            type_tag,
            payload:  PackPayload::Direct { source: absolute(path) },
        });
        true
    }

    /// Dispatch each path by name: driver, resource or title.  Title failures
    /// are recorded and skipped.
    pub fn add_paths(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if is_driver(path) {
                if self.opts.family.map_or(true, |f| f == Family::Ssf) {
                    self.add_driver(path);
                }
                continue;
            }
            if self.add_resource(path) {
                continue;
            }
            if let Err(e) = self.add_title(path) {
                error!(path = %path.display(), "cannot collect title: {}", e);
                self.failures.push((path.clone(), e));
            }
        }
    }

    pub fn failures(&self) -> &[(PathBuf, VfsError)] {
        &self.failures
    }

    /// Final pack list: program records, then groups and resources.
    pub fn finish(self) -> (Vec<PackEntry>, Vec<(PathBuf, VfsError)>) {
        let mut entries = self.members;
        entries.extend(self.titles);
        (entries, self.failures)
    }
}

fn resource_tag(path: &Path) -> Option<u32> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "mod" => Some(MOD_TAG),
        "vgm" => Some(VGM_TAG),
        "mdx" => Some(MDX_TAG),
        _ => None,
    }
}

/// True for the driver and for resource files packed verbatim.
pub fn is_direct_resource(path: &Path) -> bool {
    is_driver(path) || resource_tag(path).is_some()
}

fn is_driver(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(DRIVER_FILE_NAME))
}

/// True for names a title scan should consider: container and BIN
/// extensions ending in `sf` or `sfbin`.
pub fn is_title_candidate(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|e| e.ends_with("sf") || e.ends_with("sfbin"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::format::BinaryKind;
    use crate::table::{ContainerEntry, FormatTable};
    use crate::text::TextOptions;
    use tempfile::tempdir;

    fn write(path: &Path, load: u32, program: &[u8], tags: &str) {
        let mut t = FormatTable::new(BinaryKind::MiniXsf, Family::Ssf, program.len() + 4);
        t.image[4..].copy_from_slice(program);
        let mut e = ContainerEntry::new(path, Family::Ssf.header_bytes(load));
        e.start = 4;
        e.end = t.image.len() as u32;
        e.tags = tags.as_bytes().to_vec();
        t.entries.push(e);
        codec::save(&t, 0, path).unwrap();
    }

    fn opts() -> CollectOptions {
        CollectOptions {
            load: LoadOptions { text: TextOptions::utf8(), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn shared_library_is_stored_once() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("base.ssflib"), 0x1000, &[1; 32], "[TAG]");
        write(&dir.path().join("a.minissf"), 0x1004, &[2; 4], "[TAG]_lib=base.ssflib\ntitle=Alpha");
        write(&dir.path().join("b.minissf"), 0x1008, &[3; 4], "[TAG]_lib=base.ssflib");

        let mut c = TitleCollector::new(opts());
        c.add_paths(&[dir.path().join("a.minissf"), dir.path().join("b.minissf")]);
        let (entries, failures) = c.finish();
        assert!(failures.is_empty());
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].name, "base.ssflib");
        assert_eq!(entries[0].type_tag, 0x05A0_1000);
        assert_eq!(entries[3].name, "Alpha");
        assert_eq!(entries[3].payload, PackPayload::Group { members: vec![0, 1], primary: 1 });
        assert_eq!(entries[4].name, "b");
        assert_eq!(entries[4].payload, PackPayload::Group { members: vec![0, 2], primary: 1 });
        assert!(matches!(
            entries[1].payload,
            PackPayload::Program { file_start: 4, file_end: 8, load_libs: false, .. }
        ));
    }

    #[test]
    fn resources_and_driver_are_typed() {
        let dir = tempdir().unwrap();
        for name in ["song.vgm", "vgm68.bin", "t.mod"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut c = TitleCollector::new(opts());
        c.add_paths(&[dir.path().join("song.vgm"), dir.path().join("vgm68.bin"), dir.path().join("t.mod")]);
        let (entries, _) = c.finish();
        let tags: Vec<u32> = entries.iter().map(|e| e.type_tag).collect();
        assert_eq!(tags, vec![DRIVER_TAG, VGM_TAG, MOD_TAG]);
    }

    #[test]
    fn broken_title_is_recorded() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("a.minissf"), 0, &[0; 4], "[TAG]_lib=missing.ssflib");
        let mut c = TitleCollector::new(opts());
        c.add_paths(&[dir.path().join("a.minissf")]);
        assert_eq!(c.failures().len(), 1);
        let (entries, _) = c.finish();
        assert!(entries.is_empty());
    }

    #[test]
    fn candidates() {
        assert!(is_title_candidate(Path::new("a.minissf")));
        assert!(is_title_candidate(Path::new("a.DSFBIN")));
        assert!(!is_title_candidate(Path::new("a.txt")));
        assert!(!is_title_candidate(Path::new("a.ssflib")));
        assert!(is_direct_resource(Path::new("x/VGM68.BIN")));
        assert!(is_direct_resource(Path::new("x/song.mdx")));
    }
}
