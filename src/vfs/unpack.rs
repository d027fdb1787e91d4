//! Archive extraction.
//!
//! Pass 1 rebuilds every library group as a container chain.  Pass 2 writes
//! each record not consumed by pass 1 as a raw file.

use std::fs;
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use tracing::{debug, error, info};

use super::{passthrough_extension, LibraryGroup, VfsError, VfsReader};
use crate::emit::{self, SaveOptions};
use crate::format::{BinaryKind, DsfSpan, Family};
use crate::table::{ContainerEntry, FormatTable};
use crate::tags::file_stem;
use crate::text::{self, TextOptions};

#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Output kind for rebuilt groups.
    pub kind:           BinaryKind,
    /// Pick the kind from each output name's extension.
    pub auto_kind:      bool,
    /// Output names consumed in order by group members, then raw records.
    pub names:          Vec<PathBuf>,
    pub output_dir:     Option<PathBuf>,
    /// Rebuild groups.  When false every record is written raw.
    pub extract_groups: bool,
    pub overwrite:      bool,
    pub name_encoding:  &'static Encoding,
    /// `output` selects the encoding of synthesized tags (UTF-8 if unset).
    pub text:           TextOptions,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            kind:           BinaryKind::MiniXsf,
            auto_kind:      false,
            names:          Vec::new(),
            output_dir:     None,
            extract_groups: true,
            overwrite:      false,
            name_encoding:  text::default_name_encoding(),
            text:           TextOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UnpackReport {
    /// Groups rebuilt in pass 1.
    pub groups:   usize,
    /// Raw files written in pass 2.
    pub raw:      Vec<PathBuf>,
    pub failures: Vec<(usize, VfsError)>,
}

/// Hands out caller-supplied names in order, shared by both passes.
struct NameCursor<'a> {
    names: &'a [PathBuf],
    next:  usize,
}

impl NameCursor<'_> {
    fn take(&mut self) -> Option<&PathBuf> {
        let name = self.names.get(self.next)?;
        self.next += 1;
        Some(name)
    }
}

pub fn unpack(archive: &Path, opts: &UnpackOptions) -> Result<UnpackReport, VfsError> {
    let mut reader = VfsReader::open(archive, opts.name_encoding)?;
    let count = reader.records().len();
    let mut done = vec![false; count];
    let mut cursor = NameCursor { names: &opts.names, next: 0 };
    let mut report = UnpackReport::default();
    let out_dir = opts.output_dir.clone().unwrap_or_default();

    if opts.extract_groups {
        for i in 0..count {
            if done[i] || reader.records()[i].group_family().is_none() {
                continue;
            }
            done[i] = true;
            match rebuild_group(&mut reader, i, &mut cursor, &out_dir, opts) {
                Ok((table, members)) => {
                    let save = SaveOptions {
                        kind:       Some(opts.kind),
                        auto_kind:  opts.auto_kind,
                        overwrite:  opts.overwrite,
                        text:       opts.text,
                        output_dir: None,
                    };
                    let names: Vec<PathBuf> = if opts.auto_kind {
                        table.entries.iter().map(|e| e.path.clone()).collect()
                    } else {
                        Vec::new()
                    };
                    match emit::save_table(&table, &names, &save) {
                        Ok(n) => {
                            debug!(index = i, files = n, "rebuilt group");
                            for m in members {
                                done[m] = true;
                            }
                            report.groups += 1;
                        }
                        Err(e) => {
                            error!(index = i, "cannot write group: {}", e);
                            report.failures.push((i, e.into()));
                        }
                    }
                }
                Err(e) => {
                    error!(index = i, "cannot rebuild group: {}", e);
                    report.failures.push((i, e));
                }
            }
        }
    }

    let mut jobs: Vec<(usize, PathBuf, Vec<u8>)> = Vec::new();
    for i in 0..count {
        if done[i] {
            continue;
        }
        match reader.read_payload(i) {
            Ok(data) => {
                let rec = &reader.records()[i];
                let out = match cursor.take() {
                    Some(n) => out_dir.join(n),
                    None => out_dir.join(format!("{}{}", safe_file_name(&rec.name), passthrough_extension(rec.type_tag))),
                };
                jobs.push((i, out, data));
            }
            Err(e) => {
                error!(index = i, "cannot read record: {}", e);
                report.failures.push((i, e));
            }
        }
    }
    let (written, failed) = write_raw(jobs, opts.overwrite);
    report.raw = written;
    report.failures.extend(failed);

    info!(
        archive = %archive.display(),
        groups = report.groups,
        raw = report.raw.len(),
        failed = report.failures.len(),
        "unpacked"
    );
    Ok(report)
}

/// Rebuild group record `index` as a table of modified entries.  Returns the
/// table and the member record indices.
fn rebuild_group<R: std::io::Read + std::io::Seek>(
    reader:  &mut VfsReader<R>,
    index:   usize,
    cursor:  &mut NameCursor<'_>,
    out_dir: &Path,
    opts:    &UnpackOptions,
) -> Result<(FormatTable, Vec<usize>), VfsError> {
    let LibraryGroup { family, members, primary } = reader.read_group(index)?;
    let group_name = safe_file_name(&reader.records()[index].name);
    let hs = family.header_size() as u32;

    let mut lowest = u32::MAX;
    let mut highest = 0u32;
    for &m in &members {
        let rec = &reader.records()[m];
        let end = rec.type_tag.checked_add(rec.size).ok_or(VfsError::TooLarge)?;
        lowest = lowest.min(rec.type_tag);
        highest = highest.max(end);
    }
    if members.is_empty() || highest < lowest {
        return Err(VfsError::Truncated("empty group"));
    }
    let span = highest - lowest;
    if span as usize > Family::Dsf.image_size(DsfSpan::Naomi) {
        return Err(VfsError::TooLarge);
    }

    // output path and the name other members refer to it by
    let mut outputs: Vec<(PathBuf, String)> = Vec::with_capacity(members.len());
    for (j, &m) in members.iter().enumerate() {
        let default = if j == primary {
            format!("{}.{}", group_name, family.extension(BinaryKind::MiniXsf))
        } else {
            let member = safe_file_name(&reader.records()[m].name);
            format!("{}.{}", file_stem(Path::new(&member)), family.library_extension())
        };
        let path = cursor.take().map(|n| out_dir.join(n)).unwrap_or_else(|| out_dir.join(&default));
        let tag_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(default);
        outputs.push((path, tag_name));
    }

    let mut table = FormatTable::new(opts.kind, family, (span + hs) as usize);
    let base_header = lowest.wrapping_sub(family.base_address());
    table.image[..hs as usize].copy_from_slice(&family.header_bytes(base_header));

    let encoding = opts.text.output.unwrap_or(UTF_8);
    for (j, &m) in members.iter().enumerate() {
        let data = reader.read_payload(m)?;
        let rec = &reader.records()[m];
        let start = rec.type_tag - lowest + hs;
        let end = start + rec.size;
        table.image[start as usize..end as usize].copy_from_slice(&data);

        let mut entry = ContainerEntry::new(outputs[j].0.clone(), family.header_from_absolute(rec.type_tag));
        entry.start = start;
        entry.end = end;
        entry.is_library = j != primary;
        entry.modified = true;
        entry.tag_encoding = encoding;
        let tags = chain_tags(j, primary, &outputs);
        let (bytes, _, _) = encoding.encode(&tags);
        entry.tags = bytes.into_owned();
        table.entries.push(entry);
    }
    Ok((table, members))
}

/// Turn an archive record name into a single file name.  Separators and
/// drive colons become `_`, so the result never leaves the output directory.
fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_owned(),
        _ => cleaned,
    }
}

/// Tag block for member `j` of a group rebuilt as a chain.
///
/// Members before the primary each depend on the one before them.  The
/// primary depends on its predecessor and names every later member as an
/// auxiliary library.
fn chain_tags(j: usize, primary: usize, outputs: &[(PathBuf, String)]) -> String {
    let mut lines = Vec::new();
    if j > 0 && j <= primary {
        lines.push(format!("_lib={}", outputs[j - 1].1));
    }
    if j == primary {
        for (k, (_, name)) in outputs.iter().enumerate().skip(j + 1) {
            lines.push(format!("_lib{}={}", k - j + 1, name));
        }
    }
    format!("[TAG]{}", lines.join("\n"))
}

type RawJob = (usize, PathBuf, Vec<u8>);

fn write_one(path: &Path, data: &[u8], overwrite: bool) -> Result<bool, VfsError> {
    if !overwrite && path.exists() {
        info!(path = %path.display(), "exists, skipping");
        return Ok(false);
    }
    fs::write(path, data)?;
    Ok(true)
}

/// Write raw records.  Jobs sharing an output path are written in record
/// order by one worker.
fn write_raw(jobs: Vec<RawJob>, overwrite: bool) -> (Vec<PathBuf>, Vec<(usize, VfsError)>) {
    let mut by_path: Vec<(PathBuf, Vec<(usize, Vec<u8>)>)> = Vec::new();
    for (i, path, data) in jobs {
        match by_path.iter_mut().find(|(p, _)| *p == path) {
            Some((_, group)) => group.push((i, data)),
            None => by_path.push((path, vec![(i, data)])),
        }
    }

    let run = |(path, group): &(PathBuf, Vec<(usize, Vec<u8>)>)| {
        let mut written = Vec::new();
        let mut failed = Vec::new();
        for (i, data) in group {
            match write_one(path, data, overwrite) {
                Ok(true) => written.push(path.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(index = *i, path = %path.display(), "cannot write record: {}", e);
                    failed.push((*i, e));
                }
            }
        }
        (written, failed)
    };

    #[cfg(feature = "parallel")]
    let results: Vec<(Vec<PathBuf>, Vec<(usize, VfsError)>)> = {
        use rayon::prelude::*;
        by_path.par_iter().map(run).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let results: Vec<(Vec<PathBuf>, Vec<(usize, VfsError)>)> = by_path.iter().map(run).collect();

    let mut written = Vec::new();
    let mut failed = Vec::new();
    for (w, f) in results {
        written.extend(w);
        failed.extend(f);
    }
    (written, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(names: &[&str]) -> Vec<(PathBuf, String)> {
        names.iter().map(|n| (PathBuf::from(n), n.to_string())).collect()
    }

    #[test]
    fn chain_tags_link_siblings() {
        let o = outputs(&["a.ssflib", "b.ssflib", "song.minissf", "c.ssflib", "d.ssflib"]);
        assert_eq!(chain_tags(0, 2, &o), "[TAG]");
        assert_eq!(chain_tags(1, 2, &o), "[TAG]_lib=a.ssflib");
        assert_eq!(chain_tags(2, 2, &o), "[TAG]_lib=b.ssflib\n_lib2=c.ssflib\n_lib3=d.ssflib");
        assert_eq!(chain_tags(3, 2, &o), "[TAG]");
    }

    #[test]
    fn primary_first_has_only_aux() {
        let o = outputs(&["song.minissf", "x.ssflib"]);
        assert_eq!(chain_tags(0, 0, &o), "[TAG]_lib2=x.ssflib");
    }

    #[test]
    fn record_names_stay_inside_output_dir() {
        assert_eq!(safe_file_name("../escape"), ".._escape");
        assert_eq!(safe_file_name("/etc/passwd"), "_etc_passwd");
        assert_eq!(safe_file_name("C:\\rips\\song"), "C__rips_song");
        assert_eq!(safe_file_name("AC/DC"), "AC_DC");
        assert_eq!(safe_file_name(".."), "_");
        assert_eq!(safe_file_name(""), "_");
        assert_eq!(safe_file_name("Song"), "Song");
        let joined = Path::new("out").join(safe_file_name("../../x"));
        assert_eq!(joined.parent(), Some(Path::new("out")));
    }

    #[test]
    fn raw_writes_respect_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("r.vgm");
        let (w, f) = write_raw(vec![(0, p.clone(), b"one".to_vec()), (1, p.clone(), b"two".to_vec())], false);
        assert!(f.is_empty());
        assert_eq!(w.len(), 1);
        assert_eq!(fs::read(&p).unwrap(), b"one");
    }
}
