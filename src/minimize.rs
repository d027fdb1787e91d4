//! Delta minimization of a program image against a library image.
//!
//! Both tables must be normalized.  Their header values put both images into
//! the console's address space; the minimizer lines them up and keeps only the
//! smallest padded window of the program that differs from the library.
//!
//! Offsets in [`DeltaReport`] are program-image coordinates unless noted.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::emit::{self, EmitError, SaveOptions};
use crate::format::{padding, BinaryKind, Family};
use crate::library::{self, LoadOptions, ResolveError};
use crate::table::{ContainerEntry, FormatTable};
use crate::tags::{self, TagRewrite};
use crate::text::TextOptions;

#[derive(Error, Debug)]
pub enum MinimizeError {
    #[error("program table has no primary entry")]
    NoPrimary,
    #[error("library is {library:?} but program is {program:?}")]
    FamilyMismatch { library: Family, program: Family },
    #[error("{0} image is shorter than its header")]
    ShortImage(&'static str),
    #[error("address arithmetic out of range ({0})")]
    Overflow(&'static str),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

// ── Options and results ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MinimizeOptions {
    /// Alignment of the retained start.  `None` or 0 means the header size.
    pub start_pad:      Option<u32>,
    /// Alignment of the retained end.  `None` or 0 means the header size.
    pub end_pad:        Option<u32>,
    /// Mark titles identical to the library as modified so they are written
    /// as zero-length files.
    pub keep_unchanged: bool,
    /// Name written to `_lib=`.  Defaults to the library's file name.
    pub lib_name:       Option<String>,
    pub text:           TextOptions,
}

/// What the comparison found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeltaReport {
    /// First retained byte (padded).
    pub change_start:    u32,
    /// End of the retained window (padded, clamped to the image).
    pub change_end:      u32,
    /// Bytes that differ inside the overlap.
    pub differing:       u32,
    /// Matching bytes whose library value is non-zero.
    pub nonzero_matches: u32,
    /// Remaining program bytes.
    pub zero_matches:    u32,
    /// Library-image offset aligned with program offset `psf_base`.
    pub lib_base:        u32,
    pub psf_base:        u32,
}

impl DeltaReport {
    pub fn retained(&self) -> u32 {
        self.change_end - self.change_start
    }
}

/// A rebuilt primary entry ready for [`FormatTable::set_primary`].
#[derive(Debug, Clone)]
pub struct Minimized {
    pub entry:  ContainerEntry,
    pub report: DeltaReport,
}

// ── Core ──────────────────────────────────────────────────────────────────────

fn len_u32(v: &[u8], what: &'static str) -> Result<u32, MinimizeError> {
    u32::try_from(v.len()).map_err(|_| MinimizeError::Overflow(what))
}

/// Compare `psf` against `lib` and build the minimized primary entry.
///
/// `corrected`, when given, receives library bytes confirmed by the program
/// plus the library's head and tail outside the differing window.  Bytes it
/// already holds are kept, so one buffer can accumulate over many programs.
pub fn minimize(
    lib:       &FormatTable,
    psf:       &FormatTable,
    corrected: Option<&mut [u8]>,
    opts:      &MinimizeOptions,
) -> Result<Minimized, MinimizeError> {
    if lib.family != psf.family {
        return Err(MinimizeError::FamilyMismatch { library: lib.family, program: psf.family });
    }
    let primary = psf.primary().ok_or(MinimizeError::NoPrimary)?;
    let h = lib.header_size() as u32;
    let k = psf.header_size() as u32;
    let lh = lib.image_header_value().ok_or(MinimizeError::ShortImage("library"))?;
    let ph = psf.image_header_value().ok_or(MinimizeError::ShortImage("program"))?;
    let lib_abs = lh.checked_add(lib.family.base_address()).ok_or(MinimizeError::Overflow("library address"))?;
    let psf_abs = ph.checked_add(psf.family.base_address()).ok_or(MinimizeError::Overflow("program address"))?;
    let lib_len = len_u32(&lib.image, "library length")?;
    let psf_len = len_u32(&psf.image, "program length")?;

    let overflow = MinimizeError::Overflow;
    let mut change_start: Option<u32> = None;
    let mut change_end: Option<u32> = None;
    let forced_start = lib_abs > psf_abs;
    let (lib_base, psf_base) = if !forced_start {
        let lib_base = (psf_abs - lib_abs).checked_add(h).ok_or(overflow("library base"))?;
        (lib_base, k)
    } else {
        let psf_base = (lib_abs - psf_abs).checked_add(k).ok_or(overflow("program base"))?;
        // program bytes below the library's first address
        change_start = Some(k);
        change_end = Some(psf_base.min(psf_len));
        (h, psf_base)
    };

    let lib_span = lib_len.saturating_sub(lib_base);
    let psf_span = psf_len.saturating_sub(psf_base);
    let forced_end = psf_span > lib_span;
    if forced_end {
        // program bytes past the library's last address
        let tail = psf_base.saturating_add(lib_span);
        change_start = Some(change_start.map_or(tail, |s| s.min(tail)));
        change_end = Some(psf_len);
    }
    debug!(lib_abs, psf_abs, lib_len, psf_len, lib_base, psf_base, "aligned images");

    let mut corrected = corrected;
    let mut differing = 0u32;
    let mut nonzero_matches = 0u32;
    if !(forced_start && forced_end) {
        let overlap = lib_span.min(psf_span) as usize;
        let lib_bytes = lib.image.get(lib_base as usize..).unwrap_or(&[]);
        let psf_bytes = psf.image.get(psf_base as usize..).unwrap_or(&[]);
        let (lib_bytes, psf_bytes) = (&lib_bytes[..overlap], &psf_bytes[..overlap]);
        for (i, (&l, &p)) in lib_bytes.iter().zip(psf_bytes).enumerate() {
            let i = i as u32;
            if l != p {
                differing += 1;
                let at = i + psf_base;
                change_start = Some(change_start.map_or(at, |s| s.min(at)));
                change_end = Some(change_end.map_or(at + 1, |e| e.max(at + 1)));
            } else if l != 0 {
                nonzero_matches += 1;
                if let Some(buf) = corrected.as_deref_mut() {
                    if let Some(slot) = buf.get_mut((i + lib_base) as usize) {
                        *slot = l;
                    }
                }
            }
        }
    }

    if let Some(buf) = corrected.as_deref_mut() {
        copy_untouched(buf, &lib.image, change_start, change_end, lib_base, psf_base);
    }

    let zero_matches = psf_len.saturating_sub(nonzero_matches + differing);
    debug!(?change_start, ?change_end, differing, nonzero_matches, zero_matches, "compared");

    let mut entry = primary.clone();
    let report = match (change_start, change_end) {
        (Some(cs), Some(ce)) if ce > cs => {
            let start_pad = opts.start_pad.filter(|p| *p > 0).unwrap_or(h);
            let end_pad = opts.end_pad.filter(|p| *p > 0).unwrap_or(h);
            let start = cs - cs % start_pad;
            let end = ce
                .checked_add(padding(ce, end_pad))
                .ok_or(overflow("padded end"))?
                .min(psf_len);
            let header = start
                .checked_add(ph)
                .and_then(|v| v.checked_sub(k))
                .ok_or(overflow("header"))?;

            let lib_name = opts.lib_name.clone().unwrap_or_else(|| {
                lib.primary().or(lib.entries.last()).map(ContainerEntry::file_name).unwrap_or_default()
            });
            let lines = vec![format!("_lib={lib_name}")];
            let mut how = TagRewrite::with_libs(entry.tag_encoding, &lines);
            how.output = opts.text.resolve_output(entry.tag_encoding);
            entry.tags = tags::rewrite(&entry.tags, &how);
            entry.tag_encoding = how.output;
            entry.header = psf.family.header_bytes(header);
            entry.start = start;
            entry.end = end;
            entry.modified = true;
            DeltaReport { change_start: start, change_end: end, differing, nonzero_matches, zero_matches, lib_base, psf_base }
        }
        _ => {
            entry.start = k;
            entry.end = k;
            entry.modified = opts.keep_unchanged;
            DeltaReport { change_start: k, change_end: k, differing, nonzero_matches, zero_matches, lib_base, psf_base }
        }
    };
    entry.is_library = false;
    Ok(Minimized { entry, report })
}

/// Copy the library's head and tail around the differing window into
/// `corrected`, translating program offsets into library offsets.
fn copy_untouched(
    corrected:    &mut [u8],
    lib:          &[u8],
    change_start: Option<u32>,
    change_end:   Option<u32>,
    lib_base:     u32,
    psf_base:     u32,
) {
    let to_lib = |at: u32| (at as u64 + lib_base as u64).checked_sub(psf_base as u64);
    let limit = corrected.len().min(lib.len());

    if let Some(head) = change_start.and_then(to_lib) {
        if head as usize <= corrected.len() {
            let n = (head as usize).min(limit);
            corrected[..n].copy_from_slice(&lib[..n]);
        }
    }
    if let Some(tail) = change_end.and_then(to_lib) {
        let tail = tail as usize;
        if tail <= limit {
            corrected[tail..limit].copy_from_slice(&lib[tail..limit]);
        }
    }
}

// ── File-level operations ─────────────────────────────────────────────────────

/// Minimize `program` against `library` and save the result as a mini
/// container.  Returns the report and the path written, or `None` when the
/// program matches the library and `keep_unchanged` is off.
pub fn minimize_file(
    program: &Path,
    library: &Path,
    output:  Option<&Path>,
    opts:    &MinimizeOptions,
    load:    &LoadOptions,
) -> Result<(DeltaReport, Option<PathBuf>), MinimizeError> {
    let lib = library::load_title(library, load)?;
    let mut psf = library::load_title(program, load)?;
    let mut opts = opts.clone();
    if opts.lib_name.is_none() {
        opts.lib_name = library.file_name().map(|n| n.to_string_lossy().into_owned());
    }
    let Minimized { mut entry, report } = minimize(&lib, &psf, None, &opts)?;

    let out = output.map(Path::to_path_buf).unwrap_or_else(|| mini_path(program, psf.family));
    entry.path = out.clone();
    entry.modified = entry.modified || opts.keep_unchanged;
    if !entry.modified {
        info!(source = %program.display(), "matches library, nothing written");
        return Ok((report, None));
    }
    for e in &mut psf.entries {
        e.modified = false;
    }
    psf.kind = BinaryKind::MiniXsf;
    psf.set_primary(entry);

    let save = SaveOptions { kind: Some(BinaryKind::MiniXsf), overwrite: true, text: opts.text, ..Default::default() };
    emit::save_table(&psf, &[out.clone()], &save)?;
    info!(source = %program.display(), output = %out.display(), "kept {} bytes", report.retained());
    Ok((report, Some(out)))
}

/// `<stem>.mini<fam>` next to `source`.
pub fn mini_path(source: &Path, family: Family) -> PathBuf {
    let stem = tags::file_stem(source);
    source.with_file_name(format!("{stem}.{}", family.extension(BinaryKind::MiniXsf)))
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub minimize:       MinimizeOptions,
    pub load:           LoadOptions,
    /// Write the corrected library as a single container with this file name,
    /// next to the library.
    pub corrected_name: Option<String>,
    /// Directory for the minimized outputs.  Defaults to each input's own.
    pub output_dir:     Option<PathBuf>,
}

#[derive(Debug)]
pub struct BatchItem {
    pub source: PathBuf,
    pub output: PathBuf,
    pub report: DeltaReport,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Sorted by retained size, smallest first.
    pub items:     Vec<BatchItem>,
    pub failures:  Vec<(PathBuf, MinimizeError)>,
    pub corrected: Option<PathBuf>,
}

/// Minimize every input against one library.  A failing input is recorded
/// and skipped.
pub fn minimize_batch(library: &Path, inputs: &[PathBuf], opts: &BatchOptions) -> Result<BatchReport, MinimizeError> {
    let mut lib = library::load_title(library, &opts.load)?;
    let lib_name = opts
        .corrected_name
        .clone()
        .or_else(|| library.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let mut min_opts = opts.minimize.clone();
    min_opts.lib_name = Some(lib_name.clone());
    let mut corrected = opts.corrected_name.as_ref().map(|_| vec![0u8; lib.image.len()]);

    let mut report = BatchReport::default();
    for input in inputs {
        match minimize_one(&lib, input, corrected.as_deref_mut(), &min_opts, opts) {
            Ok(item) => report.items.push(item),
            Err(e) => {
                error!(path = %input.display(), "minimize failed: {}", e);
                report.failures.push((input.clone(), e));
            }
        }
    }

    if let Some(mut image) = corrected {
        let hs = lib.header_size().min(image.len());
        image[..hs].copy_from_slice(&lib.image[..hs]);
        lib.image = image;
        let out = library.with_file_name(&lib_name);
        let save = SaveOptions { kind: Some(BinaryKind::Xsf), overwrite: true, text: opts.minimize.text, ..Default::default() };
        emit::save_table(&lib, &[out.clone()], &save)?;
        info!(path = %out.display(), "wrote corrected library");
        report.corrected = Some(out);
    }

    report.items.sort_by_key(|it| it.report.retained());
    Ok(report)
}

fn minimize_one(
    lib:       &FormatTable,
    input:     &Path,
    corrected: Option<&mut [u8]>,
    min_opts:  &MinimizeOptions,
    opts:      &BatchOptions,
) -> Result<BatchItem, MinimizeError> {
    let mut psf = library::load_title(input, &opts.load)?;
    let Minimized { mut entry, report } = minimize(lib, &psf, corrected, min_opts)?;
    let mut output = mini_path(input, psf.family);
    if let (Some(dir), Some(name)) = (&opts.output_dir, output.file_name()) {
        output = dir.join(name);
    }
    entry.path = output.clone();
    entry.modified = entry.modified || min_opts.keep_unchanged;
    for e in &mut psf.entries {
        e.modified = false;
    }
    psf.kind = BinaryKind::MiniXsf;
    psf.set_primary(entry);
    let save = SaveOptions { kind: Some(BinaryKind::MiniXsf), overwrite: true, text: min_opts.text, ..Default::default() };
    emit::save_table(&psf, &[output.clone()], &save)?;
    debug!(source = %input.display(), "kept {} bytes", report.retained());
    Ok(BatchItem { source: input.to_owned(), output, report })
}
