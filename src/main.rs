use clap::{Parser, Subcommand};
use encoding_rs::Encoding;
use std::path::{Path, PathBuf};
use xsfvfs::format::{BinaryKind, DsfSpan, Family};
use xsfvfs::library::{self, LoadOptions};
use xsfvfs::minimize::{self, BatchOptions, MinimizeOptions};
use xsfvfs::tags::{self, TagRewrite};
use xsfvfs::text::{self, TextOptions};
use xsfvfs::vfs::{self, collect, CollectOptions, PackOptions, TitleCollector, UnpackOptions, VfsReader};
use xsfvfs::emit::{self, SaveOptions};

#[derive(Parser)]
#[command(name = "xsfvfs", about = "SSF/DSF container and VFS archive tool")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Encoding of tags being read (detected when omitted)
    #[arg(long, global = true)]
    encoding: Option<String>,
    /// Encoding of tags being written (defaults to the input's)
    #[arg(long, global = true)]
    out_encoding: Option<String>,
    /// Use the 2 MiB Dreamcast span for DSF images instead of NAOMI's 8 MiB
    #[arg(long, global = true)]
    dreamcast: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a title's library chain and tags
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Re-save a title as bin, xsf or mini, optionally editing its tags
    Convert {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// bin, xsf or mini (default: from the output extension)
        #[arg(short, long)]
        kind: Option<String>,
        /// Tag line to set, `key=value`
        #[arg(short, long)]
        set: Vec<String>,
        /// Drop all existing tags except library references
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        overwrite: bool,
    },
    /// Minimize one title against a library
    Minimize {
        input: PathBuf,
        #[arg(short, long)]
        lib: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        start_pad: Option<u32>,
        #[arg(long)]
        end_pad: Option<u32>,
        /// Write titles identical to the library as empty files
        #[arg(long)]
        keep_unchanged: bool,
    },
    /// Minimize every title under a directory against one library
    MinimizeBatch {
        dir: PathBuf,
        #[arg(short, long)]
        lib: PathBuf,
        /// Also write the corrected library under this file name
        #[arg(short, long)]
        corrected: Option<String>,
        /// Pad retained ends to the header size instead of single bytes
        #[arg(long)]
        pad_end: bool,
        #[arg(long)]
        keep_unchanged: bool,
    },
    /// Pack titles and resources into a VFS archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Files or directories
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Only take titles of this family
        #[arg(short, long)]
        family: Option<String>,
        /// Deduplicate libraries by path instead of content hash
        #[arg(long)]
        by_path: bool,
    },
    /// Extract a VFS archive
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// bin, xsf or mini for rebuilt groups
        #[arg(short, long, default_value = "mini")]
        kind: String,
        /// Write every record raw
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        overwrite: bool,
        /// Explicit output names, used in record order
        #[arg(short, long)]
        name: Vec<PathBuf>,
    },
    /// List archive records
    List {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let text = TextOptions {
        input:  parse_encoding(cli.encoding.as_deref())?,
        output: parse_encoding(cli.out_encoding.as_deref())?,
    };
    let load = LoadOptions {
        text,
        dsf_span: if cli.dreamcast { DsfSpan::Dreamcast } else { DsfSpan::Naomi },
        ..Default::default()
    };

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let table = library::load_title(&input, &load)?;
            if json {
                let entries: Vec<serde_json::Value> = table.entries.iter().map(|e| serde_json::json!({
                    "path":       e.path.display().to_string(),
                    "start":      e.start,
                    "end":        e.end,
                    "is_library": e.is_library,
                    "title":      e.title(),
                    "tags":       tags::parse(&e.tags, e.tag_encoding).lines,
                })).collect();
                let doc = serde_json::json!({
                    "family":       table.family.name(),
                    "kind":         format!("{:?}", table.kind),
                    "image_header": table.image_header_value(),
                    "image_size":   table.image.len(),
                    "entries":      entries,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("── {} ─────────────────────────────────────────", input.display());
                println!("  Family         {}", table.family.name());
                println!("  Kind           {:?}", table.kind);
                println!("  Load address   {:#x}", table.image_header_value().unwrap_or(0));
                println!("  Image size     {:#x}", table.image.len());
                for e in &table.entries {
                    let role = if e.is_library { "lib " } else { "main" };
                    println!("  {} {:#08x}..{:#08x}  {}", role, e.start, e.end, e.path.display());
                    for line in tags::parse(&e.tags, e.tag_encoding).lines {
                        println!("         {}", line);
                    }
                }
            }
        }

        // ── Convert ──────────────────────────────────────────────────────────
        Commands::Convert { input, output, kind, set, clear, overwrite } => {
            let mut table = library::load_title(&input, &load)?;
            let primary = table.primary_mut().ok_or("no primary entry")?;
            if clear || !set.is_empty() {
                let mut lines = set.clone();
                if clear {
                    let libs = tags::parse(&primary.tags, primary.tag_encoding)
                        .lines
                        .into_iter()
                        .filter(|l| l.to_ascii_lowercase().starts_with("_lib"));
                    lines.extend(libs);
                    primary.tags.clear();
                }
                let how = TagRewrite {
                    input:     primary.tag_encoding,
                    output:    text.resolve_output(primary.tag_encoding),
                    lines:     &lines,
                    keep_libs: true,
                    replace:   true,
                };
                primary.tags = tags::rewrite(&primary.tags, &how);
                primary.tag_encoding = how.output;
            }
            primary.modified = true;

            let kind = kind.as_deref().map(parse_kind).transpose()?;
            let names: Vec<PathBuf> = output.into_iter().collect();
            let opts = SaveOptions { kind, auto_kind: kind.is_none(), overwrite, text, output_dir: None };
            let n = emit::save_table(&table, &names, &opts)?;
            println!("Wrote {} file(s)", n);
        }

        // ── Minimize ─────────────────────────────────────────────────────────
        Commands::Minimize { input, lib, output, start_pad, end_pad, keep_unchanged } => {
            let opts = MinimizeOptions { start_pad, end_pad, keep_unchanged, lib_name: None, text };
            match minimize::minimize_file(&input, &lib, output.as_deref(), &opts, &load)? {
                (report, Some(out)) => println!("{}: kept {:#x}..{:#x} ({} bytes, {} differing)",
                    out.display(), report.change_start, report.change_end, report.retained(), report.differing),
                (_, None) => println!("{}: identical to library, nothing written", input.display()),
            }
        }

        // ── Minimize batch ───────────────────────────────────────────────────
        Commands::MinimizeBatch { dir, lib, corrected, pad_end, keep_unchanged } => {
            let mut inputs = Vec::new();
            walk(&dir, &mut inputs)?;
            let lib_abs = std::fs::canonicalize(&lib).unwrap_or_else(|_| lib.clone());
            inputs.retain(|p| collect::is_title_candidate(p) && std::fs::canonicalize(p).ok().as_ref() != Some(&lib_abs));

            let opts = BatchOptions {
                minimize: MinimizeOptions {
                    end_pad: if pad_end { None } else { Some(1) },
                    keep_unchanged,
                    text,
                    ..Default::default()
                },
                load,
                corrected_name: corrected,
                output_dir: None,
            };
            let report = minimize::minimize_batch(&lib, &inputs, &opts)?;
            for item in &report.items {
                println!("{:<40} size: {}", item.output.display(), item.report.retained());
            }
            for (path, e) in &report.failures {
                eprintln!("failed: {}: {}", path.display(), e);
            }
            if let Some(c) = &report.corrected {
                println!("Corrected library: {}", c.display());
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, input, family, by_path } => {
            let family = family
                .as_deref()
                .map(|f| Family::from_name(f).ok_or_else(|| format!("unknown family '{}'", f)))
                .transpose()?;
            let mut paths = Vec::new();
            for p in &input {
                if p.is_dir() { walk(p, &mut paths)?; } else { paths.push(p.clone()); }
            }
            paths.retain(|p| collect::is_title_candidate(p) || collect::is_direct_resource(p));

            let mut collector = TitleCollector::new(CollectOptions { load, dedup_by_hash: !by_path, family });
            collector.add_paths(&paths);
            let (entries, failures) = collector.finish();
            for (path, e) in &failures {
                eprintln!("skipped: {}: {}", path.display(), e);
            }
            let report = vfs::pack(&output, &entries, &PackOptions { load, ..Default::default() })?;
            for (i, e) in &report.failures {
                eprintln!("record {} empty: {}", i, e);
            }
            println!("Created: {} ({} records)", output.display(), report.records.len());
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, kind, raw, overwrite, name } => {
            std::fs::create_dir_all(&output_dir)?;
            let opts = UnpackOptions {
                kind: parse_kind(&kind)?,
                names: name,
                output_dir: Some(output_dir.clone()),
                extract_groups: !raw,
                overwrite,
                text,
                ..Default::default()
            };
            let report = vfs::unpack(&input, &opts)?;
            for (i, e) in &report.failures {
                eprintln!("record {}: {}", i, e);
            }
            println!("Unpacked {} group(s), {} raw file(s) to {}",
                report.groups, report.raw.len(), output_dir.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let reader = VfsReader::open(&input, text::default_name_encoding())?;
            if json {
                println!("{}", serde_json::to_string_pretty(reader.records())?);
            } else {
                println!("Archive: {}", input.display());
                println!("{:>5} {:<40} {:>10} {:>10} {:>10}  Kind", "#", "Name", "Size", "Address", "Type");
                for r in reader.records() {
                    println!("{:>5} {:<40} {:>10} {:>#10x} {:>#10x}  {}",
                        r.index, r.name, r.size, r.address, r.type_tag, r.kind_label());
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_encoding(label: Option<&str>) -> Result<Option<&'static Encoding>, String> {
    label
        .map(|l| text::encoding_from_label(l).ok_or_else(|| format!("unknown encoding '{}'", l)))
        .transpose()
}

fn parse_kind(s: &str) -> Result<BinaryKind, String> {
    BinaryKind::from_name(s).ok_or_else(|| format!("unknown kind '{}' (bin, xsf, mini)", s))
}

/// Collect files under `dir`, sorted per directory.
fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
