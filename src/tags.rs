//! `[TAG]` block parsing and editing.
//!
//! A tag block is the literal `[TAG]` followed by newline-separated
//! `key=value` lines in some text encoding.  Keys are matched
//! case-insensitively.  A missing or malformed block is never an error: it
//! reads as an empty [`TagBlock`].
//!
//! Library references:
//! - `_lib=<path>`: the main dependency, loaded before the title itself.
//! - `_libN=<path>` with `N >= 2`: auxiliary dependencies, loaded after the
//!   title in ascending `N`.

use std::path::Path;

use encoding_rs::Encoding;
use tracing::warn;

use crate::format::TAG_SIGNATURE;

const LIB_KEY: &str = "_lib";

/// Lines of one tag block, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagBlock {
    pub lines: Vec<String>,
}

impl TagBlock {
    /// Iterate `(key, value)` pairs, skipping lines without `=`.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| split_line(l))
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Split a tag line at its first `=`.
pub fn split_line(line: &str) -> Option<(&str, &str)> {
    let (k, v) = line.split_once('=')?;
    let k = k.trim();
    if k.is_empty() {
        return None;
    }
    Some((k, v.trim_end_matches(['\r', '\n'])))
}

/// Parse raw tag bytes (including the `[TAG]` signature).
pub fn parse(bytes: &[u8], encoding: &'static Encoding) -> TagBlock {
    let Some(body) = bytes.strip_prefix(TAG_SIGNATURE) else {
        return TagBlock::default();
    };
    let (text, _, had_errors) = encoding.decode(body);
    if had_errors {
        warn!(encoding = encoding.name(), "tag block contains undecodable bytes");
    }
    TagBlock {
        lines: text.lines().map(str::to_owned).collect(),
    }
}

/// Dependency references found in a tag block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryRefs {
    /// `_lib=` values in file order.
    pub main: Vec<String>,
    /// `_libN=` values sorted by `N` ascending.
    pub aux:  Vec<(u32, String)>,
}

impl LibraryRefs {
    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.aux.is_empty()
    }
}

pub fn library_refs(bytes: &[u8], encoding: &'static Encoding) -> LibraryRefs {
    let block = parse(bytes, encoding);
    let mut refs = LibraryRefs::default();
    for line in &block.lines {
        let Some((key, value)) = split_line(line) else {
            if starts_with_ignore_case(line, LIB_KEY) {
                warn!(line = %line, "not a valid tag line");
            }
            continue;
        };
        if !starts_with_ignore_case(key, LIB_KEY) {
            continue;
        }
        let value = value.trim();
        if value.is_empty() {
            warn!(line = %line, "library reference without a path");
            continue;
        }
        let suffix = &key[LIB_KEY.len()..];
        if suffix.is_empty() {
            refs.main.push(value.to_owned());
        } else {
            match suffix.parse::<u32>() {
                Ok(n) if n > 1 => refs.aux.push((n, value.to_owned())),
                Ok(_) => {}
                Err(_) => warn!(line = %line, "not a valid library tag"),
            }
        }
    }
    refs.aux.sort_by_key(|(n, _)| *n);
    refs
}

/// How [`rewrite`] builds a new tag block.
#[derive(Debug, Clone)]
pub struct TagRewrite<'a> {
    /// Encoding of the existing block.
    pub input:     &'static Encoding,
    /// Encoding of the produced block.
    pub output:    &'static Encoding,
    /// Lines placed first in the new block.
    pub lines:     &'a [String],
    /// Keep existing `_lib*` lines.
    pub keep_libs: bool,
    /// Drop existing lines whose key matches a key in `lines`.
    pub replace:   bool,
}

impl<'a> TagRewrite<'a> {
    /// Drop every library line, keep everything else.
    pub fn strip_libs(encoding: &'static Encoding) -> Self {
        Self { input: encoding, output: encoding, lines: &[], keep_libs: false, replace: true }
    }

    /// Replace all library lines with `lines`.
    pub fn with_libs(encoding: &'static Encoding, lines: &'a [String]) -> Self {
        Self { input: encoding, output: encoding, lines, keep_libs: false, replace: true }
    }
}

/// Build a new tag block from `tags` according to `how`.
pub fn rewrite(tags: &[u8], how: &TagRewrite<'_>) -> Vec<u8> {
    let mut dropped: Vec<String> = Vec::new();
    if how.replace {
        dropped.extend(how.lines.iter().filter_map(|l| {
            split_line(l).map(|(k, _)| format!("{k}="))
        }));
    }
    if !how.keep_libs {
        dropped.push(LIB_KEY.to_owned());
    }

    let old = parse(tags, how.input);
    let mut out: Vec<&str> = how.lines.iter().map(String::as_str).collect();
    out.extend(
        old.lines
            .iter()
            .filter(|l| !dropped.iter().any(|d| starts_with_ignore_case(l, d)))
            .map(String::as_str),
    );

    let text = format!("[TAG]{}", out.join("\n"));
    let (bytes, _, _) = how.output.encode(&text);
    bytes.into_owned()
}

/// `title=` value, falling back to the file stem of `source`.
pub fn title(tags: &[u8], encoding: &'static Encoding, source: &Path) -> String {
    parse(tags, encoding)
        .get("title")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| file_stem(source))
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_owned())
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_8;
    use proptest::prelude::*;

    #[test]
    fn missing_signature_is_empty() {
        assert!(parse(b"title=x", UTF_8).is_empty());
        assert!(parse(b"", UTF_8).is_empty());
    }

    #[test]
    fn parses_pairs_and_crlf() {
        let b = parse(b"[TAG]title=Song\r\nartist=Someone\r\n", UTF_8);
        assert_eq!(b.get("TITLE"), Some("Song"));
        assert_eq!(b.get("artist"), Some("Someone"));
    }

    #[test]
    fn library_refs_sorted() {
        let refs = library_refs(
            b"[TAG]_lib3=c.ssflib\n_lib=main.ssflib\n_LIB2=b.ssflib\n_lib1=x\ntitle=t",
            UTF_8,
        );
        assert_eq!(refs.main, vec!["main.ssflib".to_owned()]);
        assert_eq!(refs.aux, vec![(2, "b.ssflib".to_owned()), (3, "c.ssflib".to_owned())]);
    }

    #[test]
    fn garbled_lib_line_is_skipped() {
        let refs = library_refs(b"[TAG]_libx=a\n_lib\n_lib=\nk=v", UTF_8);
        assert!(refs.is_empty());
    }

    #[test]
    fn rewrite_replaces_library_lines() {
        let lines = vec!["_lib=new.ssflib".to_owned()];
        let out = rewrite(
            b"[TAG]title=A\n_lib=old.ssflib\n_lib2=aux.ssflib",
            &TagRewrite::with_libs(UTF_8, &lines),
        );
        assert_eq!(out, b"[TAG]_lib=new.ssflib\ntitle=A");
    }

    #[test]
    fn rewrite_replace_and_keep() {
        let lines = vec!["title=B".to_owned()];
        let how = TagRewrite {
            input: UTF_8, output: UTF_8, lines: &lines, keep_libs: true, replace: true,
        };
        let out = rewrite(b"[TAG]title=A\n_lib=l.ssflib\nartist=C", &how);
        assert_eq!(out, b"[TAG]title=B\n_lib=l.ssflib\nartist=C");
    }

    #[test]
    fn title_falls_back_to_stem() {
        assert_eq!(title(b"[TAG]title=Hi", UTF_8, Path::new("x/y.minissf")), "Hi");
        assert_eq!(title(b"", UTF_8, Path::new("x/y.minissf")), "y");
    }

    proptest! {
        #[test]
        fn every_written_line_parses_back(key in "[a-z]{1,8}", value in "[a-zA-Z0-9 ]{0,16}") {
            let lines = vec![format!("{key}={value}")];
            let out = rewrite(b"", &TagRewrite::with_libs(UTF_8, &lines));
            let block = parse(&out, UTF_8);
            prop_assert_eq!(block.get(&key), Some(value.as_str()));
        }
    }
}
