//! Tag text encodings: explicit choice, with auto-detection as a fallback.
//!
//! Detection is a service behind [`EncodingDetector`] so callers and tests can
//! swap it out.  The default is [`Chardet`].

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use tracing::warn;

/// Given raw tag bytes, return a best-guess encoding.
pub trait EncodingDetector: Send + Sync {
    fn detect(&self, bytes: &[u8]) -> Option<&'static Encoding>;
}

/// `chardetng` backed detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct Chardet;

impl EncodingDetector for Chardet {
    fn detect(&self, bytes: &[u8]) -> Option<&'static Encoding> {
        let text = bytes.strip_prefix(crate::format::TAG_SIGNATURE).unwrap_or(bytes);
        if text.is_empty() {
            return None;
        }
        let mut det = chardetng::EncodingDetector::new();
        det.feed(text, true);
        Some(det.guess(None, true))
    }
}

/// Encoding choices for one top-level operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOptions {
    /// Encoding of tags being read.  `None` means detect.
    pub input:  Option<&'static Encoding>,
    /// Encoding of tags being written.  `None` means keep the input's.
    pub output: Option<&'static Encoding>,
}

impl TextOptions {
    pub fn utf8() -> Self {
        Self { input: Some(UTF_8), output: Some(UTF_8) }
    }

    /// Encoding for reading `bytes`: the explicit choice, a detected one, or
    /// UTF-8.
    pub fn resolve_input(&self, bytes: &[u8]) -> &'static Encoding {
        self.resolve_input_with(&Chardet, bytes)
    }

    pub fn resolve_input_with(&self, detector: &dyn EncodingDetector, bytes: &[u8]) -> &'static Encoding {
        if let Some(enc) = self.input {
            return enc;
        }
        match detector.detect(bytes) {
            Some(enc) => enc,
            None => {
                if bytes.len() > crate::format::TAG_SIGNATURE.len() {
                    warn!("tag encoding could not be detected, using UTF-8");
                }
                UTF_8
            }
        }
    }

    /// Encoding for writing tags that were read as `read_as`.
    pub fn resolve_output(&self, read_as: &'static Encoding) -> &'static Encoding {
        self.output.unwrap_or(read_as)
    }
}

/// Default encoding for VFS directory names.
pub fn default_name_encoding() -> &'static Encoding {
    WINDOWS_1252
}

/// Parse an encoding label such as `utf-8`, `shift_jis` or `latin1`.
pub fn encoding_from_label(label: &str) -> Option<&'static Encoding> {
    match label.to_ascii_lowercase().as_str() {
        "ascii" | "us-ascii" => Some(WINDOWS_1252),
        other => Encoding::for_label(other.as_bytes()),
    }
}

/// Encode `text`, cutting the result at `limit` bytes.
pub fn encode_truncated(text: &str, encoding: &'static Encoding, limit: usize) -> Vec<u8> {
    let (bytes, _, _) = encoding.encode(text);
    let mut out = bytes.into_owned();
    if out.len() > limit {
        out.truncate(limit);
        if encoding == UTF_8 {
            // back off to a char boundary
            while !out.is_empty() && std::str::from_utf8(&out).is_err() {
                out.pop();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::SHIFT_JIS;

    struct Never;
    impl EncodingDetector for Never {
        fn detect(&self, _: &[u8]) -> Option<&'static Encoding> { None }
    }

    #[test]
    fn explicit_input_wins() {
        let opts = TextOptions { input: Some(SHIFT_JIS), output: None };
        assert_eq!(opts.resolve_input(b"[TAG]title=x"), SHIFT_JIS);
        assert_eq!(opts.resolve_output(SHIFT_JIS), SHIFT_JIS);
    }

    #[test]
    fn failed_detection_falls_back_to_utf8() {
        let opts = TextOptions::default();
        assert_eq!(opts.resolve_input_with(&Never, b"[TAG]title=x"), UTF_8);
    }

    #[test]
    fn labels() {
        assert_eq!(encoding_from_label("UTF-8"), Some(UTF_8));
        assert_eq!(encoding_from_label("shift_jis"), Some(SHIFT_JIS));
        assert!(encoding_from_label("klingon").is_none());
    }

    #[test]
    fn truncation_keeps_utf8_valid() {
        let out = encode_truncated("ééé", UTF_8, 5);
        assert_eq!(out.len(), 4);
        assert!(std::str::from_utf8(&out).is_ok());
    }
}
