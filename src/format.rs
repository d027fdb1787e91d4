//! Format registry: container magics, address-space constants and naming.
//!
//! # Identity rules
//! A container is identified by its first four bytes, read as a little-endian
//! `u32`.  Anything else is treated as a raw BIN dump of the console's memory
//! whose first [`Family::header_size`] bytes hold the load address.
//!
//! Every piece of code that needs the header width asks the family.  No
//! caller assumes 4 bytes, so a new family only has to extend the tables
//! below.
//!
//! # Endianness
//! Magic, size fields and the header's load address are little-endian.

/// `PSF\x11`
pub const SSF_MAGIC: u32 = 0x1146_5350;
/// `PSF\x12`
pub const DSF_MAGIC: u32 = 0x1246_5350;

/// Fixed part of a container: magic, reserved size, compressed size, CRC.
pub const CONTAINER_PREAMBLE: u64 = 16;

/// Literal prefix of a tag block.
pub const TAG_SIGNATURE: &[u8; 5] = b"[TAG]";

/// Largest header width of any supported family.
pub const MAX_HEADER_SIZE: usize = 4;

const SSF_IMAGE_SIZE: usize = 0x80004;
const DSF_NAOMI_IMAGE_SIZE: usize = 0x800004;
const DSF_DREAMCAST_IMAGE_SIZE: usize = 0x200004;

/// Raw dumps whose first word is below this are assumed to be SSF.
const SSF_BIN_LIMIT: u32 = 0x80000;

// ── Family ───────────────────────────────────────────────────────────────────

/// Console family of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Saturn sound CPU.
    Ssf,
    /// Dreamcast / NAOMI AICA.
    Dsf,
}

/// Addressable RAM span used for DSF images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsfSpan {
    /// 8 MiB sound RAM.
    #[default]
    Naomi,
    /// 2 MiB sound RAM.
    Dreamcast,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Ssf, Family::Dsf];

    #[inline]
    pub fn magic(self) -> u32 {
        match self {
            Family::Ssf => SSF_MAGIC,
            Family::Dsf => DSF_MAGIC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.magic() == magic)
    }

    /// Width of the header that precedes the program bytes in the
    /// decompressed block.
    #[inline]
    pub fn header_size(self) -> usize {
        match self {
            Family::Ssf | Family::Dsf => 4,
        }
    }

    /// Offset that turns a header value into a real console address.
    #[inline]
    pub fn base_address(self) -> u32 {
        match self {
            Family::Ssf => 0x05A0_0000,
            Family::Dsf => 0xA080_0000,
        }
    }

    /// Size of the scratch image a chain is assembled into, header included.
    pub fn image_size(self, span: DsfSpan) -> usize {
        match (self, span) {
            (Family::Ssf, _) => SSF_IMAGE_SIZE,
            (Family::Dsf, DsfSpan::Naomi) => DSF_NAOMI_IMAGE_SIZE,
            (Family::Dsf, DsfSpan::Dreamcast) => DSF_DREAMCAST_IMAGE_SIZE,
        }
    }

    /// VFS type tag of a library-group entry.
    #[inline]
    pub fn group_tag(self) -> u32 {
        match self {
            Family::Ssf => 0xFFFF_FF18,
            Family::Dsf => 0xFFFF_FF19,
        }
    }

    pub fn from_group_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.group_tag() == tag)
    }

    /// Guess the family of a raw dump from its first word.
    pub fn guess_from_bin(first_word: u32) -> Self {
        if first_word < SSF_BIN_LIMIT {
            Family::Ssf
        } else {
            Family::Dsf
        }
    }

    /// Short lowercase name, also used as the extension stem.
    pub fn name(self) -> &'static str {
        match self {
            Family::Ssf => "ssf",
            Family::Dsf => "dsf",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ssf" => Some(Family::Ssf),
            "dsf" => Some(Family::Dsf),
            _     => None,
        }
    }

    /// Extension (without dot) for a file of `kind` in this family.
    pub fn extension(self, kind: BinaryKind) -> String {
        match kind {
            BinaryKind::Bin     => format!("{}bin", self.name()),
            BinaryKind::Xsf     => self.name().to_owned(),
            BinaryKind::MiniXsf => format!("mini{}", self.name()),
        }
    }

    /// Extension (without dot) for a library file of this family.
    pub fn library_extension(self) -> String {
        format!("{}lib", self.name())
    }

    /// Decode a header into its raw load-address value.
    ///
    /// Returns `None` when `header` is shorter than [`Family::header_size`].
    pub fn header_value(self, header: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = header.get(..self.header_size())?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Encode a raw load-address value as a header.
    pub fn header_bytes(self, value: u32) -> Vec<u8> {
        value.to_le_bytes()[..self.header_size()].to_vec()
    }

    /// Header value plus the family's base address.
    pub fn absolute_address(self, header: &[u8]) -> Option<u32> {
        self.header_value(header)
            .map(|v| v.wrapping_add(self.base_address()))
    }

    /// Inverse of [`Family::absolute_address`].
    pub fn header_from_absolute(self, address: u32) -> Vec<u8> {
        self.header_bytes(address.wrapping_sub(self.base_address()))
    }
}

// ── BinaryKind ───────────────────────────────────────────────────────────────

/// How a table is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryKind {
    /// Raw memory dump, header included, no container.
    Bin,
    /// One self-contained container.
    Xsf,
    /// A container chain: one primary plus `_lib` dependencies.
    #[default]
    MiniXsf,
}

impl BinaryKind {
    /// Pick a kind from an output file name.
    pub fn from_extension(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".minissf") || lower.ends_with(".minidsf") {
            Some(BinaryKind::MiniXsf)
        } else if lower.ends_with("bin") {
            Some(BinaryKind::Bin)
        } else if lower.ends_with("sf") {
            Some(BinaryKind::Xsf)
        } else {
            None
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bin"                => Some(BinaryKind::Bin),
            "xsf" | "single"     => Some(BinaryKind::Xsf),
            "mini" | "minixsf"   => Some(BinaryKind::MiniXsf),
            _                    => None,
        }
    }
}

/// Bytes needed to round `value` up to a multiple of `sector`.
#[inline]
pub fn padding(value: u32, sector: u32) -> u32 {
    if sector == 0 {
        return 0;
    }
    (sector - value % sector) % sector
}
