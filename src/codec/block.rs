use std::io::{Read, Write};

use crc32fast::Hasher;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use super::CodecError;

/// zlib stream holding `[header][program]` plus the CRC32 of the compressed
/// bytes.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    pub payload: Vec<u8>,
    pub crc:     u32,
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Compress `header` followed by `program` at maximum zlib level.
pub fn encode_block(header: &[u8], program: &[u8]) -> Result<CompressedBlock, CodecError> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity((header.len() + program.len()) / 2),
        Compression::best(),
    );
    encoder.write_all(header)?;
    encoder.write_all(program)?;
    let payload = encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    let crc = crc32(&payload);
    debug!("zlib: {} bytes -> {} bytes", header.len() + program.len(), payload.len());
    Ok(CompressedBlock { payload, crc })
}

/// Decompress a block.  The CRC is not checked here; see
/// [`CompressedBlock::crc_matches`].
pub fn decode_block(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

impl CompressedBlock {
    pub fn crc_matches(&self) -> bool {
        crc32(&self.payload) == self.crc
    }
}
