//! Compression codecs for chunk payloads
//!
//! Chunks are served either raw or wrapped in a streaming compression format.
//! The codec is announced by the manifest, never sniffed from the payload.
//!
//! | Codec | Wire format | Crate |
//! |-------|-------------|-------|
//! | `NONE` | passthrough | - |
//! | `LZ4_FRAME` | LZ4 frame format | `lz4` |
//! | `ZSTD` | Zstandard frame | `zstd` |
//! | `GZIP` | gzip member(s) | `flate2` |
//!
//! Decompression is streaming: [`decompress_reader`] wraps any `Read` so the
//! decoder pulls bytes as the HTTP body arrives.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Compression codec of a chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionCodec {
    /// No compression (passthrough)
    #[default]
    None,
    /// LZ4 frame format
    #[serde(alias = "LZ4", alias = "lz4")]
    Lz4Frame,
    /// Zstandard
    #[serde(alias = "zstd")]
    Zstd,
    /// gzip / deflate
    #[serde(alias = "gzip")]
    Gzip,
}

impl CompressionCodec {
    /// All supported codecs
    pub const ALL: [CompressionCodec; 4] = [
        CompressionCodec::None,
        CompressionCodec::Lz4Frame,
        CompressionCodec::Zstd,
        CompressionCodec::Gzip,
    ];

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4Frame => "lz4_frame",
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uncompressed" | "" => Some(Self::None),
            "lz4" | "lz4_frame" | "lz4frame" => Some(Self::Lz4Frame),
            "zstd" | "zstandard" => Some(Self::Zstd),
            "gzip" | "gz" => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Check if this codec actually compresses
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CompressionCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::compression(s, "unsupported compression codec"))
    }
}

/// Wrap `reader` so that reads yield decompressed bytes
pub fn decompress_reader<R>(reader: R, codec: CompressionCodec) -> Result<Box<dyn Read + Send>>
where
    R: Read + Send + 'static,
{
    let decoder: Box<dyn Read + Send> = match codec {
        CompressionCodec::None => Box::new(reader),
        CompressionCodec::Lz4Frame => Box::new(
            lz4::Decoder::new(reader).map_err(|e| Error::compression(codec.name(), e.to_string()))?,
        ),
        CompressionCodec::Zstd => Box::new(
            zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::compression(codec.name(), e.to_string()))?,
        ),
        CompressionCodec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
    };
    Ok(decoder)
}

/// Compress a whole payload with `codec`
pub fn compress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    let map_err = |e: std::io::Error| Error::compression(codec.name(), e.to_string());
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        CompressionCodec::Lz4Frame => {
            let mut encoder = lz4::EncoderBuilder::new()
                .build(Vec::with_capacity(data.len() / 2))
                .map_err(map_err)?;
            encoder.write_all(data).map_err(map_err)?;
            let (out, result) = encoder.finish();
            result.map_err(map_err)?;
            Ok(out)
        }
        CompressionCodec::Zstd => zstd::stream::encode_all(data, 3).map_err(map_err),
        CompressionCodec::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(map_err)?;
            encoder.finish().map_err(map_err)
        }
    }
}

/// Decompress a whole payload with `codec`
pub fn decompress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    let mut reader = decompress_reader(std::io::Cursor::new(data.to_vec()), codec)?;
    let mut out = Vec::with_capacity(data.len() * 2);
    reader
        .read_to_end(&mut out)
        .map_err(|e| Error::compression(codec.name(), e.to_string()))?;
    Ok(out)
}
