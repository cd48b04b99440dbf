//! # Codecs
//!
//! The engine only decides *which* algorithm to try and in *what order*
//! (see [`chain`]). The algorithms themselves sit behind the [`Codec`] trait:
//!
//! - [`LzssCodec`]: the format's LZSS variant.
//! - [`ZlibCodec`]: zlib-wrapped deflate through `flate2`.
//! - [`LzmaCodec`]: legacy `.lzma` streams through `xz2`, marked with a leading zero byte.
//! - [`StoreCodec`]: raw copy.

pub mod chain;
mod lzss;

pub use chain::{Attempt, DecodeChain, Decoded};
pub use lzss::LzssCodec;

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use xz2::stream::{LzmaOptions, Stream};

use crate::entry::CompressionKind;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{codec}: corrupt stream: {reason}")]
    Corrupt { codec: &'static str, reason: String },
    #[error("{codec}: expected {expected} bytes, got {actual}")]
    SizeMismatch { codec: &'static str, expected: usize, actual: usize },
    #[error("{codec}: not applicable: {reason}")]
    NotApplicable { codec: &'static str, reason: &'static str },
    #[error("{codec}: {source}")]
    Io {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A compression algorithm the pipeline can call.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompresses `data`; `expected` is the decompressed size recorded in the catalog.
    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError>;
}

/// Checks that a decoder produced exactly the recorded size.
pub(crate) fn check_size(codec: &'static str, out: Vec<u8>, expected: usize) -> Result<Vec<u8>, CodecError> {
    if out.len() != expected {
        return Err(CodecError::SizeMismatch { codec, expected, actual: out.len() });
    }
    Ok(out)
}

/// First allocation for a decoder's output. The catalog size is not trusted
/// past a few times the payload length; the vector grows if the data is real.
pub(crate) fn initial_capacity(data_len: usize, expected: usize) -> usize {
    expected.min(data_len.saturating_mul(4).saturating_add(64))
}

/// Drains `reader` into a buffer, reading at most one byte past `expected` so
/// an overrun surfaces as a size mismatch instead of unbounded growth.
fn read_bounded<R: Read>(codec: &'static str, reader: R, data_len: usize, expected: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(initial_capacity(data_len, expected));
    reader
        .take((expected as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Corrupt { codec, reason: e.to_string() })?;
    check_size(codec, out, expected)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn name(&self) -> &'static str {
        "store"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() < expected {
            return Err(CodecError::SizeMismatch { codec: "store", expected, actual: data.len() });
        }
        Ok(data[..expected].to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    pub level: u32,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl ZlibCodec {
    /// Headerless deflate, the last thing tried on streams with a damaged zlib wrapper.
    pub fn inflate_raw(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded("deflate", DeflateDecoder::new(data), data.len(), expected)
    }
}

impl Codec for ZlibCodec {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::new(self.level));
        encoder.write_all(data).map_err(|source| CodecError::Io { codec: "zlib", source })?;
        encoder.finish().map_err(|source| CodecError::Io { codec: "zlib", source })
    }

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded("zlib", ZlibDecoder::new(data), data.len(), expected)
    }
}

/// LZMA "alone" streams prefixed with a single `0x00` marker byte, which is how
/// the container tells them apart from zlib payloads (a zlib header never starts with 0).
#[derive(Debug, Clone, Copy)]
pub struct LzmaCodec {
    pub preset: u32,
}

impl Default for LzmaCodec {
    fn default() -> Self {
        Self { preset: 6 }
    }
}

pub const LZMA_MARKER: u8 = 0x00;

impl Codec for LzmaCodec {
    fn name(&self) -> &'static str {
        "lzma"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let options = LzmaOptions::new_preset(self.preset)
            .map_err(|e| CodecError::Io { codec: "lzma", source: e.into() })?;
        let stream = Stream::new_lzma_encoder(&options)
            .map_err(|e| CodecError::Io { codec: "lzma", source: e.into() })?;
        let mut out = vec![LZMA_MARKER];
        let mut encoder = xz2::write::XzEncoder::new_stream(&mut out, stream);
        encoder.write_all(data).map_err(|source| CodecError::Io { codec: "lzma", source })?;
        encoder.finish().map_err(|source| CodecError::Io { codec: "lzma", source })?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        match data.first() {
            Some(&LZMA_MARKER) => {}
            _ => return Err(CodecError::NotApplicable { codec: "lzma", reason: "missing leading zero marker" }),
        }
        let stream = Stream::new_lzma_decoder(u64::MAX)
            .map_err(|e| CodecError::Io { codec: "lzma", source: e.into() })?;
        read_bounded("lzma", xz2::read::XzDecoder::new_stream(&data[1..], stream), data.len(), expected)
    }
}

/// The codec used to *write* a given compression kind.
pub fn codec_for(kind: CompressionKind) -> Box<dyn Codec> {
    match kind {
        CompressionKind::Lzss => Box::new(LzssCodec),
        CompressionKind::Generic => Box::new(ZlibCodec::default()),
        CompressionKind::Raw | CompressionKind::None => Box::new(StoreCodec),
    }
}

/// Output encoding chosen for entries written by repack or compress passes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Lzss,
    #[default]
    Zlib,
    Lzma,
    Store,
}

impl Method {
    /// The catalog flag recorded for entries written with this method.
    pub fn kind(self) -> CompressionKind {
        match self {
            Method::Lzss => CompressionKind::Lzss,
            Method::Zlib | Method::Lzma => CompressionKind::Generic,
            Method::Store => CompressionKind::Raw,
        }
    }

    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            Method::Lzss => Box::new(LzssCodec),
            Method::Zlib => Box::new(ZlibCodec::default()),
            Method::Lzma => Box::new(LzmaCodec::default()),
            Method::Store => Box::new(StoreCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        let text = b"sprite/palette/act gnd rsw ";
        (0..len).map(|i| if i % 13 == 0 { (i % 256) as u8 } else { text[i % text.len()] }).collect()
    }

    fn roundtrip(codec: &dyn Codec) {
        for len in [0usize, 1, 300_000] {
            let data = sample(len);
            let packed = codec.compress(&data).unwrap();
            let unpacked = codec.decompress(&packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "{} failed for len {}", codec.name(), len);
        }
    }

    #[test]
    fn zlib_roundtrip() {
        roundtrip(&ZlibCodec::default());
    }

    #[test]
    fn lzma_roundtrip() {
        roundtrip(&LzmaCodec::default());
    }

    #[test]
    fn store_roundtrip() {
        roundtrip(&StoreCodec);
    }

    #[test]
    fn lzma_output_carries_marker() {
        let packed = LzmaCodec::default().compress(b"abc").unwrap();
        assert_eq!(packed[0], LZMA_MARKER);
        let zlib = ZlibCodec::default().compress(b"abc").unwrap();
        assert_ne!(zlib[0], LZMA_MARKER);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let packed = ZlibCodec::default().compress(b"hello world").unwrap();
        let err = ZlibCodec::default().decompress(&packed, 5).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { .. }));
    }

    #[test]
    fn absurd_recorded_size_fails_without_allocating_it() {
        let data = sample(4096);
        let huge = usize::MAX / 2;
        let codecs: [&dyn Codec; 3] = [&ZlibCodec::default(), &LzmaCodec::default(), &LzssCodec];
        for codec in codecs {
            let packed = codec.compress(&data).unwrap();
            let err = codec.decompress(&packed, huge).unwrap_err();
            assert!(
                matches!(err, CodecError::SizeMismatch { actual: 4096, .. } | CodecError::Corrupt { .. }),
                "{}: {err}",
                codec.name()
            );
        }
        assert_eq!(initial_capacity(100, huge), 464);
        assert_eq!(initial_capacity(100, 10), 10);
    }

    #[test]
    fn overrun_stops_one_byte_past_the_recorded_size() {
        let packed = ZlibCodec::default().compress(&vec![7u8; 1 << 20]).unwrap();
        match ZlibCodec::default().decompress(&packed, 10).unwrap_err() {
            CodecError::SizeMismatch { expected, actual, .. } => assert_eq!((expected, actual), (10, 11)),
            other => panic!("unexpected {other}"),
        }
    }
}
