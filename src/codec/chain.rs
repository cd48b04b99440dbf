//! Ordered decoder fallback.
//!
//! Decoding an entry walks a list of [`Attempt`]s and keeps the first one that
//! yields exactly the recorded decompressed size. The default order is:
//!
//! 1. [`Attempt::Primary`]: the decoder named by the entry's compression flag.
//! 2. [`Attempt::Raw`]: a plain copy, only when both sizes are equal.
//! 3. [`Attempt::Lzma`]: only when the payload starts with the zero marker.
//! 4. [`Attempt::Zlib`]: zlib, then headerless deflate.

use std::fmt;

use tracing::trace;

use super::{CodecError, LzmaCodec, LzssCodec, StoreCodec, ZlibCodec, Codec, LZMA_MARKER};
use crate::entry::CompressionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attempt {
    Primary,
    Raw,
    Lzma,
    Zlib,
}

/// Plaintext produced by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub bytes: Vec<u8>,
    pub via: Attempt,
}

/// Every attempt failed; holds each attempt's reason in order.
#[derive(Debug)]
pub struct ChainError {
    pub failures: Vec<(Attempt, CodecError)>,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "no decoder applies");
        }
        write!(f, "all decoders failed")?;
        for (attempt, err) in &self.failures {
            write!(f, "; {:?}: {}", attempt, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChainError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeChain {
    attempts: Vec<Attempt>,
}

impl Default for DecodeChain {
    fn default() -> Self {
        Self::new(vec![Attempt::Primary, Attempt::Raw, Attempt::Lzma, Attempt::Zlib])
    }
}

impl DecodeChain {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self { attempts }
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Decodes `data` (already decrypted and trimmed to the compressed size).
    pub fn decode(&self, kind: CompressionKind, data: &[u8], expected: usize) -> Result<Decoded, ChainError> {
        let mut failures = Vec::new();
        for &attempt in &self.attempts {
            match run(attempt, kind, data, expected) {
                Ok(bytes) => return Ok(Decoded { bytes, via: attempt }),
                Err(CodecError::NotApplicable { .. }) => {}
                Err(err) => {
                    trace!(attempt = ?attempt, error = %err, "decode attempt failed");
                    failures.push((attempt, err));
                }
            }
        }
        Err(ChainError { failures })
    }
}

fn run(attempt: Attempt, kind: CompressionKind, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    match attempt {
        Attempt::Primary => match kind {
            CompressionKind::Lzss => LzssCodec.decompress(data, expected),
            CompressionKind::Generic => ZlibCodec::default().decompress(data, expected),
            CompressionKind::Raw | CompressionKind::None => StoreCodec.decompress(data, expected),
        },
        Attempt::Raw => {
            if data.len() != expected {
                return Err(CodecError::NotApplicable { codec: "store", reason: "sizes differ" });
            }
            Ok(data.to_vec())
        }
        Attempt::Lzma => {
            if data.first() != Some(&LZMA_MARKER) {
                return Err(CodecError::NotApplicable { codec: "lzma", reason: "missing leading zero marker" });
            }
            LzmaCodec::default().decompress(data, expected)
        }
        Attempt::Zlib => {
            let zlib = ZlibCodec::default();
            zlib.decompress(data, expected).or_else(|_| zlib.inflate_raw(data, expected))
        }
    }
}
