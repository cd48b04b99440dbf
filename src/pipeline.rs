//! Per-entry decode/encode stages shared by all workers.
//!
//! Decode: decrypt (secondary, then DES) → trim padding → fallback decode chain.
//! Encode: compress → pad to the alignment → encrypt (DES, then secondary).

use std::fmt;

use crate::codec::chain::ChainError;
use crate::codec::{DecodeChain, Decoded, Method};
use crate::crypto::{CryptoError, CryptoLayers};
use crate::entry::{align_up, CompressionKind, Encryption, Entry, ALIGNMENT};
use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("payload holds {available} bytes but the compressed size is {expected}")]
    Truncated { available: usize, expected: u64 },
}

/// An entry that could not be decoded but did not abort its pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub index: usize,
    pub path: String,
    pub reason: String,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.path, self.reason)
    }
}

/// Encoded payload ready to be written; `bytes` is already padded.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub size_compressed: u64,
    pub size_decompressed: u64,
    pub compression: CompressionKind,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub chain: DecodeChain,
    pub crypto: CryptoLayers,
}

impl Pipeline {
    pub fn new(crypto: CryptoLayers) -> Self {
        Self { chain: DecodeChain::default(), crypto }
    }

    /// Decodes the stored payload of `entry` (its aligned bytes as read from the source).
    pub fn decode(&self, entry: &Entry, payload: &[u8]) -> Result<Decoded, DecodeError> {
        let mut buf = payload.to_vec();
        self.crypto.decrypt_in_place(entry.encryption, &mut buf, entry.size_compressed)?;
        if (buf.len() as u64) < entry.size_compressed {
            return Err(DecodeError::Truncated { available: buf.len(), expected: entry.size_compressed });
        }
        buf.truncate(entry.size_compressed as usize);
        Ok(self.chain.decode(entry.compression, &buf, usize::try_from(entry.size_decompressed).unwrap_or(usize::MAX))?)
    }

    pub fn encode(&self, plain: &[u8], method: Method, encryption: Encryption) -> Result<Encoded, EngineError> {
        let mut bytes = method.codec().compress(plain)?;
        let size_compressed = bytes.len() as u64;
        bytes.resize(align_up(size_compressed, ALIGNMENT) as usize, 0);
        self.crypto.encrypt_in_place(encryption, &mut bytes, size_compressed)?;
        Ok(Encoded { bytes, size_compressed, size_decompressed: plain.len() as u64, compression: method.kind() })
    }

    /// Swaps the encryption of a stored payload without touching its compression.
    pub fn reencrypt(&self, entry: &Entry, payload: &[u8], target: Encryption) -> Result<Vec<u8>, CryptoError> {
        let mut buf = payload.to_vec();
        self.crypto.decrypt_in_place(entry.encryption, &mut buf, entry.size_compressed)?;
        self.crypto.encrypt_in_place(target, &mut buf, entry.size_compressed)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Attempt;
    use crate::entry::DesMode;

    fn stored_from(encoded: &Encoded, encryption: Encryption) -> Entry {
        let mut entry = Entry::stored("a.bin", 0, encoded.size_compressed, encoded.size_decompressed);
        entry.compression = encoded.compression;
        entry.encryption = encryption;
        entry
    }

    #[test]
    fn encode_then_decode_every_method() {
        let pipeline = Pipeline::new(CryptoLayers::new(Some("pw")));
        let plain: Vec<u8> = b"grf entry payload ".iter().cycle().take(20_000).copied().collect();
        let encryptions = [
            Encryption::NONE,
            Encryption { des: Some(DesMode::Header), secondary: false },
            Encryption { des: Some(DesMode::Mixed), secondary: true },
        ];
        for method in [Method::Lzss, Method::Zlib, Method::Lzma, Method::Store] {
            for enc in encryptions {
                let encoded = pipeline.encode(&plain, method, enc).unwrap();
                assert_eq!(encoded.bytes.len() as u64 % ALIGNMENT, 0);
                let entry = stored_from(&encoded, enc);
                let decoded = pipeline.decode(&entry, &encoded.bytes).unwrap();
                assert_eq!(decoded.bytes, plain, "{:?} / {:?}", method, enc);
            }
        }
    }

    #[test]
    fn lzma_written_as_generic_decodes_via_fallback() {
        let pipeline = Pipeline::default();
        let encoded = pipeline.encode(b"hello hello hello", Method::Lzma, Encryption::NONE).unwrap();
        let entry = stored_from(&encoded, Encryption::NONE);
        assert_eq!(pipeline.decode(&entry, &encoded.bytes).unwrap().via, Attempt::Lzma);
    }

    #[test]
    fn reencrypt_keeps_content() {
        let pipeline = Pipeline::default();
        let encoded = pipeline.encode(&[9u8; 500], Method::Zlib, Encryption::NONE).unwrap();
        let mut entry = stored_from(&encoded, Encryption::NONE);
        let target = Encryption { des: Some(DesMode::Mixed), secondary: false };
        let swapped = pipeline.reencrypt(&entry, &encoded.bytes, target).unwrap();
        entry.encryption = target;
        assert_eq!(pipeline.decode(&entry, &swapped).unwrap().bytes, vec![9u8; 500]);
    }

    #[test]
    fn short_payload_is_reported() {
        let pipeline = Pipeline::default();
        let entry = Entry::stored("x", 0, 64, 64);
        assert!(matches!(pipeline.decode(&entry, &[0u8; 8]), Err(DecodeError::Truncated { .. })));
    }
}
