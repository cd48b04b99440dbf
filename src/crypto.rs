//! Encryption layers applied to entry payloads.
//!
//! Two independent layers, applied DES first then secondary on encode and in
//! reverse on decode:
//!
//! - [`LegacyDes`]: the container's historical DES scheme. Works on whole
//!   8-byte blocks only; a trailing partial block is left untouched.
//! - [`SecondaryCipher`]: a length-preserving XOR keystream keyed by a
//!   passphrase, used by the editor for its own archives.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::entry::{DesMode, Encryption};

const KEY_SIZE: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;
const SECONDARY_SALT: &[u8; 16] = b"packforge.layer2";

const DES_KEY: [u8; 8] = [0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6];
const BLOCK: usize = 8;
/// Blocks always covered by DES, in both modes.
const HEADER_BLOCKS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("entry uses the secondary layer but no key is configured")]
    MissingSecondaryKey,
    #[error("invalid key length")]
    InvalidKey,
}

pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Distance between two DES-covered blocks past the header in mixed mode,
/// derived from the number of decimal digits of the compressed size.
pub fn mixed_cycle(size_compressed: u64) -> usize {
    let digits = size_compressed.max(1).ilog10() as usize + 1;
    match digits {
        d if d < 3 => 1,
        d if d < 5 => d + 1,
        d if d < 7 => d + 9,
        d => d + 15,
    }
}

// Byte substitution used on the last byte of shuffled blocks. It is an
// involution, so encode and decode share it.
fn substitute(b: u8) -> u8 {
    match b {
        0x00 => 0x2B,
        0x2B => 0x00,
        0x6C => 0x80,
        0x80 => 0x6C,
        0x01 => 0x68,
        0x68 => 0x01,
        0x48 => 0x77,
        0x77 => 0x48,
        0x60 => 0xFF,
        0xFF => 0x60,
        0xB9 => 0xC0,
        0xC0 => 0xB9,
        0xFE => 0xEB,
        0xEB => 0xFE,
        other => other,
    }
}

fn unshuffle(block: &mut [u8]) {
    let b = [block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7]];
    block.copy_from_slice(&[b[3], b[4], b[6], b[0], b[1], b[2], b[5], substitute(b[7])]);
}

fn shuffle(block: &mut [u8]) {
    let b = [block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7]];
    block.copy_from_slice(&[b[3], b[4], b[5], b[0], b[1], b[6], b[2], substitute(b[7])]);
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Clone)]
pub struct LegacyDes {
    cipher: Des,
}

impl std::fmt::Debug for LegacyDes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyDes").finish_non_exhaustive()
    }
}

impl Default for LegacyDes {
    fn default() -> Self {
        Self { cipher: Des::new(GenericArray::from_slice(&DES_KEY)) }
    }
}

impl LegacyDes {
    pub fn with_key(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Des::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, mode: DesMode, buf: &mut [u8], size_compressed: u64) {
        self.apply(mode, buf, size_compressed, Direction::Encrypt);
    }

    pub fn decrypt(&self, mode: DesMode, buf: &mut [u8], size_compressed: u64) {
        self.apply(mode, buf, size_compressed, Direction::Decrypt);
    }

    fn apply(&self, mode: DesMode, buf: &mut [u8], size_compressed: u64, direction: Direction) {
        let cycle = match mode {
            DesMode::Header => None,
            DesMode::Mixed => Some(mixed_cycle(size_compressed)),
        };
        let mut counter = 0;
        for (i, block) in buf.chunks_exact_mut(BLOCK).enumerate() {
            let covered = i < HEADER_BLOCKS || cycle.is_some_and(|c| i % c == 0);
            if covered {
                let block = GenericArray::from_mut_slice(block);
                match direction {
                    Direction::Encrypt => self.cipher.encrypt_block(block),
                    Direction::Decrypt => self.cipher.decrypt_block(block),
                }
                continue;
            }
            let Some(_) = cycle else { break };
            if counter == 7 {
                match direction {
                    Direction::Encrypt => shuffle(block),
                    Direction::Decrypt => unshuffle(block),
                }
                counter = 0;
            }
            counter += 1;
        }
    }
}

/// XOR keystream built from `SHA-256(key || block_counter)`.
#[derive(Clone)]
pub struct SecondaryCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SecondaryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCipher").finish_non_exhaustive()
    }
}

impl SecondaryCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self { key: derive_key(passphrase, SECONDARY_SALT) }
    }

    /// Encrypts or decrypts `buf` in place; the operation is its own inverse.
    pub fn apply(&self, buf: &mut [u8]) {
        for (counter, chunk) in buf.chunks_mut(KEY_SIZE).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update((counter as u64).to_le_bytes());
            let pad = hasher.finalize();
            for (byte, k) in chunk.iter_mut().zip(pad.iter()) {
                *byte ^= k;
            }
        }
    }
}

/// Both layers, configured once per engine and shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CryptoLayers {
    pub des: LegacyDes,
    pub secondary: Option<SecondaryCipher>,
}

impl CryptoLayers {
    pub fn new(secondary_key: Option<&str>) -> Self {
        Self { des: LegacyDes::default(), secondary: secondary_key.map(SecondaryCipher::from_passphrase) }
    }

    fn secondary(&self) -> Result<&SecondaryCipher, CryptoError> {
        self.secondary.as_ref().ok_or(CryptoError::MissingSecondaryKey)
    }

    pub fn encrypt_in_place(&self, encryption: Encryption, buf: &mut [u8], size_compressed: u64) -> Result<(), CryptoError> {
        if let Some(mode) = encryption.des {
            self.des.encrypt(mode, buf, size_compressed);
        }
        if encryption.secondary {
            self.secondary()?.apply(buf);
        }
        Ok(())
    }

    pub fn decrypt_in_place(&self, encryption: Encryption, buf: &mut [u8], size_compressed: u64) -> Result<(), CryptoError> {
        if encryption.secondary {
            self.secondary()?.apply(buf);
        }
        if let Some(mode) = encryption.des {
            self.des.decrypt(mode, buf, size_compressed);
        }
        Ok(())
    }
}
