//! The per-file record shared by every component of the engine.
//!
//! An [`Entry`] is created when the container catalog is loaded (or when a new
//! file is staged for addition). During a pass it is mutated only by the worker
//! whose slice contains it; the coordinator fixes its final layout in `dump`.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Payload sizes are padded to this many bytes (one DES block).
pub const ALIGNMENT: u64 = 8;

/// Rounds `size` up to the next multiple of `alignment`.
pub fn align_up(size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

/// Normalize path by replacing backslashes with forward slashes and dropping
/// `./` prefixes and doubled separators.
/// Example: ".\\data\\\\sprite\\a.spr" becomes "data/sprite/a.spr"
pub fn normalize_path(path: &str) -> String {
    let s = path.replace('\\', "/");
    let mut out = String::with_capacity(s.len());
    for part in s.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Joins an archive-relative path onto `root`, refusing anything that would
/// escape it (absolute paths, `..`, drive prefixes).
pub fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let normalized = normalize_path(relative);
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for comp in Path::new(&normalized).components() {
        match comp {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    pushed.then_some(out)
}

/// How an entry's payload is compressed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// The format's own LZSS variant.
    Lzss,
    /// Stored as-is; compressed size equals decompressed size.
    Raw,
    /// Generic deflate (zlib-wrapped) or a leading-zero LZMA stream.
    #[default]
    Generic,
    /// No payload compression flag (directory placeholders, empty files).
    None,
}

/// Which blocks the legacy DES layer covers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DesMode {
    /// Only the first 20 blocks.
    Header,
    /// The first 20 blocks, every `cycle`-th block after that, and a byte
    /// shuffle on the blocks in between.
    Mixed,
}

/// Encryption layers applied to an entry, in encode order: DES then secondary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Encryption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub des: Option<DesMode>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secondary: bool,
}

impl Encryption {
    pub const NONE: Encryption = Encryption { des: None, secondary: false };

    pub fn is_encrypted(&self) -> bool {
        self.des.is_some() || self.secondary
    }
}

/// Pending change that decides which path a worker takes for the entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Modification {
    #[default]
    Unchanged,
    /// Staged from the filesystem; the payload lives at [`Entry::source_path`].
    Added,
    Removed,
    /// Payload must be decrypted and encrypted again with [`Entry::target_encryption`].
    Reencrypt,
}

/// Result of the signature scan done by the classification pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Normal,
    Lzma,
    LegacyEncrypted,
}

/// One archive member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Relative path inside the archive; compared case-insensitively.
    pub path: String,
    /// Byte position of the payload in the source stream.
    pub offset: u64,
    pub size_compressed: u64,
    pub size_decompressed: u64,
    /// `size_compressed` rounded up to the alignment unit, as laid out in the source.
    pub size_compressed_alignment: u64,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub encryption: Encryption,
    #[serde(default)]
    pub directory: bool,

    #[serde(skip)]
    pub modification: Modification,
    /// Filesystem file holding the uncompressed bytes of an added entry.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
    /// Encryption to apply when the entry is rewritten (re-encrypt / added entries).
    #[serde(skip)]
    pub target_encryption: Option<Encryption>,
    #[serde(skip)]
    pub classification: Option<Classification>,

    // Working fields: owned by the worker holding this entry during a pass.
    /// Position inside the owning worker's block buffer or temp file.
    #[serde(skip)]
    pub temporary_offset: u64,
    /// Aligned size after the transform; 0 means "same as the source".
    #[serde(skip)]
    pub temporary_size_compressed_alignment: u64,
    #[serde(skip)]
    pub new_size_compressed: u64,
    #[serde(skip)]
    pub new_size_decompressed: u64,
    #[serde(skip)]
    pub new_compression: Option<CompressionKind>,
    #[serde(skip)]
    pub new_encryption: Option<Encryption>,
}

impl Entry {
    /// An entry already present in the source stream.
    pub fn stored(path: &str, offset: u64, size_compressed: u64, size_decompressed: u64) -> Self {
        Self {
            path: normalize_path(path),
            offset,
            size_compressed,
            size_decompressed,
            size_compressed_alignment: align_up(size_compressed, ALIGNMENT),
            compression: CompressionKind::Generic,
            encryption: Encryption::NONE,
            directory: false,
            modification: Modification::Unchanged,
            source_path: None,
            target_encryption: None,
            classification: None,
            temporary_offset: 0,
            temporary_size_compressed_alignment: 0,
            new_size_compressed: 0,
            new_size_decompressed: 0,
            new_compression: None,
            new_encryption: None,
        }
    }

    /// A new entry staged from a filesystem file; sizes are filled in by the compress pass.
    pub fn added(path: &str, source_path: PathBuf, size: u64) -> Self {
        let mut entry = Self::stored(path, 0, 0, size);
        entry.size_compressed_alignment = 0;
        entry.modification = Modification::Added;
        entry.source_path = Some(source_path);
        entry
    }

    /// A directory placeholder.
    pub fn directory(path: &str) -> Self {
        let mut entry = Self::stored(path, 0, 0, 0);
        entry.compression = CompressionKind::None;
        entry.directory = true;
        entry
    }

    /// Case-insensitive identity key.
    pub fn key(&self) -> String {
        self.path.to_lowercase()
    }

    pub fn is_added(&self) -> bool {
        self.modification == Modification::Added
    }

    pub fn is_removed(&self) -> bool {
        self.modification == Modification::Removed
    }

    /// Whether the entry will carry any encryption once rewritten.
    pub fn has_to_encrypt(&self) -> bool {
        self.output_encryption().is_encrypted()
    }

    /// Encryption the entry will have after the current pass.
    pub fn output_encryption(&self) -> Encryption {
        self.target_encryption.unwrap_or(self.encryption)
    }

    pub fn is_empty(&self) -> bool {
        self.size_decompressed == 0
    }

    /// Whether the entry has bytes in the source stream that a pass may read.
    pub fn has_source_payload(&self) -> bool {
        !self.is_added() && !self.directory && self.size_compressed_alignment > 0
    }

    /// Aligned size the current pass wants this entry to occupy.
    pub fn target_alignment(&self) -> u64 {
        if self.temporary_size_compressed_alignment == 0 {
            self.size_compressed_alignment
        } else {
            self.temporary_size_compressed_alignment
        }
    }

    /// Resets the working fields before a new pass.
    pub fn reset_working(&mut self) {
        self.temporary_offset = 0;
        self.temporary_size_compressed_alignment = 0;
        self.new_size_compressed = 0;
        self.new_size_decompressed = 0;
        self.new_compression = None;
        self.new_encryption = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_block() {
        assert_eq!(align_up(0, ALIGNMENT), 0);
        assert_eq!(align_up(1, ALIGNMENT), 8);
        assert_eq!(align_up(8, ALIGNMENT), 8);
        assert_eq!(align_up(9, ALIGNMENT), 16);
        assert_eq!(align_up(9, 1), 9);
    }

    #[test]
    fn normalize_strips_noise() {
        assert_eq!(normalize_path(".\\data\\\\sprite\\a.spr"), "data/sprite/a.spr");
        assert_eq!(normalize_path("./a//b/./c"), "a/b/c");
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/out");
        assert_eq!(safe_join(root, "data\\a.txt"), Some(PathBuf::from("/out/data/a.txt")));
        assert_eq!(safe_join(root, "../etc/passwd"), None);
        assert_eq!(safe_join(root, ""), None);
    }

    #[test]
    fn predicates_follow_flags() {
        let mut e = Entry::stored("Data\\Texture.BMP", 16, 10, 20);
        assert_eq!(e.key(), "data/texture.bmp");
        assert_eq!(e.size_compressed_alignment, 16);
        assert!(!e.is_added());
        assert!(!e.has_to_encrypt());
        assert!(e.has_source_payload());

        e.target_encryption = Some(Encryption { des: Some(DesMode::Mixed), secondary: false });
        assert!(e.has_to_encrypt());

        let added = Entry::added("new.txt", PathBuf::from("/tmp/new.txt"), 4);
        assert!(added.is_added());
        assert!(!added.has_source_payload());

        let dir = Entry::directory("data");
        assert!(dir.is_empty());
        assert!(!dir.has_source_payload());
    }
}
