//! # Pack container
//!
//! A small reference container that the CLI and the end-to-end tests read and
//! write. The layout is:
//!
//! ```text
//! [b"PKFG\0\0\0\x01"][8 reserved bytes]
//! [entry payloads, each padded to ALIGNMENT]
//! [zstd(JSON index)]
//! [u64 LE: compressed index size][u64 LE: JSON index size][b"PKFGIDX1"]
//! ```
//!
//! Payloads start at [`HEADER_LEN`], which is the `base_offset` handed to
//! [`SpoolPass::dump`].

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::entry::{normalize_path, Entry};
use crate::error::EngineError;
use crate::pool::SpoolPass;

pub const PACK_MAGIC: &[u8; 8] = b"PKFG\0\0\0\x01";
const INDEX_MAGIC: &[u8; 8] = b"PKFGIDX1";
const FOOTER_LEN: u64 = 24;
const INDEX_LEVEL: i32 = 3;

/// Start of the data region.
pub const HEADER_LEN: u64 = 16;

#[derive(Serialize, Deserialize, Debug)]
struct PackIndex {
    version: u32,
    entries: Vec<Entry>,
}

pub fn write_header<W: Write>(out: &mut W) -> Result<(), EngineError> {
    out.write_all(PACK_MAGIC)?;
    out.write_all(&[0u8; 8])?;
    Ok(())
}

/// Appends the compressed index and the footer. Returns the bytes written.
pub fn write_index<W: Write>(out: &mut W, entries: &[Entry]) -> Result<u64, EngineError> {
    let index = PackIndex { version: 1, entries: entries.to_vec() };
    let index_json = serde_json::to_vec(&index)?;
    let mut encoder = zstd::Encoder::new(Vec::new(), INDEX_LEVEL)?;
    encoder.write_all(&index_json)?;
    let index_comp = encoder.finish()?;

    out.write_all(&index_comp)?;
    out.write_all(&(index_comp.len() as u64).to_le_bytes())?;
    out.write_all(&(index_json.len() as u64).to_le_bytes())?;
    out.write_all(INDEX_MAGIC)?;
    Ok(index_comp.len() as u64 + FOOTER_LEN)
}

/// Quick check of the footer magic.
pub fn is_pack(path: &Path) -> std::io::Result<bool> {
    let mut f = File::open(path)?;
    let len = f.metadata()?.len();
    if len < HEADER_LEN + FOOTER_LEN {
        return Ok(false);
    }
    f.seek(SeekFrom::End(-8))?;
    let mut magic = [0u8; 8];
    f.read_exact(&mut magic)?;
    Ok(&magic == INDEX_MAGIC)
}

/// Reads the entry list of a container. Every payload must lie inside the
/// data region.
pub fn read_index<R: Read + Seek>(reader: &mut R) -> Result<Vec<Entry>, EngineError> {
    let len = reader.seek(SeekFrom::End(0))?;
    if len < HEADER_LEN + FOOTER_LEN {
        return Err(EngineError::Format(format!("{} bytes is too small for a container", len)));
    }
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    if &header != PACK_MAGIC {
        return Err(EngineError::Format("bad header magic".into()));
    }

    reader.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    reader.read_exact(&mut footer)?;
    let (comp_bytes, rest) = footer.split_at(8);
    let (json_bytes, magic) = rest.split_at(8);
    if magic != INDEX_MAGIC {
        return Err(EngineError::Format("bad index magic".into()));
    }
    let index_comp = read_u64(comp_bytes);
    let index_json = read_u64(json_bytes);
    let index_start = FOOTER_LEN
        .checked_add(index_comp)
        .and_then(|tail| len.checked_sub(tail))
        .filter(|start| *start >= HEADER_LEN)
        .ok_or_else(|| EngineError::Format(format!("index size {} exceeds the container", index_comp)))?;

    reader.seek(SeekFrom::Start(index_start))?;
    let mut compressed = vec![0u8; index_comp as usize];
    reader.read_exact(&mut compressed)?;
    let json = zstd::decode_all(compressed.as_slice())?;
    if json.len() as u64 != index_json {
        return Err(EngineError::Format(format!("index inflated to {} bytes, footer says {}", json.len(), index_json)));
    }
    let index: PackIndex = serde_json::from_slice(&json)?;

    for entry in &index.entries {
        if entry.size_compressed > entry.size_compressed_alignment {
            return Err(EngineError::Format(format!("entry '{}' is larger than its aligned size", entry.path)));
        }
        let end = entry.offset.checked_add(entry.size_compressed_alignment);
        if entry.size_compressed_alignment > 0
            && (entry.offset < HEADER_LEN || end.map_or(true, |end| end > index_start))
        {
            return Err(EngineError::Format(format!("entry '{}' lies outside the data region", entry.path)));
        }
    }
    debug!(entries = index.entries.len(), index_comp, "index loaded");
    Ok(index.entries)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

pub fn open_index(path: &Path) -> Result<Vec<Entry>, EngineError> {
    let mut file = File::open(path).map_err(|e| EngineError::io_at(e, path))?;
    read_index(&mut file)
}

/// Walks `inputs` and stages every file as an added entry and every
/// directory as a placeholder. A file given directly is stored under its file
/// name; a directory's contents keep their path relative to its parent.
/// Duplicate paths (case-insensitive) keep the first occurrence.
pub fn stage_inputs(inputs: &[PathBuf]) -> Result<Vec<Entry>, EngineError> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for input in inputs {
        let base = input.parent().unwrap_or_else(|| Path::new(""));
        for item in WalkDir::new(input).sort_by_file_name() {
            let item = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| input.clone());
                EngineError::io_at(e.into(), path)
            })?;
            let relative = item.path().strip_prefix(base).unwrap_or(item.path());
            let name = normalize_path(&relative.to_string_lossy());
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                continue;
            }
            if item.file_type().is_dir() {
                entries.push(Entry::directory(&name));
            } else if item.file_type().is_file() {
                let size = item.metadata().map_err(|e| EngineError::io_at(e.into(), item.path()))?.len();
                entries.push(Entry::added(&name, item.path().to_path_buf(), size));
            }
        }
    }
    info!(entries = entries.len(), "staged inputs");
    Ok(entries)
}

/// Writes a complete container to `path`: header, the pass's spooled data,
/// then the index of `entries` as rewritten by the dump. The file is built
/// next to `path` and renamed over it at the end, so `path` may be the
/// container the pass read from.
pub fn write_pack(path: &Path, entries: &mut Vec<Entry>, pass: SpoolPass) -> Result<u64, EngineError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| EngineError::io_at(e, &dir))?;
    let mut staged = tempfile::NamedTempFile::new_in(&dir).map_err(|e| EngineError::io_at(e, &dir))?;

    let file = staged.as_file_mut();
    write_header(file)?;
    let data = pass.dump(entries, file, HEADER_LEN)?;
    let index = write_index(file, entries)?;
    file.sync_all()?;

    staged.persist(path).map_err(|e| EngineError::io_at(e.error, path))?;
    let total = HEADER_LEN + data + index;
    info!(path = %path.display(), bytes = total, entries = entries.len(), "container written");
    Ok(total)
}
