//! Read-only access to the container's byte stream.
//!
//! Each worker opens its own reader so concurrent reads never share a cursor.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait Source: Sync {
    type Reader: Read + Seek + Send;

    /// Opens an independent handle positioned at the start of the stream.
    fn open_reader(&self) -> io::Result<Self::Reader>;

    /// Human-readable identity, also used to derive spool file names.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    type Reader = File;

    fn open_reader(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An in-memory stream shared between workers without copying.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `Cursor` over a shared buffer.
#[derive(Debug, Clone)]
pub struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Source for MemorySource {
    type Reader = Cursor<SharedBytes>;

    fn open_reader(&self) -> io::Result<Self::Reader> {
        Ok(Cursor::new(SharedBytes(Arc::clone(&self.data))))
    }

    fn describe(&self) -> String {
        format!("memory:{:p}", Arc::as_ptr(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn memory_readers_are_independent() {
        let source = MemorySource::new(vec![1u8, 2, 3, 4]);
        let mut a = source.open_reader().unwrap();
        let mut b = source.open_reader().unwrap();
        a.seek(SeekFrom::Start(2)).unwrap();
        let mut one = [0u8; 1];
        a.read_exact(&mut one).unwrap();
        assert_eq!(one, [3]);
        b.read_exact(&mut one).unwrap();
        assert_eq!(one, [1]);
    }

    #[test]
    fn file_source_opens_fresh_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"abcdef").unwrap();
        let source = FileSource::new(&path);
        let mut reader = source.open_reader().unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abcdef");
        assert!(source.describe().ends_with("blob.bin"));
    }
}
