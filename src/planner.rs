//! # Block planner
//!
//! Turns a run of entries (sorted by source offset) into as few physical reads
//! as possible. Entries whose payloads sit back-to-back in the source are
//! merged into one block, so thousands of small payloads cost a handful of
//! `seek` + `read_exact` calls instead of one pair per entry.
//!
//! One *load* fills the reader's buffer with up to `budget` bytes. A load is
//! made of one or more blocks; a block ends at the first gap between two
//! payloads, and the load ends once the budget is reached. The budget is soft:
//! a single entry larger than the budget still gets a block of its own.
//!
//! When the target aligned size of an entry differs from the size it occupies
//! in the source (e.g. trimming stale padding while defragmenting), the block is
//! read into scratch memory and copied entry by entry into correctly sized
//! slots, instead of being read straight into the buffer.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;

use crate::entry::Entry;

/// Default byte budget for one load.
pub const DEFAULT_BUDGET: u64 = 8 * 1024 * 1024;

/// One planned physical read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Where the read starts in the source stream.
    pub stream_position: u64,
    /// Number of bytes read from the stream.
    pub length: u64,
    /// Where the block's entries start in the load buffer.
    pub buffer_offset: u64,
    /// Half-open range of entry indices covered by the block.
    pub from: usize,
    pub to: usize,
}

/// Plans a single load starting at `from`. Returns the blocks and the index of
/// the first entry that did not fit.
pub fn plan_load(entries: &[Entry], from: usize, to: usize, budget: u64) -> (Vec<BlockInfo>, usize) {
    let mut blocks: Vec<BlockInfo> = Vec::new();
    let mut current: Option<BlockInfo> = None;
    // Source end of the last payload added to `current`.
    let mut block_end = 0u64;
    let mut used = 0u64;
    let mut index = from;

    while index < to {
        let entry = &entries[index];
        if !entry.has_source_payload() {
            // No bytes to read: neither joins nor breaks a block.
            if let Some(block) = current.as_mut() {
                block.to = index + 1;
            }
            index += 1;
            continue;
        }

        let cost = entry.size_compressed_alignment.max(entry.target_alignment());
        if used > 0 && used + cost > budget {
            break;
        }

        match current.as_mut() {
            Some(block) if entry.offset == block_end => {
                block.length += entry.size_compressed_alignment;
                block.to = index + 1;
            }
            _ => {
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
                current = Some(BlockInfo {
                    stream_position: entry.offset,
                    length: entry.size_compressed_alignment,
                    buffer_offset: used,
                    from: index,
                    to: index + 1,
                });
            }
        }
        block_end = entry.offset + entry.size_compressed_alignment;
        used += entry.target_alignment();
        index += 1;
    }

    if let Some(done) = current {
        blocks.push(done);
    }
    (blocks, index)
}

/// Plans every load needed to cover `[from, to)` and returns all blocks in order.
pub fn plan_blocks(entries: &[Entry], from: usize, to: usize, budget: u64) -> Vec<BlockInfo> {
    let mut all = Vec::new();
    let mut next = from;
    while next < to {
        let (blocks, end) = plan_load(entries, next, to, budget);
        all.extend(blocks);
        next = end;
    }
    all
}

/// Reusable buffer that executes planned loads against a source stream.
///
/// Each worker owns one reader; the buffers are reused across loads.
#[derive(Debug)]
pub struct BlockReader {
    budget: u64,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    loaded: Range<usize>,
    reads: u64,
}

impl BlockReader {
    pub fn new(budget: u64) -> Self {
        Self {
            budget: budget.max(1),
            buffer: Vec::new(),
            scratch: Vec::new(),
            loaded: 0..0,
            reads: 0,
        }
    }

    /// Index range covered by the current buffer contents.
    pub fn loaded(&self) -> Range<usize> {
        self.loaded.clone()
    }

    /// Number of physical reads issued so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Makes sure the payload of `entries[index]` is in the buffer, loading the
    /// next run `[index, end)` if needed.
    pub fn ensure<R: Read + Seek>(
        &mut self,
        source: &mut R,
        entries: &mut [Entry],
        index: usize,
        end: usize,
    ) -> io::Result<()> {
        if self.loaded.contains(&index) {
            return Ok(());
        }
        self.load(source, entries, index, end).map(|_| ())
    }

    /// Fills the buffer starting at `from` and returns the index where the load
    /// stopped. Sets `temporary_offset` of every loaded entry to the position
    /// of its payload in the buffer.
    pub fn load<R: Read + Seek>(
        &mut self,
        source: &mut R,
        entries: &mut [Entry],
        from: usize,
        to: usize,
    ) -> io::Result<usize> {
        self.buffer.clear();
        let (blocks, end) = plan_load(entries, from, to, self.budget);

        for block in &blocks {
            source.seek(SeekFrom::Start(block.stream_position))?;
            self.reads += 1;

            let covered = &mut entries[block.from..block.to];
            let aligned = covered
                .iter()
                .filter(|e| e.has_source_payload())
                .all(|e| e.target_alignment() == e.size_compressed_alignment);

            if aligned {
                let start = self.buffer.len();
                self.buffer.resize(start + block.length as usize, 0);
                source.read_exact(&mut self.buffer[start..])?;
                for entry in covered.iter_mut().filter(|e| e.has_source_payload()) {
                    entry.temporary_offset = start as u64 + (entry.offset - block.stream_position);
                }
            } else {
                self.scratch.clear();
                self.scratch.resize(block.length as usize, 0);
                source.read_exact(&mut self.scratch)?;
                for entry in covered.iter_mut().filter(|e| e.has_source_payload()) {
                    let src = (entry.offset - block.stream_position) as usize;
                    let target = entry.target_alignment() as usize;
                    let copy = target.min(entry.size_compressed_alignment as usize);
                    entry.temporary_offset = self.buffer.len() as u64;
                    self.buffer.extend_from_slice(&self.scratch[src..src + copy]);
                    self.buffer.resize(self.buffer.len() + (target - copy), 0);
                }
            }
        }

        self.loaded = from..end;
        Ok(end)
    }

    /// The payload of a loaded entry, `target_alignment()` bytes long.
    pub fn payload(&self, entry: &Entry) -> &[u8] {
        let start = entry.temporary_offset as usize;
        let end = start + entry.target_alignment() as usize;
        &self.buffer[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{align_up, ALIGNMENT};
    use std::io::Cursor;

    /// Lays out entries back-to-back starting at `base`, with an optional gap before `gap_at`.
    fn layout(sizes: &[u64], base: u64, gap_at: Option<(usize, u64)>) -> Vec<Entry> {
        let mut offset = base;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                if let Some((at, gap)) = gap_at {
                    if at == i {
                        offset += gap;
                    }
                }
                let entry = Entry::stored(&format!("e{i}"), offset, size, size);
                offset += align_up(size, ALIGNMENT);
                entry
            })
            .collect()
    }

    fn stream_for(entries: &[Entry]) -> Vec<u8> {
        let end = entries.iter().map(|e| e.offset + e.size_compressed_alignment).max().unwrap_or(0);
        (0..end).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn contiguous_run_is_one_block() {
        let entries = layout(&[10, 3, 64, 7, 100], 16, None);
        let total: u64 = entries.iter().map(|e| e.size_compressed_alignment).sum();
        let blocks = plan_blocks(&entries, 0, entries.len(), total);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].stream_position, 16);
        assert_eq!(blocks[0].length, total);
        assert_eq!((blocks[0].from, blocks[0].to), (0, 5));
    }

    #[test]
    fn gap_splits_block_at_gap() {
        let entries = layout(&[10, 3, 64, 7, 100], 16, Some((3, 40)));
        let blocks = plan_blocks(&entries, 0, entries.len(), u64::MAX);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].from, blocks[0].to), (0, 3));
        assert_eq!((blocks[1].from, blocks[1].to), (3, 5));
        assert_eq!(blocks[1].stream_position, entries[3].offset);
    }

    #[test]
    fn oversized_entry_gets_own_block() {
        let entries = layout(&[8, 4096, 8], 0, None);
        let blocks = plan_blocks(&entries, 0, entries.len(), 64);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].length, 4096);
    }

    #[test]
    fn empty_range_reads_nothing() {
        let mut entries = layout(&[8, 8], 0, None);
        let data = stream_for(&entries);
        let mut reader = BlockReader::new(1024);
        let end = reader.load(&mut Cursor::new(data), &mut entries, 1, 1).unwrap();
        assert_eq!(end, 1);
        assert!(reader.buffer().is_empty());
        assert_eq!(reader.reads(), 0);
    }

    #[test]
    fn entries_without_payload_are_transparent() {
        let mut entries = layout(&[16, 16], 0, None);
        entries.insert(1, Entry::directory("dir"));
        let blocks = plan_blocks(&entries, 0, entries.len(), u64::MAX);
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].from, blocks[0].to), (0, 3));
    }

    #[test]
    fn aligned_load_matches_stream() {
        let mut entries = layout(&[5, 17, 33, 2], 24, Some((2, 8)));
        let data = stream_for(&entries);
        let mut reader = BlockReader::new(1 << 20);
        let mut cursor = Cursor::new(data.clone());
        let end = reader.load(&mut cursor, &mut entries, 0, 4).unwrap();
        assert_eq!(end, 4);
        assert_eq!(reader.reads(), 2);
        for entry in &entries {
            let start = entry.offset as usize;
            let expected = &data[start..start + entry.size_compressed_alignment as usize];
            assert_eq!(reader.payload(entry), expected);
        }
    }

    #[test]
    fn misaligned_load_resizes_slots() {
        // Source carries 8 bytes of stale padding per entry.
        let mut entries = layout(&[8, 8, 8], 0, None);
        for e in entries.iter_mut() {
            e.size_compressed_alignment = 16;
        }
        entries[1].offset = 16;
        entries[2].offset = 32;
        for e in entries.iter_mut() {
            e.temporary_size_compressed_alignment = 8;
        }
        let data = stream_for(&entries);
        let mut reader = BlockReader::new(1 << 20);
        reader.load(&mut Cursor::new(data.clone()), &mut entries, 0, 3).unwrap();
        assert_eq!(reader.reads(), 1);
        assert_eq!(reader.buffer().len(), 24);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.temporary_offset, (i * 8) as u64);
            let start = entry.offset as usize;
            assert_eq!(reader.payload(entry), &data[start..start + 8]);
        }
    }

    #[test]
    fn budget_bounds_each_load() {
        let mut entries = layout(&[64; 10], 0, None);
        let data = stream_for(&entries);
        let mut reader = BlockReader::new(200);
        let mut cursor = Cursor::new(data);
        let mut next = 0;
        let mut loads = 0;
        while next < entries.len() {
            next = reader.load(&mut cursor, &mut entries, next, 10).unwrap();
            assert!(reader.buffer().len() <= 200);
            loads += 1;
        }
        assert_eq!(loads, 4);
    }
}
