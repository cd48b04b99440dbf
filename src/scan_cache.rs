//! Double-buffered forward-scanning byte cache.
//!
//! Answers small byte probes at increasing offsets (e.g. the first two bytes of
//! every entry, visited in source order) without a seek + read per probe. Two
//! fixed-size buffers hold consecutive windows of the stream; a miss refills
//! whichever window starts further behind. Memory stays at `2 × buffer_size`
//! regardless of the stream length.
//!
//! The stream is only read forward: a read below both windows is rejected
//! with [`io::ErrorKind::InvalidInput`], so callers must visit in offset order.

use std::io::{self, Read, Seek, SeekFrom};

/// Default size of each of the two windows.
pub const DEFAULT_SCAN_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
struct Window {
    data: Vec<u8>,
    start: u64,
    len: usize,
}

impl Window {
    fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.start + self.len as u64
    }
}

#[derive(Debug)]
pub struct ForwardScanCache<R> {
    reader: R,
    stream_len: u64,
    buffer_size: usize,
    windows: [Window; 2],
    /// Current position of `reader`.
    position: u64,
    refills: u64,
}

impl<R: Read + Seek> ForwardScanCache<R> {
    pub fn new(mut reader: R, buffer_size: usize) -> io::Result<Self> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let buffer_size = buffer_size.max(1);
        let window = || Window { data: vec![0u8; buffer_size], start: 0, len: 0 };
        Ok(Self {
            reader,
            stream_len,
            buffer_size,
            windows: [window(), window()],
            position: 0,
            refills: 0,
        })
    }

    pub fn stream_len(&self) -> u64 {
        self.stream_len
    }

    /// Number of window refills (physical reads) so far.
    pub fn refills(&self) -> u64 {
        self.refills
    }

    /// Returns the byte at `offset`. Fails if `offset` is past the end of the stream.
    pub fn read_byte(&mut self, offset: u64) -> io::Result<u8> {
        if offset >= self.stream_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("offset {} is outside the stream ({} bytes)", offset, self.stream_len),
            ));
        }
        for window in &self.windows {
            if window.contains(offset) {
                return Ok(window.data[(offset - window.start) as usize]);
            }
        }
        let slot = self.refill(offset)?;
        let window = &self.windows[slot];
        Ok(window.data[(offset - window.start) as usize])
    }

    /// Fills `out` with the bytes starting at `offset`.
    pub fn read_into(&mut self, offset: u64, out: &mut [u8]) -> io::Result<()> {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_byte(offset + i as u64)?;
        }
        Ok(())
    }

    fn refill(&mut self, offset: u64) -> io::Result<usize> {
        let floor = self.windows.iter().filter(|w| w.len > 0).map(|w| w.start).min();
        if let Some(floor) = floor.filter(|floor| offset < *floor) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("backward read at {offset}, cache already starts at {floor}"),
            ));
        }
        // Fill an empty window first, then recycle the one that starts further behind.
        let slot = match (&self.windows[0], &self.windows[1]) {
            (a, _) if a.len == 0 => 0,
            (_, b) if b.len == 0 => 1,
            (a, b) if a.start <= b.start => 0,
            _ => 1,
        };
        let furthest = self.windows[1 - slot].start + self.windows[1 - slot].len as u64;

        // Keep reading sequentially when the probe lands in the next chunk,
        // otherwise jump straight to the probe.
        let start = if offset >= furthest && offset < furthest + self.buffer_size as u64 {
            furthest
        } else {
            offset
        };
        if start != self.position {
            self.reader.seek(SeekFrom::Start(start))?;
        }

        let want = (self.stream_len - start).min(self.buffer_size as u64) as usize;
        let window = &mut self.windows[slot];
        self.reader.read_exact(&mut window.data[..want])?;
        window.start = start;
        window.len = want;
        self.position = start + want as u64;
        self.refills += 1;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn increasing_probes_match_random_access() {
        let data = stream(10_000);
        let mut cache = ForwardScanCache::new(Cursor::new(data.clone()), 256).unwrap();
        let mut offset = 0u64;
        let mut step = 1u64;
        while offset < data.len() as u64 {
            assert_eq!(cache.read_byte(offset).unwrap(), data[offset as usize]);
            offset += step;
            step = step % 97 + 3;
        }
        // Spanned far more than two windows.
        assert!(cache.refills() > 2);
    }

    #[test]
    fn probes_within_window_do_not_refill() {
        let data = stream(1024);
        let mut cache = ForwardScanCache::new(Cursor::new(data), 512).unwrap();
        cache.read_byte(0).unwrap();
        cache.read_byte(1).unwrap();
        cache.read_byte(511).unwrap();
        assert_eq!(cache.refills(), 1);
        cache.read_byte(512).unwrap();
        assert_eq!(cache.refills(), 2);
        // Both windows are still valid.
        cache.read_byte(3).unwrap();
        assert_eq!(cache.refills(), 2);
    }

    #[test]
    fn out_of_range_fails() {
        let mut cache = ForwardScanCache::new(Cursor::new(stream(16)), 8).unwrap();
        assert!(cache.read_byte(15).is_ok());
        let err = cache.read_byte(16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_behind_both_windows_is_rejected() {
        let data = stream(4096);
        let mut cache = ForwardScanCache::new(Cursor::new(data.clone()), 64).unwrap();
        cache.read_byte(1000).unwrap();
        cache.read_byte(2000).unwrap();
        assert_eq!(cache.read_byte(1001).unwrap(), data[1001]);
        let err = cache.read_byte(999).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(cache.refills(), 2);
    }

    #[test]
    fn read_into_crosses_windows() {
        let data = stream(64);
        let mut cache = ForwardScanCache::new(Cursor::new(data.clone()), 8).unwrap();
        let mut out = [0u8; 2];
        cache.read_into(7, &mut out).unwrap();
        assert_eq!(out, [data[7], data[8]]);
    }
}
