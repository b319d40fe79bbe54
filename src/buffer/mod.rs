//! Random-access and cursor-based views over image bytes.
//!
//! Every read in this crate ultimately goes through a [`Cursor`] built on top
//! of an [`InputBuffer`]. Buffers are allowed to be "virtual": shorter
//! physically than the size they report, so that malformed/truncated images
//! can still be parsed as far as possible instead of aborting immediately.

use crate::error::{BoundsError, PeError};

/// A random-access, possibly virtually-extended byte source.
///
/// `physical_size()` may be smaller than `size()`; bytes beyond
/// `physical_size()` do not physically exist and reads crossing that
/// boundary are either truncated (virtual data allowed) or rejected
/// (virtual data disallowed), per caller preference.
pub trait InputBuffer {
    /// Logical size of the buffer, including any virtual tail.
    fn size(&self) -> u64;

    /// Size of the physically backed prefix of the buffer.
    fn physical_size(&self) -> u64;

    /// Absolute offset of this buffer's start within the overall image.
    fn absolute_offset(&self) -> u64;

    /// Offset of this buffer's start relative to its logical parent region
    /// (e.g. the start of the containing section).
    fn relative_offset(&self) -> u64;

    /// Reads up to `dst.len()` bytes starting at `pos`, returning the number
    /// of bytes actually copied (which may be less than `dst.len()` if `pos`
    /// is within the virtual tail).
    fn read_at(&self, pos: u64, dst: &mut [u8]) -> u64;
}

/// The simplest concrete [`InputBuffer`]: an owned byte vector, with an
/// optional declared virtual tail beyond its physical content.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Vec<u8>,
    virtual_size: u64,
    absolute_offset: u64,
    relative_offset: u64,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            data,
            virtual_size: len,
            absolute_offset: 0,
            relative_offset: 0,
        }
    }

    /// Declares additional virtual bytes past the physical content, as when
    /// a section's raw data is shorter than its virtual size.
    pub fn with_virtual_size(mut self, virtual_size: u64) -> Self {
        self.virtual_size = virtual_size.max(self.data.len() as u64);
        self
    }

    pub fn with_absolute_offset(mut self, offset: u64) -> Self {
        self.absolute_offset = offset;
        self
    }

    pub fn with_relative_offset(mut self, offset: u64) -> Self {
        self.relative_offset = offset;
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl InputBuffer for MemoryBuffer {
    fn size(&self) -> u64 {
        self.virtual_size
    }

    fn physical_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn absolute_offset(&self) -> u64 {
        self.absolute_offset
    }

    fn relative_offset(&self) -> u64 {
        self.relative_offset
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) -> u64 {
        let phys = self.physical_size();
        if pos >= phys {
            return 0;
        }
        let avail = (phys - pos) as usize;
        let n = avail.min(dst.len());
        let start = pos as usize;
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        n as u64
    }
}

/// Snapshot of a cursor's position at the moment a packed field began
/// reading, carried forward onto the field for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceState {
    pub absolute_offset: u64,
    pub relative_offset: u64,
    pub rpos: u64,
}

/// A mutable read cursor over a shared [`InputBuffer`].
///
/// Single-threaded by design: a `Cursor` owns its own `rpos` and is not
/// `Sync`. The underlying buffer may be shared read-only across cursors.
pub struct Cursor<'a> {
    buffer: &'a dyn InputBuffer,
    rpos: u64,
    allow_virtual_data: bool,
}

impl<'a> Cursor<'a> {
    pub fn new(buffer: &'a dyn InputBuffer, allow_virtual_data: bool) -> Self {
        Self {
            buffer,
            rpos: 0,
            allow_virtual_data,
        }
    }

    pub fn allow_virtual_data(&self) -> bool {
        self.allow_virtual_data
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn physical_size(&self) -> u64 {
        self.buffer.physical_size()
    }

    pub fn rpos(&self) -> u64 {
        self.rpos
    }

    pub fn set_rpos(&mut self, pos: u64) -> Result<(), PeError> {
        if pos > self.buffer.size() {
            return Err(BoundsError::BufferOverrun.into());
        }
        self.rpos = pos;
        Ok(())
    }

    pub fn advance_rpos(&mut self, delta: i64) -> Result<(), PeError> {
        let new_pos = if delta >= 0 {
            self.rpos.checked_add(delta as u64)
        } else {
            self.rpos.checked_sub((-delta) as u64)
        }
        .ok_or(BoundsError::IntegerOverflow)?;
        self.set_rpos(new_pos)
    }

    /// Captures the current position without advancing, for attaching to a
    /// packed field that is about to be read.
    pub fn snapshot(&self) -> SourceState {
        SourceState {
            absolute_offset: self.buffer.absolute_offset() + self.rpos,
            relative_offset: self.buffer.relative_offset() + self.rpos,
            rpos: self.rpos,
        }
    }

    /// Reads up to `dst.len()` bytes, returning the number of bytes
    /// physically available. Short reads past the physical end are only
    /// permitted when `allow_virtual_data` is set; the unread tail of `dst`
    /// is left zeroed either way.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<u64, PeError> {
        let want = dst.len() as u64;
        if self.rpos.saturating_add(want) > self.buffer.size() {
            return Err(BoundsError::BufferOverrun.into());
        }
        let n = self.buffer.read_at(self.rpos, dst);
        if n < want && !self.allow_virtual_data {
            return Err(BoundsError::BufferOverrun.into());
        }
        self.rpos += want;
        Ok(n)
    }
}

/// A fixed-size write window, present for completeness and exercised by
/// tests only: the directory parsers never write.
pub struct VectorOutputBuffer {
    data: Vec<u8>,
    wpos: usize,
}

impl VectorOutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            wpos: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PeError> {
        if self.wpos + bytes.len() > self.data.len() {
            return Err(BoundsError::BufferOverrun.into());
        }
        self.data[self.wpos..self.wpos + bytes.len()].copy_from_slice(bytes);
        self.wpos += bytes.len();
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_buffer_reports_virtual_tail() {
        let buf = MemoryBuffer::new(vec![1, 2, 3]).with_virtual_size(8);
        assert_eq!(buf.physical_size(), 3);
        assert_eq!(buf.size(), 8);
        let mut dst = [0u8; 5];
        assert_eq!(buf.read_at(1, &mut dst), 2);
        assert_eq!(&dst[..2], &[2, 3]);
    }

    #[test]
    fn cursor_rejects_overrun_without_virtual_data() {
        let buf = MemoryBuffer::new(vec![1, 2, 3]);
        let mut cursor = Cursor::new(&buf, false);
        let mut dst = [0u8; 4];
        assert!(cursor.read(&mut dst).is_err());
    }

    #[test]
    fn cursor_allows_short_read_with_virtual_data() {
        let buf = MemoryBuffer::new(vec![1, 2, 3]).with_virtual_size(4);
        let mut cursor = Cursor::new(&buf, true);
        let mut dst = [0u8; 4];
        let n = cursor.read(&mut dst).unwrap();
        assert_eq!(n, 3);
        assert_eq!(cursor.rpos(), 4);
    }

    #[test]
    fn snapshot_tracks_absolute_and_relative_offsets() {
        let buf = MemoryBuffer::new(vec![0; 16])
            .with_absolute_offset(0x1000)
            .with_relative_offset(0x10);
        let mut cursor = Cursor::new(&buf, false);
        cursor.advance_rpos(4).unwrap();
        let snap = cursor.snapshot();
        assert_eq!(snap.absolute_offset, 0x1004);
        assert_eq!(snap.relative_offset, 0x14);
    }
}
