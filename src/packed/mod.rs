//! Typed readers for fixed-layout little-endian records, fixed/variable
//! byte arrays, and NUL-terminated strings, each preserving the source
//! offsets at which they were read.
//!
//! Generalizes the original `StructField<T> { offset, bytes, data }` into
//! a reusable wrapper carrying physical vs. logical ("virtual") size and a
//! full [`SourceState`] snapshot, per the buffer substrate in [`crate::buffer`].

use crate::buffer::{Cursor, SourceState};
use crate::error::{BoundsError, PeError};
use std::ops::{Deref, DerefMut};

/// A value decoded from the byte stream, together with the bookkeeping the
/// diagnostics layer needs: how many bytes were actually present
/// (`physical_size`), how many bytes the logical field occupies including
/// any virtual padding (`data_size`), and where reading began.
#[derive(Debug, Clone)]
pub struct PackedField<T> {
    pub value: T,
    pub physical_size: u64,
    pub data_size: u64,
    pub state: SourceState,
}

impl<T> PackedField<T> {
    pub fn is_virtual(&self) -> bool {
        self.physical_size < self.data_size
    }
}

impl<T> Deref for PackedField<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for PackedField<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

macro_rules! impl_read_le_int {
    ($name:ident, $ty:ty) => {
        /// Reads a little-endian integer, capturing its source state.
        pub fn $name(cursor: &mut Cursor) -> Result<PackedField<$ty>, PeError> {
            let state = cursor.snapshot();
            let mut bytes = [0u8; std::mem::size_of::<$ty>()];
            let physical_size = cursor.read(&mut bytes)?;
            let value = <$ty>::from_le_bytes(bytes);
            Ok(PackedField {
                value,
                physical_size,
                data_size: bytes.len() as u64,
                state,
            })
        }
    };
}

impl_read_le_int!(read_u8, u8);
impl_read_le_int!(read_u16, u16);
impl_read_le_int!(read_u32, u32);
impl_read_le_int!(read_u64, u64);

/// Reads a fixed-size byte array, tolerating a short physical read as
/// virtual zero-padding when the cursor allows virtual data.
pub fn read_fixed_array<const N: usize>(
    cursor: &mut Cursor,
) -> Result<PackedField<[u8; N]>, PeError> {
    let state = cursor.snapshot();
    let mut bytes = [0u8; N];
    let physical_size = cursor.read(&mut bytes)?;
    Ok(PackedField {
        value: bytes,
        physical_size,
        data_size: N as u64,
        state,
    })
}

/// Reads a caller-specified number of bytes into a `Vec<u8>`.
pub fn read_byte_vector(cursor: &mut Cursor, len: u64) -> Result<PackedField<Vec<u8>>, PeError> {
    let state = cursor.snapshot();
    let mut bytes = vec![0u8; len as usize];
    let physical_size = cursor.read(&mut bytes)?;
    Ok(PackedField {
        value: bytes,
        physical_size,
        data_size: len,
        state,
    })
}

/// Reads an 8-bit NUL-terminated string. If `allow_virtual_data` is set and
/// the buffer ends before a NUL is found, the string is terminated at the
/// physical end and treated as virtually NUL-terminated.
pub fn read_c_string(cursor: &mut Cursor) -> Result<PackedField<String>, PeError> {
    let state = cursor.snapshot();
    let mut bytes = Vec::new();
    let mut physical_size = 0u64;
    loop {
        let mut byte = [0u8; 1];
        let n = match cursor.read(&mut byte) {
            Ok(n) => n,
            Err(e) => {
                if bytes.is_empty() {
                    return Err(e);
                }
                break;
            }
        };
        if n == 0 {
            break;
        }
        physical_size += 1;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    let data_size = physical_size;
    let value = String::from_utf8_lossy(&bytes).into_owned();
    Ok(PackedField {
        value,
        physical_size,
        data_size,
        state,
    })
}

/// Reads a length-prefixed (`u16` LE) UTF-16LE string; may be virtually
/// truncated if fewer code units are physically present than declared.
pub fn read_utf16_string(cursor: &mut Cursor) -> Result<PackedField<String>, PeError> {
    let state = cursor.snapshot();
    let len_field = read_u16(cursor)?;
    let code_unit_count = len_field.value as usize;
    let mut units = Vec::with_capacity(code_unit_count);
    let mut physical_size = len_field.physical_size;
    for _ in 0..code_unit_count {
        let mut raw = [0u8; 2];
        let n = cursor.read(&mut raw)?;
        physical_size += n;
        if n < 2 {
            break;
        }
        units.push(u16::from_le_bytes(raw));
    }
    let value = String::from_utf16_lossy(&units);
    Ok(PackedField {
        value,
        physical_size,
        data_size: len_field.data_size + (code_unit_count as u64) * 2,
        state,
    })
}

/// Reads a fixed-layout struct via a caller-supplied closure that issues one
/// or more reads against the cursor, wrapping the result with a single
/// source-state snapshot taken before the first read.
pub fn read_struct<T>(
    cursor: &mut Cursor,
    f: impl FnOnce(&mut Cursor) -> Result<T, PeError>,
) -> Result<PackedField<T>, PeError> {
    let state = cursor.snapshot();
    let before = cursor.rpos();
    let phys = cursor.physical_size();
    let value = f(cursor)?;
    let after = cursor.rpos();
    let data_size = after.checked_sub(before).ok_or(BoundsError::IntegerOverflow)?;
    let physical_size = after.min(phys).saturating_sub(before.min(phys));
    Ok(PackedField {
        value,
        physical_size,
        data_size,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;

    #[test]
    fn read_u32_advances_cursor_by_four() {
        let buf = MemoryBuffer::new(vec![0x78, 0x56, 0x34, 0x12]);
        let mut cursor = Cursor::new(&buf, false);
        let field = read_u32(&mut cursor).unwrap();
        assert_eq!(field.value, 0x1234_5678);
        assert_eq!(cursor.rpos(), 4);
        assert_eq!(field.physical_size, field.data_size);
    }

    #[test]
    fn read_c_string_stops_at_nul() {
        let buf = MemoryBuffer::new(b"abc\0def".to_vec());
        let mut cursor = Cursor::new(&buf, false);
        let field = read_c_string(&mut cursor).unwrap();
        assert_eq!(field.value, "abc");
        assert_eq!(cursor.rpos(), 4);
    }

    #[test]
    fn read_fixed_array_tolerates_virtual_tail() {
        let buf = MemoryBuffer::new(vec![1, 2]).with_virtual_size(4);
        let mut cursor = Cursor::new(&buf, true);
        let field = read_fixed_array::<4>(&mut cursor).unwrap();
        assert_eq!(field.physical_size, 2);
        assert_eq!(field.data_size, 4);
        assert!(field.is_virtual());
    }
}
