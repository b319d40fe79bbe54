//! Section table entries and their characteristics flags.

use crate::buffer::Cursor;
use crate::error::{ErrorContext, ErrorList, PeError};
use crate::packed::{read_fixed_array, read_u16, read_u32};
use bitflags::bitflags;

bitflags! {
    /// `IMAGE_SCN_*` section characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const LNK_INFO = 0x0000_0200;
        const LNK_REMOVE = 0x0000_0800;
        const LNK_COMDAT = 0x0000_1000;
        const GPREL = 0x0000_8000;
        /// Reserved for future use (`IMAGE_SCN_MEM_PURGEABLE`/`IMAGE_SCN_MEM_16BIT`
        /// alias the same bit in the Windows headers; only one name survives here
        /// since `bitflags` requires distinct constants per bit).
        const MEM_PURGEABLE = 0x0002_0000;
        const MEM_LOCKED = 0x0004_0000;
        const MEM_PRELOAD = 0x0008_0000;
        const ALIGN_1BYTES = 0x0010_0000;
        const LNK_NRELOC_OVFL = 0x0100_0000;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_NOT_CACHED = 0x0400_0000;
        const MEM_NOT_PAGED = 0x0800_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

/// A single entry of the section table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    /// The section name as a UTF-8 string, trimmed of trailing NUL padding.
    /// Long names stored as `/<offset>` into the COFF string table are
    /// returned verbatim; executable images do not use that form.
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

pub(super) fn read_section_header(cursor: &mut Cursor) -> Result<SectionHeader, PeError> {
    let name = read_fixed_array::<8>(cursor)?.value;
    let virtual_size = read_u32(cursor)?.value;
    let virtual_address = read_u32(cursor)?.value;
    let size_of_raw_data = read_u32(cursor)?.value;
    let pointer_to_raw_data = read_u32(cursor)?.value;
    let pointer_to_relocations = read_u32(cursor)?.value;
    let pointer_to_linenumbers = read_u32(cursor)?.value;
    let number_of_relocations = read_u16(cursor)?.value;
    let number_of_linenumbers = read_u16(cursor)?.value;
    let characteristics = SectionFlags::from_bits_truncate(read_u32(cursor)?.value);
    Ok(SectionHeader {
        name,
        virtual_size,
        virtual_address,
        size_of_raw_data,
        pointer_to_raw_data,
        pointer_to_relocations,
        pointer_to_linenumbers,
        number_of_relocations,
        number_of_linenumbers,
        characteristics,
    })
}

/// Reads the section table entry by entry over a [`Cursor`] positioned at
/// its start, tolerating a mid-table read failure by stopping there and
/// recording the failing entry's index.
pub struct SectionTableReader<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
}

impl<'c, 'a> SectionTableReader<'c, 'a> {
    pub fn new(cursor: &'c mut Cursor<'a>) -> Self {
        Self { cursor }
    }

    pub fn read_section_header(&mut self) -> Result<SectionHeader, PeError> {
        read_section_header(self.cursor)
    }

    pub fn read_section_table(&mut self, count: u16, errors: &mut ErrorList) -> Vec<SectionHeader> {
        let mut sections = Vec::new();
        for i in 0..count {
            match self.read_section_header() {
                Ok(section) => sections.push(section),
                Err(e) => {
                    errors.add_error_with_context(e, ErrorContext::Index(i as usize));
                    break;
                }
            }
        }
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;

    #[test]
    fn name_str_trims_nul_padding() {
        let header = SectionHeader {
            name: *b".text\0\0\0",
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: SectionFlags::empty(),
        };
        assert_eq!(header.name_str(), ".text");
    }

    #[test]
    fn reads_section_header_fields() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b".data\0\0\0");
        bytes.extend_from_slice(&0x2000u32.to_le_bytes());
        bytes.extend_from_slice(&0x4000u32.to_le_bytes());
        bytes.extend_from_slice(&0x1e00u32.to_le_bytes());
        bytes.extend_from_slice(&0x800u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&(SectionFlags::MEM_READ | SectionFlags::MEM_WRITE).bits().to_le_bytes());
        let buf = MemoryBuffer::new(bytes);
        let mut cursor = Cursor::new(&buf, false);
        let header = read_section_header(&mut cursor).unwrap();
        assert_eq!(header.name_str(), ".data");
        assert_eq!(header.virtual_address, 0x4000);
        assert!(header.characteristics.contains(SectionFlags::MEM_WRITE));
    }
}
