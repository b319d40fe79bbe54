//! Volatile metadata: an undocumented table pairing a volatile-access RVA
//! list with a volatile-range table, grounded on `image_volatile_metadata`
//! and `range_table_entry` in `detail/load_config/image_load_config_directory.h`.

use crate::buffer::Cursor;
use crate::error::{CapacityError, ErrorList, PeError, StructuralError};
use crate::image::ImageAccess;
use crate::packed::read_u32;

#[derive(Debug, Clone, Copy)]
pub struct VolatileRangeEntry {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct VolatileMetadata {
    pub size: u32,
    pub version: u32,
    pub volatile_access_table: u32,
    pub volatile_access_table_size: u32,
    pub volatile_info_range_table: u32,
    pub volatile_info_range_table_size: u32,
    pub access_rvas: Vec<u32>,
    pub ranges: Vec<VolatileRangeEntry>,
    pub errors: ErrorList,
}

/// Reads the volatile metadata descriptor and both of its sub-tables.
pub fn read_volatile_metadata(
    image: &dyn ImageAccess,
    rva: u32,
    allow_virtual_data: bool,
    max_access_entries: u32,
    max_range_entries: u32,
) -> Result<VolatileMetadata, PeError> {
    let buf = image.buffer_for(rva, 24, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let size = read_u32(&mut cursor)?.value;
    let version = read_u32(&mut cursor)?.value;
    let volatile_access_table = read_u32(&mut cursor)?.value;
    let volatile_access_table_size = read_u32(&mut cursor)?.value;
    let volatile_info_range_table = read_u32(&mut cursor)?.value;
    let volatile_info_range_table_size = read_u32(&mut cursor)?.value;

    let mut errors = ErrorList::new();

    if volatile_access_table_size % 4 != 0 {
        errors.add_error(StructuralError::UnalignedVolatileMetadataAccessRvaTableSize);
    }
    let access_count = volatile_access_table_size / 4;
    let access_clamped = access_count.min(max_access_entries);
    if access_clamped < access_count {
        errors.add_error(CapacityError::InvalidVolatileMetadataAccessRvaTableEntryCount);
    }
    let access_buf = image.buffer_for(volatile_access_table, access_clamped * 4, false)?;
    let mut access_cursor = Cursor::new(&access_buf, allow_virtual_data);
    let mut access_rvas = Vec::with_capacity(access_clamped as usize);
    for _ in 0..access_clamped {
        access_rvas.push(read_u32(&mut access_cursor)?.value);
    }

    if volatile_info_range_table_size % 8 != 0 {
        errors.add_error(StructuralError::UnalignedVolatileMetadataRangeTableSize);
    }
    let range_count = volatile_info_range_table_size / 8;
    let range_clamped = range_count.min(max_range_entries);
    if range_clamped < range_count {
        errors.add_error(CapacityError::InvalidVolatileMetadataRangeTableEntryCount);
    }
    let range_buf = image.buffer_for(volatile_info_range_table, range_clamped * 8, false)?;
    let mut range_cursor = Cursor::new(&range_buf, allow_virtual_data);
    let mut ranges = Vec::with_capacity(range_clamped as usize);
    for _ in 0..range_clamped {
        let entry_rva = read_u32(&mut range_cursor)?.value;
        let entry_size = read_u32(&mut range_cursor)?.value;
        ranges.push(VolatileRangeEntry { rva: entry_rva, size: entry_size });
    }

    Ok(VolatileMetadata {
        size,
        version,
        volatile_access_table,
        volatile_access_table_size,
        volatile_info_range_table,
        volatile_info_range_table_size,
        access_rvas,
        ranges,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::image::{DataDirectory, Machine, SectionRef};

    struct FakeImage {
        data: Vec<u8>,
    }

    impl ImageAccess for FakeImage {
        fn image_base(&self) -> u64 {
            0
        }
        fn is_64bit(&self) -> bool {
            true
        }
        fn section_alignment(&self) -> u32 {
            0x1000
        }
        fn machine(&self) -> Machine {
            Machine::Amd64
        }
        fn section_containing(&self, _rva: u32, _length: u32) -> Result<Option<SectionRef<'_>>, PeError> {
            Ok(None)
        }
        fn buffer_for(&self, rva: u32, length: u32, _include_headers: bool) -> Result<MemoryBuffer, PeError> {
            let start = rva as usize;
            let end = (start + length as usize).min(self.data.len());
            Ok(MemoryBuffer::new(self.data[start..end].to_vec()).with_virtual_size(length as u64))
        }
        fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
            Ok(va as u32)
        }
        fn data_directory(&self, _index: usize) -> Option<DataDirectory> {
            None
        }
    }

    #[test]
    fn misaligned_access_table_records_diagnostic() {
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&8u32.to_le_bytes());
        data[4..8].copy_from_slice(&1u32.to_le_bytes());
        data[8..12].copy_from_slice(&24u32.to_le_bytes());
        data[12..16].copy_from_slice(&3u32.to_le_bytes()); // not a multiple of 4
        data[16..20].copy_from_slice(&0u32.to_le_bytes());
        data[20..24].copy_from_slice(&0u32.to_le_bytes());
        let image = FakeImage { data };
        let meta = read_volatile_metadata(&image, 0, false, 0xffff, 0xffff).unwrap();
        assert!(!meta.errors.is_empty());
    }

    #[test]
    fn partial_trailing_range_table_loads_whole_entries_only() {
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&24u32.to_le_bytes()); // size
        data[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
        data[8..12].copy_from_slice(&0u32.to_le_bytes()); // volatile_access_table
        data[12..16].copy_from_slice(&0u32.to_le_bytes()); // volatile_access_table_size
        data[16..20].copy_from_slice(&24u32.to_le_bytes()); // volatile_info_range_table
        data[20..24].copy_from_slice(&9u32.to_le_bytes()); // volatile_info_range_table_size (not a multiple of 8)
        data[24..28].copy_from_slice(&0x500u32.to_le_bytes()); // one whole entry's rva
        data[28..32].copy_from_slice(&0x10u32.to_le_bytes()); // one whole entry's size
        let image = FakeImage { data };

        let meta = read_volatile_metadata(&image, 0, false, 0xffff, 0xffff).unwrap();
        assert_eq!(meta.ranges.len(), 1);
        assert_eq!(meta.ranges[0].rva, 0x500);
        assert!(meta
            .errors
            .contains(StructuralError::UnalignedVolatileMetadataRangeTableSize));
    }
}
