//! Control Flow Guard (CF Guard) / Extended Flow Guard (XFG) function
//! tables, and the structurally identical address-taken-IAT and long-jump
//! tables.
//!
//! Grounded on `load_config/load_config_directory.h` (`guard_function_common`,
//! `max_guard_function_table_stride = 0xf`) and the `guard_flags` constants
//! captured from `detail/load_config/image_load_config_directory.h`.

use crate::buffer::Cursor;
use crate::error::{ErrorList, PeError, SemanticError};
use crate::image::ImageAccess;
use crate::packed::{read_byte_vector, read_u32};
use bitflags::bitflags;

bitflags! {
    /// `IMAGE_GUARD_*` bits of `GuardFlags`.
    #[derive(Default)]
    pub struct GuardFlags: u32 {
        const CF_INSTRUMENTED = 0x100;
        const CFW_INSTRUMENTED = 0x200;
        const CF_FUNCTION_TABLE_PRESENT = 0x400;
        const SECURITY_COOKIE_UNUSED = 0x800;
        const PROTECT_DELAYLOAD_IAT = 0x1000;
        const DELAYLOAD_IAT_IN_ITS_OWN_SECTION = 0x2000;
        const CF_EXPORT_SUPPRESSION_INFO_PRESENT = 0x4000;
        const CF_ENABLE_EXPORT_SUPPRESSION = 0x8000;
        const CF_LONGJUMP_TABLE_PRESENT = 0x1_0000;
        const RF_INSTRUMENTED = 0x2_0000;
        const RF_ENABLE = 0x4_0000;
        const RF_STRICT = 0x8_0000;
        const RETPOLINE_PRESENT = 0x10_0000;
        const EH_CONTINUATION_TABLE_PRESENT_20H1 = 0x20_0000;
        const EH_CONTINUATION_TABLE_PRESENT = 0x40_0000;
        const XFG_ENABLED = 0x80_0000;
        const CASTGUARD_PRESENT = 0x100_0000;
        const MEMCPY_PRESENT = 0x200_0000;
    }
}

const CF_FUNCTION_TABLE_SIZE_SHIFT: u32 = 28;

impl GuardFlags {
    /// The additional-data stride (0..15 bytes) packed into bits 28..31.
    pub fn function_table_stride(self) -> u8 {
        ((self.bits() >> CF_FUNCTION_TABLE_SIZE_SHIFT) & 0xf) as u8
    }
}

bitflags! {
    /// Per-entry `IMAGE_GUARD_FLAG_*` bits of a gfids table entry, packed
    /// into the stride's trailing byte when a stride is present.
    #[derive(Default)]
    pub struct GfidsFlags: u8 {
        const FID_SUPPRESSED = 0x1;
        const EXPORT_SUPPRESSED = 0x2;
        const FID_LANGEXCPTHANDLER = 0x4;
        const FID_XFG = 0x8;
    }
}

/// One entry of a CF Guard function table (or the structurally identical
/// address-taken-IAT / long-jump tables).
#[derive(Debug, Clone)]
pub struct GuardFunction {
    pub rva: u32,
    pub additional_data: Vec<u8>,
    pub flags: GfidsFlags,
    pub type_based_hash: Option<u64>,
}

/// Reads `count` guard-function entries, each `4 + stride` bytes, checking
/// ascending-RVA order and (when XFG is enabled and an entry's flags include
/// `FID_XFG`) the 8-byte type hash preceding the entry's RVA in the image.
pub fn read_guard_function_table(
    image: &dyn ImageAccess,
    table_rva: u32,
    count: u32,
    stride: u8,
    xfg_enabled: bool,
    allow_virtual_data: bool,
    errors: &mut ErrorList,
) -> Result<Vec<GuardFunction>, PeError> {
    let entry_size = 4 + stride as u32;
    let table_size = entry_size * count;
    let buf = image.buffer_for(table_rva, table_size, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);

    let mut entries = Vec::with_capacity(count as usize);
    let mut last_rva: Option<u32> = None;
    let mut unsorted = false;
    for _ in 0..count {
        let rva = read_u32(&mut cursor)?.value;
        let additional_data = if stride > 0 {
            read_byte_vector(&mut cursor, stride as u64)?.value
        } else {
            Vec::new()
        };
        let flags = additional_data
            .last()
            .map(|b| GfidsFlags::from_bits_truncate(*b))
            .unwrap_or_default();

        if let Some(last) = last_rva {
            if rva < last {
                unsorted = true;
            }
        }
        last_rva = Some(rva);

        let type_based_hash = if xfg_enabled && flags.contains(GfidsFlags::FID_XFG) && rva >= 8 {
            match read_type_based_hash(image, rva, allow_virtual_data) {
                Ok(hash) => Some(hash),
                Err(_) => {
                    errors.add_error(SemanticError::InvalidXfgTypeBasedHashRva);
                    None
                }
            }
        } else {
            None
        };

        entries.push(GuardFunction {
            rva,
            additional_data,
            flags,
            type_based_hash,
        });
    }

    if unsorted {
        errors.add_error(SemanticError::UnsortedCfGuardTable);
    }

    Ok(entries)
}

fn read_type_based_hash(
    image: &dyn ImageAccess,
    entry_rva: u32,
    allow_virtual_data: bool,
) -> Result<u64, PeError> {
    let hash_rva = entry_rva - 8;
    let buf = image.buffer_for(hash_rva, 8, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let mut bytes = [0u8; 8];
    cursor.read(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::error::BoundsError;
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
            let end = start + length as usize;
            if end > self.data.len() {
                return Err(BoundsError::RvaOutOfBounds.into());
            }
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
    fn xfg_table_resolves_hash_and_flags_unsorted() {
        let mut data = vec![0u8; 0x200];
        // type-based hash for the entry at rva 0x60: 8 bytes preceding it.
        data[0x58..0x60].copy_from_slice(&0x0807_0605_0403_0201u64.to_le_bytes());

        let table_rva = 0x100u32;
        let entry_size = 5usize; // 4-byte rva + 1-byte stride carrying gfids flags
        // entry 0: rva=0x50, flags=FID_XFG (no hash since rva < 8 + ... actually 0x50 >= 8, but no hash bytes placed -> reads zero)
        data[0x100..0x104].copy_from_slice(&0x50u32.to_le_bytes());
        data[0x104] = GfidsFlags::FID_XFG.bits();
        // entry 1: rva=0x40 (descending -> triggers unsorted), no xfg
        data[0x100 + entry_size..0x104 + entry_size].copy_from_slice(&0x40u32.to_le_bytes());
        data[0x104 + entry_size] = 0;
        // entry 2: rva=0x60, flags=FID_XFG, hash resolves from data[0x58..0x60]
        data[0x100 + 2 * entry_size..0x104 + 2 * entry_size].copy_from_slice(&0x60u32.to_le_bytes());
        data[0x104 + 2 * entry_size] = GfidsFlags::FID_XFG.bits();

        let image = FakeImage { data };
        let mut errors = ErrorList::new();
        let entries =
            read_guard_function_table(&image, table_rva, 3, 1, true, false, &mut errors).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].type_based_hash, Some(0));
        assert_eq!(entries[2].type_based_hash, Some(0x0807_0605_0403_0201));
        assert!(errors.contains(SemanticError::UnsortedCfGuardTable));
    }

    #[test]
    fn function_table_stride_reads_high_nibble() {
        let flags = GuardFlags::from_bits_truncate(0x3_0000_0400);
        assert_eq!(flags.function_table_stride(), 3);
    }

    #[test]
    fn gfids_flags_detect_xfg_bit() {
        let flags = GfidsFlags::from_bits_truncate(0x9);
        assert!(flags.contains(GfidsFlags::FID_SUPPRESSED));
        assert!(flags.contains(GfidsFlags::FID_XFG));
    }
}
