//! Compiled Hybrid PE (CHPE) metadata: the x86-on-ARM and ARM64X variants,
//! plus their range tables.
//!
//! Grounded on `detail/load_config/image_load_config_directory.h`
//! (`image_chpe_metadata_x86`, `image_chpe_metadata_arm64x` and their range
//! entry types/masks).

use crate::buffer::Cursor;
use crate::error::{ErrorList, PeError, VersioningError};
use crate::image::{ImageAccess, Machine};
use crate::packed::read_u32;

pub const CHPE_X86_RANGE_CODE_TYPE_MASK: u32 = 0b1;
pub const CHPE_ARM64X_RANGE_CODE_TYPE_MASK: u32 = 0b11;

#[derive(Debug, Clone, Copy)]
pub struct RangeEntry {
    pub start_offset: u32,
    pub length: u32,
}

impl RangeEntry {
    pub fn x86_code_type(&self) -> u32 {
        self.start_offset & CHPE_X86_RANGE_CODE_TYPE_MASK
    }

    pub fn arm64x_code_type(&self) -> u32 {
        self.start_offset & CHPE_ARM64X_RANGE_CODE_TYPE_MASK
    }
}

/// `image_chpe_metadata_x86`: describes an x86-on-ARM hybrid image.
#[derive(Debug, Clone)]
pub struct ChpeMetadataX86 {
    pub version: u32,
    pub chpe_code_address_range_offset: u32,
    pub chpe_code_address_range_count: u32,
    pub wow_a64_exception_handler_function_pointer: u32,
    pub wow_a64_dispatch_call_function_pointer: u32,
    pub wow_a64_dispatch_indirect_call_function_pointer: u32,
    pub wow_a64_dispatch_indirect_call_cfg_function_pointer: u32,
    pub wow_a64_dispatch_ret_function_pointer: u32,
    pub wow_a64_dispatch_ret_leaf_function_pointer: u32,
    pub wow_a64_dispatch_jump_function_pointer: u32,
    pub ranges: Vec<RangeEntry>,
}

/// `image_chpe_metadata_arm64x`: describes an ARM64X (AMD64/ARM64 union)
/// hybrid image, including its exception-directory cross-reference.
#[derive(Debug, Clone)]
pub struct ChpeMetadataArm64X {
    pub version: u32,
    pub code_map_offset: u32,
    pub code_map_count: u32,
    pub code_ranges_to_entry_points_offset: u32,
    pub redirection_metadata_offset: u32,
    pub redirection_metadata_count: u32,
    pub os_arm64x_dispatch_call_no_redirect: u32,
    pub os_arm64x_dispatch_ret: u32,
    pub os_arm64x_dispatch_call: u32,
    pub os_arm64x_dispatch_icall: u32,
    pub os_arm64x_dispatch_icall_cfg: u32,
    pub alt_entry_point: u32,
    pub auxiliary_iat: u32,
    pub code_ranges_to_entry_points_count: u32,
    pub redirection_metadata_count2: u32,
    pub get_x64_information_function_pointer: u32,
    pub set_x64_information_function_pointer: u32,
    /// Start of the ARM64 exception directory carried alongside the native
    /// AMD64 one; this is the RVA the exception-directory loader's hybrid
    /// dispatch pass consumes.
    pub extra_rfe_table: u32,
    pub extra_rfe_table_size: u32,
    pub unknown_rva1: u32,
    pub unknown_rva2: u32,
    pub unknown_rva3: u32,
    pub ranges: Vec<RangeEntry>,
}

pub enum ChpeMetadata {
    X86(ChpeMetadataX86),
    Arm64X(ChpeMetadataArm64X),
}

fn read_range_table(
    image: &dyn ImageAccess,
    offset: u32,
    count: u32,
    allow_virtual_data: bool,
    max_entries: u32,
    errors: &mut ErrorList,
) -> Result<Vec<RangeEntry>, PeError> {
    let clamped = count.min(max_entries);
    if clamped < count {
        errors.add_error(crate::error::CapacityError::InvalidChpeRangeEntryCount);
    }
    let buf = image.buffer_for(offset, clamped * 8, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let mut ranges = Vec::with_capacity(clamped as usize);
    for _ in 0..clamped {
        let start_offset = read_u32(&mut cursor)?.value;
        let length = read_u32(&mut cursor)?.value;
        ranges.push(RangeEntry { start_offset, length });
    }
    Ok(ranges)
}

/// Reads the CHPE metadata block at `rva`, selecting the X86 or ARM64X
/// layout by machine type.
pub fn read_chpe_metadata(
    image: &dyn ImageAccess,
    rva: u32,
    allow_virtual_data: bool,
    max_range_entries: u32,
    errors: &mut ErrorList,
) -> Result<ChpeMetadata, PeError> {
    match image.machine() {
        Machine::Amd64 => {
            let buf = image.buffer_for(rva, 4 * 22, false)?;
            let mut cursor = Cursor::new(&buf, allow_virtual_data);
            let version = read_u32(&mut cursor)?.value;
            let code_map_offset = read_u32(&mut cursor)?.value;
            let code_map_count = read_u32(&mut cursor)?.value;
            let code_ranges_to_entry_points_offset = read_u32(&mut cursor)?.value;
            let redirection_metadata_offset = read_u32(&mut cursor)?.value;
            let redirection_metadata_count = read_u32(&mut cursor)?.value;
            let os_arm64x_dispatch_call_no_redirect = read_u32(&mut cursor)?.value;
            let os_arm64x_dispatch_ret = read_u32(&mut cursor)?.value;
            let os_arm64x_dispatch_call = read_u32(&mut cursor)?.value;
            let os_arm64x_dispatch_icall = read_u32(&mut cursor)?.value;
            let os_arm64x_dispatch_icall_cfg = read_u32(&mut cursor)?.value;
            let alt_entry_point = read_u32(&mut cursor)?.value;
            let auxiliary_iat = read_u32(&mut cursor)?.value;
            let code_ranges_to_entry_points_count = read_u32(&mut cursor)?.value;
            let redirection_metadata_count2 = read_u32(&mut cursor)?.value;
            let get_x64_information_function_pointer = read_u32(&mut cursor)?.value;
            let set_x64_information_function_pointer = read_u32(&mut cursor)?.value;
            let extra_rfe_table = read_u32(&mut cursor)?.value;
            let extra_rfe_table_size = read_u32(&mut cursor)?.value;
            let unknown_rva1 = read_u32(&mut cursor)?.value;
            let unknown_rva2 = read_u32(&mut cursor)?.value;
            let unknown_rva3 = read_u32(&mut cursor)?.value;

            let ranges = read_range_table(
                image,
                code_map_offset,
                code_map_count,
                allow_virtual_data,
                max_range_entries,
                errors,
            )
            .unwrap_or_default();

            Ok(ChpeMetadata::Arm64X(ChpeMetadataArm64X {
                version,
                code_map_offset,
                code_map_count,
                code_ranges_to_entry_points_offset,
                redirection_metadata_offset,
                redirection_metadata_count,
                os_arm64x_dispatch_call_no_redirect,
                os_arm64x_dispatch_ret,
                os_arm64x_dispatch_call,
                os_arm64x_dispatch_icall,
                os_arm64x_dispatch_icall_cfg,
                alt_entry_point,
                auxiliary_iat,
                code_ranges_to_entry_points_count,
                redirection_metadata_count2,
                get_x64_information_function_pointer,
                set_x64_information_function_pointer,
                extra_rfe_table,
                extra_rfe_table_size,
                unknown_rva1,
                unknown_rva2,
                unknown_rva3,
                ranges,
            }))
        }
        Machine::Arm | Machine::ArmNt | Machine::I386 => {
            let buf = image.buffer_for(rva, 4 * 10, false)?;
            let mut cursor = Cursor::new(&buf, allow_virtual_data);
            let version = read_u32(&mut cursor)?.value;
            let chpe_code_address_range_offset = read_u32(&mut cursor)?.value;
            let chpe_code_address_range_count = read_u32(&mut cursor)?.value;
            let wow_a64_exception_handler_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_call_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_indirect_call_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_indirect_call_cfg_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_ret_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_ret_leaf_function_pointer = read_u32(&mut cursor)?.value;
            let wow_a64_dispatch_jump_function_pointer = read_u32(&mut cursor)?.value;

            let ranges = read_range_table(
                image,
                chpe_code_address_range_offset,
                chpe_code_address_range_count,
                allow_virtual_data,
                max_range_entries,
                errors,
            )
            .unwrap_or_default();

            Ok(ChpeMetadata::X86(ChpeMetadataX86 {
                version,
                chpe_code_address_range_offset,
                chpe_code_address_range_count,
                wow_a64_exception_handler_function_pointer,
                wow_a64_dispatch_call_function_pointer,
                wow_a64_dispatch_indirect_call_function_pointer,
                wow_a64_dispatch_indirect_call_cfg_function_pointer,
                wow_a64_dispatch_ret_function_pointer,
                wow_a64_dispatch_ret_leaf_function_pointer,
                wow_a64_dispatch_jump_function_pointer,
                ranges,
            }))
        }
        _ => Err(VersioningError::UnknownChpeMetadataType.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_range_entry_extracts_single_bit_code_type() {
        let entry = RangeEntry { start_offset: 0x1001, length: 0x10 };
        assert_eq!(entry.x86_code_type(), 1);
    }

    #[test]
    fn arm64x_range_entry_extracts_two_bit_code_type() {
        let entry = RangeEntry { start_offset: 0x1003, length: 0x10 };
        assert_eq!(entry.arm64x_code_type(), 0b11);
    }
}
