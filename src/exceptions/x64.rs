//! x64 (.pdata) runtime functions and their `UNWIND_INFO` records.
//!
//! Grounded on `detail/exceptions/image_runtime_function_entry.h` (header
//! layout, opcode node counts) and `exceptions/x64/x64_exception_directory-inl.h`
//! (every accessor's exact bit math, reproduced in the getters below).

use crate::buffer::Cursor;
use crate::error::{
    capture, BoundsError, CapacityError, ErrorList, PeError, SemanticError, SetterError,
    StructuralError, VersioningError,
};
use crate::packed::read_u32;
use bitflags::bitflags;

/// Maximum depth of a chained `UNWIND_INFO` sequence before traversal is
/// aborted; matches `unwind_chain_limit` upstream.
pub const UNWIND_CHAIN_LIMIT: u32 = 32;

bitflags! {
    /// `UNW_FLAG_*` bits packed into the high 5 bits of the version byte.
    #[derive(Default)]
    pub struct UnwindFlags: u8 {
        const EHANDLER = 0x1;
        const UHANDLER = 0x2;
        const CHAININFO = 0x4;
    }
}

/// One decoded `UNWIND_CODE` slot (or slot-pair/triple).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindCode {
    PushNonvol { offset_in_prolog: u8, register: u8 },
    AllocLarge { offset_in_prolog: u8, size: u32 },
    AllocSmall { offset_in_prolog: u8, size: u32 },
    SetFpreg { offset_in_prolog: u8 },
    SaveNonvol { offset_in_prolog: u8, register: u8, stack_offset: u32 },
    SaveNonvolFar { offset_in_prolog: u8, register: u8, stack_offset: u32 },
    Epilog { offset_in_prolog: u8, flags: u8 },
    Spare { offset_in_prolog: u8 },
    SaveXmm128 { offset_in_prolog: u8, register: u8, stack_offset: u32 },
    SaveXmm128Far { offset_in_prolog: u8, register: u8, stack_offset: u32 },
    PushMachframe { offset_in_prolog: u8, has_error_code: bool },
    SetFpregLarge { offset_in_prolog: u8, stack_offset: u32 },
}

impl UnwindCode {
    /// `get_rsp_decrement()`: 48 when the trapped frame pushed an error
    /// code, 40 otherwise.
    pub fn rsp_decrement(&self) -> Option<u32> {
        match self {
            UnwindCode::PushMachframe { has_error_code, .. } => {
                Some(if *has_error_code { 48 } else { 40 })
            }
            _ => None,
        }
    }
}

fn decode_unwind_codes(
    slots: &[u16],
) -> Result<(Vec<UnwindCode>, bool), PeError> {
    let mut codes = Vec::new();
    let mut i = 0usize;
    let mut seen_non_push = false;
    let mut order_violation = false;
    while i < slots.len() {
        let slot = slots[i];
        let offset_in_prolog = (slot & 0x00ff) as u8;
        let opcode_byte = (slot >> 8) as u8;
        let opcode_id = opcode_byte & 0x0f;
        let operation_info = (opcode_byte >> 4) & 0x0f;

        let next = |k: usize| -> Result<u16, PeError> {
            slots.get(k).copied().ok_or_else(|| BoundsError::BufferOverrun.into())
        };

        match opcode_id {
            0 => {
                if seen_non_push {
                    order_violation = true;
                }
                codes.push(UnwindCode::PushNonvol { offset_in_prolog, register: operation_info });
                i += 1;
            }
            1 => {
                seen_non_push = true;
                if operation_info == 0 {
                    let node = next(i + 1)?;
                    codes.push(UnwindCode::AllocLarge { offset_in_prolog, size: node as u32 * 8 });
                    i += 2;
                } else if operation_info == 1 {
                    let lo = next(i + 1)?;
                    let hi = next(i + 2)?;
                    let size = lo as u32 | ((hi as u32) << 16);
                    codes.push(UnwindCode::AllocLarge { offset_in_prolog, size });
                    i += 3;
                } else {
                    return Err(SetterError::InvalidOperationInfo.into());
                }
            }
            2 => {
                seen_non_push = true;
                codes.push(UnwindCode::AllocSmall {
                    offset_in_prolog,
                    size: operation_info as u32 * 8 + 8,
                });
                i += 1;
            }
            3 => {
                seen_non_push = true;
                codes.push(UnwindCode::SetFpreg { offset_in_prolog });
                i += 1;
            }
            4 => {
                seen_non_push = true;
                let node = next(i + 1)?;
                codes.push(UnwindCode::SaveNonvol {
                    offset_in_prolog,
                    register: operation_info,
                    stack_offset: node as u32 * 8,
                });
                i += 2;
            }
            5 => {
                seen_non_push = true;
                let lo = next(i + 1)?;
                let hi = next(i + 2)?;
                codes.push(UnwindCode::SaveNonvolFar {
                    offset_in_prolog,
                    register: operation_info,
                    stack_offset: lo as u32 | ((hi as u32) << 16),
                });
                i += 3;
            }
            6 => {
                seen_non_push = true;
                codes.push(UnwindCode::Epilog { offset_in_prolog, flags: operation_info });
                i += 1;
            }
            7 => {
                seen_non_push = true;
                codes.push(UnwindCode::Spare { offset_in_prolog });
                i += 1;
            }
            8 => {
                seen_non_push = true;
                let node = next(i + 1)?;
                codes.push(UnwindCode::SaveXmm128 {
                    offset_in_prolog,
                    register: operation_info,
                    stack_offset: node as u32 * 16,
                });
                i += 2;
            }
            9 => {
                seen_non_push = true;
                let node = next(i + 1)?;
                codes.push(UnwindCode::SaveXmm128Far {
                    offset_in_prolog,
                    register: operation_info,
                    stack_offset: node as u32,
                });
                i += 2;
            }
            10 => {
                seen_non_push = true;
                codes.push(UnwindCode::PushMachframe {
                    offset_in_prolog,
                    has_error_code: operation_info != 0,
                });
                i += 1;
            }
            11 => {
                seen_non_push = true;
                let node = next(i + 1)?;
                codes.push(UnwindCode::SetFpregLarge {
                    offset_in_prolog,
                    stack_offset: node as u32 * 16,
                });
                i += 2;
            }
            _ => {
                return Err(SemanticError::UnknownUnwindCode.into());
            }
        }
    }
    Ok((codes, order_violation))
}

/// A single `.pdata` entry and the `UNWIND_INFO` it points to.
#[derive(Debug)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
    pub unwind_info: Option<UnwindInfo>,
    pub errors: ErrorList,
}

#[derive(Debug)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: UnwindFlags,
    pub size_of_prolog: u8,
    pub frame_register: u8,
    pub scaled_frame_register_offset: u8,
    pub codes: Vec<UnwindCode>,
    pub exception_handler_rva: Option<u32>,
    /// Raw scope-table record count read immediately after
    /// `exception_handler_rva` when `load_c_specific_handlers` is set. The
    /// scope-table records themselves (handler-private SEH payload) are not
    /// decoded.
    pub c_specific_handler_record_count: Option<u32>,
    pub chained_function: Option<Box<RuntimeFunction>>,
    pub errors: ErrorList,
}

fn read_descriptor(cursor: &mut Cursor) -> Result<(u32, u32, u32), PeError> {
    let begin = read_u32(cursor)?.value;
    let end = read_u32(cursor)?.value;
    let unwind_info_rva = read_u32(cursor)?.value;
    Ok((begin, end, unwind_info_rva))
}

/// Decodes the `UNWIND_INFO` record at the current cursor position.
/// `depth` tracks how many chained links have been followed so far.
fn read_unwind_info(
    buffer_for: &impl Fn(u32, u32, bool) -> Result<crate::buffer::MemoryBuffer, PeError>,
    rva: u32,
    allow_virtual_data: bool,
    load_c_specific_handlers: bool,
    max_c_specific_records: u32,
    depth: u32,
) -> Result<UnwindInfo, PeError> {
    if rva % 4 != 0 {
        return Err(StructuralError::UnalignedUnwindInfo.into());
    }
    let mut errors = ErrorList::new();

    let header_buf = buffer_for(rva, 4, true)?;
    let mut cursor = Cursor::new(&header_buf, allow_virtual_data);
    let mut byte = [0u8; 1];
    cursor.read(&mut byte)?;
    let version_and_flags = byte[0];
    let version = version_and_flags & 0x07;
    if version != 1 && version != 2 {
        return Err(VersioningError::UnknownUnwindVersion.into());
    }
    let flags = UnwindFlags::from_bits_truncate((version_and_flags & 0xf8) >> 3);
    if flags.contains(UnwindFlags::CHAININFO)
        && (flags.contains(UnwindFlags::EHANDLER) || flags.contains(UnwindFlags::UHANDLER))
    {
        errors.add_error(SemanticError::InvalidUnwindInfoFlags);
    }
    cursor.read(&mut byte)?;
    let size_of_prolog = byte[0];
    cursor.read(&mut byte)?;
    let count_of_codes = byte[0];
    cursor.read(&mut byte)?;
    let frame_register_and_offset = byte[0];
    let frame_register = frame_register_and_offset & 0x0f;
    let scaled_frame_register_offset = frame_register_and_offset & 0xf0;

    let slot_count = count_of_codes as usize + (count_of_codes as usize % 2);
    let codes_len = slot_count * 2;
    let full_buf = buffer_for(rva, 4 + codes_len as u32, allow_virtual_data)?;
    let mut body_cursor = Cursor::new(&full_buf, allow_virtual_data);
    body_cursor.set_rpos(4)?;
    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        let mut raw = [0u8; 2];
        body_cursor.read(&mut raw)?;
        slots.push(u16::from_le_bytes(raw));
    }
    let (codes, order_violation) = capture(&mut errors, || decode_unwind_codes(&slots))
        .unwrap_or_default();
    if order_violation {
        errors.add_error(SemanticError::PushNonvolUwopOutOfOrder);
    }

    let mut exception_handler_rva = None;
    let mut c_specific_handler_record_count = None;
    let mut chained_function = None;
    if flags.contains(UnwindFlags::CHAININFO) {
        if depth >= UNWIND_CHAIN_LIMIT {
            errors.add_error(SemanticError::ChainDepthExceeded);
        } else {
            let chain_buf = buffer_for(rva, 4 + codes_len as u32 + 12, allow_virtual_data)?;
            let mut chain_cursor = Cursor::new(&chain_buf, allow_virtual_data);
            chain_cursor.set_rpos(4 + codes_len as u64)?;
            match read_descriptor(&mut chain_cursor) {
                Ok((begin, end, unwind_info_rva)) => {
                    let mut chained_errors = ErrorList::new();
                    let chained_unwind =
                        capture(&mut chained_errors, || {
                            read_unwind_info(
                                buffer_for,
                                unwind_info_rva,
                                allow_virtual_data,
                                load_c_specific_handlers,
                                max_c_specific_records,
                                depth + 1,
                            )
                        });
                    chained_function = Some(Box::new(RuntimeFunction {
                        begin_address: begin,
                        end_address: end,
                        unwind_info_address: unwind_info_rva,
                        unwind_info: chained_unwind,
                        errors: chained_errors,
                    }));
                }
                Err(_) => errors.add_error(SemanticError::InvalidChainedRuntimeFunctionEntry),
            }
        }
    } else if flags.contains(UnwindFlags::EHANDLER) || flags.contains(UnwindFlags::UHANDLER) {
        let handler_len = if load_c_specific_handlers { 4 + codes_len as u32 + 4 + 4 } else { 4 + codes_len as u32 + 4 };
        let handler_buf = buffer_for(rva, handler_len, allow_virtual_data)?;
        let mut handler_cursor = Cursor::new(&handler_buf, allow_virtual_data);
        handler_cursor.set_rpos(4 + codes_len as u64)?;
        match read_u32(&mut handler_cursor) {
            Ok(field) => exception_handler_rva = Some(field.value),
            Err(_) => errors.add_error(SemanticError::InvalidExceptionHandlerRva),
        }
        if load_c_specific_handlers {
            match read_u32(&mut handler_cursor) {
                Ok(field) => {
                    c_specific_handler_record_count = Some(field.value);
                    if field.value > max_c_specific_records {
                        errors.add_error(CapacityError::TooManyCSpecificHandlerRecords);
                    }
                }
                Err(_) => errors.add_error(SemanticError::InvalidCSpecificHandlerRecordCount),
            }
        }
    }

    Ok(UnwindInfo {
        version,
        flags,
        size_of_prolog,
        frame_register,
        scaled_frame_register_offset,
        codes,
        exception_handler_rva,
        c_specific_handler_record_count,
        chained_function,
        errors,
    })
}

/// Walks the x64 exception directory (a flat array of 12-byte descriptors)
/// at `(directory_rva, directory_size)`, decoding each entry's unwind info.
pub fn load(
    image: &dyn crate::image::ImageAccess,
    directory_rva: u32,
    directory_size: u32,
    allow_virtual_data: bool,
    include_headers: bool,
    load_c_specific_handlers: bool,
    max_c_specific_records: u32,
) -> Result<Vec<RuntimeFunction>, PeError> {
    const ENTRY_SIZE: u32 = 12;
    let entry_count = directory_size / ENTRY_SIZE;
    let table_buf = image.buffer_for(directory_rva, directory_size, include_headers)?;
    let mut cursor = Cursor::new(&table_buf, allow_virtual_data);

    let mut functions = Vec::new();
    for _ in 0..entry_count {
        let (begin, end, unwind_info_rva) = read_descriptor(&mut cursor)?;
        if begin == 0 && end == 0 && unwind_info_rva == 0 {
            continue;
        }
        let mut errors = ErrorList::new();
        let buffer_for = |rva: u32, len: u32, headers: bool| image.buffer_for(rva, len, headers);
        let unwind_info = capture(&mut errors, || {
            read_unwind_info(
                &buffer_for,
                unwind_info_rva,
                allow_virtual_data,
                load_c_specific_handlers,
                max_c_specific_records,
                0,
            )
        });
        functions.push(RuntimeFunction {
            begin_address: begin,
            end_address: end,
            unwind_info_address: unwind_info_rva,
            unwind_info,
            errors,
        });
    }
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::image::{DataDirectory, ImageAccess, Machine, SectionRef};

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
    fn two_runtime_functions_one_with_truncated_chain() {
        let mut data = vec![0u8; 0x3108];

        // directory table at rva 0x1000: two 12-byte entries.
        data[0x1000..0x1004].copy_from_slice(&0x5000u32.to_le_bytes());
        data[0x1004..0x1008].copy_from_slice(&0x5010u32.to_le_bytes());
        data[0x1008..0x100c].copy_from_slice(&0x3000u32.to_le_bytes());
        data[0x100c..0x1010].copy_from_slice(&0x5010u32.to_le_bytes());
        data[0x1010..0x1014].copy_from_slice(&0x5020u32.to_le_bytes());
        data[0x1014..0x1018].copy_from_slice(&0x3100u32.to_le_bytes());

        // entry A: ehandler, decodes cleanly with a real handler rva.
        data[0x3000] = 0x09; // version 1 | EHANDLER << 3
        data[0x3001] = 4; // size_of_prolog
        data[0x3002] = 2; // count_of_codes
        data[0x3003] = 0;
        data[0x3004] = 0x10; // save_xmm128_far, offset_in_prolog
        data[0x3005] = 0x69; // opcode_id=9, operation_info=6
        data[0x3006..0x3008].copy_from_slice(&5u16.to_le_bytes());
        data[0x3008..0x300c].copy_from_slice(&0x1234_5678u32.to_le_bytes());

        // entry B: chaininfo, codes decode cleanly but the chained descriptor
        // is truncated out of the buffer entirely.
        data[0x3100] = 0x21; // version 1 | CHAININFO << 3
        data[0x3101] = 0;
        data[0x3102] = 2;
        data[0x3103] = 0;
        data[0x3104] = 0x00; // push_nonvol reg=5
        data[0x3105] = 0x50;
        data[0x3106] = 0x00; // alloc_small info=0 -> size 8
        data[0x3107] = 0x02;

        let image = FakeImage { data };
        let functions = load(&image, 0x1000, 24, false, false, false, 0xfffff).unwrap();

        assert_eq!(functions.len(), 2);

        let entry_a = &functions[0];
        assert!(entry_a.errors.is_empty());
        let unwind_a = entry_a.unwind_info.as_ref().unwrap();
        assert!(unwind_a.flags.contains(UnwindFlags::EHANDLER));
        assert_eq!(unwind_a.exception_handler_rva, Some(0x1234_5678));
        assert_eq!(unwind_a.codes.len(), 1);

        let entry_b = &functions[1];
        assert!(entry_b.unwind_info.is_none());
        assert!(!entry_b.errors.is_empty());
    }

    #[test]
    fn c_specific_handler_record_count_is_read_and_capped() {
        let mut data = vec![0u8; 0x3020];

        data[0x1000..0x1004].copy_from_slice(&0x5000u32.to_le_bytes());
        data[0x1004..0x1008].copy_from_slice(&0x5010u32.to_le_bytes());
        data[0x1008..0x100c].copy_from_slice(&0x3000u32.to_le_bytes());

        data[0x3000] = 0x09; // version 1 | EHANDLER << 3
        data[0x3001] = 4; // size_of_prolog
        data[0x3002] = 0; // count_of_codes
        data[0x3003] = 0;
        data[0x3004..0x3008].copy_from_slice(&0x1234_5678u32.to_le_bytes()); // exception_handler_rva
        data[0x3008..0x300c].copy_from_slice(&10u32.to_le_bytes()); // scope table count

        let image = FakeImage { data };

        let capped = load(&image, 0x1000, 12, false, false, true, 5).unwrap();
        let unwind = capped[0].unwind_info.as_ref().unwrap();
        assert_eq!(unwind.c_specific_handler_record_count, Some(10));
        assert!(unwind.errors.contains(CapacityError::TooManyCSpecificHandlerRecords));

        let uncapped = load(&image, 0x1000, 12, false, false, true, 20).unwrap();
        let unwind = uncapped[0].unwind_info.as_ref().unwrap();
        assert_eq!(unwind.c_specific_handler_record_count, Some(10));
        assert!(!unwind.errors.has_errors());

        let ignored = load(&image, 0x1000, 12, false, false, false, 0xfffff).unwrap();
        let unwind = ignored[0].unwind_info.as_ref().unwrap();
        assert_eq!(unwind.c_specific_handler_record_count, None);
    }

    #[test]
    fn decodes_push_nonvol_and_alloc_small() {
        // push_nonvol(reg=5) then alloc_small(info=2 -> size 24)
        let slots = [0x5000u16, 0x2100u16];
        let (codes, order_violation) = decode_unwind_codes(&slots).unwrap();
        assert!(!order_violation);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0], UnwindCode::PushNonvol { offset_in_prolog: 0, register: 5 });
        assert_eq!(codes[1], UnwindCode::AllocSmall { offset_in_prolog: 0, size: 24 });
    }

    #[test]
    fn flags_push_nonvol_out_of_order() {
        // alloc_small first, then push_nonvol afterwards
        let slots = [0x2000u16, 0x0000u16];
        let (_, order_violation) = decode_unwind_codes(&slots).unwrap();
        assert!(order_violation);
    }

    #[test]
    fn push_machframe_rsp_decrement() {
        let code = UnwindCode::PushMachframe { offset_in_prolog: 0, has_error_code: true };
        assert_eq!(code.rsp_decrement(), Some(48));
        let code = UnwindCode::PushMachframe { offset_in_prolog: 0, has_error_code: false };
        assert_eq!(code.rsp_decrement(), Some(40));
    }

    #[test]
    fn unknown_opcode_id_errors() {
        let slots = [0x0f00u16];
        assert!(decode_unwind_codes(&slots).is_err());
    }
}
