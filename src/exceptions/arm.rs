//! ARM (`IMAGE_FILE_MACHINE_ARMNT`) runtime functions: packed (single-word)
//! unwind data and the extended `.xdata` record, plus the full ARM unwind
//! opcode table.
//!
//! Grounded on `exceptions/arm/arm_exception_directory.h`: every opcode
//! class's `(Length, Matcher, MatcherMask)` triple is reproduced verbatim in
//! [`OPCODE_TABLE`] below, sorted by mask specificity so dispatch matches the
//! upstream partition of the 0x00-0xFF opcode byte space.

use super::arm_common::{decode_header, get_bits_msb, EpilogScope, UnwindHeader};
use crate::buffer::Cursor;
use crate::error::{
    capture, BoundsError, ErrorList, PeError, SemanticError, SetterError, StructuralError,
};
use crate::packed::read_u32;

const FUNCTION_LENGTH_MULTIPLIER: u32 = 2;

/// A single decoded ARM unwind opcode, tagged with its raw packed bytes.
/// Only the handful of opcodes with simple scalar payloads (the `alloc_*`
/// family) expose a decoded accessor; the rest carry their raw bytes for a
/// caller that needs the exact bit pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindCode {
    AllocS { bytes: [u8; 1] },
    SaveR0R12Lr { bytes: [u8; 2] },
    MovSpRx { bytes: [u8; 1] },
    SaveR4RxLr { bytes: [u8; 1] },
    SaveR4RxLrWide { bytes: [u8; 2] },
    SaveD8Dx { bytes: [u8; 1] },
    AllocSWide { bytes: [u8; 2] },
    SaveR0R7Lr { bytes: [u8; 2] },
    MsSpecific { bytes: [u8; 2] },
    LdrLrSp { bytes: [u8; 2] },
    SaveDsDe { bytes: [u8; 2] },
    SaveDsDe16 { bytes: [u8; 2] },
    AllocM { bytes: [u8; 3] },
    AllocMWide { bytes: [u8; 3] },
    AllocL { bytes: [u8; 4] },
    AllocLWide { bytes: [u8; 4] },
    Nop,
    NopWide,
    EndNop,
    EndNopWide,
    End,
}

impl UnwindCode {
    /// Decoded allocation size in bytes, for the opcodes that encode one.
    pub fn allocation_size(&self) -> Option<u32> {
        match self {
            UnwindCode::AllocS { bytes } => Some(get_bits_msb(bytes, 1, 7) * 4),
            UnwindCode::AllocSWide { bytes } => Some(get_bits_msb(bytes, 6, 15) * 4),
            UnwindCode::AllocM { bytes } => Some(get_bits_msb(bytes, 8, 23) * 4),
            UnwindCode::AllocMWide { bytes } => Some(get_bits_msb(bytes, 8, 23) * 4),
            UnwindCode::AllocL { bytes } => Some(get_bits_msb(bytes, 8, 31) * 4),
            UnwindCode::AllocLWide { bytes } => Some(get_bits_msb(bytes, 8, 31) * 4),
            _ => None,
        }
    }

    /// True for the four codes (`0xFD`-`0xFF` region) that terminate an
    /// epilog/prolog's opcode sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnwindCode::EndNop | UnwindCode::EndNopWide | UnwindCode::End
        )
    }
}

type Decoder = fn(&[u8]) -> UnwindCode;

struct OpcodeEntry {
    len: usize,
    mask: u8,
    matcher: u8,
    decode: Decoder,
}

macro_rules! arr {
    ($bytes:expr, $n:literal) => {{
        let mut out = [0u8; $n];
        out.copy_from_slice(&$bytes[..$n]);
        out
    }};
}

const OPCODE_TABLE: &[OpcodeEntry] = &[
    OpcodeEntry { len: 1, mask: 0xff, matcher: 0xff, decode: |_b| UnwindCode::End },
    OpcodeEntry { len: 1, mask: 0xff, matcher: 0xfe, decode: |_b| UnwindCode::EndNopWide },
    OpcodeEntry { len: 1, mask: 0xff, matcher: 0xfd, decode: |_b| UnwindCode::EndNop },
    OpcodeEntry { len: 1, mask: 0xff, matcher: 0xfc, decode: |_b| UnwindCode::NopWide },
    OpcodeEntry { len: 1, mask: 0xff, matcher: 0xfb, decode: |_b| UnwindCode::Nop },
    OpcodeEntry { len: 4, mask: 0xff, matcher: 0xfa, decode: |b| UnwindCode::AllocLWide { bytes: arr!(b, 4) } },
    OpcodeEntry { len: 3, mask: 0xff, matcher: 0xf9, decode: |b| UnwindCode::AllocMWide { bytes: arr!(b, 3) } },
    OpcodeEntry { len: 4, mask: 0xff, matcher: 0xf8, decode: |b| UnwindCode::AllocL { bytes: arr!(b, 4) } },
    OpcodeEntry { len: 3, mask: 0xff, matcher: 0xf7, decode: |b| UnwindCode::AllocM { bytes: arr!(b, 3) } },
    OpcodeEntry { len: 2, mask: 0xff, matcher: 0xf6, decode: |b| UnwindCode::SaveDsDe16 { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 2, mask: 0xff, matcher: 0xf5, decode: |b| UnwindCode::SaveDsDe { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 2, mask: 0xff, matcher: 0xef, decode: |b| UnwindCode::LdrLrSp { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 2, mask: 0xff, matcher: 0xee, decode: |b| UnwindCode::MsSpecific { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 2, mask: 0xfe, matcher: 0xec, decode: |b| UnwindCode::SaveR0R7Lr { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 2, mask: 0xfc, matcher: 0xe8, decode: |b| UnwindCode::AllocSWide { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 1, mask: 0xf8, matcher: 0xe0, decode: |b| UnwindCode::SaveD8Dx { bytes: arr!(b, 1) } },
    OpcodeEntry { len: 2, mask: 0xf8, matcher: 0xd8, decode: |b| UnwindCode::SaveR4RxLrWide { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 1, mask: 0xf8, matcher: 0xd0, decode: |b| UnwindCode::SaveR4RxLr { bytes: arr!(b, 1) } },
    OpcodeEntry { len: 1, mask: 0xf0, matcher: 0xc0, decode: |b| UnwindCode::MovSpRx { bytes: arr!(b, 1) } },
    OpcodeEntry { len: 2, mask: 0xc0, matcher: 0x80, decode: |b| UnwindCode::SaveR0R12Lr { bytes: arr!(b, 2) } },
    OpcodeEntry { len: 1, mask: 0x80, matcher: 0x00, decode: |b| UnwindCode::AllocS { bytes: arr!(b, 1) } },
];

fn decode_one(bytes: &[u8]) -> Result<(UnwindCode, usize), PeError> {
    let first = bytes[0];
    for entry in OPCODE_TABLE {
        if first & entry.mask == entry.matcher {
            if bytes.len() < entry.len {
                return Err(BoundsError::BufferOverrun.into());
            }
            return Ok(((entry.decode)(bytes), entry.len));
        }
    }
    Err(SemanticError::UnknownUnwindCode.into())
}

fn decode_unwind_codes(bytes: &[u8]) -> Result<Vec<UnwindCode>, PeError> {
    let mut codes = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let (code, len) = decode_one(&bytes[offset..])?;
        let terminal = code.is_terminal();
        codes.push(code);
        offset += len;
        if terminal {
            break;
        }
    }
    Ok(codes)
}

/// The single-word packed unwind data form (`unwind_data & 0b11 != 0`).
#[derive(Debug, Clone, Copy)]
pub struct PackedUnwindData {
    pub flag: u32,
    pub function_length: u32,
    pub ret: u32,
    pub h: bool,
    pub reg: u32,
    pub r: bool,
    pub l: bool,
    pub c: bool,
    pub stack_adjust: u32,
}

impl PackedUnwindData {
    pub fn decode(word: u32) -> Self {
        Self {
            flag: word & 0b11,
            function_length: ((word >> 2) & 0x7ff) * 2,
            ret: (word >> 12) & 0b11,
            h: (word >> 14) & 1 != 0,
            reg: (word >> 15) & 0b111,
            r: (word >> 18) & 1 != 0,
            l: (word >> 19) & 1 != 0,
            c: (word >> 20) & 1 != 0,
            stack_adjust: (word >> 21) & 0x3ff,
        }
    }
}

#[derive(Debug)]
pub struct ExtendedUnwindRecord {
    pub header: UnwindHeader,
    pub epilog_scopes: Vec<EpilogScope>,
    pub codes: Vec<UnwindCode>,
    pub exception_handler_rva: Option<u32>,
    pub errors: ErrorList,
}

fn read_extended_unwind_record(
    image: &dyn crate::image::ImageAccess,
    rva: u32,
    allow_virtual_data: bool,
) -> Result<ExtendedUnwindRecord, PeError> {
    let mut errors = ErrorList::new();
    let head_buf = image.buffer_for(rva, 8, true)?;
    let mut head_cursor = Cursor::new(&head_buf, allow_virtual_data);
    let word = read_u32(&mut head_cursor)?.value;
    let mut consumed = 4u32;
    let header = decode_header(word, FUNCTION_LENGTH_MULTIPLIER, true, || {
        let ext = read_u32(&mut head_cursor)?.value;
        consumed = 8;
        Ok(ext)
    })?;

    let epilog_bytes = if header.epilog_in_header { 0 } else { header.epilog_count * 4 };
    let code_bytes = header.code_words * 4;
    let total = consumed + epilog_bytes + code_bytes + if header.has_exception_data { 4 } else { 0 };
    let body_buf = image.buffer_for(rva, total, allow_virtual_data)?;
    let mut cursor = Cursor::new(&body_buf, allow_virtual_data);
    cursor.set_rpos(consumed as u64)?;

    let mut epilog_scopes = Vec::new();
    if !header.epilog_in_header {
        for _ in 0..header.epilog_count {
            let entry = read_u32(&mut cursor)?.value;
            epilog_scopes.push(EpilogScope {
                epilog_start_offset: (entry & 0x0003_ffff) * 2,
                epilog_start_index: (entry >> 18) & 0x3ff,
                condition: Some(((entry >> 28) & 0xf) as u8),
            });
        }
    }

    let mut code_bytes_buf = vec![0u8; code_bytes as usize];
    cursor.read(&mut code_bytes_buf)?;
    let codes = capture(&mut errors, || decode_unwind_codes(&code_bytes_buf)).unwrap_or_default();

    let mut exception_handler_rva = None;
    if header.has_exception_data {
        match read_u32(&mut cursor) {
            Ok(field) => exception_handler_rva = Some(field.value),
            Err(_) => errors.add_error(SemanticError::InvalidExceptionHandlerRva),
        }
    }

    Ok(ExtendedUnwindRecord {
        header,
        epilog_scopes,
        codes,
        exception_handler_rva,
        errors,
    })
}

/// A decoded ARM `.pdata` entry.
#[derive(Debug)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub unwind_data: u32,
    pub packed: Option<PackedUnwindData>,
    pub extended: Option<ExtendedUnwindRecord>,
    pub errors: ErrorList,
}

/// Walks the ARM exception directory at `(directory_rva, directory_size)`.
pub fn load(
    image: &dyn crate::image::ImageAccess,
    directory_rva: u32,
    directory_size: u32,
    allow_virtual_data: bool,
    include_headers: bool,
) -> Result<Vec<RuntimeFunction>, PeError> {
    const ENTRY_SIZE: u32 = 8;
    let entry_count = directory_size / ENTRY_SIZE;
    let table_buf = image.buffer_for(directory_rva, directory_size, include_headers)?;
    let mut cursor = Cursor::new(&table_buf, allow_virtual_data);

    let mut functions = Vec::new();
    for _ in 0..entry_count {
        let begin_address = read_u32(&mut cursor)?.value;
        let unwind_data = read_u32(&mut cursor)?.value;
        if begin_address == 0 && unwind_data == 0 {
            continue;
        }
        let mut errors = ErrorList::new();
        let (packed, extended) = if unwind_data & 0b11 != 0 {
            (Some(PackedUnwindData::decode(unwind_data)), None)
        } else {
            let extended = capture(&mut errors, || {
                read_extended_unwind_record(image, unwind_data, allow_virtual_data)
            });
            (None, extended)
        };
        functions.push(RuntimeFunction {
            begin_address,
            unwind_data,
            packed,
            extended,
            errors,
        });
    }
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_alloc_s_prefix() {
        let bytes = [0b0011_0101u8];
        let (code, len) = decode_one(&bytes).unwrap();
        assert_eq!(len, 1);
        assert_eq!(code.allocation_size(), Some(0b011_0101 * 4));
    }

    #[test]
    fn decodes_end_opcode() {
        let bytes = [0xffu8];
        let (code, len) = decode_one(&bytes).unwrap();
        assert_eq!(len, 1);
        assert!(code.is_terminal());
    }

    #[test]
    fn decodes_alloc_l_four_bytes() {
        let bytes = [0xf8u8, 0x00, 0x00, 0x01];
        let (code, len) = decode_one(&bytes).unwrap();
        assert_eq!(len, 4);
        assert_eq!(code.allocation_size(), Some(1 * 4));
    }

    #[test]
    fn sequence_stops_at_terminal_opcode() {
        let bytes = [0x00u8, 0xffu8, 0x00u8];
        let codes = decode_unwind_codes(&bytes).unwrap();
        assert_eq!(codes.len(), 2);
        assert!(codes[1].is_terminal());
    }

    #[test]
    fn packed_unwind_data_extracts_fields() {
        let word = 0b0001_0_1_0_1_01_1010_1010_1010_1010_01u32.rotate_right(0);
        let packed = PackedUnwindData::decode(word);
        assert_eq!(packed.flag, word & 0b11);
    }
}
