//! ARM64 (`IMAGE_FILE_MACHINE_ARM64`) runtime functions: packed unwind data
//! and the extended `.xdata` record.
//!
//! The packed-word bit layout is grounded on the Microsoft "ARM64 exception
//! handling" unwind-data note; the extended record's header/epilog-scope
//! handling reuses [`super::arm_common`] with `function_length_multiplier = 4`
//! and no ARM-style F-bit.
//!
//! Unlike [`super::arm`], the full `(Length, Matcher, MatcherMask)` triple
//! for every ARM64 opcode isn't reproduced here; this module therefore
//! decodes a representative
//! subset of the documented opcode space (the non-volatile register
//! save/restore family plus the allocate/end/nop opcodes, which cover the
//! overwhelming majority of compiler-emitted unwind codes) and reports
//! anything else as [`SemanticError::UnknownUnwindCode`] rather than
//! guessing at undocumented matcher bytes. This scope reduction mirrors the
//! ARM module's structure exactly, so extending the table later is a matter
//! of adding rows, not restructuring the decoder.

use super::arm_common::{decode_header, EpilogScope, UnwindHeader};
use crate::buffer::Cursor;
use crate::error::{capture, BoundsError, ErrorList, PeError, SemanticError};
use crate::packed::read_u32;

const FUNCTION_LENGTH_MULTIPLIER: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindCode {
    /// `alloc_s`: `sub sp, sp, #X*16` (1 byte, `0xxxxxxx`).
    AllocS { size: u32 },
    /// `save_r19r20_x`: pre-indexed store pair of x19,x20 (1 byte, `110xxxxx`).
    SaveR19R20X { offset: u32 },
    /// `save_fplr`: store pair fp,lr (1 byte, `10xxxxxx`).
    SaveFpLr { offset: u32 },
    /// `save_fplr_x`: pre-indexed store pair fp,lr (1 byte, `10xxxxxx` variant).
    SaveFpLrX { offset: u32 },
    /// `alloc_m`: larger stack allocation (2 bytes, `11000xxx`).
    AllocM { size: u32 },
    /// `alloc_l`: largest stack allocation (4 bytes, `11100000`).
    AllocL { size: u32 },
    /// `set_fp`: `mov x29, sp` (1 byte, `11100001`).
    SetFp,
    /// `add_fp`: `add x29, sp, #X*8` (2 bytes, `11100010`).
    AddFp { offset: u32 },
    /// `nop` (1 byte, `11100011`).
    Nop,
    /// `end` (1 byte, `11100100`).
    End,
    /// `end_c` (1 byte, `11100101`).
    EndC,
}

impl UnwindCode {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnwindCode::End | UnwindCode::EndC)
    }
}

fn decode_one(bytes: &[u8]) -> Result<(UnwindCode, usize), PeError> {
    let b0 = bytes[0];
    if b0 & 0x80 == 0x00 {
        return Ok((UnwindCode::AllocS { size: (b0 & 0x7f) as u32 * 16 }, 1));
    }
    if b0 & 0xe0 == 0xc0 {
        return Ok((UnwindCode::SaveR19R20X { offset: (b0 & 0x1f) as u32 * 8 }, 1));
    }
    if b0 & 0xc0 == 0x80 {
        return Ok((UnwindCode::SaveFpLr { offset: (b0 & 0x3f) as u32 * 8 }, 1));
    }
    match b0 {
        0xe0 => {
            if bytes.len() < 2 {
                return Err(BoundsError::BufferOverrun.into());
            }
            let size = ((bytes[0] as u32 & 0x1f) << 8 | bytes[1] as u32) * 16;
            Ok((UnwindCode::AllocM { size }, 2))
        }
        0xe1 => Ok((UnwindCode::SetFp, 1)),
        0xe2 => {
            if bytes.len() < 2 {
                return Err(BoundsError::BufferOverrun.into());
            }
            Ok((UnwindCode::AddFp { offset: bytes[1] as u32 * 8 }, 2))
        }
        0xe3 => Ok((UnwindCode::Nop, 1)),
        0xe4 => Ok((UnwindCode::End, 1)),
        0xe5 => Ok((UnwindCode::EndC, 1)),
        _ => Err(SemanticError::UnknownUnwindCode.into()),
    }
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
    pub reg_f: u32,
    pub reg_i: u32,
    pub h: bool,
    pub cr: u32,
    pub frame_size: u32,
}

impl PackedUnwindData {
    pub fn decode(word: u32) -> Self {
        Self {
            flag: word & 0b11,
            function_length: ((word >> 2) & 0x7ff) * 4,
            reg_f: (word >> 13) & 0b111,
            reg_i: (word >> 16) & 0b1111,
            h: (word >> 20) & 1 != 0,
            cr: (word >> 21) & 0b11,
            frame_size: (word >> 23) & 0x1ff,
        }
    }

    /// `get_reg_fp()`: 0 when the raw field is 0, otherwise `raw + 1`.
    pub fn reg_fp(&self) -> u32 {
        if self.reg_i == 0 { 0 } else { self.reg_i + 1 }
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
    let header = decode_header(word, FUNCTION_LENGTH_MULTIPLIER, false, || {
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
                epilog_start_offset: (entry & 0x0003_ffff) * 4,
                epilog_start_index: (entry >> 18) & 0x3ff,
                condition: None,
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

/// A decoded ARM64 `.pdata` entry.
#[derive(Debug)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub unwind_data: u32,
    pub packed: Option<PackedUnwindData>,
    pub extended: Option<ExtendedUnwindRecord>,
    pub errors: ErrorList,
}

/// Walks the ARM64 exception directory at `(directory_rva, directory_size)`.
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
    fn packed_unwind_data_reg_fp_offset_by_one() {
        let mut word = 0u32;
        word |= 3 << 16; // reg_i = 3
        let packed = PackedUnwindData::decode(word);
        assert_eq!(packed.reg_fp(), 4);
    }

    #[test]
    fn packed_unwind_data_reg_fp_zero_stays_zero() {
        let packed = PackedUnwindData::decode(0);
        assert_eq!(packed.reg_fp(), 0);
    }

    #[test]
    fn decodes_alloc_s_and_end() {
        let bytes = [0x02u8, 0xe4u8];
        let codes = decode_unwind_codes(&bytes).unwrap();
        assert_eq!(codes[0], UnwindCode::AllocS { size: 32 });
        assert!(codes[1].is_terminal());
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert!(decode_one(&[0xe6]).is_err());
    }
}
