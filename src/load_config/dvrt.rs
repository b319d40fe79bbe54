//! Dynamic Value Relocation Table (DVRT): the `guard_rf_*`/ARM64X/function
//! override fixup records applied by the loader after relocation.
//!
//! Grounded on `load_config/load_config_directory.h` and
//! `detail/load_config/image_load_config_directory.h` (symbol table,
//! `image_dynamic_relocation[_v2]`, `image_arm64x_dynamic_relocation`,
//! `image_function_override_*`, `image_bdd_*`) plus `bit_stream.h` for the
//! epilogue branch-descriptor bitmap's bit order.

use crate::buffer::Cursor;
use crate::error::{
    capture, BoundsError, ErrorList, PeError, SemanticError, StructuralError, VersioningError,
};
use crate::image::ImageAccess;
use crate::packed::{read_byte_vector, read_u16, read_u32, read_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicRelocationSymbol {
    GuardRfPrologue,
    GuardRfEpilogue,
    GuardImportControlTransfer,
    GuardIndirControlTransfer,
    GuardSwitchtableBranch,
    GuardArm64x,
    FunctionOverride,
    Unknown(u64),
}

impl DynamicRelocationSymbol {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => Self::GuardRfPrologue,
            2 => Self::GuardRfEpilogue,
            3 => Self::GuardImportControlTransfer,
            4 => Self::GuardIndirControlTransfer,
            5 => Self::GuardSwitchtableBranch,
            6 => Self::GuardArm64x,
            7 => Self::FunctionOverride,
            other => Self::Unknown(other),
        }
    }
}

/// One page's worth of fixups: an `image_base_relocation` header (page RVA +
/// block size) followed by fixups packed at `fixup_width` bytes each.
#[derive(Debug, Clone)]
pub struct BaseRelocationBlock {
    pub page_rva: u32,
    pub fixups: Vec<u32>,
}

fn read_base_relocation_blocks(
    cursor: &mut Cursor,
    total_bytes: u32,
    fixup_width: u32,
    errors: &mut ErrorList,
) -> Result<Vec<BaseRelocationBlock>, PeError> {
    let end = cursor.rpos() + total_bytes as u64;
    let mut blocks = Vec::new();
    while cursor.rpos() < end {
        let page_rva = read_u32(cursor)?.value;
        let size_of_block = read_u32(cursor)?.value;
        if size_of_block < 8 || (size_of_block - 8) % fixup_width != 0 {
            errors.add_error(StructuralError::InvalidBaseRelocation);
            break;
        }
        let fixup_count = (size_of_block - 8) / fixup_width;
        let mut fixups = Vec::with_capacity(fixup_count as usize);
        for _ in 0..fixup_count {
            let raw = if fixup_width == 2 {
                read_u16(cursor)?.value as u32
            } else {
                read_u32(cursor)?.value
            };
            fixups.push(raw);
        }
        blocks.push(BaseRelocationBlock { page_rva, fixups });
    }
    Ok(blocks)
}

pub fn import_control_transfer_iat_index(raw: u32) -> u32 {
    (raw >> 13) & 0x7_ffff
}

pub fn import_control_transfer_is_indirect_call(raw: u32) -> bool {
    (raw >> 12) & 1 != 0
}

pub fn indir_control_transfer_is_indirect_call(raw: u32) -> bool {
    (raw >> 12) & 1 != 0
}

pub fn indir_control_transfer_is_rex_w_prefix(raw: u32) -> bool {
    (raw >> 13) & 1 != 0
}

pub fn indir_control_transfer_is_cfg_check(raw: u32) -> bool {
    (raw >> 14) & 1 != 0
}

pub fn switchtable_branch_register(raw: u32) -> u8 {
    ((raw >> 12) & 0xf) as u8
}

/// `arm64x_dynamic_relocation::type`: the low 2 bits of `meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arm64XFixup {
    ZeroFill { size: u8 },
    CopyData { size: u8, data: Vec<u8> },
    AddDelta { multiplier: u8, minus: bool, delta: i32 },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Arm64XEntry {
    pub page_relative_offset: u16,
    pub fixup: Arm64XFixup,
}

fn read_arm64x_entries(
    cursor: &mut Cursor,
    total_bytes: u32,
) -> Result<Vec<Arm64XEntry>, PeError> {
    let end = cursor.rpos() + total_bytes as u64;
    let mut entries = Vec::new();
    while cursor.rpos() < end {
        let metadata = read_u16(cursor)?.value;
        let page_relative_offset = metadata & 0x0fff;
        let meta = ((metadata >> 12) & 0xf) as u8;
        let fixup = match meta & 0b11 {
            0b00 => Arm64XFixup::ZeroFill { size: 1u8 << (meta >> 2) },
            0b01 => {
                let size = 1u8 << (meta >> 2);
                let data = read_byte_vector(cursor, size as u64)?.value;
                Arm64XFixup::CopyData { size, data }
            }
            0b10 => {
                let multiplier = if meta & 0b1000 != 0 { 8 } else { 4 };
                let minus = meta & 0b0100 != 0;
                let raw = read_u16(cursor)?.value as i32;
                Arm64XFixup::AddDelta { multiplier, minus, delta: raw * multiplier as i32 }
            }
            _ => Arm64XFixup::Unknown,
        };
        entries.push(Arm64XEntry { page_relative_offset, fixup });
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct BddNode {
    pub left: u16,
    pub right: u16,
    pub value: u32,
}

#[derive(Debug, Clone)]
pub struct BddInfo {
    pub version: u32,
    pub nodes: Vec<BddNode>,
}

fn read_bdd_info(cursor: &mut Cursor, total_bytes: u32) -> Result<BddInfo, PeError> {
    let version = read_u32(cursor)?.value;
    let bdd_size = read_u32(cursor)?.value;
    if version != 1 {
        return Err(VersioningError::UnknownBddInfoEntryVersion.into());
    }
    let bdd_size = bdd_size.min(total_bytes.saturating_sub(8));
    let node_count = bdd_size / 8;
    let mut nodes = Vec::with_capacity(node_count as usize);
    for _ in 0..node_count {
        let left = read_u16(cursor)?.value;
        let right = read_u16(cursor)?.value;
        let value = read_u32(cursor)?.value;
        nodes.push(BddNode { left, right, value });
    }
    Ok(BddInfo { version, nodes })
}

#[derive(Debug, Clone)]
pub struct FunctionOverrideItem {
    pub original_rva: u32,
    pub rvas: Vec<u32>,
    pub base_relocations: Vec<BaseRelocationBlock>,
}

#[derive(Debug)]
pub struct FunctionOverrideRecord {
    pub items: Vec<FunctionOverrideItem>,
    pub bdd_info: BddInfo,
    pub errors: ErrorList,
}

fn read_function_override_record(
    cursor: &mut Cursor,
    record_size: u32,
) -> Result<FunctionOverrideRecord, PeError> {
    let start = cursor.rpos();
    let func_override_size = read_u32(cursor)?.value;
    let func_override_end = cursor.rpos() + func_override_size as u64;

    let mut errors = ErrorList::new();
    let mut items = Vec::new();
    while cursor.rpos() < func_override_end {
        let original_rva = read_u32(cursor)?.value;
        let bdd_offset = read_u32(cursor)?.value;
        let rva_size = read_u32(cursor)?.value;
        let base_reloc_size = read_u32(cursor)?.value;
        let _ = bdd_offset;

        let mut rvas = Vec::with_capacity((rva_size / 4) as usize);
        for _ in 0..(rva_size / 4) {
            rvas.push(read_u32(cursor)?.value);
        }
        let base_relocations = read_base_relocation_blocks(cursor, base_reloc_size, 4, &mut errors)?;

        items.push(FunctionOverrideItem { original_rva, rvas, base_relocations });
    }

    let consumed = cursor.rpos() - start;
    let bdd_total = record_size.saturating_sub(consumed as u32);
    let bdd_info = capture(&mut errors, || read_bdd_info(cursor, bdd_total))
        .unwrap_or(BddInfo { version: 0, nodes: Vec::new() });

    Ok(FunctionOverrideRecord { items, bdd_info, errors })
}

#[derive(Debug)]
pub enum V1Payload {
    ImportControlTransfer(Vec<BaseRelocationBlock>),
    IndirControlTransfer(Vec<BaseRelocationBlock>),
    SwitchtableBranch(Vec<BaseRelocationBlock>),
    Arm64X(Vec<Arm64XEntry>),
    FunctionOverride(FunctionOverrideRecord),
    Unknown(Vec<u8>),
}

#[derive(Debug)]
pub struct V1Record {
    pub symbol: DynamicRelocationSymbol,
    pub payload: V1Payload,
}

fn read_v1_record(
    cursor: &mut Cursor,
    is_64bit: bool,
    errors: &mut ErrorList,
) -> Result<V1Record, PeError> {
    let symbol_raw = if is_64bit { read_u64(cursor)?.value } else { read_u32(cursor)?.value as u64 };
    let symbol = DynamicRelocationSymbol::from_raw(symbol_raw);
    let base_reloc_size = read_u32(cursor)?.value;

    let payload = match symbol {
        DynamicRelocationSymbol::GuardImportControlTransfer => V1Payload::ImportControlTransfer(
            read_base_relocation_blocks(cursor, base_reloc_size, 4, errors)?,
        ),
        DynamicRelocationSymbol::GuardIndirControlTransfer => V1Payload::IndirControlTransfer(
            read_base_relocation_blocks(cursor, base_reloc_size, 2, errors)?,
        ),
        DynamicRelocationSymbol::GuardSwitchtableBranch => V1Payload::SwitchtableBranch(
            read_base_relocation_blocks(cursor, base_reloc_size, 2, errors)?,
        ),
        DynamicRelocationSymbol::GuardArm64x => {
            V1Payload::Arm64X(read_arm64x_entries(cursor, base_reloc_size)?)
        }
        DynamicRelocationSymbol::FunctionOverride => {
            V1Payload::FunctionOverride(read_function_override_record(cursor, base_reloc_size)?)
        }
        _ => {
            errors.add_error(VersioningError::UnknownDynamicRelocationSymbol);
            V1Payload::Unknown(read_byte_vector(cursor, base_reloc_size as u64)?.value)
        }
    };

    Ok(V1Record { symbol, payload })
}

#[derive(Debug)]
pub struct EpilogueBranchDescriptor {
    pub instr_size: u8,
    pub disp_offset: u8,
    pub disp_size: u8,
    pub value: Vec<u8>,
}

#[derive(Debug)]
pub enum V2Header {
    None,
    Prologue { byte_count: u8, bytes: Vec<u8> },
    Epilogue {
        epilogue_count: u32,
        branch_descriptor_count: u16,
        branch_descriptors: Vec<EpilogueBranchDescriptor>,
        /// Decoded indices into `branch_descriptors`, one per epilogue.
        branch_descriptor_indices: Vec<u32>,
    },
}

/// LSB-first bit reader, matching the `bit_stream` utility the epilogue
/// branch-descriptor bitmap is read through upstream.
struct LsbBitStream<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LsbBitStream<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read(&mut self, count: u32) -> Result<u32, PeError> {
        if count > 32 {
            return Err(BoundsError::IntegerOverflow.into());
        }
        let mut result = 0u32;
        let mut shift = 0u32;
        let mut remaining = count;
        while remaining > 0 {
            let byte_index = self.pos / 8;
            let byte = *self.bytes.get(byte_index).ok_or(BoundsError::BufferOverrun)?;
            let bit_offset = (self.pos % 8) as u32;
            let take = remaining.min(8 - bit_offset);
            let mask = if take == 8 { 0xffu32 } else { (1u32 << take) - 1 };
            let bits = (byte as u32 >> bit_offset) & mask;
            result |= bits << shift;
            shift += take;
            self.pos += take as usize;
            remaining -= take;
        }
        Ok(result)
    }
}

fn bit_width_for(count: u16) -> u32 {
    if count <= 1 {
        1
    } else {
        32 - (count as u32 - 1).leading_zeros()
    }
}

fn read_v2_header(
    cursor: &mut Cursor,
    symbol: DynamicRelocationSymbol,
    header_size: u32,
) -> Result<V2Header, PeError> {
    let header_start = cursor.rpos();
    let header = match symbol {
        DynamicRelocationSymbol::GuardRfPrologue => {
            let byte_count = crate::packed::read_u8(cursor)?.value;
            let bytes = read_byte_vector(cursor, byte_count as u64)?.value;
            V2Header::Prologue { byte_count, bytes }
        }
        DynamicRelocationSymbol::GuardRfEpilogue => {
            let epilogue_count = read_u32(cursor)?.value;
            let _epilogue_byte_count = crate::packed::read_u8(cursor)?.value;
            let _branch_descriptor_element_size = crate::packed::read_u8(cursor)?.value;
            let branch_descriptor_count = read_u16(cursor)?.value;

            let mut branch_descriptors = Vec::with_capacity(branch_descriptor_count as usize);
            for _ in 0..branch_descriptor_count {
                let descriptor = read_u16(cursor)?.value;
                let instr_size = (descriptor & 0xf) as u8;
                let disp_offset = ((descriptor >> 4) & 0xf) as u8;
                let disp_size = ((descriptor >> 8) & 0xf) as u8;
                branch_descriptors.push(EpilogueBranchDescriptor {
                    instr_size,
                    disp_offset,
                    disp_size,
                    value: Vec::new(),
                });
            }

            let consumed = cursor.rpos() - header_start;
            let bit_map_bytes = header_size.saturating_sub(consumed as u32);
            let bit_map = read_byte_vector(cursor, bit_map_bytes as u64)?.value;
            let bit_width = bit_width_for(branch_descriptor_count);
            let mut stream = LsbBitStream::new(&bit_map);
            let mut branch_descriptor_indices = Vec::with_capacity(epilogue_count as usize);
            for _ in 0..epilogue_count {
                branch_descriptor_indices.push(stream.read(bit_width)?);
            }

            V2Header::Epilogue {
                epilogue_count,
                branch_descriptor_count,
                branch_descriptors,
                branch_descriptor_indices,
            }
        }
        _ => {
            cursor.advance_rpos(header_size as i64)?;
            V2Header::None
        }
    };
    Ok(header)
}

#[derive(Debug)]
pub struct V2Record {
    pub symbol: DynamicRelocationSymbol,
    pub symbol_group: u32,
    pub flags: u32,
    pub header: V2Header,
    pub fixups: Vec<BaseRelocationBlock>,
}

fn read_v2_record(
    cursor: &mut Cursor,
    is_64bit: bool,
    errors: &mut ErrorList,
) -> Result<V2Record, PeError> {
    let header_size = read_u32(cursor)?.value;
    let fixup_info_size = read_u32(cursor)?.value;
    let symbol_raw = if is_64bit { read_u64(cursor)?.value } else { read_u32(cursor)?.value as u64 };
    let symbol = DynamicRelocationSymbol::from_raw(symbol_raw);
    let symbol_group = read_u32(cursor)?.value;
    let flags = read_u32(cursor)?.value;

    let header = read_v2_header(cursor, symbol, header_size)?;
    let fixups = read_base_relocation_blocks(cursor, fixup_info_size, 2, errors)?;

    Ok(V2Record { symbol, symbol_group, flags, header, fixups })
}

#[derive(Debug)]
pub enum DynamicRelocations {
    V1(Vec<V1Record>),
    V2(Vec<V2Record>),
}

#[derive(Debug)]
pub struct DynamicRelocationTable {
    pub version: u32,
    pub size: u32,
    pub relocations: DynamicRelocations,
    pub errors: ErrorList,
}

/// Reads the DVRT at `rva`, dispatching on its declared version (1 or 2).
pub fn read_dynamic_relocation_table(
    image: &dyn ImageAccess,
    rva: u32,
    is_64bit: bool,
    allow_virtual_data: bool,
) -> Result<DynamicRelocationTable, PeError> {
    let head_buf = image.buffer_for(rva, 8, false)?;
    let mut head_cursor = Cursor::new(&head_buf, allow_virtual_data);
    let version = read_u32(&mut head_cursor)?.value;
    let size = read_u32(&mut head_cursor)?.value;

    let mut errors = ErrorList::new();
    if version != 1 && version != 2 {
        errors.add_error(VersioningError::UnknownDynamicRelocationTableVersion);
        return Ok(DynamicRelocationTable {
            version,
            size,
            relocations: DynamicRelocations::V1(Vec::new()),
            errors,
        });
    }

    let body_buf = image.buffer_for(rva, 8 + size, false)?;
    let mut cursor = Cursor::new(&body_buf, allow_virtual_data);
    cursor.set_rpos(8)?;
    let end = cursor.rpos() + size as u64;

    let relocations = if version == 1 {
        let mut records = Vec::new();
        while cursor.rpos() < end {
            match read_v1_record(&mut cursor, is_64bit, &mut errors) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        DynamicRelocations::V1(records)
    } else {
        let mut records = Vec::new();
        while cursor.rpos() < end {
            match read_v2_record(&mut cursor, is_64bit, &mut errors) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        DynamicRelocations::V2(records)
    };

    Ok(DynamicRelocationTable { version, size, relocations, errors })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_control_transfer_bit_layout() {
        let raw = (1u32 << 12) | (5u32 << 13);
        assert!(import_control_transfer_is_indirect_call(raw));
        assert_eq!(import_control_transfer_iat_index(raw), 5);
    }

    #[test]
    fn arm64x_zero_fill_decodes_size() {
        let bytes = [0x00u8, 0x10u8]; // meta nibble = 0b0001 -> size 2^0=1 shl(meta>>2=0)
        let buf = crate::buffer::MemoryBuffer::new(bytes.to_vec());
        let mut cursor = Cursor::new(&buf, false);
        let entries = read_arm64x_entries(&mut cursor, 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].fixup, Arm64XFixup::ZeroFill { .. }));
    }

    #[test]
    fn epilogue_bit_width_rounds_up() {
        assert_eq!(bit_width_for(3), 2);
        assert_eq!(bit_width_for(1), 1);
        assert_eq!(bit_width_for(4), 2);
        assert_eq!(bit_width_for(5), 3);
    }

    #[test]
    fn lsb_bit_stream_reads_low_bits_first() {
        let bytes = [0b0000_1010u8];
        let mut stream = LsbBitStream::new(&bytes);
        assert_eq!(stream.read(2).unwrap(), 0b10);
        assert_eq!(stream.read(2).unwrap(), 0b10);
    }
}
