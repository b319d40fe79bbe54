//! A minimal, read-only PE image container: just enough of the COFF file
//! header, optional header and section table to back [`ImageAccess`] for
//! the exception and load-config directory parsers.
//!
//! This is deliberately thin - it does not parse imports, exports,
//! resources or relocations, and has no serialization path back to bytes.
//!
//! Field-by-field reading follows the `FileHeaderReader`/`SectionHeaderReader`
//! idiom: a small struct wraps a [`Cursor`] and exposes one `read_*` method
//! per field plus an aggregate method that composes them.

pub mod section;

use crate::buffer::{Cursor, MemoryBuffer};
use crate::error::{BoundsError, ErrorList, ImageError, PeError, StructuralError};
use crate::packed::{read_struct, read_u16, read_u32, read_u64, PackedField};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

pub use section::{SectionFlags, SectionHeader, SectionTableReader};

/// Index of the exception data directory entry within the 16-entry table.
pub const EXCEPTION_DIRECTORY_INDEX: usize = 3;
/// Index of the load config data directory entry.
pub const LOAD_CONFIG_DIRECTORY_INDEX: usize = 10;

const MZ_SIGNATURE: [u8; 2] = *b"MZ";
const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";

/// Machine types relevant to exception-directory dispatch; the full set
/// recognized by the COFF spec is wider, but only these three feed into
/// X's arch dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    I386,
    Amd64,
    Arm,
    ArmNt,
    Arm64,
    Unknown(u16),
}

impl From<u16> for Machine {
    fn from(value: u16) -> Self {
        match value {
            0x014c => Machine::I386,
            0x8664 => Machine::Amd64,
            0x01c0 => Machine::Arm,
            0x01c4 => Machine::ArmNt,
            0xaa64 => Machine::Arm64,
            other => Machine::Unknown(other),
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::I386 => write!(f, "IMAGE_FILE_MACHINE_I386"),
            Machine::Amd64 => write!(f, "IMAGE_FILE_MACHINE_AMD64"),
            Machine::Arm => write!(f, "IMAGE_FILE_MACHINE_ARM"),
            Machine::ArmNt => write!(f, "IMAGE_FILE_MACHINE_ARMNT"),
            Machine::Arm64 => write!(f, "IMAGE_FILE_MACHINE_ARM64"),
            Machine::Unknown(raw) => write!(f, "IMAGE_FILE_MACHINE_UNKNOWN(0x{raw:04x})"),
        }
    }
}

/// COFF file header, immediately following the PE signature.
#[derive(Debug)]
pub struct CoffHeader {
    pub machine: PackedField<Machine>,
    pub number_of_sections: PackedField<u16>,
    pub time_date_stamp: PackedField<u32>,
    pub pointer_to_symbol_table: PackedField<u32>,
    pub number_of_symbols: PackedField<u32>,
    pub size_of_optional_header: PackedField<u16>,
    pub characteristics: PackedField<u16>,
}

impl CoffHeader {
    /// The header's timestamp decoded as a Unix-epoch UTC instant. Returns
    /// `None` for the (rare) out-of-range raw value.
    pub fn time_date_stamp_utc(&self) -> Option<DateTime<Utc>> {
        match Utc.timestamp_opt(self.time_date_stamp.value as i64, 0) {
            chrono::LocalResult::Single(dt) => Some(dt),
            _ => None,
        }
    }
}

/// One `{rva, size}` entry of the optional header's data directory array.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// PE32 vs PE32+ discriminated optional header; only the fields the
/// directory parsers need are retained.
#[derive(Debug)]
pub struct OptionalHeader {
    pub is_pe32_plus: bool,
    pub image_base: PackedField<u64>,
    pub section_alignment: PackedField<u32>,
    pub file_alignment: PackedField<u32>,
    pub size_of_image: PackedField<u32>,
    pub size_of_headers: PackedField<u32>,
    pub dll_characteristics: PackedField<u16>,
    pub data_directories: Vec<DataDirectory>,
}

/// Reads the COFF file header field by field over a [`Cursor`] positioned
/// right after the PE signature.
pub struct CoffHeaderReader<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
}

impl<'c, 'a> CoffHeaderReader<'c, 'a> {
    pub fn new(cursor: &'c mut Cursor<'a>) -> Self {
        Self { cursor }
    }

    pub fn read_machine(&mut self) -> Result<PackedField<Machine>, PeError> {
        let raw = read_u16(self.cursor)?;
        Ok(PackedField {
            value: Machine::from(raw.value),
            physical_size: raw.physical_size,
            data_size: raw.data_size,
            state: raw.state,
        })
    }

    pub fn read_number_of_sections(&mut self) -> Result<PackedField<u16>, PeError> {
        read_u16(self.cursor)
    }

    pub fn read_time_date_stamp(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    pub fn read_pointer_to_symbol_table(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    pub fn read_number_of_symbols(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    pub fn read_size_of_optional_header(&mut self) -> Result<PackedField<u16>, PeError> {
        read_u16(self.cursor)
    }

    pub fn read_characteristics(&mut self) -> Result<PackedField<u16>, PeError> {
        read_u16(self.cursor)
    }

    pub fn read_coff_header(&mut self) -> Result<CoffHeader, PeError> {
        let machine = self.read_machine()?;
        let number_of_sections = self.read_number_of_sections()?;
        let time_date_stamp = self.read_time_date_stamp()?;
        let pointer_to_symbol_table = self.read_pointer_to_symbol_table()?;
        let number_of_symbols = self.read_number_of_symbols()?;
        let size_of_optional_header = self.read_size_of_optional_header()?;
        let characteristics = self.read_characteristics()?;
        Ok(CoffHeader {
            machine,
            number_of_sections,
            time_date_stamp,
            pointer_to_symbol_table,
            number_of_symbols,
            size_of_optional_header,
            characteristics,
        })
    }
}

fn widen_u32(f: PackedField<u32>) -> PackedField<u64> {
    PackedField {
        value: f.value as u64,
        physical_size: f.physical_size,
        data_size: f.data_size,
        state: f.state,
    }
}

/// Reads the optional header field by field, branching between the PE32 and
/// PE32+ layouts where they diverge.
pub struct OptionalHeaderReader<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
    is_pe32_plus: bool,
}

impl<'c, 'a> OptionalHeaderReader<'c, 'a> {
    pub fn new(cursor: &'c mut Cursor<'a>) -> Self {
        Self { cursor, is_pe32_plus: false }
    }

    pub fn read_magic(&mut self) -> Result<PackedField<u16>, PeError> {
        let magic = read_u16(self.cursor)?;
        self.is_pe32_plus = magic.value == 0x020b;
        Ok(magic)
    }

    /// Skips the fields between `Magic` and `ImageBase` that no directory
    /// parser in this crate consumes.
    pub fn skip_to_image_base(&mut self) -> Result<(), PeError> {
        let mut skip = [0u8; 1];
        for _ in 0..2 {
            self.cursor.read(&mut skip)?; // major/minor linker version
        }
        read_u32(self.cursor)?; // size_of_code
        read_u32(self.cursor)?; // size_of_initialized_data
        read_u32(self.cursor)?; // size_of_uninitialized_data
        read_u32(self.cursor)?; // address_of_entry_point
        read_u32(self.cursor)?; // base_of_code
        if !self.is_pe32_plus {
            read_u32(self.cursor)?; // base_of_data, PE32 only
        }
        Ok(())
    }

    pub fn read_image_base(&mut self) -> Result<PackedField<u64>, PeError> {
        if self.is_pe32_plus {
            read_u64(self.cursor)
        } else {
            Ok(widen_u32(read_u32(self.cursor)?))
        }
    }

    pub fn read_section_alignment(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    pub fn read_file_alignment(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    /// Skips the OS/image/subsystem version pairs and `win32_version_value`
    /// between `FileAlignment` and `SizeOfImage`.
    pub fn skip_to_size_of_image(&mut self) -> Result<(), PeError> {
        for _ in 0..4 {
            read_u16(self.cursor)?; // os/image version pairs
        }
        read_u32(self.cursor)?; // win32_version_value
        Ok(())
    }

    pub fn read_size_of_image(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    pub fn read_size_of_headers(&mut self) -> Result<PackedField<u32>, PeError> {
        read_u32(self.cursor)
    }

    /// Skips `check_sum` and `subsystem` between `SizeOfHeaders` and
    /// `DllCharacteristics`.
    pub fn skip_to_dll_characteristics(&mut self) -> Result<(), PeError> {
        read_u32(self.cursor)?; // check_sum
        read_u16(self.cursor)?; // subsystem
        Ok(())
    }

    pub fn read_dll_characteristics(&mut self) -> Result<PackedField<u16>, PeError> {
        read_u16(self.cursor)
    }

    /// Skips the four reserve/commit size fields, whose width depends on
    /// `is_pe32_plus`.
    pub fn skip_stack_and_heap_sizes(&mut self) -> Result<(), PeError> {
        if self.is_pe32_plus {
            for _ in 0..4 {
                read_u64(self.cursor)?;
            }
        } else {
            for _ in 0..4 {
                read_u32(self.cursor)?;
            }
        }
        Ok(())
    }

    pub fn read_data_directories(&mut self) -> Result<Vec<DataDirectory>, PeError> {
        read_u32(self.cursor)?; // loader_flags
        let number_of_rva_and_sizes = read_u32(self.cursor)?;
        let mut data_directories = Vec::new();
        for _ in 0..number_of_rva_and_sizes.value {
            let rva = read_u32(self.cursor)?;
            let size = read_u32(self.cursor)?;
            data_directories.push(DataDirectory {
                virtual_address: rva.value,
                size: size.value,
            });
        }
        Ok(data_directories)
    }

    pub fn read_optional_header(&mut self) -> Result<OptionalHeader, PeError> {
        self.read_magic()?;
        self.skip_to_image_base()?;
        let image_base = self.read_image_base()?;
        let section_alignment = self.read_section_alignment()?;
        let file_alignment = self.read_file_alignment()?;
        self.skip_to_size_of_image()?;
        let size_of_image = self.read_size_of_image()?;
        let size_of_headers = self.read_size_of_headers()?;
        self.skip_to_dll_characteristics()?;
        let dll_characteristics = self.read_dll_characteristics()?;
        self.skip_stack_and_heap_sizes()?;
        let data_directories = self.read_data_directories()?;

        Ok(OptionalHeader {
            is_pe32_plus: self.is_pe32_plus,
            image_base,
            section_alignment,
            file_alignment,
            size_of_image,
            size_of_headers,
            dll_characteristics,
            data_directories,
        })
    }
}

/// A borrowed view of one section's raw content plus the metadata needed to
/// locate it inside the image.
pub struct SectionRef<'a> {
    pub header: &'a SectionHeader,
    pub buffer: MemoryBuffer,
}

/// Operations the exception and load-config directory parsers consume from
/// the image, independent of how the image bytes are physically stored.
pub trait ImageAccess {
    fn image_base(&self) -> u64;
    fn is_64bit(&self) -> bool;
    fn section_alignment(&self) -> u32;
    fn machine(&self) -> Machine;

    /// Returns the section whose virtual range contains `[rva, rva+length)`,
    /// or `None` when `rva` falls in the headers region.
    fn section_containing(&self, rva: u32, length: u32) -> Result<Option<SectionRef<'_>>, PeError>;

    /// A cursor over `length` bytes starting at `rva`, resolved through
    /// whichever section (or the headers) contains it.
    fn buffer_for(&self, rva: u32, length: u32, include_headers: bool) -> Result<MemoryBuffer, PeError>;

    fn va_to_rva(&self, va: u64) -> Result<u32, PeError>;

    fn data_directory(&self, index: usize) -> Option<DataDirectory>;
}

/// The image container: owns the raw bytes and the parsed headers/section
/// table, and implements [`ImageAccess`] over them.
pub struct Image {
    bytes: Vec<u8>,
    pe_header_offset: u64,
    pub coff_header: CoffHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<SectionHeader>,
    pub errors: ErrorList,
}

impl Image {
    pub fn parse(bytes: impl Into<Vec<u8>>) -> Result<Self, ImageError> {
        let bytes = bytes.into();
        if bytes.len() < 0x40 || bytes[0..2] != MZ_SIGNATURE {
            return Err(ImageError::InvalidMzSignature);
        }
        let buf = MemoryBuffer::new(bytes.clone());
        let mut header_cursor = Cursor::new(&buf, false);
        header_cursor.set_rpos(0x3c)?;
        let pe_offset_field = read_u32(&mut header_cursor)?;
        let pe_header_offset = pe_offset_field.value as u64;

        header_cursor.set_rpos(pe_header_offset)?;
        let mut sig = [0u8; 4];
        header_cursor.read(&mut sig)?;
        if sig != PE_SIGNATURE {
            return Err(ImageError::InvalidPeSignature);
        }

        let coff_header =
            read_struct(&mut header_cursor, |c| CoffHeaderReader::new(c).read_coff_header())?.value;

        if coff_header.size_of_optional_header.value == 0 {
            return Err(ImageError::MissingOptionalHeader);
        }

        let mut errors = ErrorList::new();
        let optional_header_start = header_cursor.rpos();
        let declared_size = coff_header.size_of_optional_header.value as u64;
        let phys_avail = (bytes.len() as u64).saturating_sub(optional_header_start);
        let take = declared_size.min(phys_avail) as usize;
        let opt_start = optional_header_start as usize;
        let opt_data = bytes[opt_start..opt_start + take].to_vec();
        let opt_buf = MemoryBuffer::new(opt_data)
            .with_virtual_size(declared_size)
            .with_absolute_offset(optional_header_start)
            .with_relative_offset(0);
        let mut opt_cursor = Cursor::new(&opt_buf, true);
        let optional_header_field = read_struct(&mut opt_cursor, |c| {
            OptionalHeaderReader::new(c).read_optional_header()
        })?;
        if optional_header_field.is_virtual() {
            errors.add_error(StructuralError::TruncatedOptionalHeader);
        }
        let optional_header = optional_header_field.value;

        // The section table starts right after the declared optional header
        // size, not after however many bytes our reduced reader consumed -
        // some vendor-private trailing data directories are intentionally
        // not modeled here.
        header_cursor.set_rpos(optional_header_start + declared_size)?;

        let sections = SectionTableReader::new(&mut header_cursor)
            .read_section_table(coff_header.number_of_sections.value, &mut errors);

        Ok(Image {
            bytes,
            pe_header_offset,
            coff_header,
            optional_header,
            sections,
            errors,
        })
    }

    fn headers_buffer(&self) -> MemoryBuffer {
        MemoryBuffer::new(self.bytes.clone())
    }

    /// File offset of the `PE\0\0` signature, i.e. where the COFF header
    /// begins.
    pub fn pe_header_offset(&self) -> u64 {
        self.pe_header_offset
    }

    fn find_section(&self, rva: u32, length: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| {
            let start = s.virtual_address;
            let end = start.saturating_add(s.virtual_size);
            rva >= start && (rva as u64 + length as u64) <= end as u64
        })
    }
}

impl ImageAccess for Image {
    fn image_base(&self) -> u64 {
        self.optional_header.image_base.value
    }

    fn is_64bit(&self) -> bool {
        self.optional_header.is_pe32_plus
    }

    fn section_alignment(&self) -> u32 {
        self.optional_header.section_alignment.value
    }

    fn machine(&self) -> Machine {
        self.coff_header.machine.value
    }

    fn section_containing(&self, rva: u32, length: u32) -> Result<Option<SectionRef<'_>>, PeError> {
        if (self.optional_header.size_of_headers.value) > rva {
            return Ok(None);
        }
        match self.find_section(rva, length) {
            Some(section) => {
                let offset_in_section = (rva - section.virtual_address) as u64;
                let file_start = section.pointer_to_raw_data as u64 + offset_in_section;
                let file_end = (section.pointer_to_raw_data as u64 + section.size_of_raw_data as u64)
                    .min(self.bytes.len() as u64);
                let physical = file_end.saturating_sub(file_start.min(file_end)) as usize;
                let start = file_start.min(self.bytes.len() as u64) as usize;
                let data = self.bytes[start..start + physical].to_vec();
                let virtual_size = (section.virtual_size as u64).saturating_sub(offset_in_section);
                let buffer = MemoryBuffer::new(data)
                    .with_virtual_size(virtual_size.max(physical as u64))
                    .with_absolute_offset(file_start)
                    .with_relative_offset(offset_in_section);
                Ok(Some(SectionRef {
                    header: section,
                    buffer,
                }))
            }
            None => Err(BoundsError::RvaOutOfBounds.into()),
        }
    }

    fn buffer_for(&self, rva: u32, length: u32, include_headers: bool) -> Result<MemoryBuffer, PeError> {
        if include_headers && (rva as usize) < self.bytes.len() && self.find_section(rva, length).is_none() {
            let start = rva as usize;
            let end = (start + length as usize).min(self.bytes.len());
            let data = self.bytes[start..end].to_vec();
            return Ok(MemoryBuffer::new(data)
                .with_virtual_size(length as u64)
                .with_absolute_offset(rva as u64)
                .with_relative_offset(0));
        }
        match self.section_containing(rva, length)? {
            Some(section_ref) => Ok(section_ref.buffer),
            None => Err(BoundsError::RvaOutOfBounds.into()),
        }
    }

    fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
        let base = self.image_base();
        if va < base {
            return Err(BoundsError::InvalidVa.into());
        }
        let rva = va - base;
        if rva >= self.optional_header.size_of_image.value as u64 {
            return Err(BoundsError::InvalidVa.into());
        }
        Ok(rva as u32)
    }

    fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.optional_header.data_directories.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image_bytes(machine: u16, is_64bit: bool, image_base: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x200];
        bytes[0..2].copy_from_slice(b"MZ");
        let pe_offset: u32 = 0x80;
        bytes[0x3c..0x40].copy_from_slice(&pe_offset.to_le_bytes());

        let mut pe = Vec::new();
        pe.extend_from_slice(b"PE\0\0");
        pe.extend_from_slice(&machine.to_le_bytes()); // machine
        pe.extend_from_slice(&1u16.to_le_bytes()); // number_of_sections
        pe.extend_from_slice(&0u32.to_le_bytes()); // time_date_stamp
        pe.extend_from_slice(&0u32.to_le_bytes()); // pointer_to_symbol_table
        pe.extend_from_slice(&0u32.to_le_bytes()); // number_of_symbols
        let opt_header_size: u16 = if is_64bit { 112 } else { 96 };
        pe.extend_from_slice(&opt_header_size.to_le_bytes());
        pe.extend_from_slice(&0u16.to_le_bytes()); // characteristics

        let magic: u16 = if is_64bit { 0x020b } else { 0x010b };
        pe.extend_from_slice(&magic.to_le_bytes());
        pe.push(0); // major linker
        pe.push(0); // minor linker
        pe.extend_from_slice(&0u32.to_le_bytes()); // size_of_code
        pe.extend_from_slice(&0u32.to_le_bytes()); // size_of_initialized_data
        pe.extend_from_slice(&0u32.to_le_bytes()); // size_of_uninitialized_data
        pe.extend_from_slice(&0u32.to_le_bytes()); // address_of_entry_point
        pe.extend_from_slice(&0u32.to_le_bytes()); // base_of_code
        if !is_64bit {
            pe.extend_from_slice(&0u32.to_le_bytes()); // base_of_data
        }
        if is_64bit {
            pe.extend_from_slice(&image_base.to_le_bytes());
        } else {
            pe.extend_from_slice(&(image_base as u32).to_le_bytes());
        }
        pe.extend_from_slice(&0x1000u32.to_le_bytes()); // section_alignment
        pe.extend_from_slice(&0x200u32.to_le_bytes()); // file_alignment
        for _ in 0..4 {
            pe.extend_from_slice(&0u16.to_le_bytes());
        }
        pe.extend_from_slice(&0u32.to_le_bytes()); // win32_version_value
        pe.extend_from_slice(&0x3000u32.to_le_bytes()); // size_of_image
        pe.extend_from_slice(&0x200u32.to_le_bytes()); // size_of_headers
        pe.extend_from_slice(&0u32.to_le_bytes()); // check_sum
        pe.extend_from_slice(&3u16.to_le_bytes()); // subsystem
        pe.extend_from_slice(&0u16.to_le_bytes()); // dll_characteristics
        let widths = if is_64bit { 8 } else { 4 };
        for _ in 0..4 {
            if widths == 8 {
                pe.extend_from_slice(&0u64.to_le_bytes());
            } else {
                pe.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        pe.extend_from_slice(&0u32.to_le_bytes()); // loader_flags
        pe.extend_from_slice(&16u32.to_le_bytes()); // number_of_rva_and_sizes
        for _ in 0..16 {
            pe.extend_from_slice(&0u32.to_le_bytes());
            pe.extend_from_slice(&0u32.to_le_bytes());
        }

        // one section header
        let mut name = [0u8; 8];
        name[..5].copy_from_slice(b".text");
        pe.extend_from_slice(&name);
        pe.extend_from_slice(&0x1000u32.to_le_bytes()); // virtual_size
        pe.extend_from_slice(&0x1000u32.to_le_bytes()); // virtual_address
        pe.extend_from_slice(&0x1000u32.to_le_bytes()); // size_of_raw_data
        pe.extend_from_slice(&0x200u32.to_le_bytes()); // pointer_to_raw_data
        pe.extend_from_slice(&0u32.to_le_bytes());
        pe.extend_from_slice(&0u32.to_le_bytes());
        pe.extend_from_slice(&0u16.to_le_bytes());
        pe.extend_from_slice(&0u16.to_le_bytes());
        pe.extend_from_slice(&0u32.to_le_bytes()); // characteristics

        bytes[0x80..0x80 + pe.len()].copy_from_slice(&pe);
        bytes.resize(0x1200, 0);
        bytes
    }

    #[test]
    fn parses_minimal_64_bit_image() {
        let bytes = minimal_image_bytes(0x8664, true, 0x1_4000_0000);
        let image = Image::parse(bytes).unwrap();
        assert!(image.is_64bit());
        assert_eq!(image.image_base(), 0x1_4000_0000);
        assert_eq!(image.machine(), Machine::Amd64);
        assert_eq!(image.sections.len(), 1);
        assert_eq!(image.optional_header.size_of_headers.value, 0x200);
        assert!(!image.errors.has_errors());
    }

    #[test]
    fn va_to_rva_rejects_out_of_range() {
        let bytes = minimal_image_bytes(0x8664, true, 0x1000);
        let image = Image::parse(bytes).unwrap();
        assert!(image.va_to_rva(0x100).is_err());
        assert_eq!(image.va_to_rva(0x1100).unwrap(), 0x100);
    }

    #[test]
    fn va_to_rva_rejects_rva_equal_to_size_of_image() {
        let bytes = minimal_image_bytes(0x8664, true, 0x1000);
        let image = Image::parse(bytes).unwrap();
        // size_of_image is 0x3000 in the fixture -> va 0x1000+0x3000 is
        // exactly at the boundary and must be rejected.
        assert!(image.va_to_rva(0x1000 + 0x3000).is_err());
        assert!(image.va_to_rva(0x1000 + 0x2fff).is_ok());
    }

    #[test]
    fn section_containing_resolves_text_section() {
        let bytes = minimal_image_bytes(0x8664, true, 0x1000);
        let image = Image::parse(bytes).unwrap();
        let found = image.section_containing(0x1000, 4).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn truncated_optional_header_is_tolerated_and_recorded() {
        let mut bytes = minimal_image_bytes(0x8664, true, 0x1_4000_0000);
        // Cut the file off partway through the optional header (which
        // starts at 0x80 + 24 = 0x98) to simulate a truncated image.
        bytes.truncate(0x98 + 40);
        let image = Image::parse(bytes).unwrap();
        assert!(image.errors.contains(StructuralError::TruncatedOptionalHeader));
    }

    #[test]
    fn parse_rejects_missing_mz_signature() {
        let mut bytes = minimal_image_bytes(0x8664, true, 0x1000);
        bytes[0..2].copy_from_slice(b"XX");
        assert!(matches!(Image::parse(bytes), Err(ImageError::InvalidMzSignature)));
    }

    #[test]
    fn parse_rejects_missing_pe_signature() {
        let mut bytes = minimal_image_bytes(0x8664, true, 0x1000);
        bytes[0x80..0x84].copy_from_slice(b"XXXX");
        assert!(matches!(Image::parse(bytes), Err(ImageError::InvalidPeSignature)));
    }

    #[test]
    fn find_section_excludes_raw_data_padding_beyond_virtual_size() {
        let bytes = minimal_image_bytes(0x8664, true, 0x1000);
        let image = Image::parse(bytes).unwrap();
        // virtual_size and size_of_raw_data are equal (0x1000) in the
        // fixture, so probe right at the exact virtual end.
        assert!(image.find_section(0x1000, 0x1000).is_some());
        assert!(image.find_section(0x1000, 0x1001).is_none());
    }
}
