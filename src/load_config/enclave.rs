//! Enclave configuration: `image_enclave_config` plus its import array.
//!
//! Grounded on `detail/load_config/image_load_config_directory.h`
//! (`image_enclave_config<Pointer>`, `image_enclave_import`).

use crate::buffer::Cursor;
use crate::error::{ErrorList, PeError, CapacityError};
use crate::image::ImageAccess;
use crate::packed::{read_fixed_array, read_u32, read_u64};

pub const ENCLAVE_LONG_ID_LENGTH: usize = 32;
pub const ENCLAVE_SHORT_ID_LENGTH: usize = 16;

pub const ENCLAVE_POLICY_DEBUGGABLE: u32 = 0x1;
pub const ENCLAVE_FLAG_PRIMARY_IMAGE: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveImportMatch {
    None,
    UniqueId,
    AuthorId,
    FamilyId,
    ImageId,
    Unknown(u32),
}

impl EnclaveImportMatch {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::UniqueId,
            2 => Self::AuthorId,
            3 => Self::FamilyId,
            4 => Self::ImageId,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnclaveImport {
    pub match_type: EnclaveImportMatch,
    pub minimum_security_version: u32,
    pub unique_or_author_id: [u8; ENCLAVE_LONG_ID_LENGTH],
    pub family_id: [u8; ENCLAVE_SHORT_ID_LENGTH],
    pub image_id: [u8; ENCLAVE_SHORT_ID_LENGTH],
    pub import_name: u32,
}

/// `image_enclave_config<Pointer>`, widened to a `u64` for `enclave_size`
/// regardless of bitness (32-bit images store a narrower field; the upper
/// bits are simply zero).
#[derive(Debug)]
pub struct EnclaveConfig {
    pub size: u32,
    pub minimum_required_config_size: u32,
    pub policy_flags: u32,
    pub number_of_imports: u32,
    pub import_list: u32,
    pub import_entry_size: u32,
    pub family_id: [u8; ENCLAVE_SHORT_ID_LENGTH],
    pub image_id: [u8; ENCLAVE_SHORT_ID_LENGTH],
    pub image_version: u32,
    pub security_version: u32,
    pub enclave_size: u64,
    pub number_of_threads: u32,
    pub enclave_flags: u32,
    pub imports: Vec<EnclaveImport>,
    pub errors: ErrorList,
}

const IMPORT_ENTRY_SIZE: u32 = 4 + 4 + ENCLAVE_LONG_ID_LENGTH as u32 + ENCLAVE_SHORT_ID_LENGTH as u32 * 2 + 4 + 4;

fn read_imports(
    image: &dyn ImageAccess,
    import_list: u32,
    count: u32,
    entry_size: u32,
    allow_virtual_data: bool,
    max_imports: u32,
    errors: &mut ErrorList,
) -> Result<Vec<EnclaveImport>, PeError> {
    let clamped = count.min(max_imports);
    if clamped < count {
        errors.add_error(CapacityError::InvalidEnclaveImportArray);
    }
    let entry_size = if entry_size == 0 { IMPORT_ENTRY_SIZE } else { entry_size };
    let buf = image.buffer_for(import_list, entry_size * clamped, false)?;
    let mut imports = Vec::with_capacity(clamped as usize);
    for i in 0..clamped {
        let mut cursor = Cursor::new(&buf, allow_virtual_data);
        cursor.set_rpos((i * entry_size) as u64)?;
        let match_type = EnclaveImportMatch::from_raw(read_u32(&mut cursor)?.value);
        let minimum_security_version = read_u32(&mut cursor)?.value;
        let unique_or_author_id = read_fixed_array::<ENCLAVE_LONG_ID_LENGTH>(&mut cursor)?.value;
        let family_id = read_fixed_array::<ENCLAVE_SHORT_ID_LENGTH>(&mut cursor)?.value;
        let image_id = read_fixed_array::<ENCLAVE_SHORT_ID_LENGTH>(&mut cursor)?.value;
        let import_name = read_u32(&mut cursor)?.value;
        imports.push(EnclaveImport {
            match_type,
            minimum_security_version,
            unique_or_author_id,
            family_id,
            image_id,
            import_name,
        });
    }
    Ok(imports)
}

/// Reads the enclave configuration descriptor at `rva`.
pub fn read_enclave_config(
    image: &dyn ImageAccess,
    rva: u32,
    is_64bit: bool,
    allow_virtual_data: bool,
    max_imports: u32,
) -> Result<EnclaveConfig, PeError> {
    let head_size = if is_64bit { 4 * 10 + 16 * 2 + 8 } else { 4 * 10 + 16 * 2 + 4 };
    let buf = image.buffer_for(rva, head_size, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);

    let size = read_u32(&mut cursor)?.value;
    let minimum_required_config_size = read_u32(&mut cursor)?.value;
    let policy_flags = read_u32(&mut cursor)?.value;
    let number_of_imports = read_u32(&mut cursor)?.value;
    let import_list = read_u32(&mut cursor)?.value;
    let import_entry_size = read_u32(&mut cursor)?.value;
    let family_id = read_fixed_array::<ENCLAVE_SHORT_ID_LENGTH>(&mut cursor)?.value;
    let image_id = read_fixed_array::<ENCLAVE_SHORT_ID_LENGTH>(&mut cursor)?.value;
    let image_version = read_u32(&mut cursor)?.value;
    let security_version = read_u32(&mut cursor)?.value;
    let enclave_size = if is_64bit { read_u64(&mut cursor)?.value } else { read_u32(&mut cursor)?.value as u64 };
    let number_of_threads = read_u32(&mut cursor)?.value;
    let enclave_flags = read_u32(&mut cursor)?.value;

    let mut errors = ErrorList::new();
    let imports = if number_of_imports > 0 {
        read_imports(image, import_list, number_of_imports, import_entry_size, allow_virtual_data, max_imports, &mut errors)?
    } else {
        Vec::new()
    };

    Ok(EnclaveConfig {
        size,
        minimum_required_config_size,
        policy_flags,
        number_of_imports,
        import_list,
        import_entry_size,
        family_id,
        image_id,
        image_version,
        security_version,
        enclave_size,
        number_of_threads,
        enclave_flags,
        imports,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_match_decodes_known_values() {
        assert_eq!(EnclaveImportMatch::from_raw(1), EnclaveImportMatch::UniqueId);
        assert_eq!(EnclaveImportMatch::from_raw(99), EnclaveImportMatch::Unknown(99));
    }
}
