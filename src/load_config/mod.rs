//! The Load Configuration directory: a versioned, ever-growing descriptor
//! whose final decoded version depends only on how many bytes the data
//! directory declares for it.
//!
//! Grounded on `load_config/load_config_directory.h` and
//! `detail/load_config/image_load_config_directory.h`, whose per-version
//! structs (`image_load_config_directory_base{32,64}`,
//! `structured_exceptions{32,64}`, `cf_guard{32,64}`, ...) are read here as a
//! single cumulative byte stream rather than as separate nested types, since
//! the whole point of the format is "read as much as `size` allows".

pub mod chpe;
pub mod dvrt;
pub mod enclave;
pub mod guard;
pub mod loader;
pub mod volatile;

use crate::buffer::Cursor;
use crate::error::{ErrorList, PeError};
use crate::image::ImageAccess;
use crate::packed::{read_u16, read_u32, read_u64};
use guard::GuardFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Base,
    Seh,
    CfGuard,
    CodeIntegrity,
    CfGuardEx,
    HybridPe,
    RfGuard,
    RfGuardEx,
    Enclave,
    VolatileMetadata,
    EhGuard,
    XfGuard,
    CastGuard,
    MemcpyGuard,
}

impl Version {
    /// Cumulative byte offset (from the start of the directory body, i.e.
    /// excluding the directory's own `size`/leading fields already consumed
    /// by the caller) at which this version's fields end, for the given
    /// bitness.
    fn cutoff(self, is_64bit: bool) -> u32 {
        if is_64bit {
            match self {
                Version::Base => 92,
                Version::Seh => 108,
                Version::CfGuard => 144,
                Version::CodeIntegrity => 156,
                Version::CfGuardEx => 188,
                Version::HybridPe => 204,
                Version::RfGuard => 228,
                Version::RfGuardEx => 240,
                Version::Enclave => 252,
                Version::VolatileMetadata => 260,
                Version::EhGuard => 276,
                Version::XfGuard => 300,
                Version::CastGuard => 308,
                Version::MemcpyGuard => 316,
            }
        } else {
            match self {
                Version::Base => 60,
                Version::Seh => 68,
                Version::CfGuard => 88,
                Version::CodeIntegrity => 100,
                Version::CfGuardEx => 116,
                Version::HybridPe => 124,
                Version::RfGuard => 140,
                Version::RfGuardEx => 148,
                Version::Enclave => 156,
                Version::VolatileMetadata => 160,
                Version::EhGuard => 168,
                Version::XfGuard => 180,
                Version::CastGuard => 184,
                Version::MemcpyGuard => 188,
            }
        }
    }
}

/// The minimum Windows release name associated with each version, purely
/// informational (matches `version_to_min_required_windows_version`).
pub fn version_to_min_required_windows_version(value: Version) -> &'static str {
    match value {
        Version::Base => "Windows XP",
        Version::Seh => "Windows XP",
        Version::CfGuard => "Windows 10 (1507)",
        Version::CodeIntegrity => "Windows 10 (1511)",
        Version::CfGuardEx => "Windows 10 (1607)",
        Version::HybridPe => "Windows 10 (1607)",
        Version::RfGuard => "Windows 10 (1703)",
        Version::RfGuardEx => "Windows 10 (1703)",
        Version::Enclave => "Windows 10 (1709)",
        Version::VolatileMetadata => "Windows 10 (1803)",
        Version::EhGuard => "Windows 10 (1809)",
        Version::XfGuard => "Windows 10 (21H1)",
        Version::CastGuard => "Windows 10 (21H2)",
        Version::MemcpyGuard => "Windows 10 (22H2)",
    }
}

#[derive(Debug, Default)]
pub struct BaseFields {
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u64,
    pub de_commit_total_free_threshold: u64,
    pub lock_prefix_table: u64,
    pub maximum_allocation_size: u64,
    pub virtual_memory_threshold: u64,
    pub process_heap_flags: u32,
    pub process_affinity_mask: u64,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u64,
    pub security_cookie: u64,
}

#[derive(Debug, Default)]
pub struct StructuredExceptions {
    pub se_handler_table: u64,
    pub se_handler_count: u64,
}

#[derive(Debug, Default)]
pub struct CfGuard {
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_cf_function_count: u64,
    pub guard_flags: GuardFlags,
}

#[derive(Debug, Default)]
pub struct CodeIntegrity {
    pub flags: u16,
    pub catalog: u16,
    pub catalog_offset: u32,
}

#[derive(Debug, Default)]
pub struct CfGuardEx {
    pub guard_address_taken_iat_entry_table: u64,
    pub guard_address_taken_iat_entry_count: u64,
    pub guard_long_jump_target_table: u64,
    pub guard_long_jump_target_count: u64,
}

#[derive(Debug, Default)]
pub struct HybridPe {
    pub dynamic_value_reloc_table: u64,
    pub chpe_metadata_pointer: u64,
}

#[derive(Debug, Default)]
pub struct RfGuard {
    pub guard_rf_failure_routine: u64,
    pub guard_rf_failure_routine_function_pointer: u64,
    pub dynamic_value_reloc_table_offset: u32,
    pub dynamic_value_reloc_table_section: u16,
}

#[derive(Debug, Default)]
pub struct RfGuardEx {
    pub guard_rf_verify_stack_pointer_function_pointer: u64,
    pub hot_patch_table_offset: u32,
}

#[derive(Debug, Default)]
pub struct EnclaveDescriptor {
    pub enclave_configuration_pointer: u64,
}

#[derive(Debug, Default)]
pub struct VolatileMetadataDescriptor {
    pub volatile_metadata_pointer: u64,
}

#[derive(Debug, Default)]
pub struct GuardExceptionHandling {
    pub guard_eh_continuation_table: u64,
    pub guard_eh_continuation_count: u64,
}

#[derive(Debug, Default)]
pub struct ExtendedFlowGuard {
    pub guard_xfg_check_function_pointer: u64,
    pub guard_xfg_dispatch_function_pointer: u64,
    pub guard_xfg_table_dispatch_function_pointer: u64,
}

/// The full descriptor, populated up to whichever [`Version`] the
/// declared directory size reaches; later groups are `None` when the image
/// predates them.
#[derive(Debug)]
pub struct LoadConfigDescriptor {
    pub version: Version,
    pub base: BaseFields,
    pub structured_exceptions: Option<StructuredExceptions>,
    pub cf_guard: Option<CfGuard>,
    pub code_integrity: Option<CodeIntegrity>,
    pub cf_guard_ex: Option<CfGuardEx>,
    pub hybrid_pe: Option<HybridPe>,
    pub rf_guard: Option<RfGuard>,
    pub rf_guard_ex: Option<RfGuardEx>,
    pub enclave: Option<EnclaveDescriptor>,
    pub volatile_metadata: Option<VolatileMetadataDescriptor>,
    pub guard_exception_handling: Option<GuardExceptionHandling>,
    pub extended_flow_guard: Option<ExtendedFlowGuard>,
    pub cast_guard_os_determined_failure_mode: Option<u64>,
    pub guard_memcpy_function_pointer: Option<u64>,
}

fn remaining(cursor: &Cursor, buf_len: u64) -> u64 {
    buf_len.saturating_sub(cursor.rpos())
}

fn read_pointer(cursor: &mut Cursor, is_64bit: bool) -> Result<u64, PeError> {
    if is_64bit {
        Ok(read_u64(cursor)?.value)
    } else {
        Ok(read_u32(cursor)?.value as u64)
    }
}

/// Reads the load config descriptor body (the data directory's `size`
/// bytes), growing the populated field groups as far as `size` allows.
pub fn read_descriptor(
    image: &dyn ImageAccess,
    rva: u32,
    size: u32,
    allow_virtual_data: bool,
) -> Result<LoadConfigDescriptor, PeError> {
    let is_64bit = image.is_64bit();
    let buf = image.buffer_for(rva, size, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let buf_len = size as u64;

    let base = BaseFields {
        time_date_stamp: read_u32(&mut cursor)?.value,
        major_version: read_u16(&mut cursor)?.value,
        minor_version: read_u16(&mut cursor)?.value,
        global_flags_clear: read_u32(&mut cursor)?.value,
        global_flags_set: read_u32(&mut cursor)?.value,
        critical_section_default_timeout: read_u32(&mut cursor)?.value,
        de_commit_free_block_threshold: read_pointer(&mut cursor, is_64bit)?,
        de_commit_total_free_threshold: read_pointer(&mut cursor, is_64bit)?,
        lock_prefix_table: read_pointer(&mut cursor, is_64bit)?,
        maximum_allocation_size: read_pointer(&mut cursor, is_64bit)?,
        virtual_memory_threshold: read_pointer(&mut cursor, is_64bit)?,
        process_heap_flags: if is_64bit { 0 } else { read_u32(&mut cursor)?.value },
        process_affinity_mask: if is_64bit { read_pointer(&mut cursor, is_64bit)? } else { 0 },
        csd_version: 0,
        dependent_load_flags: 0,
        edit_list: 0,
        security_cookie: 0,
    };
    // csd_version/dependent_load_flags/edit_list/security_cookie/(32-bit
    // process_affinity_mask) follow in file order; read them in a second
    // pass so the 64-bit pointer-width branch above stays linear.
    let mut base = base;
    if !is_64bit {
        base.process_affinity_mask = read_u32(&mut cursor)?.value as u64;
    } else {
        base.process_heap_flags = read_u32(&mut cursor)?.value;
    }
    base.csd_version = read_u16(&mut cursor)?.value;
    base.dependent_load_flags = read_u16(&mut cursor)?.value;
    base.edit_list = read_pointer(&mut cursor, is_64bit)?;
    base.security_cookie = read_pointer(&mut cursor, is_64bit)?;

    let mut version = Version::Base;
    let mut structured_exceptions = None;
    let mut cf_guard = None;
    let mut code_integrity = None;
    let mut cf_guard_ex = None;
    let mut hybrid_pe = None;
    let mut rf_guard = None;
    let mut rf_guard_ex = None;
    let mut enclave = None;
    let mut volatile_metadata = None;
    let mut guard_exception_handling = None;
    let mut extended_flow_guard = None;
    let mut cast_guard_os_determined_failure_mode = None;
    let mut guard_memcpy_function_pointer = None;

    if remaining(&cursor, buf_len) >= (Version::Seh.cutoff(is_64bit) - Version::Base.cutoff(is_64bit)) as u64 {
        structured_exceptions = Some(StructuredExceptions {
            se_handler_table: read_pointer(&mut cursor, is_64bit)?,
            se_handler_count: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::Seh;
    }

    if structured_exceptions.is_some()
        && remaining(&cursor, buf_len) >= (Version::CfGuard.cutoff(is_64bit) - Version::Seh.cutoff(is_64bit)) as u64
    {
        cf_guard = Some(CfGuard {
            guard_cf_check_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            guard_cf_dispatch_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            guard_cf_function_table: read_pointer(&mut cursor, is_64bit)?,
            guard_cf_function_count: read_pointer(&mut cursor, is_64bit)?,
            guard_flags: GuardFlags::from_bits_truncate(read_u32(&mut cursor)?.value),
        });
        version = Version::CfGuard;
    }

    if cf_guard.is_some()
        && remaining(&cursor, buf_len) >= (Version::CodeIntegrity.cutoff(is_64bit) - Version::CfGuard.cutoff(is_64bit)) as u64
    {
        code_integrity = Some(CodeIntegrity {
            flags: read_u16(&mut cursor)?.value,
            catalog: read_u16(&mut cursor)?.value,
            catalog_offset: read_u32(&mut cursor)?.value,
        });
        // skip reserved u32
        let _ = read_u32(&mut cursor)?;
        version = Version::CodeIntegrity;
    }

    if code_integrity.is_some()
        && remaining(&cursor, buf_len) >= (Version::CfGuardEx.cutoff(is_64bit) - Version::CodeIntegrity.cutoff(is_64bit)) as u64
    {
        cf_guard_ex = Some(CfGuardEx {
            guard_address_taken_iat_entry_table: read_pointer(&mut cursor, is_64bit)?,
            guard_address_taken_iat_entry_count: read_pointer(&mut cursor, is_64bit)?,
            guard_long_jump_target_table: read_pointer(&mut cursor, is_64bit)?,
            guard_long_jump_target_count: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::CfGuardEx;
    }

    if cf_guard_ex.is_some()
        && remaining(&cursor, buf_len) >= (Version::HybridPe.cutoff(is_64bit) - Version::CfGuardEx.cutoff(is_64bit)) as u64
    {
        hybrid_pe = Some(HybridPe {
            dynamic_value_reloc_table: read_pointer(&mut cursor, is_64bit)?,
            chpe_metadata_pointer: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::HybridPe;
    }

    if hybrid_pe.is_some()
        && remaining(&cursor, buf_len) >= (Version::RfGuard.cutoff(is_64bit) - Version::HybridPe.cutoff(is_64bit)) as u64
    {
        rf_guard = Some(RfGuard {
            guard_rf_failure_routine: read_pointer(&mut cursor, is_64bit)?,
            guard_rf_failure_routine_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            dynamic_value_reloc_table_offset: read_u32(&mut cursor)?.value,
            dynamic_value_reloc_table_section: read_u16(&mut cursor)?.value,
        });
        let _ = read_u16(&mut cursor)?; // reserved2
        version = Version::RfGuard;
    }

    if rf_guard.is_some()
        && remaining(&cursor, buf_len) >= (Version::RfGuardEx.cutoff(is_64bit) - Version::RfGuard.cutoff(is_64bit)) as u64
    {
        rf_guard_ex = Some(RfGuardEx {
            guard_rf_verify_stack_pointer_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            hot_patch_table_offset: read_u32(&mut cursor)?.value,
        });
        version = Version::RfGuardEx;
    }

    if rf_guard_ex.is_some()
        && remaining(&cursor, buf_len) >= (Version::Enclave.cutoff(is_64bit) - Version::RfGuardEx.cutoff(is_64bit)) as u64
    {
        let _reserved3 = read_u32(&mut cursor)?;
        enclave = Some(EnclaveDescriptor {
            enclave_configuration_pointer: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::Enclave;
    }

    if enclave.is_some()
        && remaining(&cursor, buf_len)
            >= (Version::VolatileMetadata.cutoff(is_64bit) - Version::Enclave.cutoff(is_64bit)) as u64
    {
        volatile_metadata = Some(VolatileMetadataDescriptor {
            volatile_metadata_pointer: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::VolatileMetadata;
    }

    if volatile_metadata.is_some()
        && remaining(&cursor, buf_len) >= (Version::EhGuard.cutoff(is_64bit) - Version::VolatileMetadata.cutoff(is_64bit)) as u64
    {
        guard_exception_handling = Some(GuardExceptionHandling {
            guard_eh_continuation_table: read_pointer(&mut cursor, is_64bit)?,
            guard_eh_continuation_count: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::EhGuard;
    }

    if guard_exception_handling.is_some()
        && remaining(&cursor, buf_len) >= (Version::XfGuard.cutoff(is_64bit) - Version::EhGuard.cutoff(is_64bit)) as u64
    {
        extended_flow_guard = Some(ExtendedFlowGuard {
            guard_xfg_check_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            guard_xfg_dispatch_function_pointer: read_pointer(&mut cursor, is_64bit)?,
            guard_xfg_table_dispatch_function_pointer: read_pointer(&mut cursor, is_64bit)?,
        });
        version = Version::XfGuard;
    }

    if extended_flow_guard.is_some()
        && remaining(&cursor, buf_len) >= (Version::CastGuard.cutoff(is_64bit) - Version::XfGuard.cutoff(is_64bit)) as u64
    {
        cast_guard_os_determined_failure_mode = Some(read_pointer(&mut cursor, is_64bit)?);
        version = Version::CastGuard;
    }

    if cast_guard_os_determined_failure_mode.is_some()
        && remaining(&cursor, buf_len) >= (Version::MemcpyGuard.cutoff(is_64bit) - Version::CastGuard.cutoff(is_64bit)) as u64
    {
        guard_memcpy_function_pointer = Some(read_pointer(&mut cursor, is_64bit)?);
        version = Version::MemcpyGuard;
    }

    Ok(LoadConfigDescriptor {
        version,
        base,
        structured_exceptions,
        cf_guard,
        code_integrity,
        cf_guard_ex,
        hybrid_pe,
        rf_guard,
        rf_guard_ex,
        enclave,
        volatile_metadata,
        guard_exception_handling,
        extended_flow_guard,
        cast_guard_os_determined_failure_mode,
        guard_memcpy_function_pointer,
    })
}

/// The full load-config directory: the versioned descriptor plus whichever
/// optional sub-tables it references and the loader chose to resolve.
#[derive(Debug)]
pub struct LoadConfigDirectory {
    pub descriptor: LoadConfigDescriptor,
    pub lock_prefix_table: Option<Vec<u32>>,
    pub safeseh_handlers: Option<Vec<u32>>,
    pub cf_guard_functions: Option<Vec<guard::GuardFunction>>,
    pub address_taken_iat_functions: Option<Vec<guard::GuardFunction>>,
    pub long_jump_functions: Option<Vec<guard::GuardFunction>>,
    pub chpe_metadata: Option<chpe::ChpeMetadata>,
    pub dynamic_relocations: Option<dvrt::DynamicRelocationTable>,
    pub enclave_config: Option<enclave::EnclaveConfig>,
    pub volatile_metadata: Option<volatile::VolatileMetadata>,
    pub eh_continuation_targets: Option<Vec<u32>>,
    pub errors: ErrorList,
}

/// Reads the lock prefix table: a NUL-VA-terminated array of pointer-sized
/// VAs starting at `first_va`, each resolved to an RVA. An entry that
/// doesn't resolve into the image is dropped and recorded as an error; the
/// scan still continues to the next slot. Bounded by `max_entries` in case
/// a corrupt image never supplies the terminating zero VA.
pub(crate) fn read_lock_prefix_table(
    image: &dyn ImageAccess,
    first_va: u64,
    allow_virtual_data: bool,
    max_entries: u32,
    errors: &mut ErrorList,
) -> Result<Vec<u32>, PeError> {
    use crate::error::{CapacityError, StructuralError};

    if first_va == 0 {
        return Ok(Vec::new());
    }
    let is_64bit = image.is_64bit();
    let entry_size: u32 = if is_64bit { 8 } else { 4 };
    let start_rva = image.va_to_rva(first_va)?;

    let mut rvas = Vec::new();
    let mut offset: u32 = 0;
    loop {
        if rvas.len() as u32 >= max_entries {
            errors.add_error(CapacityError::InvalidLockPrefixTableEntryCount);
            break;
        }
        let buf = image.buffer_for(start_rva + offset, entry_size, false)?;
        let mut cursor = Cursor::new(&buf, allow_virtual_data);
        let va = read_pointer(&mut cursor, is_64bit)?;
        if va == 0 {
            break;
        }
        match image.va_to_rva(va) {
            Ok(rva) => rvas.push(rva),
            Err(_) => errors.add_error(StructuralError::InvalidLockPrefixTable),
        }
        offset += entry_size;
    }
    Ok(rvas)
}

/// Reads the SafeSEH handler table: a plain RVA array, capped but not
/// required to be sorted.
pub(crate) fn read_safeseh_handlers(
    image: &dyn ImageAccess,
    rva: u32,
    count: u64,
    allow_virtual_data: bool,
    max_count: u32,
    errors: &mut ErrorList,
) -> Result<Vec<u32>, PeError> {
    use crate::error::CapacityError;
    let count = count.min(u32::MAX as u64) as u32;
    let clamped = count.min(max_count);
    if clamped < count {
        errors.add_error(CapacityError::InvalidSafesehHandlerTable);
    }
    let buf = image.buffer_for(rva, clamped * 4, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let mut rvas = Vec::with_capacity(clamped as usize);
    for _ in 0..clamped {
        rvas.push(read_u32(&mut cursor)?.value);
    }
    Ok(rvas)
}

/// Reads the EH continuation table: an ascending-sorted RVA array.
pub(crate) fn read_ehcont_targets(
    image: &dyn ImageAccess,
    rva: u32,
    count: u64,
    allow_virtual_data: bool,
    max_count: u32,
    errors: &mut ErrorList,
) -> Result<Vec<u32>, PeError> {
    use crate::error::{CapacityError, SemanticError};
    let count = count.min(u32::MAX as u64) as u32;
    let clamped = count.min(max_count);
    if clamped < count {
        errors.add_error(CapacityError::InvalidEhcontTargetsCount);
    }
    let buf = image.buffer_for(rva, clamped * 4, false)?;
    let mut cursor = Cursor::new(&buf, allow_virtual_data);
    let mut rvas = Vec::with_capacity(clamped as usize);
    let mut last = None;
    let mut unsorted = false;
    for _ in 0..clamped {
        let value = read_u32(&mut cursor)?.value;
        if let Some(prev) = last {
            if value < prev {
                unsorted = true;
            }
        }
        last = Some(value);
        rvas.push(value);
    }
    if unsorted {
        errors.add_error(SemanticError::UnsortedEhcontTargets);
    }
    Ok(rvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::error::BoundsError;
    use crate::image::{DataDirectory, Machine, SectionRef};

    struct FakeImage {
        data: Vec<u8>,
        is_64bit: bool,
        image_base: u64,
    }

    impl ImageAccess for FakeImage {
        fn image_base(&self) -> u64 {
            self.image_base
        }
        fn is_64bit(&self) -> bool {
            self.is_64bit
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
            if start > self.data.len() {
                return Err(BoundsError::RvaOutOfBounds.into());
            }
            let end = (start + length as usize).min(self.data.len());
            Ok(MemoryBuffer::new(self.data[start..end].to_vec()).with_virtual_size(length as u64))
        }
        fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
            if va < self.image_base {
                return Err(BoundsError::InvalidVa.into());
            }
            Ok((va - self.image_base) as u32)
        }
        fn data_directory(&self, _index: usize) -> Option<DataDirectory> {
            None
        }
    }

    #[test]
    fn base_only_descriptor_stops_at_base_version() {
        let mut data = vec![0u8; 60];
        data[0..4].copy_from_slice(&0x1111_1111u32.to_le_bytes());
        data[28..32].copy_from_slice(&0x2000u32.to_le_bytes()); // lock_prefix_table
        let image = FakeImage { data, is_64bit: false, image_base: 0x400000 };

        let descriptor = read_descriptor(&image, 0, 60, false).unwrap();
        assert_eq!(descriptor.version, Version::Base);
        assert_eq!(descriptor.base.time_date_stamp, 0x1111_1111);
        assert_eq!(descriptor.base.lock_prefix_table, 0x2000);
        assert!(descriptor.structured_exceptions.is_none());
    }

    #[test]
    fn lock_prefix_table_skips_unresolvable_va_and_stops_at_sentinel() {
        let mut data = vec![0u8; 0x200];
        data[0x100..0x104].copy_from_slice(&0x400300u32.to_le_bytes());
        data[0x104..0x108].copy_from_slice(&0x1u32.to_le_bytes()); // below image_base, unresolvable
        data[0x108..0x10c].copy_from_slice(&0u32.to_le_bytes()); // sentinel
        let image = FakeImage { data, is_64bit: false, image_base: 0x400000 };

        let mut errors = ErrorList::new();
        let rvas = read_lock_prefix_table(&image, 0x400100, false, 0xffff, &mut errors).unwrap();
        assert_eq!(rvas, vec![0x300]);
        assert!(errors.contains(crate::error::StructuralError::InvalidLockPrefixTable));
    }

    #[test]
    fn lock_prefix_table_respects_entry_cap() {
        let mut data = vec![0u8; 0x200];
        data[0x100..0x104].copy_from_slice(&0x400300u32.to_le_bytes());
        data[0x104..0x108].copy_from_slice(&0x400400u32.to_le_bytes());
        let image = FakeImage { data, is_64bit: false, image_base: 0x400000 };

        let mut errors = ErrorList::new();
        let rvas = read_lock_prefix_table(&image, 0x400100, false, 1, &mut errors).unwrap();
        assert_eq!(rvas, vec![0x300]);
        assert!(errors.contains(crate::error::CapacityError::InvalidLockPrefixTableEntryCount));
    }

    #[test]
    fn version_cutoffs_strictly_increase_both_bitnesses() {
        let versions = [
            Version::Base,
            Version::Seh,
            Version::CfGuard,
            Version::CodeIntegrity,
            Version::CfGuardEx,
            Version::HybridPe,
            Version::RfGuard,
            Version::RfGuardEx,
            Version::Enclave,
            Version::VolatileMetadata,
            Version::EhGuard,
            Version::XfGuard,
            Version::CastGuard,
            Version::MemcpyGuard,
        ];
        for window in versions.windows(2) {
            assert!(window[0].cutoff(true) < window[1].cutoff(true));
            assert!(window[0].cutoff(false) < window[1].cutoff(false));
        }
    }
}
