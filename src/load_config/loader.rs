//! Top-level load-config directory loader: resolves the versioned
//! descriptor, then walks every sub-table the version and [`LoadConfigLoaderOptions`]
//! enable, wrapping each step in a fault barrier so one bad pointer doesn't
//! sink the whole directory.
//!
//! Grounded on `load_config/load_config_directory_loader.h`'s `loader_options`
//! aggregate and its `load` entry point.

use crate::error::{capture, ErrorList, PeError, StructuralError};
use crate::image::{ImageAccess, LOAD_CONFIG_DIRECTORY_INDEX};

use super::guard::read_guard_function_table;
use super::{chpe, dvrt, enclave, read_ehcont_targets, read_lock_prefix_table, read_safeseh_handlers, volatile};
use super::{LoadConfigDescriptor, LoadConfigDirectory, Version};

/// Mirrors the upstream `loader_options`: every sub-table can be individually
/// skipped, and every variable-length sub-table has its own entry-count cap.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfigLoaderOptions {
    pub allow_virtual_data: bool,
    pub load_lock_prefix_table: bool,
    pub load_safeseh_handlers: bool,
    pub load_cf_guard_function_table: bool,
    pub load_guard_long_jump_table: bool,
    pub load_guard_export_suppression_table: bool,
    pub load_chpe_metadata: bool,
    pub load_dynamic_relocations: bool,
    pub load_enclave_config: bool,
    pub load_volatile_metadata: bool,
    pub load_ehcont_targets: bool,
    pub load_xfg_type_based_hashes: bool,
    pub max_lock_prefix_table_entries: u32,
    pub max_safeseh_handler_count: u32,
    pub max_cf_function_table_functions: u32,
    pub max_guard_export_suppression_table_functions: u32,
    pub max_guard_longjump_table_functions: u32,
    pub max_chpe_code_address_range_count: u32,
    pub max_enclave_number_of_imports: u32,
    pub max_volatile_metadata_access_entries: u32,
    pub max_volatile_metadata_info_range_entries: u32,
    pub max_ehcont_targets: u32,
}

impl Default for LoadConfigLoaderOptions {
    fn default() -> Self {
        Self {
            allow_virtual_data: false,
            load_lock_prefix_table: true,
            load_safeseh_handlers: true,
            load_cf_guard_function_table: true,
            load_guard_long_jump_table: true,
            load_guard_export_suppression_table: true,
            load_chpe_metadata: true,
            load_dynamic_relocations: true,
            load_enclave_config: true,
            load_volatile_metadata: true,
            load_ehcont_targets: true,
            load_xfg_type_based_hashes: true,
            max_lock_prefix_table_entries: 0xffff,
            max_safeseh_handler_count: 0xffff,
            max_cf_function_table_functions: 0xfffff,
            max_guard_export_suppression_table_functions: 0xfffff,
            max_guard_longjump_table_functions: 0xffff,
            max_chpe_code_address_range_count: 0xffff,
            max_enclave_number_of_imports: 0xff,
            max_volatile_metadata_access_entries: 0xffff,
            max_volatile_metadata_info_range_entries: 0xffff,
            max_ehcont_targets: 0xfffff,
        }
    }
}

/// Reads and fully resolves the load config directory, if the image carries
/// one. Returns `Ok(None)` when the data directory entry is absent or empty.
pub fn load(
    image: &dyn ImageAccess,
    options: &LoadConfigLoaderOptions,
) -> Result<Option<LoadConfigDirectory>, PeError> {
    let Some(dir) = image.data_directory(LOAD_CONFIG_DIRECTORY_INDEX) else {
        return Ok(None);
    };
    if dir.virtual_address == 0 || dir.size == 0 {
        return Ok(None);
    }

    let mut errors = ErrorList::new();
    let descriptor = match super::read_descriptor(image, dir.virtual_address, dir.size, options.allow_virtual_data) {
        Ok(descriptor) => descriptor,
        Err(_) => {
            errors.add_error(StructuralError::InvalidLoadConfigDirectory);
            return Ok(Some(LoadConfigDirectory {
                descriptor: degenerate_descriptor(),
                lock_prefix_table: None,
                safeseh_handlers: None,
                cf_guard_functions: None,
                address_taken_iat_functions: None,
                long_jump_functions: None,
                chpe_metadata: None,
                dynamic_relocations: None,
                enclave_config: None,
                volatile_metadata: None,
                eh_continuation_targets: None,
                errors,
            }));
        }
    };

    let is_64bit = image.is_64bit();
    let xfg_enabled = descriptor
        .cf_guard
        .as_ref()
        .map(|cf| cf.guard_flags.contains(super::guard::GuardFlags::XFG_ENABLED))
        .unwrap_or(false);

    let lock_prefix_table = if options.load_lock_prefix_table && descriptor.base.lock_prefix_table != 0 {
        let mut table_errors = ErrorList::new();
        let result = capture(&mut errors, || {
            read_lock_prefix_table(
                image,
                descriptor.base.lock_prefix_table,
                options.allow_virtual_data,
                options.max_lock_prefix_table_entries,
                &mut table_errors,
            )
        });
        errors.extend(table_errors);
        result
    } else {
        None
    };

    let safeseh_handlers = if options.load_safeseh_handlers && !is_64bit {
        descriptor.structured_exceptions.as_ref().and_then(|se| {
            if se.se_handler_table == 0 {
                return None;
            }
            let rva = image.va_to_rva(se.se_handler_table).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                read_safeseh_handlers(
                    image,
                    rva,
                    se.se_handler_count,
                    options.allow_virtual_data,
                    options.max_safeseh_handler_count,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    let cf_guard_functions = if options.load_cf_guard_function_table {
        descriptor.cf_guard.as_ref().and_then(|cf| {
            if cf.guard_cf_function_table == 0 || cf.guard_cf_function_count == 0 {
                return None;
            }
            let rva = image.va_to_rva(cf.guard_cf_function_table).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                read_guard_function_table(
                    image,
                    rva,
                    cf.guard_cf_function_count.min(u32::MAX as u64) as u32,
                    cf.guard_flags.function_table_stride(),
                    xfg_enabled && options.load_xfg_type_based_hashes,
                    options.allow_virtual_data,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    let address_taken_iat_functions = if options.load_guard_export_suppression_table {
        descriptor.cf_guard_ex.as_ref().and_then(|ex| {
            if ex.guard_address_taken_iat_entry_table == 0 || ex.guard_address_taken_iat_entry_count == 0 {
                return None;
            }
            let rva = image.va_to_rva(ex.guard_address_taken_iat_entry_table).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                read_guard_function_table(
                    image,
                    rva,
                    ex.guard_address_taken_iat_entry_count.min(u32::MAX as u64) as u32,
                    0,
                    false,
                    options.allow_virtual_data,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    let long_jump_functions = if options.load_guard_long_jump_table {
        descriptor.cf_guard_ex.as_ref().and_then(|ex| {
            if ex.guard_long_jump_target_table == 0 || ex.guard_long_jump_target_count == 0 {
                return None;
            }
            let rva = image.va_to_rva(ex.guard_long_jump_target_table).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                read_guard_function_table(
                    image,
                    rva,
                    ex.guard_long_jump_target_count.min(u32::MAX as u64) as u32,
                    0,
                    false,
                    options.allow_virtual_data,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    let chpe_metadata = if options.load_chpe_metadata {
        descriptor.hybrid_pe.as_ref().and_then(|hybrid| {
            if hybrid.chpe_metadata_pointer == 0 {
                return None;
            }
            let rva = image.va_to_rva(hybrid.chpe_metadata_pointer).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                chpe::read_chpe_metadata(
                    image,
                    rva,
                    options.allow_virtual_data,
                    options.max_chpe_code_address_range_count,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    let dynamic_relocations = if options.load_dynamic_relocations {
        descriptor.hybrid_pe.as_ref().and_then(|hybrid| {
            if hybrid.dynamic_value_reloc_table == 0 {
                return None;
            }
            let rva = image.va_to_rva(hybrid.dynamic_value_reloc_table).ok()?;
            let result = capture(&mut errors, || {
                dvrt::read_dynamic_relocation_table(image, rva, is_64bit, options.allow_virtual_data)
            });
            if let Some(ref table) = result {
                errors.extend(table.errors.clone());
            }
            result
        })
    } else {
        None
    };

    let enclave_config = if options.load_enclave_config {
        descriptor.enclave.as_ref().and_then(|enc| {
            if enc.enclave_configuration_pointer == 0 {
                return None;
            }
            let rva = image.va_to_rva(enc.enclave_configuration_pointer).ok()?;
            let result = capture(&mut errors, || {
                enclave::read_enclave_config(
                    image,
                    rva,
                    is_64bit,
                    options.allow_virtual_data,
                    options.max_enclave_number_of_imports,
                )
            });
            if let Some(ref config) = result {
                errors.extend(config.errors.clone());
            }
            result
        })
    } else {
        None
    };

    let volatile_metadata = if options.load_volatile_metadata {
        descriptor.volatile_metadata.as_ref().and_then(|vol| {
            if vol.volatile_metadata_pointer == 0 {
                return None;
            }
            let rva = image.va_to_rva(vol.volatile_metadata_pointer).ok()?;
            let result = capture(&mut errors, || {
                volatile::read_volatile_metadata(
                    image,
                    rva,
                    options.allow_virtual_data,
                    options.max_volatile_metadata_access_entries,
                    options.max_volatile_metadata_info_range_entries,
                )
            });
            if let Some(ref meta) = result {
                errors.extend(meta.errors.clone());
            }
            result
        })
    } else {
        None
    };

    let eh_continuation_targets = if options.load_ehcont_targets {
        descriptor.guard_exception_handling.as_ref().and_then(|eh| {
            if eh.guard_eh_continuation_table == 0 || eh.guard_eh_continuation_count == 0 {
                return None;
            }
            let rva = image.va_to_rva(eh.guard_eh_continuation_table).ok()?;
            let mut table_errors = ErrorList::new();
            let result = capture(&mut errors, || {
                read_ehcont_targets(
                    image,
                    rva,
                    eh.guard_eh_continuation_count,
                    options.allow_virtual_data,
                    options.max_ehcont_targets,
                    &mut table_errors,
                )
            });
            errors.extend(table_errors);
            result
        })
    } else {
        None
    };

    Ok(Some(LoadConfigDirectory {
        descriptor,
        lock_prefix_table,
        safeseh_handlers,
        cf_guard_functions,
        address_taken_iat_functions,
        long_jump_functions,
        chpe_metadata,
        dynamic_relocations,
        enclave_config,
        volatile_metadata,
        eh_continuation_targets,
        errors,
    }))
}

fn degenerate_descriptor() -> LoadConfigDescriptor {
    LoadConfigDescriptor {
        version: Version::Base,
        base: super::BaseFields::default(),
        structured_exceptions: None,
        cf_guard: None,
        code_integrity: None,
        cf_guard_ex: None,
        hybrid_pe: None,
        rf_guard: None,
        rf_guard_ex: None,
        enclave: None,
        volatile_metadata: None,
        guard_exception_handling: None,
        extended_flow_guard: None,
        cast_guard_os_determined_failure_mode: None,
        guard_memcpy_function_pointer: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let options = LoadConfigLoaderOptions::default();
        assert_eq!(options.max_safeseh_handler_count, 0xffff);
        assert_eq!(options.max_cf_function_table_functions, 0xfffff);
        assert_eq!(options.max_enclave_number_of_imports, 0xff);
        assert!(options.load_cf_guard_function_table);
    }
}
