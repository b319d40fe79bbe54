//! Top-level exception-directory loader: resolves the image's exception
//! data directory, dispatches by machine type, and assembles an
//! [`ExceptionDirectory`].
//!
//! Grounded on `exceptions/x64/x64_exception_directory_loader.h` for the
//! options surface (`include_headers`, `allow_virtual_data`,
//! `load_c_specific_handlers`, `max_c_specific_records`). `include_headers`
//! is threaded to every arch's directory-table read; `load_c_specific_handlers`
//! and `max_c_specific_records` only apply to the x64 path (the original
//! scopes this options surface to x64 too) and gate whether the scope-table
//! record count following `exception_handler_rva` is read and capped - this
//! crate does not decode the handler-private SEH record payload itself
//! (out of scope per the exception directory's Non-goals).

use super::{arm, arm64, x64, ExceptionDirectory, RuntimeFunctions};
use crate::error::{capture, PeError};
use crate::image::{Machine, ImageAccess, EXCEPTION_DIRECTORY_INDEX};

/// A second ARM64 exception directory reachable through a hybrid image's
/// CHPE metadata (`extra_rfe_table`). The load-config CHPE parser hands one
/// of these back to the caller, who passes it to [`load`] for the combined
/// pass described in the dispatch rules.
#[derive(Debug, Clone, Copy)]
pub struct ExtraArm64Directory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionLoaderOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    pub load_c_specific_handlers: bool,
    pub max_c_specific_records: u32,
}

impl Default for ExceptionLoaderOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            allow_virtual_data: false,
            load_c_specific_handlers: false,
            max_c_specific_records: 0xfffff,
        }
    }
}

/// Decodes the exception directory for `image`, dispatching on machine
/// type. `extra_arm64` carries a second ARM64 directory discovered via CHPE
/// metadata on a hybrid AMD64 image, if the caller has already resolved one.
pub fn load(
    image: &dyn ImageAccess,
    options: &ExceptionLoaderOptions,
    extra_arm64: Option<ExtraArm64Directory>,
) -> Result<ExceptionDirectory, PeError> {
    let mut directory = ExceptionDirectory::default();
    let Some(entry) = image.data_directory(EXCEPTION_DIRECTORY_INDEX) else {
        return Ok(directory);
    };
    if entry.size == 0 {
        return Ok(directory);
    }

    log::debug!(
        "loading exception directory at rva=0x{:x} size=0x{:x} machine={}",
        entry.virtual_address,
        entry.size,
        image.machine()
    );

    let primary = capture(&mut directory.errors, || match image.machine() {
        Machine::Amd64 => x64::load(
            image,
            entry.virtual_address,
            entry.size,
            options.allow_virtual_data,
            options.include_headers,
            options.load_c_specific_handlers,
            options.max_c_specific_records,
        )
        .map(RuntimeFunctions::X64),
        Machine::Arm64 => arm64::load(
            image,
            entry.virtual_address,
            entry.size,
            options.allow_virtual_data,
            options.include_headers,
        )
        .map(RuntimeFunctions::Arm64),
        Machine::ArmNt => arm::load(
            image,
            entry.virtual_address,
            entry.size,
            options.allow_virtual_data,
            options.include_headers,
        )
        .map(RuntimeFunctions::Arm),
        _ => {
            log::trace!("exception directory skipped: unsupported machine type");
            Ok(RuntimeFunctions::X64(Vec::new()))
        }
    });
    if let Some(table) = primary {
        if !table.is_empty() || matches!(image.machine(), Machine::Amd64 | Machine::Arm64 | Machine::ArmNt) {
            directory.tables.push(table);
        }
    }

    if let Some(extra) = extra_arm64 {
        log::debug!("loading hybrid CHPE ARM64 exception directory at rva=0x{:x}", extra.rva);
        if let Some(table) = capture(&mut directory.errors, || {
            arm64::load(image, extra.rva, extra.size, options.allow_virtual_data, options.include_headers)
                .map(RuntimeFunctions::Arm64)
        }) {
            directory.tables.push(table);
        }
    }

    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::image::{DataDirectory, SectionRef};

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
            Ok(MemoryBuffer::new(self.data[start..end].to_vec()).with_virtual_size(length as u64))
        }
        fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
            Ok(va as u32)
        }
        fn data_directory(&self, index: usize) -> Option<DataDirectory> {
            if index == crate::image::EXCEPTION_DIRECTORY_INDEX {
                Some(DataDirectory { virtual_address: 0x1000, size: 12 })
            } else {
                None
            }
        }
    }

    #[test]
    fn combines_primary_amd64_table_with_extra_arm64_directory() {
        let mut data = vec![0u8; 0x3000];
        // primary x64 directory at rva 0x1000: a single null (skipped) entry.
        // entirely zeroed already.

        // extra ARM64 directory at rva 0x2000: one packed-unwind-data entry.
        data[0x2000..0x2004].copy_from_slice(&0x4000u32.to_le_bytes()); // begin_address
        data[0x2004..0x2008].copy_from_slice(&0x0000_0003u32.to_le_bytes()); // packed (flag bits set)

        let image = FakeImage { data };
        let extra = ExtraArm64Directory { rva: 0x2000, size: 8 };
        let directory = load(&image, &ExceptionLoaderOptions::default(), Some(extra)).unwrap();

        assert_eq!(directory.tables.len(), 2);
        match &directory.tables[0] {
            RuntimeFunctions::X64(functions) => assert!(functions.is_empty()),
            other => panic!("expected primary x64 table, got {other:?}"),
        }
        match &directory.tables[1] {
            RuntimeFunctions::Arm64(functions) => {
                assert_eq!(functions.len(), 1);
                assert!(functions[0].packed.is_some());
            }
            other => panic!("expected extra arm64 table, got {other:?}"),
        }
    }
}
