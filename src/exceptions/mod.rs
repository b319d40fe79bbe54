//! The exception (unwind) directory: per-architecture `.pdata` tables and
//! their associated unwind information.
//!
//! Dispatch is purely by machine type: AMD64 images decode as [`x64`],
//! ARM64 images as [`arm64`] (plus a second
//! ARM64 pass over a hybrid image's CHPE `extra_rfe_table`, wired up by the
//! caller through [`loader::ExtraArm64Directory`]), and ARMNT images as
//! [`arm`]. Any other machine type yields an empty, error-free directory.

pub mod arm;
pub mod arm_common;
pub mod arm64;
pub mod loader;
pub mod x64;

use crate::error::ErrorList;

/// One architecture's worth of decoded runtime functions, tagged so a
/// caller walking a hybrid image's combined directory can tell which arch
/// produced which entries.
#[derive(Debug)]
pub enum RuntimeFunctions {
    X64(Vec<x64::RuntimeFunction>),
    Arm(Vec<arm::RuntimeFunction>),
    Arm64(Vec<arm64::RuntimeFunction>),
}

impl RuntimeFunctions {
    pub fn len(&self) -> usize {
        match self {
            RuntimeFunctions::X64(v) => v.len(),
            RuntimeFunctions::Arm(v) => v.len(),
            RuntimeFunctions::Arm64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The full set of exception directories found in an image: normally one,
/// but two for a hybrid AMD64/ARM64X image (the native AMD64 table plus the
/// ARM64 table reachable through CHPE metadata).
#[derive(Debug, Default)]
pub struct ExceptionDirectory {
    pub tables: Vec<RuntimeFunctions>,
    pub errors: ErrorList,
}

impl ExceptionDirectory {
    pub fn total_entries(&self) -> usize {
        self.tables.iter().map(RuntimeFunctions::len).sum()
    }
}
