//! Error taxonomy and the per-aggregate error-list mixin.
//!
//! Every parsed aggregate in this crate carries its own [`ErrorList`]
//! instead of aborting the whole parse on a recoverable problem. Only a
//! handful of operations - buffer reads that cannot be tolerated and
//! bit-field setters - return a hard [`PeError`].

use std::fmt;

/// Bounds-related failures: out-of-range reads, RVA/VA translation, integer
/// overflow in cursor arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsError {
    BufferOverrun,
    RvaOutOfBounds,
    InvalidVa,
    IntegerOverflow,
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BoundsError::BufferOverrun => "read crossed the physical end of the buffer",
            BoundsError::RvaOutOfBounds => "rva does not lie within any section or the headers",
            BoundsError::InvalidVa => "va does not lie within the image",
            BoundsError::IntegerOverflow => "cursor position arithmetic overflowed",
        };
        f.write_str(msg)
    }
}

/// Structural problems in the layout of a table or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralError {
    UnalignedUnwindInfo,
    UnalignedTable,
    UnalignedVolatileMetadataAccessRvaTableSize,
    UnalignedVolatileMetadataRangeTableSize,
    InvalidRuntimeFunctionEntry,
    InvalidBaseRelocation,
    InvalidLoadConfigDirectory,
    UnmatchedDirectorySize,
    InvalidLockPrefixTable,
    TruncatedOptionalHeader,
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StructuralError::UnalignedUnwindInfo => "unwind info is not 4-byte aligned",
            StructuralError::UnalignedTable => "table size is not a multiple of its entry size",
            StructuralError::UnalignedVolatileMetadataAccessRvaTableSize => {
                "volatile metadata access rva table size is not a multiple of 4"
            }
            StructuralError::UnalignedVolatileMetadataRangeTableSize => {
                "volatile metadata range table size is not a multiple of 8"
            }
            StructuralError::InvalidRuntimeFunctionEntry => "runtime function entry is invalid",
            StructuralError::InvalidBaseRelocation => "base relocation entry is invalid",
            StructuralError::InvalidLoadConfigDirectory => {
                "load config directory size is absent or degenerate"
            }
            StructuralError::UnmatchedDirectorySize => {
                "declared directory size exceeds the data directory bounds"
            }
            StructuralError::InvalidLockPrefixTable => {
                "lock prefix table entry va does not resolve into the image"
            }
            StructuralError::TruncatedOptionalHeader => {
                "optional header is shorter than size_of_optional_header declares"
            }
        };
        f.write_str(msg)
    }
}

/// Version/format-discriminator problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningError {
    UnknownChpeMetadataType,
    UnknownDynamicRelocationTableVersion,
    UnknownDynamicRelocationSymbol,
    InvalidVersion,
    UnknownUnwindVersion,
    UnknownBddInfoEntryVersion,
}

impl fmt::Display for VersioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VersioningError::UnknownChpeMetadataType => "unrecognized chpe metadata type",
            VersioningError::UnknownDynamicRelocationTableVersion => {
                "unrecognized dynamic relocation table version"
            }
            VersioningError::UnknownDynamicRelocationSymbol => {
                "unrecognized dynamic relocation symbol"
            }
            VersioningError::InvalidVersion => "unrecognized structure version",
            VersioningError::UnknownUnwindVersion => "unrecognized x64 unwind info version",
            VersioningError::UnknownBddInfoEntryVersion => "unrecognized bdd info entry version",
        };
        f.write_str(msg)
    }
}

/// Semantic rule violations: ordering, mutual exclusion, sortedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticError {
    PushNonvolUwopOutOfOrder,
    InvalidUnwindInfoFlags,
    UnsortedCfGuardTable,
    UnsortedEhcontTargets,
    UnsortedGuardLongjumpTable,
    UnsortedGuardExportSuppressionTable,
    BothSetFpregTypesUsed,
    UnknownUnwindCode,
    InvalidExceptionHandlerRva,
    InvalidChainedRuntimeFunctionEntry,
    ChainDepthExceeded,
    InvalidXfgTypeBasedHashRva,
    InvalidCSpecificHandlerRecordCount,
}

impl fmt::Display for SemanticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SemanticError::PushNonvolUwopOutOfOrder => {
                "push_nonvol unwind code appears out of order"
            }
            SemanticError::InvalidUnwindInfoFlags => {
                "chaininfo flag combined with ehandler/uhandler"
            }
            SemanticError::UnsortedCfGuardTable => "cf guard function table entries not sorted",
            SemanticError::UnsortedEhcontTargets => "eh continuation targets not sorted",
            SemanticError::UnsortedGuardLongjumpTable => "guard longjump table entries not sorted",
            SemanticError::UnsortedGuardExportSuppressionTable => {
                "guard export suppression table entries not sorted"
            }
            SemanticError::BothSetFpregTypesUsed => {
                "both set_fpreg and set_fpreg_large used in one record"
            }
            SemanticError::UnknownUnwindCode => "unrecognized unwind opcode",
            SemanticError::InvalidExceptionHandlerRva => "exception handler rva is invalid",
            SemanticError::InvalidChainedRuntimeFunctionEntry => {
                "chained runtime function entry is invalid"
            }
            SemanticError::ChainDepthExceeded => "unwind chain depth limit exceeded",
            SemanticError::InvalidXfgTypeBasedHashRva => "xfg type based hash rva is invalid",
            SemanticError::InvalidCSpecificHandlerRecordCount => {
                "c-specific handler scope table count could not be read"
            }
        };
        f.write_str(msg)
    }
}

/// Bit-field setter validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetterError {
    InvalidAllocationSize,
    InvalidStackOffset,
    InvalidFunctionLength,
    InvalidRegister,
    InvalidOperationInfo,
}

impl fmt::Display for SetterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SetterError::InvalidAllocationSize => "allocation size does not fit the field width",
            SetterError::InvalidStackOffset => "stack offset does not fit the field width",
            SetterError::InvalidFunctionLength => {
                "function length is not a multiple of the arch unit or overflows its field"
            }
            SetterError::InvalidRegister => "register id is out of range",
            SetterError::InvalidOperationInfo => "operation info does not fit in 4 bits",
        };
        f.write_str(msg)
    }
}

/// Table/record counts exceeding a caller-supplied cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    InvalidSafesehHandlerTable,
    InvalidCfGuardTableFunctionCount,
    InvalidGuardExportSuppressionTableFunctionCount,
    InvalidGuardLongjumpTableFunctionCount,
    InvalidChpeRangeEntryCount,
    InvalidEnclaveImportArray,
    InvalidVolatileMetadataAccessRvaTableEntryCount,
    InvalidVolatileMetadataRangeTableEntryCount,
    InvalidEhcontTargetsCount,
    InvalidLockPrefixTableEntryCount,
    TooManyCSpecificHandlerRecords,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CapacityError::InvalidSafesehHandlerTable => "safeseh handler count exceeds the cap",
            CapacityError::InvalidCfGuardTableFunctionCount => {
                "cf guard function table count exceeds the cap"
            }
            CapacityError::InvalidGuardExportSuppressionTableFunctionCount => {
                "guard export suppression table count exceeds the cap"
            }
            CapacityError::InvalidGuardLongjumpTableFunctionCount => {
                "guard longjump table count exceeds the cap"
            }
            CapacityError::InvalidChpeRangeEntryCount => "chpe range entry count exceeds the cap",
            CapacityError::InvalidEnclaveImportArray => "enclave import count exceeds the cap",
            CapacityError::InvalidVolatileMetadataAccessRvaTableEntryCount => {
                "volatile metadata access rva table entry count exceeds the cap"
            }
            CapacityError::InvalidVolatileMetadataRangeTableEntryCount => {
                "volatile metadata range table entry count exceeds the cap"
            }
            CapacityError::InvalidEhcontTargetsCount => "eh continuation targets count exceeds the cap",
            CapacityError::InvalidLockPrefixTableEntryCount => {
                "lock prefix table entry count exceeds the cap before a nul va sentinel was found"
            }
            CapacityError::TooManyCSpecificHandlerRecords => {
                "c-specific handler scope table record count exceeds the cap"
            }
        };
        f.write_str(msg)
    }
}

/// Crate-wide error type: one variant per taxonomy kind from the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeError {
    Bounds(BoundsError),
    Structural(StructuralError),
    Versioning(VersioningError),
    Semantic(SemanticError),
    Setter(SetterError),
    Capacity(CapacityError),
}

impl fmt::Display for PeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeError::Bounds(e) => write!(f, "{e}"),
            PeError::Structural(e) => write!(f, "{e}"),
            PeError::Versioning(e) => write!(f, "{e}"),
            PeError::Semantic(e) => write!(f, "{e}"),
            PeError::Setter(e) => write!(f, "{e}"),
            PeError::Capacity(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PeError {}

macro_rules! impl_from_kind {
    ($kind:ty, $variant:ident) => {
        impl From<$kind> for PeError {
            fn from(value: $kind) -> Self {
                PeError::$variant(value)
            }
        }
    };
}

impl_from_kind!(BoundsError, Bounds);
impl_from_kind!(StructuralError, Structural);
impl_from_kind!(VersioningError, Versioning);
impl_from_kind!(SemanticError, Semantic);
impl_from_kind!(SetterError, Setter);
impl_from_kind!(CapacityError, Capacity);

/// Hard failures specific to [`crate::image::Image::parse`] itself, as
/// opposed to recoverable directory/table problems recorded onto an
/// `ErrorList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    InvalidMzSignature,
    InvalidPeSignature,
    MissingOptionalHeader,
    Cursor(PeError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::InvalidMzSignature => f.write_str("missing or invalid MZ signature"),
            ImageError::InvalidPeSignature => f.write_str("missing or invalid PE signature"),
            ImageError::MissingOptionalHeader => {
                f.write_str("optional header is absent or zero-sized")
            }
            ImageError::Cursor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<PeError> for ImageError {
    fn from(value: PeError) -> Self {
        ImageError::Cursor(value)
    }
}

/// Typed context attached alongside an error code, e.g. the index of the
/// offending table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    None,
    Index(usize),
    Rva(u32),
    Offset(u64),
    Message(String),
}

/// A single diagnostic entry: an error code plus optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: PeError,
    pub context: ErrorContext,
}

/// An unordered multiset of diagnostics attached to a parsed aggregate.
///
/// Carrying entries does not make the aggregate invalid; it only records
/// that something recoverable went wrong while building it.
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    entries: Vec<ErrorEntry>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, code: impl Into<PeError>) {
        self.entries.push(ErrorEntry {
            code: code.into(),
            context: ErrorContext::None,
        });
    }

    pub fn add_error_with_context(&mut self, code: impl Into<PeError>, context: ErrorContext) {
        self.entries.push(ErrorEntry {
            code: code.into(),
            context,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, code: impl Into<PeError>) -> bool {
        let code = code.into();
        self.entries.iter().any(|e| e.code == code)
    }

    /// Folds another list's entries into this one, preserving order.
    pub fn extend(&mut self, other: ErrorList) {
        self.entries.extend(other.entries);
    }
}

impl PartialEq for ErrorList {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        let mut remaining: Vec<&ErrorEntry> = other.entries.iter().collect();
        for entry in &self.entries {
            let Some(pos) = remaining.iter().position(|e| *e == entry) else {
                return false;
            };
            remaining.remove(pos);
        }
        true
    }
}

impl Eq for ErrorList {}

/// Runs `f`; on failure, records the error onto `errors` and returns `None`
/// instead of propagating. This is the "fault barrier" used at every
/// sub-table boundary so that one broken table does not abort the rest of
/// the directory.
pub fn capture<T>(errors: &mut ErrorList, f: impl FnOnce() -> Result<T, PeError>) -> Option<T> {
    match f() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("sub-table parse failed, recording diagnostic: {e}");
            errors.add_error(e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_error_lists_are_equal() {
        assert_eq!(ErrorList::new(), ErrorList::new());
    }

    #[test]
    fn error_lists_compare_as_multisets() {
        let mut a = ErrorList::new();
        a.add_error(BoundsError::BufferOverrun);
        a.add_error(SemanticError::UnknownUnwindCode);

        let mut b = ErrorList::new();
        b.add_error(SemanticError::UnknownUnwindCode);
        b.add_error(BoundsError::BufferOverrun);

        assert_eq!(a, b);
    }

    #[test]
    fn capture_folds_error_into_list_and_continues() {
        let mut errors = ErrorList::new();
        let result: Option<u32> =
            capture(&mut errors, || Err(BoundsError::BufferOverrun.into()));
        assert!(result.is_none());
        assert!(errors.has_errors());
        assert!(errors.contains(BoundsError::BufferOverrun));
    }
}
