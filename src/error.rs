use std::io;
use std::path::PathBuf;

use crate::reader::ReadError;

/// Errors encountered while opening an ELF file and parsing its headers.
///
/// All of these are recoverable at the module boundary: the unwind driver
/// treats a module that produces one of these as "no frames resolvable here"
/// and ends the backtrace instead of aborting the whole unwind.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Could not open {path}: {kind}")]
    FileOpen { path: PathBuf, kind: io::ErrorKind },

    #[error("Read of {size} bytes at file offset {offset:#x} did not complete")]
    TruncatedRead { offset: u64, size: u64 },

    #[error("ELF magic doesn't match")]
    BadMagic,

    #[error("Unsupported or mismatched ELF class {found}")]
    ClassMismatch { found: u8 },

    #[error("Section header string table index is zero")]
    MissingStringTable,

    #[error("Module has no .eh_frame section")]
    NoUnwindInfo,
}

impl ModuleError {
    pub(crate) fn from_io(path: &std::path::Path, e: &io::Error) -> Self {
        ModuleError::FileOpen {
            path: path.to_owned(),
            kind: e.kind(),
        }
    }
}

/// Errors encountered while parsing `.eh_frame` records or executing a CFI
/// instruction stream.
///
/// Each of these terminates the backtrace at the affected frame; the
/// frames accumulated before the failure are kept.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiError {
    #[error("CFI data ended early: {0}")]
    Truncated(#[from] ReadError),

    #[error("Record length {length:#x} at offset {offset:#x} overruns the section")]
    RecordOverrun { offset: u64, length: u64 },

    #[error("Augmentation data length {length:#x} at offset {offset:#x} overruns the record")]
    AugmentationOverrun { offset: u64, length: u64 },

    #[error("Augmentation string starts with {0:#04x}, expected NUL or 'z'")]
    MalformedAugmentation(u8),

    #[error("Unexpected augmentation character {0:?}")]
    UnsupportedAugmentation(char),

    #[error("FDE at offset {fde_offset:#x} references missing CIE at {cie_offset:#x}")]
    DanglingFde { fde_offset: u64, cie_offset: u64 },

    #[error("Unsupported or unknown CFI opcode {0:#04x}")]
    UnsupportedOpcode(u8),

    #[error("CFI operand arithmetic overflowed")]
    OperandOverflow,

    #[error("DW_CFA_def_cfa_register/offset without a register-based CFA rule")]
    IncompleteCfaRule,

    #[error("DW_CFA_remember_state nested too deeply")]
    RememberStackOverflow,

    #[error("DW_CFA_restore_state without a matching remember_state")]
    RestoreWithoutRemember,
}

/// Top-level unwinding error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("CFI error: {0}")]
    Cfi(#[from] CfiError),

    #[error("Could not read stack memory at {0:#x}")]
    CouldNotReadStack(u64),

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,

    #[error("Could not recover the CFA")]
    CouldNotRecoverCfa,
}
