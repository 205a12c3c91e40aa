//! A stack unwinder built on the DWARF call frame information that
//! compilers emit into ELF `.eh_frame` sections.
//!
//! Frame-pointer chains are optimized away in most release builds, so
//! reconstructing a call stack means doing what a C++ exception unwinder
//! does: find the unwind table entry covering the current program counter,
//! run its instruction stream to learn where the caller's registers were
//! saved, recover them, and repeat. This crate implements that loop for
//! x86, x86_64, ARM and AArch64:
//!
//!  - [`capture_registers`] snapshots the calling thread's registers
//!    (on the four supported architectures),
//!  - [`ElfModule`] parses a binary's headers and extracts `.eh_frame`,
//!  - [`CfiTable`] indexes the section's CIE and FDE records by address,
//!  - [`compute_unwind_row`] interprets the CFI opcode stream,
//!  - [`Unwinder`] drives the walk, caching parsed modules in a
//!    [`ModuleCache`] shared across threads.
//!
//! Translating live memory mappings into module paths is left to the
//! caller through the [`ResolveAddress`] trait, so the same driver works
//! for the current process, a ptraced target, or a captured core.
//!
//! ```no_run
//! use framewalk::{ModuleCache, ResolvedLocation, Unwinder};
//!
//! let cache = ModuleCache::new();
//! let resolver = |vaddr: u64| -> Option<ResolvedLocation> {
//!     // Consult /proc/self/maps, a minidump's module list, ...
//!     None
//! };
//! let unwinder = Unwinder::new(&cache, resolver);
//! # #[cfg(target_arch = "x86_64")]
//! for frame in &unwinder.unwind_current().frames {
//!     println!("{:#x} {} +{:#x}", frame.pc, frame.module.display(), frame.module_offset);
//! }
//! ```

pub mod arch;
mod cache;
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "arm"
))]
mod capture;
pub mod cfi;
mod display_utils;
pub mod eh_frame;
mod elf;
mod error;
pub mod reader;
mod unwinder;
pub mod unwindregs;

pub use arch::{Arch, ArchAarch64, ArchArm, ArchX86, ArchX86_64, UnwindRegs};
pub use cache::{CachedModule, ModuleCache};
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "arm"
))]
pub use capture::capture_registers;
pub use cfi::{compute_unwind_row, CfaRule, RegisterRule, UnwindRow};
pub use eh_frame::{CfiTable, CieRecord, FdeRecord};
pub use elf::{ElfClass, ElfModule, ProgramHeader, SectionHeader};
pub use error::{CfiError, Error, ModuleError};
pub use reader::ReadError;
pub use unwinder::{
    Backtrace, ResolveAddress, ResolvedLocation, UnwindFrame, UnwindOutcome, Unwinder,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The architecture this crate is being compiled for.
        pub type ArchNative = arch::ArchX86_64;
        pub type UnwindRegsNative = unwindregs::UnwindRegsX86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        /// The architecture this crate is being compiled for.
        pub type ArchNative = arch::ArchAarch64;
        pub type UnwindRegsNative = unwindregs::UnwindRegsAarch64;
    } else if #[cfg(target_arch = "x86")] {
        /// The architecture this crate is being compiled for.
        pub type ArchNative = arch::ArchX86;
        pub type UnwindRegsNative = unwindregs::UnwindRegsX86;
    } else if #[cfg(target_arch = "arm")] {
        /// The architecture this crate is being compiled for.
        pub type ArchNative = arch::ArchArm;
        pub type UnwindRegsNative = unwindregs::UnwindRegsArm;
    }
}
