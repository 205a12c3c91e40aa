//! The frame-walking driver.
//!
//! Starting from a register snapshot, the driver repeatedly resolves the
//! current program counter to a module, looks up the covering FDE in that
//! module's CFI table, computes the row of recovery rules in effect, and
//! derives the caller's register snapshot, collecting one [`UnwindFrame`]
//! per step until a stop condition is reached.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::arch::{Arch, UnwindRegs};
use crate::cache::ModuleCache;
use crate::cfi::{self, CfaRule, RegisterRule};
use crate::error::{CfiError, Error};

/// Where a virtual address lives: the backing file and the value to
/// subtract from runtime addresses to obtain the file's link-time
/// addresses.
///
/// Producing this from live memory mappings is the caller's job; the bias
/// for a position-independent binary is the mapping base minus the
/// module's minimum executable load address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub path: PathBuf,
    pub load_bias: u64,
}

/// Maps virtual addresses to modules. `None` means the address is not in
/// any known mapping, which ends the walk normally.
pub trait ResolveAddress {
    fn resolve(&self, vaddr: u64) -> Option<ResolvedLocation>;
}

impl<F> ResolveAddress for F
where
    F: Fn(u64) -> Option<ResolvedLocation>,
{
    fn resolve(&self, vaddr: u64) -> Option<ResolvedLocation> {
        self(vaddr)
    }
}

/// One backtrace entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwindFrame {
    pub pc: u64,
    pub module: PathBuf,
    /// `pc` relative to the module's link-time address space.
    pub module_offset: u64,
}

/// How the walk ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnwindOutcome {
    /// A natural stop: unmapped address, module without unwind info, no
    /// covering FDE, zero return address, or a CFA that stopped advancing.
    Completed,
    FrameLimitReached,
    /// Malformed input or unreadable stack memory ended the walk early.
    /// The frames collected before the failure are still in the backtrace.
    Aborted(Error),
}

#[derive(Clone, Debug)]
pub struct Backtrace {
    pub frames: Vec<UnwindFrame>,
    pub outcome: UnwindOutcome,
}

const DEFAULT_MAX_FRAMES: usize = 128;

/// Walks stacks using CFI tables served by a shared [`ModuleCache`].
pub struct Unwinder<'c, R: ResolveAddress> {
    cache: &'c ModuleCache,
    resolver: R,
    max_frames: usize,
}

impl<'c, R: ResolveAddress> Unwinder<'c, R> {
    pub fn new(cache: &'c ModuleCache, resolver: R) -> Self {
        Self {
            cache,
            resolver,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Walks the stack described by `regs`, reading stack memory through
    /// `read_stack`. Frames are ordered innermost first.
    pub fn unwind<A, F>(&self, regs: A::UnwindRegs, read_stack: &mut F) -> Backtrace
    where
        A: Arch,
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let mut frames = Vec::new();
        let mut regs = regs;
        let mut prev_cfa: Option<u64> = None;
        let mut is_first_frame = true;

        loop {
            // Return addresses point at the instruction after the call;
            // backing up one byte keeps the lookup inside the calling
            // function even when the call is its final instruction.
            let pc = regs.pc();
            let lookup_pc = if is_first_frame { pc } else { pc - 1 };

            let location = match self.resolver.resolve(lookup_pc) {
                Some(location) => location,
                None => {
                    trace!(pc, "address not in any mapping, walk complete");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
            };

            // A bias above the pc means the resolver's mapping cannot
            // contain this address; treat the frame as unresolvable.
            let adjusted_pc = match lookup_pc.checked_sub(location.load_bias) {
                Some(adjusted_pc) => adjusted_pc,
                None => {
                    trace!(pc, load_bias = location.load_bias, "address below module bias, walk complete");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
            };

            let module = match self.cache.open_module(&location.path) {
                Ok(module) => module,
                Err(e) => {
                    debug!(path = %location.path.display(), error = %e, "unusable module ends the walk");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
            };

            let table = match module.cfi_table() {
                Ok(table) => table,
                // A module without unwind info is a natural boundary;
                // malformed CFI data is a failure.
                Err(Error::Module(e)) => {
                    debug!(path = %location.path.display(), error = %e, "no unwind info, walk complete");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
                Err(e) => {
                    debug!(path = %location.path.display(), error = %e, "malformed unwind info");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Aborted(e),
                    };
                }
            };

            let fde = match table.fde_covering(adjusted_pc) {
                Some(fde) => fde,
                None => {
                    trace!(adjusted_pc, "no FDE covers this address, walk complete");
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
            };

            // The frame's identity is known as soon as an FDE covers it,
            // so record it before rule evaluation can fail.
            debug!(
                frame = frames.len(),
                pc,
                module = %location.path.display(),
                function_start = fde.start,
                "walked one frame"
            );
            frames.push(UnwindFrame {
                pc,
                module: location.path.clone(),
                // pc differs from lookup_pc by at most the one-byte backup.
                module_offset: adjusted_pc + (pc - lookup_pc),
            });
            if frames.len() >= self.max_frames {
                return Backtrace {
                    frames,
                    outcome: UnwindOutcome::FrameLimitReached,
                };
            }

            let step = self.step::<A>(&table, fde, adjusted_pc, &regs, prev_cfa, read_stack);
            match step {
                Ok(Some((next_regs, cfa))) => {
                    regs = next_regs;
                    prev_cfa = Some(cfa);
                    is_first_frame = false;
                }
                Ok(None) => {
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Completed,
                    };
                }
                Err(e) => {
                    return Backtrace {
                        frames,
                        outcome: UnwindOutcome::Aborted(e),
                    };
                }
            }
        }
    }

    /// Computes the caller's registers for one frame. `Ok(None)` is a
    /// natural stop (undefined or zero return address, CFA not advancing).
    fn step<A: Arch>(
        &self,
        table: &crate::eh_frame::CfiTable,
        fde: &crate::eh_frame::FdeRecord,
        adjusted_pc: u64,
        regs: &A::UnwindRegs,
        prev_cfa: Option<u64>,
        read_stack: &mut dyn FnMut(u64) -> Result<u64, ()>,
    ) -> Result<Option<(A::UnwindRegs, u64)>, Error> {
        let cie = table.cie_for(fde).ok_or(Error::Cfi(CfiError::DanglingFde {
            fde_offset: 0,
            cie_offset: fde.cie_offset,
        }))?;
        let row = cfi::compute_unwind_row(table, cie, fde, adjusted_pc)?;

        let cfa = match row.cfa {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = regs.get(register).ok_or(Error::CouldNotRecoverCfa)?;
                base.checked_add_signed(offset)
                    .ok_or(Error::IntegerOverflow)?
            }
            CfaRule::Unset => return Err(Error::CouldNotRecoverCfa),
        };
        if let Some(prev) = prev_cfa {
            if cfa <= prev {
                trace!(cfa, prev, "CFA did not advance, walk complete");
                return Ok(None);
            }
        }

        // A fresh snapshot per frame keeps earlier frames inspectable and
        // lets rules read the callee's values while writing the caller's.
        // The caller's sp defaults to the CFA; an explicit rule for the
        // sp register overrides it below.
        let mut next_regs = regs.clone();
        next_regs.set_sp(cfa);
        for &(register, rule) in row.rules() {
            match recover_register(rule, cfa, regs, read_stack)? {
                Some(value) => next_regs.set(register, value),
                None => {
                    // Undefined or same-value: the callee's value stands.
                }
            }
        }

        let ra_register = row.return_address_register;
        match row.rule_for(ra_register) {
            Some(RegisterRule::Undefined) | None => {
                trace!("return address is undefined, walk complete");
                return Ok(None);
            }
            Some(_) => {}
        }
        let return_address = next_regs.get(ra_register).ok_or(Error::CouldNotRecoverCfa)?;
        if return_address == 0 {
            trace!("return address is zero, walk complete");
            return Ok(None);
        }

        next_regs.set_pc(return_address);
        Ok(Some((next_regs, cfa)))
    }
}

/// Applies one register's recovery rule. `Ok(None)` means the value is
/// carried over unchanged.
fn recover_register<U: UnwindRegs>(
    rule: RegisterRule,
    cfa: u64,
    regs: &U,
    read_stack: &mut dyn FnMut(u64) -> Result<u64, ()>,
) -> Result<Option<u64>, Error> {
    match rule {
        RegisterRule::Undefined | RegisterRule::SameValue => Ok(None),
        RegisterRule::Offset(offset) => {
            let addr = cfa
                .checked_add_signed(offset)
                .ok_or(Error::IntegerOverflow)?;
            let value = read_stack(addr).map_err(|_| Error::CouldNotReadStack(addr))?;
            Ok(Some(value))
        }
        RegisterRule::ValOffset(offset) => {
            let value = cfa
                .checked_add_signed(offset)
                .ok_or(Error::IntegerOverflow)?;
            Ok(Some(value))
        }
        RegisterRule::Register(source) => {
            let value = regs.get(source).ok_or(Error::CouldNotRecoverCfa)?;
            Ok(Some(value))
        }
        RegisterRule::AtAddress(addr) => {
            let value = read_stack(addr).map_err(|_| Error::CouldNotReadStack(addr))?;
            Ok(Some(value))
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86",
        target_arch = "arm"
    ))] {
        use crate::capture::capture_registers;

        impl<'c, R: ResolveAddress> Unwinder<'c, R> {
            /// Captures the calling thread's registers and walks its own
            /// stack, reading stack memory directly from this process.
            pub fn unwind_current(&self) -> Backtrace {
                let regs = capture_registers();
                let mut read_stack = |addr: u64| {
                    if addr % 8 != 0 || addr == 0 {
                        return Err(());
                    }
                    // The addresses CFI derives for our own live stack are
                    // within this thread's mapped stack region.
                    Ok(unsafe { (addr as *const u64).read_volatile() })
                };
                self.unwind::<crate::ArchNative, _>(regs, &mut read_stack)
            }
        }
    }
}
