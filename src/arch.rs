use std::fmt::Debug;

use crate::unwindregs::{UnwindRegsAarch64, UnwindRegsArm, UnwindRegsX86, UnwindRegsX86_64};

/// Architecture-independent access to a captured register file.
///
/// Registers are addressed by their DWARF register numbers, the same
/// numbering CFI instructions use. `get` returns `None` for numbers outside
/// the architecture's register file.
pub trait UnwindRegs: Clone + Debug {
    fn get(&self, reg: u16) -> Option<u64>;
    fn set(&mut self, reg: u16, value: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, sp: u64);
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
}

pub trait Arch {
    type UnwindRegs: UnwindRegs;
}

pub struct ArchX86_64;
impl Arch for ArchX86_64 {
    type UnwindRegs = UnwindRegsX86_64;
}

pub struct ArchX86;
impl Arch for ArchX86 {
    type UnwindRegs = UnwindRegsX86;
}

pub struct ArchAarch64;
impl Arch for ArchAarch64 {
    type UnwindRegs = UnwindRegsAarch64;
}

pub struct ArchArm;
impl Arch for ArchArm {
    type UnwindRegs = UnwindRegsArm;
}
