use std::fmt::Debug;

use crate::arch::UnwindRegs;
use crate::display_utils::HexNum;

/// Register file for aarch64, indexed by DWARF register number.
///
/// Slots 0 through 30 are x0 through x30 (x29 is the frame pointer, x30 the
/// link register), slot 31 is sp. Slot 32 holds the pc, which has no DWARF
/// number of its own; the return address column is x30.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsAarch64 {
    slots: [u64; 33],
}

pub const AARCH64_REG_FP: u16 = 29;
pub const AARCH64_REG_LR: u16 = 30;
pub const AARCH64_REG_SP: u16 = 31;
pub const AARCH64_REG_PC: u16 = 32;

impl UnwindRegsAarch64 {
    pub fn from_slots(slots: [u64; 33]) -> Self {
        Self { slots }
    }

    pub fn new(lr: u64, sp: u64, fp: u64) -> Self {
        let mut slots = [0; 33];
        slots[usize::from(AARCH64_REG_LR)] = lr;
        slots[usize::from(AARCH64_REG_SP)] = sp;
        slots[usize::from(AARCH64_REG_FP)] = fp;
        slots[usize::from(AARCH64_REG_PC)] = lr;
        Self { slots }
    }

    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.slots[usize::from(AARCH64_REG_FP)]
    }

    #[inline(always)]
    pub fn lr(&self) -> u64 {
        self.slots[usize::from(AARCH64_REG_LR)]
    }
}

impl UnwindRegs for UnwindRegsAarch64 {
    fn get(&self, reg: u16) -> Option<u64> {
        self.slots.get(usize::from(reg)).copied()
    }

    fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.slots.get_mut(usize::from(reg)) {
            *slot = value;
        }
    }

    #[inline(always)]
    fn sp(&self) -> u64 {
        self.slots[usize::from(AARCH64_REG_SP)]
    }

    #[inline(always)]
    fn set_sp(&mut self, sp: u64) {
        self.slots[usize::from(AARCH64_REG_SP)] = sp;
    }

    #[inline(always)]
    fn pc(&self) -> u64 {
        self.slots[usize::from(AARCH64_REG_PC)]
    }

    #[inline(always)]
    fn set_pc(&mut self, pc: u64) {
        self.slots[usize::from(AARCH64_REG_PC)] = pc;
    }
}

impl Debug for UnwindRegsAarch64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindRegsAarch64")
            .field("pc", &HexNum(self.pc()))
            .field("lr", &HexNum(self.lr()))
            .field("sp", &HexNum(self.sp()))
            .field("fp", &HexNum(self.fp()))
            .finish()
    }
}
