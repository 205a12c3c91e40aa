use std::fmt::Debug;

use crate::arch::UnwindRegs;
use crate::display_utils::HexNum;

/// Register file for 32-bit ARM, indexed by DWARF register number.
///
/// Slots 0 through 15 are r0 through r15: r13 is sp, r14 the link register
/// and return address column, r15 the pc.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsArm {
    slots: [u32; 16],
}

pub const ARM_REG_SP: u16 = 13;
pub const ARM_REG_LR: u16 = 14;
pub const ARM_REG_PC: u16 = 15;

impl UnwindRegsArm {
    pub fn from_slots(slots: [u32; 16]) -> Self {
        Self { slots }
    }

    pub fn new(lr: u32, sp: u32, fp: u32) -> Self {
        let mut slots = [0; 16];
        slots[usize::from(ARM_REG_LR)] = lr;
        slots[usize::from(ARM_REG_SP)] = sp;
        slots[11] = fp;
        slots[usize::from(ARM_REG_PC)] = lr;
        Self { slots }
    }

    #[inline(always)]
    pub fn lr(&self) -> u32 {
        self.slots[usize::from(ARM_REG_LR)]
    }
}

impl UnwindRegs for UnwindRegsArm {
    fn get(&self, reg: u16) -> Option<u64> {
        self.slots.get(usize::from(reg)).map(|&v| u64::from(v))
    }

    fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.slots.get_mut(usize::from(reg)) {
            *slot = value as u32;
        }
    }

    #[inline(always)]
    fn sp(&self) -> u64 {
        u64::from(self.slots[usize::from(ARM_REG_SP)])
    }

    #[inline(always)]
    fn set_sp(&mut self, sp: u64) {
        self.slots[usize::from(ARM_REG_SP)] = sp as u32;
    }

    #[inline(always)]
    fn pc(&self) -> u64 {
        u64::from(self.slots[usize::from(ARM_REG_PC)])
    }

    #[inline(always)]
    fn set_pc(&mut self, pc: u64) {
        self.slots[usize::from(ARM_REG_PC)] = pc as u32;
    }
}

impl Debug for UnwindRegsArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindRegsArm")
            .field("pc", &HexNum(self.pc()))
            .field("lr", &HexNum(self.lr()))
            .field("sp", &HexNum(self.sp()))
            .finish()
    }
}
