use std::fmt::Debug;

use crate::arch::UnwindRegs;
use crate::display_utils::HexNum;

/// Register file for 32-bit x86, indexed by DWARF register number.
///
/// Slots 0 through 7 are eax, ecx, edx, ebx, esp, ebp, esi, edi; slot 8 is
/// eip, the return address column.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsX86 {
    slots: [u32; 9],
}

pub const X86_REG_ESP: u16 = 4;
pub const X86_REG_EBP: u16 = 5;
pub const X86_REG_EIP: u16 = 8;

impl UnwindRegsX86 {
    pub fn from_slots(slots: [u32; 9]) -> Self {
        Self { slots }
    }

    pub fn new(ip: u32, sp: u32, bp: u32) -> Self {
        let mut slots = [0; 9];
        slots[usize::from(X86_REG_EIP)] = ip;
        slots[usize::from(X86_REG_ESP)] = sp;
        slots[usize::from(X86_REG_EBP)] = bp;
        Self { slots }
    }

    #[inline(always)]
    pub fn bp(&self) -> u32 {
        self.slots[usize::from(X86_REG_EBP)]
    }
}

impl UnwindRegs for UnwindRegsX86 {
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
        u64::from(self.slots[usize::from(X86_REG_ESP)])
    }

    #[inline(always)]
    fn set_sp(&mut self, sp: u64) {
        self.slots[usize::from(X86_REG_ESP)] = sp as u32;
    }

    #[inline(always)]
    fn pc(&self) -> u64 {
        u64::from(self.slots[usize::from(X86_REG_EIP)])
    }

    #[inline(always)]
    fn set_pc(&mut self, pc: u64) {
        self.slots[usize::from(X86_REG_EIP)] = pc as u32;
    }
}

impl Debug for UnwindRegsX86 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindRegsX86")
            .field("ip", &HexNum(self.pc()))
            .field("sp", &HexNum(self.sp()))
            .field("bp", &HexNum(self.bp()))
            .finish()
    }
}
