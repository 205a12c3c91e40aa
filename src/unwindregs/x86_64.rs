use std::fmt::Debug;

use crate::arch::UnwindRegs;
use crate::display_utils::HexNum;

/// Register file for x86_64, indexed by DWARF register number.
///
/// Slots 0 through 15 are the integer registers (rax, rdx, rcx, rbx, rsi,
/// rdi, rbp, rsp, r8 through r15); slot 16 is the instruction pointer,
/// which doubles as the return address column in CFI.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsX86_64 {
    slots: [u64; 17],
}

pub const X86_64_REG_RBP: u16 = 6;
pub const X86_64_REG_RSP: u16 = 7;
pub const X86_64_REG_RIP: u16 = 16;

impl UnwindRegsX86_64 {
    pub fn from_slots(slots: [u64; 17]) -> Self {
        Self { slots }
    }

    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        let mut slots = [0; 17];
        slots[usize::from(X86_64_REG_RIP)] = ip;
        slots[usize::from(X86_64_REG_RSP)] = sp;
        slots[usize::from(X86_64_REG_RBP)] = bp;
        Self { slots }
    }

    #[inline(always)]
    pub fn bp(&self) -> u64 {
        self.slots[usize::from(X86_64_REG_RBP)]
    }
}

impl UnwindRegs for UnwindRegsX86_64 {
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
        self.slots[usize::from(X86_64_REG_RSP)]
    }

    #[inline(always)]
    fn set_sp(&mut self, sp: u64) {
        self.slots[usize::from(X86_64_REG_RSP)] = sp;
    }

    #[inline(always)]
    fn pc(&self) -> u64 {
        self.slots[usize::from(X86_64_REG_RIP)]
    }

    #[inline(always)]
    fn set_pc(&mut self, pc: u64) {
        self.slots[usize::from(X86_64_REG_RIP)] = pc;
    }
}

impl Debug for UnwindRegsX86_64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindRegsX86_64")
            .field("ip", &HexNum(self.pc()))
            .field("sp", &HexNum(self.sp()))
            .field("bp", &HexNum(self.bp()))
            .finish()
    }
}
