//! Live capture of the calling thread's registers.
//!
//! Each architecture has a small naked routine that stores the register
//! file into a caller-provided buffer, laid out by DWARF register number.
//! The captured state describes the *caller* at the point just after the
//! call returns: the stack pointer slot holds the post-return sp and the
//! pc slot holds the return address, so the caller's own frame is the
//! first one the unwinder sees.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use crate::unwindregs::UnwindRegsX86_64;

        #[unsafe(naked)]
        unsafe extern "C" fn capture_raw(_buf: *mut u64) -> i32 {
            // rax is stored first, before anything clobbers it.
            core::arch::naked_asm!(
                "mov [rdi + 0x00], rax",
                "mov [rdi + 0x08], rdx",
                "mov [rdi + 0x10], rcx",
                "mov [rdi + 0x18], rbx",
                "mov [rdi + 0x20], rsi",
                "mov [rdi + 0x28], rdi",
                "mov [rdi + 0x30], rbp",
                "lea rax, [rsp + 8]",
                "mov [rdi + 0x38], rax",
                "mov [rdi + 0x40], r8",
                "mov [rdi + 0x48], r9",
                "mov [rdi + 0x50], r10",
                "mov [rdi + 0x58], r11",
                "mov [rdi + 0x60], r12",
                "mov [rdi + 0x68], r13",
                "mov [rdi + 0x70], r14",
                "mov [rdi + 0x78], r15",
                "mov rax, [rsp]",
                "mov [rdi + 0x80], rax",
                "xor eax, eax",
                "ret",
            )
        }

        /// Captures the current thread's registers as seen by the caller.
        #[inline(always)]
        pub fn capture_registers() -> UnwindRegsX86_64 {
            let mut slots = [0u64; 17];
            unsafe {
                capture_raw(slots.as_mut_ptr());
            }
            UnwindRegsX86_64::from_slots(slots)
        }
    } else if #[cfg(target_arch = "aarch64")] {
        use crate::unwindregs::UnwindRegsAarch64;

        #[unsafe(naked)]
        unsafe extern "C" fn capture_raw(_buf: *mut u64) -> i32 {
            // x0 holds the buffer pointer and is also slot 0; the first
            // stp stores it before it is needed again.
            core::arch::naked_asm!(
                "stp x0, x1, [x0, #0x00]",
                "stp x2, x3, [x0, #0x10]",
                "stp x4, x5, [x0, #0x20]",
                "stp x6, x7, [x0, #0x30]",
                "stp x8, x9, [x0, #0x40]",
                "stp x10, x11, [x0, #0x50]",
                "stp x12, x13, [x0, #0x60]",
                "stp x14, x15, [x0, #0x70]",
                "stp x16, x17, [x0, #0x80]",
                "stp x18, x19, [x0, #0x90]",
                "stp x20, x21, [x0, #0xa0]",
                "stp x22, x23, [x0, #0xb0]",
                "stp x24, x25, [x0, #0xc0]",
                "stp x26, x27, [x0, #0xd0]",
                "stp x28, x29, [x0, #0xe0]",
                "str x30, [x0, #0xf0]",
                "mov x9, sp",
                "str x9, [x0, #0xf8]",
                "str x30, [x0, #0x100]",
                "mov x0, xzr",
                "ret",
            )
        }

        /// Captures the current thread's registers as seen by the caller.
        #[inline(always)]
        pub fn capture_registers() -> UnwindRegsAarch64 {
            let mut slots = [0u64; 33];
            unsafe {
                capture_raw(slots.as_mut_ptr());
            }
            UnwindRegsAarch64::from_slots(slots)
        }
    } else if #[cfg(target_arch = "x86")] {
        use crate::unwindregs::UnwindRegsX86;

        #[unsafe(naked)]
        unsafe extern "C" fn capture_raw(_buf: *mut u32) -> i32 {
            // cdecl: [esp] is the return address, [esp + 4] the buffer.
            core::arch::naked_asm!(
                "push eax",
                "mov eax, [esp + 8]",
                "mov [eax + 4], ecx",
                "mov [eax + 8], edx",
                "mov [eax + 12], ebx",
                "mov [eax + 20], ebp",
                "mov [eax + 24], esi",
                "mov [eax + 28], edi",
                "mov ecx, [esp]",
                "mov [eax + 0], ecx",
                "lea ecx, [esp + 8]",
                "mov [eax + 16], ecx",
                "mov ecx, [esp + 4]",
                "mov [eax + 32], ecx",
                "add esp, 4",
                "xor eax, eax",
                "ret",
            )
        }

        /// Captures the current thread's registers as seen by the caller.
        #[inline(always)]
        pub fn capture_registers() -> UnwindRegsX86 {
            let mut slots = [0u32; 9];
            unsafe {
                capture_raw(slots.as_mut_ptr());
            }
            UnwindRegsX86::from_slots(slots)
        }
    } else if #[cfg(target_arch = "arm")] {
        use crate::unwindregs::UnwindRegsArm;

        #[unsafe(naked)]
        unsafe extern "C" fn capture_raw(_buf: *mut u32) -> i32 {
            core::arch::naked_asm!(
                "stmia r0, {{r0-r12}}",
                "str sp, [r0, #52]",
                "str lr, [r0, #56]",
                "str lr, [r0, #60]",
                "mov r0, #0",
                "bx lr",
            )
        }

        /// Captures the current thread's registers as seen by the caller.
        #[inline(always)]
        pub fn capture_registers() -> UnwindRegsArm {
            let mut slots = [0u32; 16];
            unsafe {
                capture_raw(slots.as_mut_ptr());
            }
            UnwindRegsArm::from_slots(slots)
        }
    }
}

#[cfg(all(
    test,
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86",
        target_arch = "arm"
    )
))]
mod tests {
    use super::capture_registers;
    use crate::arch::UnwindRegs;

    #[test]
    fn consecutive_captures_share_a_stack_pointer() {
        let first = capture_registers();
        let second = capture_registers();
        assert_eq!(first.sp(), second.sp());
        assert!(second.pc() > first.pc());
        // Both return addresses lie inside this small test function.
        assert!(second.pc() - first.pc() < 0x1000);
    }

    #[test]
    fn captured_stack_pointer_is_plausible() {
        let local = 0u64;
        let regs = capture_registers();
        let addr = &local as *const u64 as u64;
        // The local lives below the captured caller sp, within a few pages.
        assert!(regs.sp() > addr);
        assert!(regs.sp() - addr < 0x10000);
    }
}
