//! Architecture-independent memory barrier abstractions.
//!
//! Centralizes the fence used between publishing a virtqueue update and
//! ringing the device doorbell, so driver code does not need scattered
//! `#[cfg(target_arch)]` blocks with inline assembly.

use core::sync::atomic::{compiler_fence, Ordering};

/// Full memory fence -- all reads and writes issued before this barrier,
/// including device register accesses, are globally visible before any reads
/// or writes issued after it.
///
/// * **AArch64**: `dsb sy` -- Data Synchronization Barrier (full system).
/// * **RISC-V**: `fence iorw, iorw` -- orders memory and I/O accesses.
/// * **everything else**: `core::sync::atomic::fence(SeqCst)`.
#[inline(always)]
pub fn memory_fence() {
    compiler_fence(Ordering::SeqCst);

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `dsb sy` only orders outstanding memory accesses. It has no
        // other architectural side effects and does not touch the stack.
        unsafe {
            core::arch::asm!("dsb sy", options(nostack, preserves_flags));
        }
    }

    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    {
        // SAFETY: `fence iorw, iorw` orders all prior memory and I/O accesses
        // before all subsequent ones. No other side effects.
        unsafe {
            core::arch::asm!("fence iorw, iorw", options(nostack, preserves_flags));
        }
    }

    #[cfg(not(any(
        target_arch = "aarch64",
        target_arch = "riscv32",
        target_arch = "riscv64"
    )))]
    {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    compiler_fence(Ordering::SeqCst);
}
