//! Fenced memory-mapped register access.
//!
//! The only place in the crate where raw volatile access happens. The
//! fence discipline guarantees that register side effects (a claim read
//! clearing the pending bit, an enable write becoming visible to the
//! routing logic) are observed in program order on the issuing hart:
//! reads are bracketed by a full read-write fence and a load-load fence,
//! writes are followed by a store-store fence and an I/O fence.

use cfg_if::cfg_if;

/// Memory-mapped register address
pub type MemAddr = usize;

/// Read a 32-bit register.
///
/// # Safety
/// `addr` must lie inside a device register window validated at
/// bring-up and be 4-byte aligned. There is no runtime check: an
/// address outside the window is a configuration bug, not a
/// recoverable condition.
#[inline]
pub unsafe fn read32(addr: MemAddr) -> u32 {
    fence_rw_rw();
    let value = core::ptr::read_volatile(addr as *const u32);
    fence_r_r();
    value
}

/// Write a 32-bit register.
///
/// # Safety
/// Same window and alignment precondition as [`read32`].
#[inline]
pub unsafe fn write32(addr: MemAddr, value: u32) {
    core::ptr::write_volatile(addr as *mut u32, value);
    fence_w_w();
    fence_iorw();
}

cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        #[inline]
        fn fence_rw_rw() {
            unsafe { core::arch::asm!("fence rw, rw", options(nostack, preserves_flags)) };
        }

        #[inline]
        fn fence_r_r() {
            unsafe { core::arch::asm!("fence r, r", options(nostack, preserves_flags)) };
        }

        #[inline]
        fn fence_w_w() {
            unsafe { core::arch::asm!("fence w, w", options(nostack, preserves_flags)) };
        }

        #[inline]
        fn fence_iorw() {
            unsafe { core::arch::asm!("fence iorw, iorw", options(nostack, preserves_flags)) };
        }
    } else {
        // Host and non-RISC-V targets: the atomic fences give the same
        // ordering guarantees for ordinary memory.
        use core::sync::atomic::{fence, Ordering};

        #[inline]
        fn fence_rw_rw() {
            fence(Ordering::SeqCst);
        }

        #[inline]
        fn fence_r_r() {
            fence(Ordering::Acquire);
        }

        #[inline]
        fn fence_w_w() {
            fence(Ordering::Release);
        }

        #[inline]
        fn fence_iorw() {
            fence(Ordering::SeqCst);
        }
    }
}
