//! Memory barrier helpers.
//!
//! Ordering rules for the queue protocol: a data synchronisation barrier
//! precedes every doorbell write, and a data memory barrier precedes every
//! completion-entry load. On aarch64 these map to the native instructions;
//! elsewhere they fall back to compiler/CPU fences so the protocol logic
//! can be exercised on any host.

use core::sync::atomic::{fence, Ordering};

/// Read barrier (acquire semantics).
///
/// Use before reading shared memory that may have been written by a device.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier (release semantics).
///
/// Use before writing to a doorbell to notify a device of new data.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Data Synchronisation Barrier.
///
/// All memory accesses (including device memory) complete before continuing.
#[inline]
pub fn dsb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB is always safe to execute
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}

/// Data Memory Barrier.
///
/// Orders memory accesses without waiting for completion.
#[inline]
pub fn dmb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DMB is always safe to execute
    unsafe {
        core::arch::asm!("dmb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}
