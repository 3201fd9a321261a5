//! Platform capabilities consumed by the driver.
//!
//! The driver core is agnostic to the surrounding platform. Everything it
//! needs from the outside world (register access, DMA address translation,
//! cache maintenance, time, completion signalling) is injected through the
//! traits in this module. A bare-metal port implements them over its MMIO
//! window, PCIe inbound mapping, and timer; the test build implements them
//! over a scripted device model.

use core::sync::atomic::{AtomicBool, Ordering};
use core::ptr::{read_volatile, write_volatile};

/// Memory-mapped register access for the controller's BAR0 window.
///
/// Offsets are relative to the start of the register file. Constructing an
/// implementation implies the PCIe function behind it has been enumerated
/// and enabled.
pub trait Mmio {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;
    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);
    /// Read a 64-bit register.
    fn read64(&self, offset: usize) -> u64;
    /// Write a 64-bit register.
    fn write64(&self, offset: usize, value: u64);
}

/// Transfer direction for cache maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// CPU-written data about to be read by the device
    ToDevice,
    /// Device-written data about to be read by the CPU
    FromDevice,
}

/// DMA address translation and cache maintenance.
///
/// `prepare_for_device` must make a CPU-side buffer safe for the device to
/// access (clean for [`Direction::ToDevice`], invalidate for
/// [`Direction::FromDevice`]); `prepare_for_cpu` must make device-written
/// data visible to the CPU (invalidate again, discarding speculative
/// fills). Implementations over fully coherent memory may treat both as
/// no-ops.
pub trait DmaArena {
    /// Translate a virtual address into the bus address the device sees.
    fn bus_addr(&self, virt: usize) -> u64;

    /// Prepare a buffer range for device access.
    fn prepare_for_device(&self, addr: usize, len: usize, dir: Direction);

    /// Prepare a device-written buffer range for CPU access.
    fn prepare_for_cpu(&self, addr: usize, len: usize, dir: Direction);

    /// Cache line granule for alignment checks.
    fn cache_line_size(&self) -> usize {
        64
    }
}

/// Tick source and delays.
pub trait Timer {
    /// Monotonic tick counter.
    fn ticks(&self) -> u64;

    /// Tick frequency in Hz.
    fn ticks_per_second(&self) -> u64;

    /// Busy-wait for the given number of microseconds.
    fn us_delay(&self, us: u64);

    /// Wait at millisecond granularity; may yield to a scheduler.
    fn ms_sleep(&self, ms: u64);

    /// Convert milliseconds into ticks, rounding up to at least one.
    fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms * self.ticks_per_second()).div_ceil(1000).max(1)
    }
}

/// Routing of the controller's legacy interrupt line.
pub trait IrqLine {
    /// Connect the line to a handler whose only action is latch set.
    fn connect(&mut self);
    /// Disconnect the line.
    fn disconnect(&mut self);
}

/// Single-producer single-consumer completion latch.
///
/// The interrupt handler's only side effect is [`IrqLatch::set`]; the
/// driver clears the latch before issuing a command and consumes it while
/// waiting.
#[derive(Debug, Default)]
pub struct IrqLatch(AtomicBool);

impl IrqLatch {
    /// Create a cleared latch.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Signal the latch. Safe to call from interrupt context.
    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the latch.
    #[inline]
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Consume a pending signal.
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Acquire)
    }
}

/// Strategy for waiting on command completion.
///
/// Selected at construction time: [`PollWaiter`] busy-polls the completion
/// queue with a microsecond back-off, [`InterruptWaiter`] blocks on an
/// [`IrqLatch`] signalled by the controller's legacy interrupt.
pub trait CompletionWaiter {
    /// Whether the controller should unmask its interrupt vector for this
    /// waiter.
    fn interrupt_driven(&self) -> bool {
        false
    }

    /// Hook invoked once after controller reset.
    fn connect(&mut self) {}

    /// Hook invoked during teardown.
    fn disconnect(&mut self) {}

    /// Re-arm before a command is issued.
    fn arm(&mut self) {}

    /// Block until the device may have posted a completion, or until the
    /// timeout in microseconds elapses. Returns `false` on timeout.
    /// Poll-mode waiters return `true` immediately.
    fn wait_for_signal(&mut self, timeout_us: u64) -> bool;

    /// Back off between consecutive completion-queue checks.
    fn relax(&mut self);
}

/// Busy-polling completion waiter with a 1 µs back-off.
pub struct PollWaiter<T: Timer> {
    timer: T,
}

impl<T: Timer> PollWaiter<T> {
    /// Create a poll-mode waiter over the given tick source.
    pub fn new(timer: T) -> Self {
        Self { timer }
    }
}

impl<T: Timer> CompletionWaiter for PollWaiter<T> {
    fn wait_for_signal(&mut self, _timeout_us: u64) -> bool {
        true
    }

    fn relax(&mut self) {
        self.timer.us_delay(1);
    }
}

/// Interrupt-driven completion waiter.
///
/// Waits on a shared [`IrqLatch`] that the platform's interrupt handler
/// sets when the controller raises its INTA-style vector.
pub struct InterruptWaiter<T: Timer, L: IrqLine> {
    latch: &'static IrqLatch,
    timer: T,
    line: L,
}

impl<T: Timer, L: IrqLine> InterruptWaiter<T, L> {
    /// Create an interrupt-mode waiter.
    ///
    /// `latch` must be the same latch the interrupt handler sets.
    pub fn new(latch: &'static IrqLatch, timer: T, line: L) -> Self {
        Self { latch, timer, line }
    }
}

impl<T: Timer, L: IrqLine> CompletionWaiter for InterruptWaiter<T, L> {
    fn interrupt_driven(&self) -> bool {
        true
    }

    fn connect(&mut self) {
        self.line.connect();
    }

    fn disconnect(&mut self) {
        self.line.disconnect();
    }

    fn arm(&mut self) {
        self.latch.clear();
    }

    fn wait_for_signal(&mut self, timeout_us: u64) -> bool {
        let start = self.timer.ticks();
        let budget = (timeout_us * self.timer.ticks_per_second()).div_ceil(1_000_000);
        loop {
            if self.latch.take() {
                return true;
            }
            if self.timer.ticks() - start >= budget {
                return false;
            }
            self.timer.us_delay(1);
        }
    }

    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// Volatile MMIO access over a mapped register window.
///
/// The production implementation of [`Mmio`] for platforms that map BAR0
/// straight into the address space.
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped register window of at least `size`
    /// bytes with device memory attributes, and no other code may access
    /// it concurrently without synchronisation.
    #[inline]
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Base address of the window.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl Mmio for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read32 out of bounds");
        // SAFETY: Constructor caller vouched for the window; offset checked
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write32 out of bounds");
        // SAFETY: Constructor caller vouched for the window; offset checked
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.size, "MMIO read64 out of bounds");
        // SAFETY: Constructor caller vouched for the window; offset checked
        unsafe { read_volatile((self.base + offset) as *const u64) }
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.size, "MMIO write64 out of bounds");
        // SAFETY: Constructor caller vouched for the window; offset checked
        unsafe { write_volatile((self.base + offset) as *mut u64, value) }
    }
}
