//! Minimal PCIe NVMe host-controller driver core.
//!
//! Drives a single attached controller with one namespace as a block
//! device: 512-byte logical blocks, 4 KiB host pages, one admin and one
//! I/O queue pair, one command in flight at a time. Completion waiting is
//! either busy-polling or interrupt-driven, chosen at construction.
//!
//! The crate is platform-free: register access, DMA translation, cache
//! maintenance, time, and interrupt plumbing are injected through the
//! capability traits in [`hal`]. A typical bring-up:
//!
//! ```ignore
//! let regs = unsafe { MmioRegion::new(bar0_base, 0x2000) };
//! let allocator = unsafe { CoherentAllocator::new(coherent_start, coherent_end) };
//! let waiter = PollWaiter::new(timer.clone());
//! let mut controller = Controller::new(regs, dma, timer, waiter, allocator);
//! controller.initialize()?;
//! let mut disk = NvmeBlockDevice::new(controller);
//! disk.seek(0);
//! disk.read(&mut sector)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod barrier;
pub mod block;
pub mod coherent;
pub mod command;
pub mod controller;
pub mod error;
pub mod hal;
pub mod prp;
pub mod queue;

#[cfg(test)]
pub(crate) mod testutil;

pub use block::{IoctlCmd, NvmeBlockDevice};
pub use coherent::CoherentAllocator;
pub use controller::{Controller, ControllerState, LBA_SIZE, NAMESPACE_ID};
pub use error::{Error, Result};
pub use hal::{
    CompletionWaiter, Direction, DmaArena, InterruptWaiter, IrqLatch, IrqLine, Mmio, MmioRegion,
    PollWaiter, Timer,
};
pub use prp::PrpBuilder;
pub use queue::QueuePair;
