//! PRP (Physical Region Page) descriptor builder.
//!
//! Translates a virtual buffer of arbitrary length and alignment into the
//! PRP1/PRP2 fields of a command. Transfers beyond two host pages get a
//! PRP list page enumerating every page after the first, in order. Each
//! page is translated through the DMA arena individually, so the builder
//! does not care whether successive virtual pages are physically
//! contiguous.
//!
//! The builder owns its list page (if any) and returns it to the
//! allocator when dropped, so it must outlive the command that uses the
//! descriptors.

use core::ptr::NonNull;

use crate::coherent::{CoherentAllocator, BLOCK_BOUNDARY, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hal::DmaArena;

/// Size of one PRP entry.
pub const PRP_ENTRY_SIZE: usize = 8;
/// PRP entries per 4 KiB list page.
pub const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / PRP_ENTRY_SIZE;

/// Builds and owns the PRP descriptors for one transfer.
pub struct PrpBuilder<'a, D: DmaArena> {
    allocator: &'a mut CoherentAllocator,
    dma: &'a D,
    prp1: u64,
    prp2: u64,
    list: Option<NonNull<u8>>,
}

impl<'a, D: DmaArena> PrpBuilder<'a, D> {
    /// Create an empty builder.
    pub fn new(allocator: &'a mut CoherentAllocator, dma: &'a D) -> Self {
        Self {
            allocator,
            dma,
            prp1: 0,
            prp2: 0,
            list: None,
        }
    }

    /// Compute descriptors covering `length` bytes starting at `buffer`.
    ///
    /// After success, [`prp1`](Self::prp1) is the bus address of the first
    /// byte and [`prp2`](Self::prp2) is zero, the bus address of the
    /// second page, or the bus address of the list page, depending on how
    /// many pages the transfer touches.
    pub fn build(&mut self, buffer: *const u8, length: usize) -> Result<()> {
        debug_assert!(self.list.is_none(), "builder used twice");
        if buffer.is_null() || length == 0 {
            return Err(Error::BadParam);
        }

        let addr = buffer as usize;
        self.prp1 = self.dma.bus_addr(addr);

        let first_page_remaining = PAGE_SIZE - (addr & (PAGE_SIZE - 1));
        if length <= first_page_remaining {
            self.prp2 = 0;
            return Ok(());
        }

        let second_page = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let remaining = length - first_page_remaining;
        if remaining <= PAGE_SIZE {
            self.prp2 = self.dma.bus_addr(second_page);
            return Ok(());
        }

        let entries = remaining.div_ceil(PAGE_SIZE);
        let pages = entries.div_ceil(PRP_ENTRIES_PER_PAGE);
        let list = self
            .allocator
            .allocate(pages * PAGE_SIZE, PAGE_SIZE, BLOCK_BOUNDARY)
            .ok_or(Error::NoResource)?;

        let slots = list.as_ptr().cast::<u64>();
        // SAFETY: the list block holds pages * PAGE_SIZE bytes, enough for
        // `entries` u64 slots, and is page-aligned.
        unsafe {
            core::ptr::write_bytes(list.as_ptr(), 0, pages * PAGE_SIZE);
            for i in 0..entries {
                slots
                    .add(i)
                    .write(self.dma.bus_addr(second_page + i * PAGE_SIZE));
            }
        }

        self.list = Some(list);
        self.prp2 = self.dma.bus_addr(list.as_ptr() as usize);
        Ok(())
    }

    /// Bus address of the first byte of the transfer.
    #[inline]
    #[must_use]
    pub fn prp1(&self) -> u64 {
        self.prp1
    }

    /// Second data pointer: zero, second page, or list page.
    #[inline]
    #[must_use]
    pub fn prp2(&self) -> u64 {
        self.prp2
    }
}

impl<D: DmaArena> Drop for PrpBuilder<'_, D> {
    fn drop(&mut self) {
        if let Some(list) = self.list.take() {
            self.allocator.free(list);
        }
    }
}
