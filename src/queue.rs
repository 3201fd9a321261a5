//! Submission/completion queue pair state.
//!
//! A [`QueuePair`] owns the cursors and memory references for one SQ/CQ
//! ring pair; the command protocol that drives it lives in the controller.
//!
//! Invariants: `sq_tail` and `cq_head` stay in `[0, entries)`; a
//! submission entry at index `i` is controller-visible once the doorbell
//! has been written with `i + 1 mod entries`; the expected phase flips
//! each time `cq_head` wraps to zero.

use crate::command::{NvmeCommand, NvmeCompletion};

/// One SQ + CQ ring pair.
pub struct QueuePair {
    name: &'static str,
    id: u16,
    entries: u16,
    sq_virt: *mut NvmeCommand,
    cq_virt: *const NvmeCompletion,
    sq_bus: u64,
    cq_bus: u64,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
}

impl QueuePair {
    /// Bytes of DMA memory needed for the submission ring.
    #[inline]
    #[must_use]
    pub const fn sq_memory_size(entries: u16) -> usize {
        entries as usize * core::mem::size_of::<NvmeCommand>()
    }

    /// Bytes of DMA memory needed for the completion ring.
    #[inline]
    #[must_use]
    pub const fn cq_memory_size(entries: u16) -> usize {
        entries as usize * core::mem::size_of::<NvmeCompletion>()
    }

    /// Wrap zeroed ring memory into a queue pair.
    ///
    /// # Safety
    ///
    /// `sq_virt` and `cq_virt` must point to zeroed, DMA-coherent ring
    /// memory of at least [`sq_memory_size`](Self::sq_memory_size) /
    /// [`cq_memory_size`](Self::cq_memory_size) bytes, reachable by the
    /// device at `sq_bus` / `cq_bus`, and stay valid for the lifetime of
    /// the pair.
    pub unsafe fn new(
        name: &'static str,
        id: u16,
        entries: u16,
        sq_virt: *mut NvmeCommand,
        sq_bus: u64,
        cq_virt: *const NvmeCompletion,
        cq_bus: u64,
    ) -> Self {
        debug_assert!(entries > 1);
        Self {
            name,
            id,
            entries,
            sq_virt,
            cq_virt,
            sq_bus,
            cq_bus,
            sq_tail: 0,
            cq_head: 0,
            // Controllers write the first pass with phase 1
            cq_phase: true,
        }
    }

    /// Logical name, for diagnostics.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue identifier (0 for the Admin queue).
    #[inline]
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Ring depth.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> u16 {
        self.entries
    }

    /// Bus address of the submission ring.
    #[inline]
    #[must_use]
    pub fn sq_bus(&self) -> u64 {
        self.sq_bus
    }

    /// Bus address of the completion ring.
    #[inline]
    #[must_use]
    pub fn cq_bus(&self) -> u64 {
        self.cq_bus
    }

    /// Current submission tail; doubles as the next command identifier.
    #[inline]
    #[must_use]
    pub fn sq_tail(&self) -> u16 {
        self.sq_tail
    }

    /// Current completion head.
    #[inline]
    #[must_use]
    pub fn cq_head(&self) -> u16 {
        self.cq_head
    }

    /// Phase value the next valid completion entry must carry.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> bool {
        self.cq_phase
    }

    /// Submission slot at the current tail.
    #[inline]
    pub(crate) fn sq_slot(&self) -> *mut NvmeCommand {
        // SAFETY: sq_tail < entries, within the ring handed to new()
        unsafe { self.sq_virt.add(self.sq_tail as usize) }
    }

    /// Completion slot at the current head.
    #[inline]
    pub(crate) fn cq_slot(&self) -> *const NvmeCompletion {
        // SAFETY: cq_head < entries, within the ring handed to new()
        unsafe { self.cq_virt.add(self.cq_head as usize) }
    }

    /// Advance the submission tail, returning the new doorbell value.
    pub(crate) fn advance_sq_tail(&mut self) -> u16 {
        self.sq_tail = (self.sq_tail + 1) % self.entries;
        self.sq_tail
    }

    /// Consume the completion at the head, returning the new doorbell
    /// value. Flips the expected phase when the head wraps.
    pub(crate) fn advance_cq_head(&mut self) -> u16 {
        self.cq_head = (self.cq_head + 1) % self.entries;
        if self.cq_head == 0 {
            self.cq_phase = !self.cq_phase;
        }
        self.cq_head
    }

    /// Base of the submission ring, for releasing the memory.
    #[inline]
    pub(crate) fn sq_virt(&self) -> *mut NvmeCommand {
        self.sq_virt
    }

    /// Base of the completion ring, for releasing the memory.
    #[inline]
    pub(crate) fn cq_virt(&self) -> *const NvmeCompletion {
        self.cq_virt
    }
}

// SAFETY: the pair is plain cursor state over memory the owner keeps alive
unsafe impl Send for QueuePair {}
