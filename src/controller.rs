//! Controller lifecycle and command protocol.
//!
//! Drives a single NVMe controller through reset, admin/I-O queue bring-up
//! and identify, then serves block reads, writes and flushes against
//! namespace 1. One command is in flight at a time; completion is awaited
//! through the configured [`CompletionWaiter`].

use core::ptr::NonNull;

use log::{debug, error, info};
use tock_registers::LocalRegisterCopy;

use crate::barrier;
use crate::coherent::{CoherentAllocator, BLOCK_BOUNDARY, PAGE_SIZE};
use crate::command::{
    admin_opcode, generic_status, identify_cns, nvm_opcode, NvmeCommand, NvmeCompletion, CAP,
    CC_EN, CC_IOCQES_16B, CC_IOCQES_MASK, CC_IOCQES_SHIFT, CC_IOSQES_64B, CC_IOSQES_MASK,
    CC_IOSQES_SHIFT, CSTS, DOORBELL_BASE, INTM_ALL_VECTORS, INTM_VECTOR0, REG_ACQ, REG_AQA,
    REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_INTMC, REG_INTMS, REG_VER, VER,
};
use crate::error::{Error, Result};
use crate::hal::{CompletionWaiter, DmaArena, Mmio, Timer};
use crate::prp::PrpBuilder;
use crate::queue::QueuePair;

/// Logical block size; the only LBA format the driver accepts.
pub const LBA_SIZE: usize = 512;

/// The single namespace the driver talks to.
pub const NAMESPACE_ID: u32 = 1;

const ADMIN_QID: u16 = 0;
const IO_QID: u16 = 1;

const ADMIN_QUEUE_ENTRIES: u16 = 64;
const IO_QUEUE_ENTRIES: u16 = 64;

/// Per-command completion budget.
const COMMAND_TIMEOUT_MS: u64 = 5000;
/// Ready-wait fallback when CAP.TO reads zero.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Identify data structures are one host page.
const IDENTIFY_DATA_SIZE: usize = PAGE_SIZE;
/// Model number: 40 ASCII bytes at offset 24 of the controller data.
const MODEL_NUMBER_OFFSET: usize = 24;
const MODEL_NUMBER_SIZE: usize = 40;

/// FLBAS lives at byte 26 of the namespace data; the LBA format table of
/// 16 u32 descriptors starts at byte 128.
const NS_FLBAS_OFFSET: usize = 26;
const NS_LBA_FORMATS_OFFSET: usize = 128;

/// CDW11 flag: queue memory is physically contiguous.
const QUEUE_PC: u32 = 1 << 0;
/// CDW11 flag: interrupts enabled for the completion queue.
const QUEUE_IEN: u32 = 1 << 1;

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, nothing touched yet
    Uninitialised,
    /// Disabled with CSTS.RDY clear
    Reset,
    /// Enabled with admin and I/O queues live
    Enabled,
    /// Controller and namespace identified
    Identified,
    /// Serving I/O
    Ready,
    /// Unrecoverable error seen; terminal
    Failed,
}

/// A single attached NVMe controller.
pub struct Controller<M: Mmio, D: DmaArena, T: Timer, W: CompletionWaiter> {
    regs: M,
    dma: D,
    timer: T,
    waiter: W,
    allocator: CoherentAllocator,
    admin: Option<QueuePair>,
    io: Option<QueuePair>,
    caps: u64,
    version: u32,
    doorbell_stride: usize,
    ready_timeout_ticks: u64,
    namespace_size: u64,
    offset: u64,
    model_number: [u8; MODEL_NUMBER_SIZE],
    state: ControllerState,
}

impl<M: Mmio, D: DmaArena, T: Timer, W: CompletionWaiter> Controller<M, D, T, W> {
    /// Wrap an enabled controller function.
    ///
    /// `regs` must map BAR0 of a function with class code 0x010802 whose
    /// PCIe link is already up. Nothing is written to the device until
    /// [`initialize`](Self::initialize).
    pub fn new(regs: M, dma: D, timer: T, waiter: W, allocator: CoherentAllocator) -> Self {
        let ready_timeout_ticks = timer.ms_to_ticks(DEFAULT_READY_TIMEOUT_MS);
        Self {
            regs,
            dma,
            timer,
            waiter,
            allocator,
            admin: None,
            io: None,
            caps: 0,
            version: 0,
            doorbell_stride: 4,
            ready_timeout_ticks,
            namespace_size: 0,
            offset: 0,
            model_number: [0; MODEL_NUMBER_SIZE],
            state: ControllerState::Uninitialised,
        }
    }

    /// Run the full bring-up sequence: version and capability checks,
    /// reset, admin queues, enable, I/O queue creation, identify.
    pub fn initialize(&mut self) -> Result<()> {
        match self.bring_up() {
            Ok(()) => {
                self.state = ControllerState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("controller initialisation failed: {}", e);
                self.state = ControllerState::Failed;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<()> {
        let raw_ver = self.regs.read32(REG_VER);
        let ver = LocalRegisterCopy::<u32, VER::Register>::new(raw_ver);
        let (mjr, mnr) = (ver.read(VER::MJR), ver.read(VER::MNR));
        if mjr != 1 || (mnr != 3 && mnr != 4) {
            error!("NVMe version not supported ({:#x})", raw_ver);
            return Err(Error::Controller);
        }
        self.version = raw_ver;

        self.caps = self.regs.read64(REG_CAP);
        let cap = LocalRegisterCopy::<u64, CAP::Register>::new(self.caps);
        self.doorbell_stride = 4usize << cap.read(CAP::DSTRD);
        let ready_ms = cap.read(CAP::TO) * 500;
        self.ready_timeout_ticks = if ready_ms == 0 {
            debug!("ready timeout adjusted");
            self.timer.ms_to_ticks(DEFAULT_READY_TIMEOUT_MS)
        } else {
            self.timer.ms_to_ticks(ready_ms)
        };
        debug!(
            "controller {}.{}.{}, doorbell stride {}",
            mjr,
            mnr,
            ver.read(VER::TER),
            self.doorbell_stride
        );

        self.disable()?;
        self.state = ControllerState::Reset;

        if self.waiter.interrupt_driven() {
            self.regs.write32(REG_INTMS, INTM_ALL_VECTORS);
            self.waiter.connect();
        }

        self.create_admin_queues()?;

        // Entry sizes and enable in one CC update; both size fields are
        // masked out first.
        let mut cc = self.regs.read32(REG_CC);
        cc &= !(CC_IOSQES_MASK | CC_IOCQES_MASK);
        cc |= (CC_IOSQES_64B << CC_IOSQES_SHIFT) | (CC_IOCQES_16B << CC_IOCQES_SHIFT) | CC_EN;
        self.regs.write32(REG_CC, cc);
        self.wait_ready(true)?;
        self.state = ControllerState::Enabled;

        self.create_io_queue(IO_QID, IO_QUEUE_ENTRIES)?;

        self.identify_all()?;
        self.state = ControllerState::Identified;

        info!(
            "{} MiB NVMe, model {}",
            self.namespace_size >> 20,
            self.model_number()
        );
        Ok(())
    }

    /// Clear CC.EN and wait for the controller to report not ready.
    fn disable(&mut self) -> Result<()> {
        let cc = self.regs.read32(REG_CC);
        self.regs.write32(REG_CC, cc & !CC_EN);
        self.wait_ready(false)
    }

    /// Poll CSTS.RDY until it matches `target`, bounded by the
    /// controller's advertised timeout.
    fn wait_ready(&self, target: bool) -> Result<()> {
        let start = self.timer.ticks();
        loop {
            let csts = LocalRegisterCopy::<u32, CSTS::Register>::new(self.regs.read32(REG_CSTS));
            if csts.is_set(CSTS::RDY) == target {
                return Ok(());
            }
            if self.timer.ticks() - start >= self.ready_timeout_ticks {
                debug!("ready wait timed out (target {})", target);
                return Err(Error::Timeout);
            }
            self.timer.ms_sleep(1);
        }
    }

    /// Allocate and zero one SQ/CQ ring pair.
    fn alloc_ring_pair(
        &mut self,
        entries: u16,
    ) -> Result<(*mut NvmeCommand, u64, *const NvmeCompletion, u64)> {
        let sq_size = QueuePair::sq_memory_size(entries);
        let cq_size = QueuePair::cq_memory_size(entries);

        let sq = self
            .allocator
            .allocate(sq_size, PAGE_SIZE, BLOCK_BOUNDARY)
            .ok_or(Error::NoResource)?;
        let cq = match self.allocator.allocate(cq_size, PAGE_SIZE, BLOCK_BOUNDARY) {
            Some(cq) => cq,
            None => {
                self.allocator.free(sq);
                return Err(Error::NoResource);
            }
        };
        // SAFETY: both blocks were just handed out with the requested sizes
        unsafe {
            core::ptr::write_bytes(sq.as_ptr(), 0, sq_size);
            core::ptr::write_bytes(cq.as_ptr(), 0, cq_size);
        }

        let sq_bus = self.dma.bus_addr(sq.as_ptr() as usize);
        let cq_bus = self.dma.bus_addr(cq.as_ptr() as usize);
        Ok((sq.as_ptr().cast(), sq_bus, cq.as_ptr().cast_const().cast(), cq_bus))
    }

    /// Program AQA/ASQ/ACQ with a fresh admin ring pair.
    fn create_admin_queues(&mut self) -> Result<()> {
        let entries = ADMIN_QUEUE_ENTRIES;
        let (sq_virt, sq_bus, cq_virt, cq_bus) = self.alloc_ring_pair(entries)?;

        let sizes = u32::from(entries) - 1;
        self.regs.write32(REG_AQA, (sizes << 16) | sizes);
        self.regs.write64(REG_ASQ, sq_bus);
        self.regs.write64(REG_ACQ, cq_bus);

        // SAFETY: ring memory was just allocated, zeroed, and translated
        self.admin = Some(unsafe {
            QueuePair::new("Admin", ADMIN_QID, entries, sq_virt, sq_bus, cq_virt, cq_bus)
        });
        Ok(())
    }

    /// Create the single I/O queue pair through admin commands.
    fn create_io_queue(&mut self, qid: u16, entries: u16) -> Result<()> {
        let (sq_virt, sq_bus, cq_virt, cq_bus) = self.alloc_ring_pair(entries)?;

        let cdw10 = u32::from(qid) | ((u32::from(entries) - 1) << 16);
        // Completion queue first: contiguous, interrupts on vector 0
        let cdw11 = QUEUE_PC | QUEUE_IEN;
        self.admin_command(admin_opcode::CREATE_IO_CQ, 0, cdw10, cdw11, cq_bus)?;

        // Submission queue bound to that completion queue
        let cdw11 = (u32::from(qid) << 16) | QUEUE_PC;
        self.admin_command(admin_opcode::CREATE_IO_SQ, 0, cdw10, cdw11, sq_bus)?;

        // SAFETY: ring memory was just allocated, zeroed, and translated
        self.io = Some(unsafe {
            QueuePair::new("I/O", qid, entries, sq_virt, sq_bus, cq_virt, cq_bus)
        });
        Ok(())
    }

    /// Submit on the admin queue and wait for the completion.
    fn admin_command(
        &mut self,
        opcode: u8,
        nsid: u32,
        cdw10: u32,
        cdw11: u32,
        data_bus: u64,
    ) -> Result<()> {
        let Self {
            regs,
            timer,
            waiter,
            admin,
            doorbell_stride,
            ..
        } = self;
        let queue = admin.as_mut().ok_or(Error::Controller)?;
        submit_command(
            regs,
            timer,
            waiter,
            *doorbell_stride,
            queue,
            opcode,
            nsid,
            cdw10,
            cdw11,
            0,
            data_bus,
            0,
        )
    }

    /// IDENTIFY with the given CNS into a caller-provided page.
    fn identify(&mut self, cns: u32, nsid: u32, buffer: NonNull<u8>) -> Result<()> {
        let bus = self.dma.bus_addr(buffer.as_ptr() as usize);
        self.admin_command(admin_opcode::IDENTIFY, nsid, cns, 0, bus)
    }

    /// Identify controller and namespace, recording the model number and
    /// namespace geometry. Rejects anything but 512-byte blocks without
    /// metadata.
    fn identify_all(&mut self) -> Result<()> {
        let buf = self
            .allocator
            .allocate(IDENTIFY_DATA_SIZE, PAGE_SIZE, BLOCK_BOUNDARY)
            .ok_or(Error::NoResource)?;
        let result = self.identify_into(buf);
        self.allocator.free(buf);
        result
    }

    fn identify_into(&mut self, buf: NonNull<u8>) -> Result<()> {
        self.identify(identify_cns::CONTROLLER, 0, buf)?;
        // SAFETY: the device wrote IDENTIFY_DATA_SIZE bytes into buf; the
        // model number field is 40 bytes at offset 24
        unsafe {
            let src = buf.as_ptr().add(MODEL_NUMBER_OFFSET);
            for (i, byte) in self.model_number.iter_mut().enumerate() {
                *byte = src.add(i).read_volatile();
            }
        }

        self.identify(identify_cns::NAMESPACE, NAMESPACE_ID, buf)?;
        // SAFETY: namespace data is IDENTIFY_DATA_SIZE bytes: NSZE at 0,
        // FLBAS at 26, LBA format table of u32 descriptors at 128 in a
        // page-aligned buffer
        let (blocks, lba_format) = unsafe {
            let flbas = buf.as_ptr().add(NS_FLBAS_OFFSET).read_volatile();
            let format = buf
                .as_ptr()
                .add(NS_LBA_FORMATS_OFFSET)
                .cast::<u32>()
                .add(usize::from(flbas & 0xF))
                .read_volatile();
            let blocks = buf.as_ptr().cast::<u64>().read_volatile();
            (blocks, format)
        };

        let lba_shift = (lba_format >> 16) & 0xFF;
        let metadata = lba_format & 0xFFFF;
        if 1usize << lba_shift != LBA_SIZE {
            error!("LBA size not supported ({})", 1u64 << lba_shift);
            return Err(Error::Controller);
        }
        if metadata != 0 {
            error!("metadata not supported ({})", metadata);
            return Err(Error::Controller);
        }

        self.namespace_size = blocks * LBA_SIZE as u64;
        Ok(())
    }

    /// Read `blocks` logical blocks starting at `lba` into `buffer`.
    pub fn read_blocks(&mut self, lba: u64, blocks: u32, buffer: *mut u8) -> Result<()> {
        self.io_transfer(nvm_opcode::READ, lba, blocks, buffer.cast_const())
    }

    /// Write `blocks` logical blocks starting at `lba` from `buffer`.
    pub fn write_blocks(&mut self, lba: u64, blocks: u32, buffer: *const u8) -> Result<()> {
        self.io_transfer(nvm_opcode::WRITE, lba, blocks, buffer)
    }

    /// Commit the volatile write cache to media.
    pub fn flush(&mut self) -> Result<()> {
        if self.state != ControllerState::Ready {
            return Err(Error::Controller);
        }
        let Self {
            regs,
            timer,
            waiter,
            io,
            doorbell_stride,
            ..
        } = self;
        let queue = io.as_mut().ok_or(Error::Controller)?;
        submit_command(
            regs,
            timer,
            waiter,
            *doorbell_stride,
            queue,
            nvm_opcode::FLUSH,
            NAMESPACE_ID,
            0,
            0,
            0,
            0,
            0,
        )
    }

    fn io_transfer(&mut self, opcode: u8, lba: u64, blocks: u32, buffer: *const u8) -> Result<()> {
        debug_assert!(blocks > 0);
        if self.state != ControllerState::Ready {
            return Err(Error::Controller);
        }
        let Self {
            regs,
            dma,
            timer,
            waiter,
            allocator,
            io,
            doorbell_stride,
            ..
        } = self;
        let queue = io.as_mut().ok_or(Error::Controller)?;

        // The builder keeps any list page alive until the command is done.
        let mut prps = PrpBuilder::new(allocator, dma);
        prps.build(buffer, blocks as usize * LBA_SIZE)?;

        submit_command(
            regs,
            timer,
            waiter,
            *doorbell_stride,
            queue,
            opcode,
            NAMESPACE_ID,
            lba as u32,
            (lba >> 32) as u32,
            blocks - 1,
            prps.prp1(),
            prps.prp2(),
        )
    }

    /// Total byte size of the namespace.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.namespace_size
    }

    /// Raw CAP register captured during initialisation.
    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> u64 {
        self.caps
    }

    /// Raw VER register captured during initialisation.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Set the byte offset used by the next transfer.
    pub fn seek(&mut self, offset: u64) -> u64 {
        self.offset = offset;
        offset
    }

    /// Byte offset the next transfer starts at.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Model number reported by IDENTIFY, trimmed.
    #[must_use]
    pub fn model_number(&self) -> &str {
        core::str::from_utf8(&self.model_number)
            .unwrap_or("")
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
    }

    /// Log the low register file and allocator headroom.
    pub fn dump_status(&self) {
        let mut offset = 0;
        while offset <= 0x3C {
            debug!("{:04X}: {:08X}", offset, self.regs.read32(offset));
            offset += 4;
        }
        debug!("{} bytes coherent memory free", self.allocator.free_space());
    }

    /// DMA capability, for cache maintenance around transfers.
    pub(crate) fn dma(&self) -> &D {
        &self.dma
    }

    /// Coherent bounce block sized for `len` bytes.
    pub(crate) fn alloc_dma(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.allocator.allocate(len, PAGE_SIZE, BLOCK_BOUNDARY)
    }

    /// Return a bounce block.
    pub(crate) fn free_dma(&mut self, block: NonNull<u8>) {
        self.allocator.free(block);
    }

    #[cfg(test)]
    pub(crate) fn io_queue(&self) -> Option<&QueuePair> {
        self.io.as_ref()
    }

    fn teardown(&mut self) {
        if self.state == ControllerState::Uninitialised {
            return;
        }

        if self.waiter.interrupt_driven() {
            self.regs.write32(REG_INTMS, INTM_ALL_VECTORS);
            self.waiter.disconnect();
        }

        // Quiesce; a stuck RDY on the way down is not actionable.
        let _ = self.disable();

        for queue in [self.admin.take(), self.io.take()].into_iter().flatten() {
            if let Some(sq) = NonNull::new(queue.sq_virt().cast()) {
                self.allocator.free(sq);
            }
            if let Some(cq) = NonNull::new(queue.cq_virt().cast_mut().cast()) {
                self.allocator.free(cq);
            }
        }

        self.state = ControllerState::Uninitialised;
    }
}

impl<M: Mmio, D: DmaArena, T: Timer, W: CompletionWaiter> Drop for Controller<M, D, T, W> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Submission queue doorbell offset for queue `qid`.
#[inline]
fn sq_doorbell(stride: usize, qid: u16) -> usize {
    DOORBELL_BASE + usize::from(qid) * stride * 2
}

/// Completion queue doorbell offset for queue `qid`.
#[inline]
fn cq_doorbell(stride: usize, qid: u16) -> usize {
    sq_doorbell(stride, qid) + 4
}

/// Encode one submission entry, ring the doorbell, and wait for its
/// completion. The command identifier is the slot index.
#[allow(clippy::too_many_arguments)]
fn submit_command<M: Mmio, T: Timer, W: CompletionWaiter>(
    regs: &M,
    timer: &T,
    waiter: &mut W,
    stride: usize,
    queue: &mut QueuePair,
    opcode: u8,
    nsid: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    prp1: u64,
    prp2: u64,
) -> Result<()> {
    let cid = queue.sq_tail();
    debug!(
        "{} command (opcode {:#04x}, cid {}, cdw {:#x} {:#x} {:#x})",
        queue.name(),
        opcode,
        cid,
        cdw10,
        cdw11,
        cdw12
    );

    let command = NvmeCommand {
        opc: opcode,
        cid,
        nsid,
        prp1,
        prp2,
        cdw10,
        cdw11,
        cdw12,
        ..NvmeCommand::default()
    };
    // SAFETY: the slot is inside the ring the queue owns; the controller
    // does not read it until the doorbell below
    unsafe {
        queue.sq_slot().write_volatile(command);
    }

    waiter.arm();
    if waiter.interrupt_driven() {
        regs.write32(REG_INTMC, INTM_VECTOR0);
    }

    let tail = queue.advance_sq_tail();
    barrier::dsb();
    regs.write32(sq_doorbell(stride, queue.id()), u32::from(tail));

    poll_completion(regs, timer, waiter, stride, queue, cid, COMMAND_TIMEOUT_MS)
}

/// Wait for the completion entry matching `cid` on `queue`.
///
/// An entry is consumed only when its phase matches the expected phase and
/// both `cid` and `sqid` agree; anything else is a stale entry from the
/// previous wrap.
fn poll_completion<M: Mmio, T: Timer, W: CompletionWaiter>(
    regs: &M,
    timer: &T,
    waiter: &mut W,
    stride: usize,
    queue: &mut QueuePair,
    cid: u16,
    timeout_ms: u64,
) -> Result<()> {
    let start = timer.ticks();
    let budget = timer.ms_to_ticks(timeout_ms);

    if waiter.interrupt_driven() && !waiter.wait_for_signal(timeout_ms * 1000) {
        debug!("{} command timed out", queue.name());
        return Err(Error::Timeout);
    }

    loop {
        barrier::dmb();
        // SAFETY: the head slot is inside the ring the queue owns
        let entry: NvmeCompletion = unsafe { queue.cq_slot().read_volatile() };

        if entry.phase() == queue.phase() && entry.cid == cid && entry.sqid == queue.id() {
            let head = queue.advance_cq_head();
            barrier::dsb();
            regs.write32(cq_doorbell(stride, queue.id()), u32::from(head));
            return decode_status(queue.name(), &entry);
        }

        if timer.ticks() - start > budget {
            debug!("{} command timed out", queue.name());
            return Err(Error::Timeout);
        }

        waiter.relax();
    }
}

/// Map a completion status field onto a driver error.
fn decode_status(name: &str, entry: &NvmeCompletion) -> Result<()> {
    let (sct, sc) = (entry.status_code_type(), entry.status_code());
    if sct == 0 && sc == generic_status::SUCCESS {
        return Ok(());
    }

    debug!("{} command failed (sct {}, sc {:#x})", name, sct, sc);
    if sct == 0 && sc == generic_status::LBA_OUT_OF_RANGE {
        return Err(Error::LbaRange);
    }
    Err(Error::Controller)
}
