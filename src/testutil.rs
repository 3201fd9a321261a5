//! Test doubles.
//!
//! [`MockDevice`] is a scripted NVMe controller model living behind the
//! [`Mmio`] capability: doorbell writes make it execute commands straight
//! out of the real submission ring memory and post phase-correct
//! completion entries, so the full queue protocol runs end-to-end on the
//! host. [`MockDma`] is an identity arena that logs cache maintenance;
//! [`MockTimer`] is a counting clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec::Vec;

use zerocopy::FromBytes;

use crate::block::NvmeBlockDevice;
use crate::coherent::{CoherentAllocator, PAGE_SIZE};
use crate::command::{
    admin_opcode, generic_status, identify_cns, nvm_opcode, NvmeCommand, NvmeCompletion,
    CC_EN, DOORBELL_BASE, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_VER,
};
use crate::controller::Controller;
use crate::hal::{Direction, DmaArena, Mmio, PollWaiter, Timer};

/// A 4 KiB-aligned byte buffer for building caller-side test buffers.
#[repr(C, align(4096))]
pub struct PageAligned<const N: usize>(pub [u8; N]);

/// Heap-backed coherent region with a chosen base alignment.
pub struct TestRegion {
    _backing: Vec<u8>,
    base: usize,
    len: usize,
}

impl TestRegion {
    /// Region whose base sits on a standard-boundary line, so bump
    /// allocations never trip the boundary rounding by accident.
    pub fn new(len: usize) -> Self {
        Self::with_alignment(len, crate::coherent::BLOCK_BOUNDARY)
    }

    /// Region with an explicit base alignment.
    pub fn with_alignment(len: usize, align: usize) -> Self {
        let mut backing = std::vec![0u8; len + align];
        let base = (backing.as_mut_ptr() as usize + align - 1) & !(align - 1);
        Self {
            _backing: backing,
            base,
            len,
        }
    }

    /// Fresh allocator over the whole region.
    pub fn allocator(&mut self) -> CoherentAllocator {
        // SAFETY: the backing vector pins [base, base + len) for as long
        // as this region lives, and host memory is trivially coherent
        unsafe { CoherentAllocator::new(self.base, self.base + self.len) }
    }
}

/// One recorded register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegEvent {
    Read32(usize),
    Write32(usize, u32),
    Read64(usize),
    Write64(usize, u64),
}

/// One recorded cache-maintenance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    ForDevice(usize, usize, Direction),
    ForCpu(usize, usize, Direction),
}

/// Device-side state of one queue pair the model serves.
#[derive(Default)]
struct ModelQueue {
    sq_base: u64,
    cq_base: u64,
    entries: u16,
    sq_head: u16,
    cq_tail: u16,
    cq_phase: bool,
}

impl ModelQueue {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn configure(&mut self, sq_base: u64, cq_base: u64, entries: u16) {
        self.sq_base = sq_base;
        self.cq_base = cq_base;
        self.entries = entries;
        self.sq_head = 0;
        self.cq_tail = 0;
        self.cq_phase = true;
    }
}

/// Scripted controller model.
pub struct MockDevice {
    /// VER register value
    pub version: u32,
    /// CAP register value
    pub cap: u64,
    /// Namespace size in blocks, as reported by IDENTIFY
    pub nsze: u64,
    /// LBADS reported for LBA format 0
    pub lba_shift: u8,
    /// MS reported for LBA format 0
    pub metadata_size: u16,
    /// Accept commands but never complete them
    pub swallow_io_commands: bool,
    /// Tick multiplier for the timer built against this model
    pub timer_scale: u64,
    model: [u8; 40],
    disk: Vec<u8>,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    admin: ModelQueue,
    io: ModelQueue,
    events: Vec<RegEvent>,
    admin_commands: Vec<NvmeCommand>,
    io_commands: Vec<NvmeCommand>,
    // Keeps the controller-side coherent backing alive with the model
    _ctrl_region: Option<TestRegion>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            version: 0x0001_0400,             // 1.4.0
            cap: (10u64 << 24) | (64 << 0),   // TO = 5 s, MQES = 64, DSTRD = 0
            nsze: 0x0020_0000,
            lba_shift: 9,
            metadata_size: 0,
            swallow_io_commands: false,
            timer_scale: 1,
            model: *b"MOCK NVME CONTROLLER                    ",
            disk: std::vec![0u8; 2048 * 512],
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            admin: ModelQueue::default(),
            io: ModelQueue::default(),
            events: Vec::new(),
            admin_commands: Vec::new(),
            io_commands: Vec::new(),
            _ctrl_region: None,
        }
    }
}

impl MockDevice {
    /// Set the model-number field, space padded.
    pub fn set_model(&mut self, model: &str) {
        self.model = [b' '; 40];
        self.model[..model.len()].copy_from_slice(model.as_bytes());
    }

    fn stride(&self) -> usize {
        4usize << ((self.cap >> 32) & 0xF)
    }

    fn write_cc(&mut self, value: u32) {
        let was_enabled = self.cc & CC_EN != 0;
        let enabled = value & CC_EN != 0;
        self.cc = value;
        if enabled && !was_enabled {
            self.csts |= 1;
            let entries = (self.aqa & 0xFFF) as u16 + 1;
            self.admin.configure(self.asq, self.acq, entries);
        } else if !enabled && was_enabled {
            self.csts &= !1;
            self.admin.reset();
            self.io.reset();
        }
    }

    fn doorbell(&mut self, offset: usize, value: u32) {
        let stride = self.stride();
        for qid in 0..2u16 {
            let sq = DOORBELL_BASE + usize::from(qid) * stride * 2;
            if offset == sq {
                self.sq_doorbell(qid, value as u16);
                return;
            }
            if offset == sq + 4 {
                return; // CQ head update, nothing for the model to do
            }
        }
        panic!("write to unknown doorbell offset {offset:#x}");
    }

    fn sq_doorbell(&mut self, qid: u16, tail: u16) {
        loop {
            let queue = if qid == 0 { &self.admin } else { &self.io };
            if queue.entries == 0 || queue.sq_head == tail {
                break;
            }
            let index = queue.sq_head;
            let entry_addr = queue.sq_base as usize + usize::from(index) * 64;
            // SAFETY: the ring was programmed by the driver from real,
            // identity-translated test memory
            let bytes =
                unsafe { core::slice::from_raw_parts(entry_addr as *const u8, 64) };
            let command = NvmeCommand::read_from_bytes(bytes).unwrap();

            if qid == 0 {
                self.admin.sq_head = (index + 1) % self.admin.entries;
                self.admin_commands.push(command);
                let status = self.execute_admin(&command);
                self.post_completion(0, command.cid, index, status);
            } else {
                self.io.sq_head = (index + 1) % self.io.entries;
                self.io_commands.push(command);
                if self.swallow_io_commands {
                    continue;
                }
                let status = self.execute_io(&command);
                self.post_completion(1, command.cid, index, status);
            }
        }
    }

    fn execute_admin(&mut self, command: &NvmeCommand) -> (u8, u8) {
        match command.opc {
            admin_opcode::IDENTIFY => {
                self.write_identify(command.cdw10 & 0xFF, command.prp1 as usize);
                (0, 0)
            }
            admin_opcode::CREATE_IO_CQ => {
                let entries = (command.cdw10 >> 16) as u16 + 1;
                self.io.cq_base = command.prp1;
                self.io.entries = entries;
                self.io.cq_tail = 0;
                self.io.cq_phase = true;
                (0, 0)
            }
            admin_opcode::CREATE_IO_SQ => {
                self.io.sq_base = command.prp1;
                self.io.sq_head = 0;
                (0, 0)
            }
            _ => (0, 0x01), // invalid opcode
        }
    }

    fn write_identify(&self, cns: u32, dest: usize) {
        // SAFETY: the driver handed a page-sized identify buffer
        let page = unsafe { core::slice::from_raw_parts_mut(dest as *mut u8, PAGE_SIZE) };
        page.fill(0);
        match cns {
            identify_cns::CONTROLLER => {
                page[24..64].copy_from_slice(&self.model);
            }
            identify_cns::NAMESPACE => {
                page[0..8].copy_from_slice(&self.nsze.to_le_bytes());
                page[8..16].copy_from_slice(&self.nsze.to_le_bytes());
                page[26] = 0; // FLBAS selects format 0
                let format =
                    (u32::from(self.lba_shift) << 16) | u32::from(self.metadata_size);
                page[128..132].copy_from_slice(&format.to_le_bytes());
            }
            _ => {}
        }
    }

    fn execute_io(&mut self, command: &NvmeCommand) -> (u8, u8) {
        match command.opc {
            nvm_opcode::FLUSH => (0, 0),
            nvm_opcode::READ | nvm_opcode::WRITE => {
                let lba = u64::from(command.cdw10) | (u64::from(command.cdw11) << 32);
                let blocks = u64::from(command.cdw12) + 1;
                if lba + blocks > self.nsze {
                    return (0, generic_status::LBA_OUT_OF_RANGE);
                }
                let len = (blocks as usize) * 512;
                let disk_off = (lba as usize) * 512;
                assert!(
                    disk_off + len <= self.disk.len(),
                    "test touched blocks beyond the backing store"
                );
                let mut disk_pos = disk_off;
                for (addr, chunk) in prp_segments(command.prp1, command.prp2, len) {
                    // SAFETY: descriptors point into identity-translated
                    // test memory prepared by the driver
                    unsafe {
                        if command.opc == nvm_opcode::READ {
                            core::ptr::copy_nonoverlapping(
                                self.disk.as_ptr().add(disk_pos),
                                addr as *mut u8,
                                chunk,
                            );
                        } else {
                            core::ptr::copy_nonoverlapping(
                                addr as *const u8,
                                self.disk.as_mut_ptr().add(disk_pos),
                                chunk,
                            );
                        }
                    }
                    disk_pos += chunk;
                }
                (0, 0)
            }
            _ => (0, 0x01),
        }
    }

    fn post_completion(&mut self, qid: u16, cid: u16, sq_head: u16, status: (u8, u8)) {
        let queue = if qid == 0 { &mut self.admin } else { &mut self.io };
        let (sct, sc) = status;
        let entry = NvmeCompletion {
            dw0: 0,
            dw1: 0,
            sq_head,
            sqid: qid,
            cid,
            status: (u16::from(sct) << 9) | (u16::from(sc) << 1) | u16::from(queue.cq_phase),
        };
        let slot = queue.cq_base as usize + usize::from(queue.cq_tail) * 16;
        // SAFETY: the completion ring was programmed by the driver from
        // real, identity-translated test memory
        unsafe {
            (slot as *mut NvmeCompletion).write_volatile(entry);
        }
        queue.cq_tail = (queue.cq_tail + 1) % queue.entries;
        if queue.cq_tail == 0 {
            queue.cq_phase = !queue.cq_phase;
        }
    }
}

/// Walk PRP descriptors the way a controller would, yielding
/// `(address, length)` data segments covering `len` bytes.
fn prp_segments(prp1: u64, prp2: u64, len: usize) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let first = prp1 as usize;
    assert_ne!(first, 0, "PRP1 must always be set");
    let first_chunk = (PAGE_SIZE - (first & (PAGE_SIZE - 1))).min(len);
    segments.push((first, first_chunk));

    let mut remaining = len - first_chunk;
    if remaining == 0 {
        return segments;
    }

    let second = prp2 as usize;
    assert_ne!(second, 0, "transfer spills past PRP1 but PRP2 is clear");
    if remaining <= PAGE_SIZE {
        segments.push((second, remaining));
        return segments;
    }

    // PRP2 names a list page of data-page addresses.
    assert_eq!(second % PAGE_SIZE, 0, "PRP list page must be page-aligned");
    let mut index = 0;
    while remaining > 0 {
        // SAFETY: the list page was built by the driver in real test memory
        let entry = unsafe { (second as *const u64).add(index).read() } as usize;
        assert_ne!(entry, 0, "PRP list ended before the transfer did");
        assert_eq!(entry % PAGE_SIZE, 0, "PRP list entries must be page-aligned");
        let chunk = remaining.min(PAGE_SIZE);
        segments.push((entry, chunk));
        remaining -= chunk;
        index += 1;
    }
    segments
}

/// Shared handle implementing the MMIO capability over a [`MockDevice`].
#[derive(Clone)]
pub struct SharedMock(Rc<RefCell<MockDevice>>);

impl SharedMock {
    pub fn new(device: MockDevice) -> Self {
        Self(Rc::new(RefCell::new(device)))
    }

    /// Register access log.
    pub fn events(&self) -> Vec<RegEvent> {
        self.0.borrow().events.clone()
    }

    /// Admin commands the model consumed, in order.
    pub fn admin_commands(&self) -> Vec<NvmeCommand> {
        self.0.borrow().admin_commands.clone()
    }

    /// I/O commands the model consumed, in order.
    pub fn io_commands(&self) -> Vec<NvmeCommand> {
        self.0.borrow().io_commands.clone()
    }

    /// Whether CC.EN is currently set.
    pub fn enabled(&self) -> bool {
        self.0.borrow().cc & CC_EN != 0
    }

    /// Write bytes into the backing store at a byte offset.
    pub fn fill_disk(&self, offset: usize, bytes: &[u8]) {
        self.0.borrow_mut().disk[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn keep_region(&self, region: TestRegion) {
        self.0.borrow_mut()._ctrl_region = Some(region);
    }

    fn timer_scale(&self) -> u64 {
        self.0.borrow().timer_scale
    }
}

impl Mmio for SharedMock {
    fn read32(&self, offset: usize) -> u32 {
        let mut dev = self.0.borrow_mut();
        dev.events.push(RegEvent::Read32(offset));
        match offset {
            REG_VER => dev.version,
            REG_CC => dev.cc,
            REG_CSTS => dev.csts,
            REG_AQA => dev.aqa,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut dev = self.0.borrow_mut();
        dev.events.push(RegEvent::Write32(offset, value));
        match offset {
            REG_CC => dev.write_cc(value),
            REG_AQA => dev.aqa = value,
            _ if offset >= DOORBELL_BASE => dev.doorbell(offset, value),
            _ => {} // interrupt masks and friends are accepted silently
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        let mut dev = self.0.borrow_mut();
        dev.events.push(RegEvent::Read64(offset));
        match offset {
            REG_CAP => dev.cap,
            _ => 0,
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        let mut dev = self.0.borrow_mut();
        dev.events.push(RegEvent::Write64(offset, value));
        match offset {
            REG_ASQ => dev.asq = value,
            REG_ACQ => dev.acq = value,
            _ => {}
        }
    }
}

/// Identity DMA arena that records cache maintenance.
#[derive(Clone, Default)]
pub struct MockDma(Rc<RefCell<Vec<CacheOp>>>);

impl MockDma {
    /// Recorded cache-maintenance calls, in order.
    pub fn ops(&self) -> Vec<CacheOp> {
        self.0.borrow().clone()
    }
}

impl DmaArena for MockDma {
    fn bus_addr(&self, virt: usize) -> u64 {
        virt as u64
    }

    fn prepare_for_device(&self, addr: usize, len: usize, dir: Direction) {
        self.0.borrow_mut().push(CacheOp::ForDevice(addr, len, dir));
    }

    fn prepare_for_cpu(&self, addr: usize, len: usize, dir: Direction) {
        self.0.borrow_mut().push(CacheOp::ForCpu(addr, len, dir));
    }
}

/// Counting clock with microsecond ticks.
#[derive(Clone)]
pub struct MockTimer {
    now: Rc<Cell<u64>>,
    scale: u64,
}

impl MockTimer {
    pub fn new(scale: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
            scale,
        }
    }
}

impl Timer for MockTimer {
    fn ticks(&self) -> u64 {
        self.now.get()
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000
    }

    fn us_delay(&self, us: u64) {
        self.now.set(self.now.get() + us * self.scale);
    }

    fn ms_sleep(&self, ms: u64) {
        self.us_delay(ms * 1000);
    }
}

/// The concrete driver stack every test drives.
pub type MockController = Controller<SharedMock, MockDma, MockTimer, PollWaiter<MockTimer>>;

fn build_rig(device: MockDevice) -> (MockController, SharedMock, MockDma, TestRegion) {
    let mock = SharedMock::new(device);
    let dma = MockDma::default();
    let timer = MockTimer::new(mock.timer_scale());
    let waiter = PollWaiter::new(timer.clone());

    let mut ctrl_region = TestRegion::new(256 * 1024);
    let allocator = ctrl_region.allocator();
    mock.keep_region(ctrl_region);

    let mut controller = Controller::new(mock.clone(), dma.clone(), timer, waiter, allocator);
    let _ = controller.initialize();

    (controller, mock, dma, TestRegion::new(256 * 1024))
}

/// Initialised controller plus a separate region for caller-side buffers.
/// Initialisation errors are left visible through the controller state.
pub fn ready_controller(device: MockDevice) -> (MockController, SharedMock, TestRegion) {
    let (controller, mock, _dma, data) = build_rig(device);
    (controller, mock, data)
}

/// Initialised block device plus the mock handles behind it.
pub fn ready_device(
    device: MockDevice,
) -> (
    NvmeBlockDevice<SharedMock, MockDma, MockTimer, PollWaiter<MockTimer>>,
    SharedMock,
    MockDma,
    TestRegion,
) {
    let (controller, mock, dma, data) = build_rig(device);
    assert_eq!(controller.state(), crate::controller::ControllerState::Ready);
    (NvmeBlockDevice::new(controller), mock, dma, data)
}
