//! NVMe register map, opcodes, and queue-entry layouts.
//!
//! Register bitfields use tock-registers for decode via
//! [`tock_registers::LocalRegisterCopy`]; queue entries are zerocopy PODs
//! so they can be moved to and from DMA memory as raw bytes.

use tock_registers::register_bitfields;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// -- Controller register offsets

/// Controller Capabilities (CAP, 8 bytes)
pub const REG_CAP: usize = 0x00;
/// Version (VER)
pub const REG_VER: usize = 0x08;
/// Interrupt Mask Set (INTMS)
pub const REG_INTMS: usize = 0x0C;
/// Interrupt Mask Clear (INTMC)
pub const REG_INTMC: usize = 0x10;
/// Controller Configuration (CC)
pub const REG_CC: usize = 0x14;
/// Controller Status (CSTS)
pub const REG_CSTS: usize = 0x1C;
/// NVM Subsystem Reset (NSSR)
pub const REG_NSSR: usize = 0x20;
/// Admin Queue Attributes (AQA)
pub const REG_AQA: usize = 0x24;
/// Admin Submission Queue Base Address (ASQ, 8 bytes)
pub const REG_ASQ: usize = 0x28;
/// Admin Completion Queue Base Address (ACQ, 8 bytes)
pub const REG_ACQ: usize = 0x30;

/// Doorbell registers start here; SQ of queue `i` lives at
/// `DOORBELL_BASE + i * stride * 2`, its CQ 4 bytes after.
pub const DOORBELL_BASE: usize = 0x1000;

/// Written to NSSR to request an NVM subsystem reset ("NVMe").
pub const NSSR_RESET: u32 = 0x4E56_4D65;

/// All interrupt vectors, for INTMS/INTMC.
pub const INTM_ALL_VECTORS: u32 = 0xFFFF_FFFF;
/// Vector 0, the only vector used with the legacy interrupt line.
pub const INTM_VECTOR0: u32 = 1;

// CC is composed by read-modify-write; both entry-size fields are masked
// out before the new values are OR-ed in.

/// CC.EN
pub const CC_EN: u32 = 1;
/// CC.IOSQES field shift
pub const CC_IOSQES_SHIFT: u32 = 16;
/// CC.IOSQES field mask
pub const CC_IOSQES_MASK: u32 = 0xF << CC_IOSQES_SHIFT;
/// 64-byte submission entries (2^6)
pub const CC_IOSQES_64B: u32 = 6;
/// CC.IOCQES field shift
pub const CC_IOCQES_SHIFT: u32 = 20;
/// CC.IOCQES field mask
pub const CC_IOCQES_MASK: u32 = 0xF << CC_IOCQES_SHIFT;
/// 16-byte completion entries (2^4)
pub const CC_IOCQES_16B: u32 = 4;

register_bitfields![u64,
    /// Controller Capabilities
    pub CAP [
        /// Maximum Queue Entries Supported (0-based)
        MQES OFFSET(0) NUMBITS(16) [],
        /// Contiguous Queues Required
        CQR OFFSET(16) NUMBITS(1) [],
        /// Ready timeout, in 500 ms units
        TO OFFSET(24) NUMBITS(8) [],
        /// Doorbell stride: 4 << DSTRD bytes
        DSTRD OFFSET(32) NUMBITS(4) [],
        /// NVM Subsystem Reset Supported
        NSSRS OFFSET(36) NUMBITS(1) [],
        /// Memory Page Size Minimum (2^(12+MPSMIN))
        MPSMIN OFFSET(48) NUMBITS(4) [],
        /// Memory Page Size Maximum (2^(12+MPSMAX))
        MPSMAX OFFSET(52) NUMBITS(4) [],
    ]
];

register_bitfields![u32,
    /// Version
    pub VER [
        /// Tertiary Version Number
        TER OFFSET(0) NUMBITS(8) [],
        /// Minor Version Number
        MNR OFFSET(8) NUMBITS(8) [],
        /// Major Version Number
        MJR OFFSET(16) NUMBITS(16) [],
    ],

    /// Controller Status
    pub CSTS [
        /// Ready
        RDY OFFSET(0) NUMBITS(1) [],
        /// Controller Fatal Status
        CFS OFFSET(1) NUMBITS(1) [],
        /// Shutdown Status
        SHST OFFSET(2) NUMBITS(2) [],
    ]
];

/// Admin command opcodes
pub mod admin_opcode {
    /// Delete I/O Submission Queue (teardown only)
    pub const DELETE_IO_SQ: u8 = 0x00;
    /// Create I/O Submission Queue
    pub const CREATE_IO_SQ: u8 = 0x01;
    /// Create I/O Completion Queue
    pub const CREATE_IO_CQ: u8 = 0x05;
    /// Identify
    pub const IDENTIFY: u8 = 0x06;
}

/// NVM command opcodes (I/O queue)
pub mod nvm_opcode {
    /// Flush
    pub const FLUSH: u8 = 0x00;
    /// Write
    pub const WRITE: u8 = 0x01;
    /// Read
    pub const READ: u8 = 0x02;
}

/// Identify CNS values
pub mod identify_cns {
    /// Identify Namespace
    pub const NAMESPACE: u32 = 0x00;
    /// Identify Controller
    pub const CONTROLLER: u32 = 0x01;
}

/// NVMe Submission Queue Entry (64 bytes, little-endian fields)
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvmeCommand {
    /// Opcode
    pub opc: u8,
    /// Fused operation bits
    pub fuse: u8,
    /// Command identifier, echoed back in the completion
    pub cid: u16,
    /// Namespace identifier
    pub nsid: u32,
    /// Reserved
    pub reserved: u64,
    /// Metadata pointer
    pub mptr: u64,
    /// Data pointer, first PRP entry
    pub prp1: u64,
    /// Data pointer, second PRP entry or PRP list
    pub prp2: u64,
    /// Command Dword 10
    pub cdw10: u32,
    /// Command Dword 11
    pub cdw11: u32,
    /// Command Dword 12
    pub cdw12: u32,
    /// Command Dword 13
    pub cdw13: u32,
    /// Command Dword 14
    pub cdw14: u32,
    /// Command Dword 15
    pub cdw15: u32,
}

/// NVMe Completion Queue Entry (16 bytes, little-endian fields)
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvmeCompletion {
    /// Command-specific result
    pub dw0: u32,
    /// Reserved
    pub dw1: u32,
    /// Submission queue head at completion time
    pub sq_head: u16,
    /// Submission queue the command came from
    pub sqid: u16,
    /// Command identifier
    pub cid: u16,
    /// Status: bit 0 phase, bits 1..8 SC, bits 9..11 SCT
    pub status: u16,
}

/// Phase tag bit in the completion status field.
pub const CQE_STATUS_PHASE: u16 = 1;
const CQE_STATUS_SC_SHIFT: u16 = 1;
const CQE_STATUS_SC_MASK: u16 = 0xFF;
const CQE_STATUS_SCT_SHIFT: u16 = 9;
const CQE_STATUS_SCT_MASK: u16 = 0x7;

impl NvmeCompletion {
    /// Phase tag of this entry.
    #[inline]
    #[must_use]
    pub const fn phase(&self) -> bool {
        (self.status & CQE_STATUS_PHASE) != 0
    }

    /// Status Code (SC) field.
    #[inline]
    #[must_use]
    pub const fn status_code(&self) -> u8 {
        ((self.status >> CQE_STATUS_SC_SHIFT) & CQE_STATUS_SC_MASK) as u8
    }

    /// Status Code Type (SCT) field.
    #[inline]
    #[must_use]
    pub const fn status_code_type(&self) -> u8 {
        ((self.status >> CQE_STATUS_SCT_SHIFT) & CQE_STATUS_SCT_MASK) as u8
    }

    /// Whether the command completed without error.
    #[inline]
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_code() == 0 && self.status_code_type() == 0
    }
}

/// Generic status codes (SCT = 0)
pub mod generic_status {
    /// Successful Completion
    pub const SUCCESS: u8 = 0x00;
    /// LBA Out of Range
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
}

const _: () = {
    assert!(core::mem::size_of::<NvmeCommand>() == 64);
    assert!(core::mem::size_of::<NvmeCompletion>() == 16);
};
