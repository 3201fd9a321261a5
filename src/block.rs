//! Block-device facade.
//!
//! Presents seek/read/write/sync over the controller. Transfers must be
//! whole 512-byte blocks at block-aligned offsets; caller buffers that are
//! not cache-line aligned transfer through a coherent bounce block that is
//! released on every path. Cache maintenance brackets each transfer:
//! invalidate before and after reads, clean before writes.

use core::ptr::NonNull;

use crate::controller::{Controller, LBA_SIZE};
use crate::error::{Error, Result};
use crate::hal::{CompletionWaiter, Direction, DmaArena, Mmio, Timer};

/// Device control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Commit the volatile write cache to media
    Sync,
}

/// Block-oriented view of one NVMe namespace.
pub struct NvmeBlockDevice<M: Mmio, D: DmaArena, T: Timer, W: CompletionWaiter> {
    controller: Controller<M, D, T, W>,
}

impl<M: Mmio, D: DmaArena, T: Timer, W: CompletionWaiter> NvmeBlockDevice<M, D, T, W> {
    /// Wrap an initialised controller.
    pub fn new(controller: Controller<M, D, T, W>) -> Self {
        Self { controller }
    }

    /// Set the byte offset of the next transfer. Returns the offset;
    /// alignment is validated when a transfer is issued.
    pub fn seek(&mut self, offset: u64) -> u64 {
        self.controller.seek(offset)
    }

    /// Total byte size of the namespace.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.controller.size()
    }

    /// Issue a FLUSH on the namespace.
    pub fn sync(&mut self) -> Result<()> {
        self.controller.flush()
    }

    /// Dispatch a device control request.
    pub fn ioctl(&mut self, cmd: IoctlCmd) -> Result<()> {
        match cmd {
            IoctlCmd::Sync => self.sync(),
        }
    }

    /// Read `buffer.len()` bytes at the current offset.
    ///
    /// Returns the byte count on success.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let count = buffer.len();
        let lba = self.transfer_lba(count)?;
        let blocks = (count / LBA_SIZE) as u32;

        let bounce = self.bounce_for(buffer.as_ptr(), count)?;
        let target = bounce.map_or(buffer.as_mut_ptr(), NonNull::as_ptr);

        self.controller
            .dma()
            .prepare_for_device(target as usize, count, Direction::FromDevice);

        if let Err(e) = self.controller.read_blocks(lba, blocks, target) {
            if let Some(block) = bounce {
                self.controller.free_dma(block);
            }
            return Err(e);
        }

        // Discard any lines speculatively filled during the transfer.
        self.controller
            .dma()
            .prepare_for_cpu(target as usize, count, Direction::FromDevice);

        if let Some(block) = bounce {
            // SAFETY: the bounce block holds exactly `count` device-written
            // bytes and does not overlap the caller's buffer
            unsafe {
                core::ptr::copy_nonoverlapping(block.as_ptr(), buffer.as_mut_ptr(), count);
            }
            self.controller.free_dma(block);
        }

        Ok(count)
    }

    /// Write `buffer.len()` bytes at the current offset.
    ///
    /// Returns the byte count on success.
    pub fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        let count = buffer.len();
        let lba = self.transfer_lba(count)?;

        if cfg!(feature = "read-only") {
            return Err(Error::ReadOnly);
        }

        let blocks = (count / LBA_SIZE) as u32;
        let bounce = self.bounce_for(buffer.as_ptr(), count)?;
        let source: *const u8 = match bounce {
            Some(block) => {
                // SAFETY: the bounce block holds `count` bytes and does not
                // overlap the caller's buffer
                unsafe {
                    core::ptr::copy_nonoverlapping(buffer.as_ptr(), block.as_ptr(), count);
                }
                block.as_ptr()
            }
            None => buffer.as_ptr(),
        };

        self.controller
            .dma()
            .prepare_for_device(source as usize, count, Direction::ToDevice);

        let result = self.controller.write_blocks(lba, blocks, source);
        if let Some(block) = bounce {
            self.controller.free_dma(block);
        }
        result.map(|()| count)
    }

    /// Validate the current offset and byte count, returning the LBA.
    fn transfer_lba(&self, count: usize) -> Result<u64> {
        let offset = self.controller.position();
        if offset % LBA_SIZE as u64 != 0 || count == 0 || count % LBA_SIZE != 0 {
            return Err(Error::BadParam);
        }
        Ok(offset / LBA_SIZE as u64)
    }

    /// Coherent bounce block for buffers the DMA engine cannot take
    /// directly.
    fn bounce_for(&mut self, buffer: *const u8, count: usize) -> Result<Option<NonNull<u8>>> {
        let line = self.controller.dma().cache_line_size();
        if (buffer as usize) % line == 0 && count % line == 0 {
            return Ok(None);
        }
        self.controller
            .alloc_dma(count)
            .map(Some)
            .ok_or(Error::NoResource)
    }
}
