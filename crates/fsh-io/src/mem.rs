//! In-memory driver with an operation journal.
//!
//! Backs the self-test harness and the executor's unit tests: the
//! device is a plain byte vector, extents are injected rather than
//! discovered, and every operation is recorded so tests can assert
//! exact copy/flush orderings.

use crate::{
    validate_range, ArenaBackend, ArenaRouter, CopyDir, ExtentInput, IoDriver, IoStats, ZeroTarget,
};
use fsh_error::{FshError, Result};
use fsh_extent::{BlockSizeBitmask, ExtentList};

/// One recorded driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Copy {
        dir: CopyDir,
        from: u64,
        to: u64,
        length: u64,
    },
    Zero {
        target: ZeroTarget,
        offset: u64,
        length: u64,
    },
    Flush,
    CheckLastBlock,
    Umount,
}

/// In-memory [`IoDriver`].
pub struct MemIo {
    dev: Vec<u8>,
    input: ExtentInput,
    loop_len: u64,
    router: Option<ArenaRouter>,
    secondary: Vec<u8>,
    ops: Vec<IoOp>,
    stats: IoStats,
}

impl MemIo {
    #[must_use]
    pub fn new(dev_len: usize) -> Self {
        Self {
            dev: vec![0_u8; dev_len],
            input: ExtentInput::default(),
            loop_len: 0,
            router: None,
            secondary: Vec::new(),
            ops: Vec::new(),
            stats: IoStats::default(),
        }
    }

    /// Inject the extent sets a real driver would discover.
    pub fn set_extents(
        &mut self,
        loop_extents: ExtentList,
        free_extents: ExtentList,
        to_zero_extents: ExtentList,
    ) -> Result<()> {
        let mut bitmask = BlockSizeBitmask::new();
        let mut loop_len = 0_u64;
        for e in &loop_extents {
            bitmask.absorb_extent(e);
            loop_len = loop_len.max(e.logical_end()?);
        }
        for e in &free_extents {
            bitmask.absorb_extent(e);
        }
        for e in &to_zero_extents {
            bitmask.absorb_extent(e);
        }
        self.loop_len = loop_len;
        self.input = ExtentInput {
            loop_extents,
            free_extents,
            to_zero_extents,
            bitmask,
        };
        Ok(())
    }

    #[must_use]
    pub fn device(&self) -> &[u8] {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut [u8] {
        &mut self.dev
    }

    /// Everything recorded so far, in issue order.
    #[must_use]
    pub fn ops(&self) -> &[IoOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<IoOp> {
        std::mem::take(&mut self.ops)
    }

    fn arena_write(&mut self, arena_offset: u64, data_dev_offset: u64, length: u64) -> Result<()> {
        let router = self.router.as_ref().ok_or(FshError::NotConnected)?;
        let pieces = router.resolve(arena_offset, length)?;
        let mut src = data_dev_offset as usize;
        for (backend, n) in pieces {
            let n = n as usize;
            match backend {
                ArenaBackend::Device(off) => {
                    self.dev.copy_within(src..src + n, off as usize);
                }
                ArenaBackend::Secondary(off) => {
                    let off = off as usize;
                    self.secondary[off..off + n].copy_from_slice(&self.dev[src..src + n]);
                }
            }
            src += n;
        }
        Ok(())
    }

    fn arena_read(&mut self, arena_offset: u64, dest_dev_offset: u64, length: u64) -> Result<()> {
        let router = self.router.as_ref().ok_or(FshError::NotConnected)?;
        let pieces = router.resolve(arena_offset, length)?;
        let mut dst = dest_dev_offset as usize;
        for (backend, n) in pieces {
            let n = n as usize;
            match backend {
                ArenaBackend::Device(off) => {
                    self.dev.copy_within(off as usize..off as usize + n, dst);
                }
                ArenaBackend::Secondary(off) => {
                    let off = off as usize;
                    self.dev[dst..dst + n].copy_from_slice(&self.secondary[off..off + n]);
                }
            }
            dst += n;
        }
        Ok(())
    }
}

impl IoDriver for MemIo {
    fn dev_path(&self) -> &str {
        "<memory>"
    }

    fn dev_length(&self) -> u64 {
        self.dev.len() as u64
    }

    fn loop_file_length(&self) -> u64 {
        self.loop_len
    }

    fn simulate_run(&self) -> bool {
        false
    }

    fn read_extents(&mut self) -> Result<ExtentInput> {
        Ok(self.input.clone())
    }

    fn create_storage(
        &mut self,
        primary: &mut ExtentList,
        secondary_len: u64,
        _buffer_len: u64,
        _resume: bool,
    ) -> Result<()> {
        if self.router.is_some() {
            return Err(FshError::AlreadyConnected);
        }
        for e in primary.iter() {
            validate_range(self.dev_length(), "placing primary storage", e.physical, e.length)?;
        }
        let router = ArenaRouter::build(primary, secondary_len)?;
        self.secondary = vec![
            0_u8;
            usize::try_from(secondary_len)
                .map_err(|_| FshError::OutOfMemory(format!("{secondary_len} bytes of storage")))?
        ];
        self.router = Some(router);
        Ok(())
    }

    fn storage_length(&self) -> u64 {
        self.router.as_ref().map_or(0, ArenaRouter::total_len)
    }

    fn copy(&mut self, dir: CopyDir, from: u64, to: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.ops.push(IoOp::Copy {
            dir,
            from,
            to,
            length,
        });
        self.stats.copy_ops += 1;
        self.stats.bytes_read += length;
        self.stats.bytes_written += length;
        match dir {
            CopyDir::Dev2Dev => {
                validate_range(self.dev_length(), "device copy source", from, length)?;
                validate_range(self.dev_length(), "device copy target", to, length)?;
                self.dev
                    .copy_within(from as usize..(from + length) as usize, to as usize);
                Ok(())
            }
            CopyDir::Dev2Storage => {
                validate_range(self.dev_length(), "device copy source", from, length)?;
                validate_range(self.storage_length(), "storage copy target", to, length)?;
                self.arena_write(to, from, length)
            }
            CopyDir::Storage2Dev => {
                validate_range(self.storage_length(), "storage copy source", from, length)?;
                validate_range(self.dev_length(), "device copy target", to, length)?;
                self.arena_read(from, to, length)
            }
        }
    }

    fn zero(&mut self, target: ZeroTarget, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.ops.push(IoOp::Zero {
            target,
            offset,
            length,
        });
        self.stats.zero_ops += 1;
        match target {
            ZeroTarget::Dev => {
                validate_range(self.dev_length(), "zeroing device range", offset, length)?;
                self.dev[offset as usize..(offset + length) as usize].fill(0);
                Ok(())
            }
            ZeroTarget::Storage => {
                validate_range(self.storage_length(), "zeroing storage range", offset, length)?;
                let router = self.router.as_ref().ok_or(FshError::NotConnected)?;
                let pieces = router.resolve(offset, length)?;
                for (backend, n) in pieces {
                    let n = n as usize;
                    match backend {
                        ArenaBackend::Device(off) => {
                            self.dev[off as usize..off as usize + n].fill(0);
                        }
                        ArenaBackend::Secondary(off) => {
                            let off = off as usize;
                            self.secondary[off..off + n].fill(0);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.ops.push(IoOp::Flush);
        self.stats.flush_ops += 1;
        Ok(())
    }

    fn check_last_block(&mut self) -> Result<()> {
        self.ops.push(IoOp::CheckLastBlock);
        Ok(())
    }

    fn umount_dev(&mut self) -> Result<()> {
        self.ops.push(IoOp::Umount);
        Ok(())
    }

    fn zero_primary_storage(&mut self) -> Result<()> {
        let ranges: Vec<(u64, u64)> = self
            .router
            .as_ref()
            .ok_or(FshError::NotConnected)?
            .primary_device_ranges()
            .collect();
        for (offset, length) in ranges {
            self.zero(ZeroTarget::Dev, offset, length)?;
        }
        Ok(())
    }

    fn close_storage(&mut self) -> Result<()> {
        self.router = None;
        self.secondary = Vec::new();
        Ok(())
    }

    fn remove_storage_after_success(&mut self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> IoStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsh_extent::Extent;

    #[test]
    fn copies_route_through_the_arena() {
        let mut io = MemIo::new(32);
        io.device_mut()[0..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        // Primary storage at device [16, 24), secondary 8 bytes.
        let mut primary = ExtentList::new();
        primary.push(Extent::new(16, 0, 8));
        io.create_storage(&mut primary, 8, 64, false).unwrap();
        assert_eq!(io.storage_length(), 16);

        // Device [0,8) into arena [4,12): spans primary into secondary.
        io.copy(CopyDir::Dev2Storage, 0, 4, 8).unwrap();
        // Overwrite the source, then restore from the arena.
        io.zero(ZeroTarget::Dev, 0, 8).unwrap();
        assert_eq!(&io.device()[0..8], &[0; 8]);
        io.copy(CopyDir::Storage2Dev, 4, 0, 8).unwrap();
        assert_eq!(&io.device()[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn operations_are_journalled_in_order() {
        let mut io = MemIo::new(16);
        let mut primary = ExtentList::new();
        io.create_storage(&mut primary, 8, 64, false).unwrap();
        io.copy(CopyDir::Dev2Storage, 0, 0, 4).unwrap();
        io.flush().unwrap();
        io.copy(CopyDir::Storage2Dev, 0, 8, 4).unwrap();
        assert_eq!(
            io.ops(),
            &[
                IoOp::Copy {
                    dir: CopyDir::Dev2Storage,
                    from: 0,
                    to: 0,
                    length: 4
                },
                IoOp::Flush,
                IoOp::Copy {
                    dir: CopyDir::Storage2Dev,
                    from: 0,
                    to: 8,
                    length: 4
                },
            ]
        );
    }

    #[test]
    fn out_of_bounds_copy_is_rejected() {
        let mut io = MemIo::new(16);
        let err = io.copy(CopyDir::Dev2Dev, 8, 12, 8).unwrap_err();
        assert!(matches!(err, FshError::Overflow(_)));
        // Storage ops before create_storage: arena length is zero.
        assert!(io.copy(CopyDir::Dev2Storage, 0, 0, 4).is_err());
    }
}
