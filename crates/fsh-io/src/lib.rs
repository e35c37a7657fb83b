#![forbid(unsafe_code)]
//! I/O drivers for the remap engine.
//!
//! The engine consumes a byte-level contract: copy between device and
//! scratch storage, copy device-to-device through a RAM buffer, zero,
//! flush. [`FileIo`] implements it against real files with positioned
//! I/O; [`MemIo`] implements it against an in-memory device and records
//! every operation for tests.
//!
//! Scratch storage is addressed through a single contiguous *arena*
//! address space: primary extents (free device ranges) first, then the
//! secondary storage file. [`ArenaRouter`] resolves arena offsets to
//! their backing ranges.

mod buffer;
mod file;
mod mem;

pub use buffer::AlignedBuf;
pub use file::{FileIo, FileIoOptions};
pub use mem::{IoOp, MemIo};

use fsh_error::{FshError, Result};
use fsh_extent::{BlockSizeBitmask, ExtentList};

/// Direction of a [`IoDriver::copy`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    /// Both offsets are device offsets; the driver buffers through RAM.
    Dev2Dev,
    /// `from` is a device offset, `to` an arena offset.
    Dev2Storage,
    /// `from` is an arena offset, `to` a device offset.
    Storage2Dev,
}

/// Target of a [`IoDriver::zero`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroTarget {
    Dev,
    Storage,
}

/// Extent discovery output: where the loop file lives, what is free,
/// and what must read as zero when the job completes.
#[derive(Debug, Clone, Default)]
pub struct ExtentInput {
    pub loop_extents: ExtentList,
    pub free_extents: ExtentList,
    pub to_zero_extents: ExtentList,
    pub bitmask: BlockSizeBitmask,
}

/// Cumulative I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoStats {
    pub copy_ops: u64,
    pub zero_ops: u64,
    pub flush_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Byte-level operations the remap executor drives.
///
/// Offsets and lengths are bytes. Every operation validates its range
/// against the relevant bound (device length or arena length) before
/// touching anything.
pub trait IoDriver {
    fn dev_path(&self) -> &str;

    /// Device length, rounded down to the filesystem block size.
    fn dev_length(&self) -> u64;

    /// Logical length of the loop-file image.
    fn loop_file_length(&self) -> u64;

    /// True when writes are suppressed.
    fn simulate_run(&self) -> bool;

    /// Discover loop-file, free-space and to-zero extents.
    fn read_extents(&mut self) -> Result<ExtentInput>;

    /// Assemble the scratch arena: `primary` extents (their `user_data`
    /// is set to the assigned arena offset) followed by a secondary
    /// storage file of exactly `secondary_len` bytes, plus the RAM copy
    /// buffer of `buffer_len` bytes. With `resume` the secondary file
    /// must already exist at exactly the journalled length.
    fn create_storage(
        &mut self,
        primary: &mut ExtentList,
        secondary_len: u64,
        buffer_len: u64,
        resume: bool,
    ) -> Result<()>;

    /// Total arena length, zero before [`create_storage`](Self::create_storage).
    fn storage_length(&self) -> u64;

    fn copy(&mut self, dir: CopyDir, from: u64, to: u64, length: u64) -> Result<()>;

    fn zero(&mut self, target: ZeroTarget, offset: u64, length: u64) -> Result<()>;

    /// Drain queued device-to-device copies and make everything written
    /// so far durable.
    fn flush(&mut self) -> Result<()>;

    /// Verify the final loop-file block is writable. Filesystems
    /// shorter than their device often refuse writes past their
    /// declared size; better to find out before moving anything.
    fn check_last_block(&mut self) -> Result<()>;

    fn umount_dev(&mut self) -> Result<()>;

    /// Zero the primary storage extents on the device.
    fn zero_primary_storage(&mut self) -> Result<()>;

    fn close_storage(&mut self) -> Result<()>;

    /// Delete the secondary storage file once the job has succeeded.
    fn remove_storage_after_success(&mut self) -> Result<()>;

    fn stats(&self) -> IoStats;
}

/// Where one arena range is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaBackend {
    /// A free extent on the device (primary storage).
    Device(u64),
    /// An offset in the secondary storage file.
    Secondary(u64),
}

#[derive(Debug, Clone, Copy)]
struct ArenaRoute {
    arena_offset: u64,
    length: u64,
    backend: ArenaBackend,
}

/// Maps the contiguous arena address space onto its backing ranges.
#[derive(Debug, Clone, Default)]
pub struct ArenaRouter {
    routes: Vec<ArenaRoute>,
    total_len: u64,
}

impl ArenaRouter {
    /// Lay out `primary` extents back to back, then `secondary_len`
    /// bytes of file storage. Writes each primary extent's assigned
    /// arena offset into its `user_data`.
    pub fn build(primary: &mut ExtentList, secondary_len: u64) -> Result<Self> {
        let mut routes = Vec::new();
        let mut arena_offset = 0_u64;

        let taken = std::mem::take(primary);
        let mut rebuilt = ExtentList::new();
        for e in &taken {
            let mut tagged = *e;
            tagged.user_data = arena_offset;
            routes.push(ArenaRoute {
                arena_offset,
                length: e.length,
                backend: ArenaBackend::Device(e.physical),
            });
            arena_offset = arena_offset
                .checked_add(e.length)
                .ok_or(FshError::Overflow("laying out storage arena"))?;
            rebuilt.push(tagged);
        }
        *primary = rebuilt;

        if secondary_len > 0 {
            routes.push(ArenaRoute {
                arena_offset,
                length: secondary_len,
                backend: ArenaBackend::Secondary(0),
            });
            arena_offset = arena_offset
                .checked_add(secondary_len)
                .ok_or(FshError::Overflow("laying out storage arena"))?;
        }

        Ok(Self {
            routes,
            total_len: arena_offset,
        })
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// The device ranges backing primary storage.
    pub fn primary_device_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.routes.iter().filter_map(|r| match r.backend {
            ArenaBackend::Device(offset) => Some((offset, r.length)),
            ArenaBackend::Secondary(_) => None,
        })
    }

    /// Resolve `[offset, offset + length)` in arena space to backing
    /// pieces, in order.
    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<(ArenaBackend, u64)>> {
        let end = offset
            .checked_add(length)
            .ok_or(FshError::Overflow("resolving storage arena range"))?;
        if end > self.total_len {
            return Err(FshError::Overflow("storage arena range out of bounds"));
        }

        let mut out = Vec::new();
        let mut pos = offset;
        for route in &self.routes {
            let r_end = route.arena_offset + route.length;
            if r_end <= pos {
                continue;
            }
            if route.arena_offset >= end {
                break;
            }
            let lo = pos.max(route.arena_offset);
            let hi = end.min(r_end);
            let delta = lo - route.arena_offset;
            let backend = match route.backend {
                ArenaBackend::Device(base) => ArenaBackend::Device(base + delta),
                ArenaBackend::Secondary(base) => ArenaBackend::Secondary(base + delta),
            };
            out.push((backend, hi - lo));
            pos = hi;
            if pos >= end {
                break;
            }
        }
        if pos < end {
            return Err(FshError::Internal(
                "storage arena routing table has a hole".to_owned(),
            ));
        }
        Ok(out)
    }
}

/// Render a byte count the way progress logs want it: two decimals and
/// a spelled-out unit.
#[must_use]
pub fn pretty_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = [
        "bytes",
        "kilobytes",
        "megabytes",
        "gigabytes",
        "terabytes",
        "petabytes",
        "exabytes",
    ];
    if bytes < 1024 {
        return format!("{bytes} bytes");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub(crate) fn validate_range(max: u64, what: &'static str, offset: u64, length: u64) -> Result<()> {
    let end = offset.checked_add(length).ok_or(FshError::Overflow(what))?;
    if end > max {
        return Err(FshError::Overflow(what));
    }
    Ok(())
}
