//! Positioned-I/O driver for real devices and files.

use crate::{
    pretty_size, validate_range, ArenaBackend, ArenaRouter, CopyDir, ExtentInput, IoDriver,
    IoStats, ZeroTarget,
};
use crate::buffer::AlignedBuf;
use fsh_error::{FshError, Result};
use fsh_extent::{file as extent_file, BlockSizeBitmask, ExtentList, ExtentMap};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

/// Fallback RAM buffer when a job never sized one.
const DEFAULT_BUFFER_LEN: usize = 4 << 20;
/// Bounce buffer for storage copies and zeroing.
const BOUNCE_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy)]
struct CopyReq {
    from: u64,
    to: u64,
    length: u64,
}

/// How to open a [`FileIo`].
#[derive(Debug, Clone)]
pub struct FileIoOptions {
    /// The block device (or device image) being rewritten.
    pub dev_path: PathBuf,
    /// Extent map of the loop file, in the extent-file text format.
    pub loop_extents_path: PathBuf,
    /// Optional extent map describing the device's free space.
    pub zero_extents_path: Option<PathBuf>,
    /// Where the secondary storage file lives (inside the job dir).
    pub secondary_storage_path: PathBuf,
    /// Logical loop-file length; derived from the extents when absent.
    pub loop_file_length: Option<u64>,
    /// Suppress every write and sync.
    pub simulate: bool,
    /// Command used to unmount the device; `umount` when empty.
    pub umount_cmd: Option<String>,
    /// Skip the unmount step entirely (file-backed devices, tests).
    pub skip_umount: bool,
}

/// I/O driver over real files: positioned reads and writes on the
/// device, the secondary storage file and the RAM buffer.
pub struct FileIo {
    opts: FileIoOptions,
    dev: File,
    dev_len: u64,
    fs_block_size: u64,
    loop_len: u64,
    router: Option<ArenaRouter>,
    secondary: Option<File>,
    buffer: Option<AlignedBuf>,
    bounce: Vec<u8>,
    zero_buf: Option<AlignedBuf>,
    pending: Vec<CopyReq>,
    stats: Mutex<IoStats>,
}

impl FileIo {
    /// Open the device and remember its rounded length.
    pub fn open(opts: FileIoOptions) -> Result<Self> {
        let mut dev = OpenOptions::new()
            .read(true)
            .write(!opts.simulate)
            .open(&opts.dev_path)?;

        let raw_len = dev.seek(SeekFrom::End(0))?;
        let meta = dev.metadata()?;
        let file_type = meta.file_type();
        if !file_type.is_block_device() && !file_type.is_file() {
            return Err(FshError::InvalidArgument(format!(
                "{} is neither a block device nor a device image",
                opts.dev_path.display()
            )));
        }
        let mut fs_block_size = meta.blksize();
        if fs_block_size == 0 {
            warn!(
                "cannot determine filesystem block size of {}, assuming 4096",
                opts.dev_path.display()
            );
            fs_block_size = 4096;
        } else if fs_block_size < 512 {
            warn!(
                "suspiciously small block size ({fs_block_size} bytes) reported for {}, rounding to 512",
                opts.dev_path.display()
            );
            fs_block_size = 512;
        }

        // A device with a trailing odd-sized block is not reliably
        // writable there; use only the rounded length.
        let dev_len = raw_len - raw_len % fs_block_size;
        if dev_len != raw_len {
            info!(
                "device length {raw_len} rounded down to {dev_len} (block size {fs_block_size})"
            );
        }

        info!(
            "device {} length is {}",
            opts.dev_path.display(),
            pretty_size(dev_len)
        );

        Ok(Self {
            opts,
            dev,
            dev_len,
            fs_block_size,
            loop_len: 0,
            router: None,
            secondary: None,
            buffer: None,
            bounce: Vec::new(),
            zero_buf: None,
            pending: Vec::new(),
            stats: Mutex::new(IoStats::default()),
        })
    }

    fn router(&self) -> Result<&ArenaRouter> {
        self.router.as_ref().ok_or(FshError::NotConnected)
    }

    fn pread(&self, file_offset: u64, buf: &mut [u8], secondary: bool) -> Result<()> {
        if self.opts.simulate {
            return Ok(());
        }
        if secondary {
            let file = self.secondary.as_ref().ok_or(FshError::NotConnected)?;
            file.read_exact_at(buf, file_offset)?;
        } else {
            self.dev.read_exact_at(buf, file_offset)?;
        }
        self.stats.lock().bytes_read += buf.len() as u64;
        Ok(())
    }

    fn pwrite(&self, file_offset: u64, buf: &[u8], secondary: bool) -> Result<()> {
        if self.opts.simulate {
            return Ok(());
        }
        if secondary {
            let file = self.secondary.as_ref().ok_or(FshError::NotConnected)?;
            file.write_all_at(buf, file_offset)?;
        } else {
            self.dev.write_all_at(buf, file_offset)?;
        }
        self.stats.lock().bytes_written += buf.len() as u64;
        Ok(())
    }

    fn ensure_bounce(&mut self) {
        if self.bounce.is_empty() {
            self.bounce = vec![0_u8; BOUNCE_LEN];
        }
    }

    /// Copy between a device range and an arena range, either way.
    fn copy_storage(&mut self, dev_offset: u64, arena_offset: u64, length: u64, to_storage: bool) -> Result<()> {
        self.ensure_bounce();
        let pieces = self.router()?.resolve(arena_offset, length)?;
        let mut dev_pos = dev_offset;
        for (backend, piece_len) in pieces {
            let (backing_offset, secondary) = match backend {
                ArenaBackend::Device(off) => (off, false),
                ArenaBackend::Secondary(off) => (off, true),
            };
            let mut done = 0_u64;
            while done < piece_len {
                let n = (piece_len - done).min(self.bounce.len() as u64) as usize;
                let mut chunk = std::mem::take(&mut self.bounce);
                let res = if to_storage {
                    self.pread(dev_pos + done, &mut chunk[..n], false)
                        .and_then(|()| self.pwrite(backing_offset + done, &chunk[..n], secondary))
                } else {
                    self.pread(backing_offset + done, &mut chunk[..n], secondary)
                        .and_then(|()| self.pwrite(dev_pos + done, &chunk[..n], false))
                };
                self.bounce = chunk;
                res?;
                done += n as u64;
            }
            dev_pos += piece_len;
        }
        Ok(())
    }

    fn drain_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.buffer.is_none() {
            self.buffer = Some(AlignedBuf::new(DEFAULT_BUFFER_LEN));
        }
        let cap = self
            .buffer
            .as_ref()
            .map_or(DEFAULT_BUFFER_LEN as u64, |b| b.len() as u64)
            .max(1);

        // Chunk every request to the buffer capacity, then fill the
        // buffer reading in physical order and drain it writing in
        // target order.
        let mut reqs = std::mem::take(&mut self.pending);
        reqs.sort_by_key(|r| r.from);
        let mut chunks: Vec<CopyReq> = Vec::new();
        for r in reqs {
            let mut done = 0;
            while done < r.length {
                let n = (r.length - done).min(cap);
                chunks.push(CopyReq {
                    from: r.from + done,
                    to: r.to + done,
                    length: n,
                });
                done += n;
            }
        }

        let mut i = 0;
        while i < chunks.len() {
            let mut used = 0_u64;
            let mut window: Vec<(CopyReq, u64)> = Vec::new();
            while i < chunks.len() && used + chunks[i].length <= cap {
                window.push((chunks[i], used));
                used += chunks[i].length;
                i += 1;
            }
            debug_assert!(!window.is_empty());

            let mut buffer = self.buffer.take().ok_or(FshError::NotConnected)?;
            let mut res = Ok(());
            for (req, buf_off) in &window {
                let slice =
                    &mut buffer.as_mut_slice()[*buf_off as usize..(*buf_off + req.length) as usize];
                res = self.pread(req.from, slice, false);
                if res.is_err() {
                    break;
                }
            }
            if res.is_ok() {
                window.sort_by_key(|(req, _)| req.to);
                for (req, buf_off) in &window {
                    let slice =
                        &buffer.as_slice()[*buf_off as usize..(*buf_off + req.length) as usize];
                    res = self.pwrite(req.to, slice, false);
                    if res.is_err() {
                        break;
                    }
                }
            }
            self.buffer = Some(buffer);
            res?;
        }
        Ok(())
    }
}

impl IoDriver for FileIo {
    fn dev_path(&self) -> &str {
        self.opts.dev_path.to_str().unwrap_or("<device>")
    }

    fn dev_length(&self) -> u64 {
        self.dev_len
    }

    fn loop_file_length(&self) -> u64 {
        self.loop_len
    }

    fn simulate_run(&self) -> bool {
        self.opts.simulate
    }

    fn read_extents(&mut self) -> Result<ExtentInput> {
        let mut bitmask = BlockSizeBitmask::new();
        let mut loop_extents = ExtentList::new();
        extent_file::load_extents_file(&self.opts.loop_extents_path, &mut loop_extents, &mut bitmask)?;

        let mut free_extents = ExtentList::new();
        if let Some(zero_path) = &self.opts.zero_extents_path {
            extent_file::load_extents_file(zero_path, &mut free_extents, &mut bitmask)?;
        } else {
            // No zero-file: irreversible remapping, everything outside
            // the loop file counts as free.
            bitmask.absorb(self.dev_len);
            let mut sorted = loop_extents.clone();
            sorted.sort_by_physical();
            let mut free_map = ExtentMap::new();
            free_map.complement0_physical_shift(&sorted, 0, self.dev_len)?;
            for e in free_map.iter() {
                free_extents.push(e);
            }
        }

        let mut loop_len = 0_u64;
        for e in &loop_extents {
            loop_len = loop_len.max(e.logical_end()?);
        }
        if let Some(explicit) = self.opts.loop_file_length {
            if explicit < loop_len {
                return Err(FshError::InvalidArgument(format!(
                    "declared loop-file length {explicit} is smaller than its extents ({loop_len})"
                )));
            }
            loop_len = explicit;
        }
        if loop_len > self.dev_len {
            return Err(FshError::InvalidArgument(format!(
                "cannot remap: loop-file length ({} bytes) exceeds usable device length ({} bytes); \
                 shrink the image first",
                loop_len, self.dev_len
            )));
        }
        self.loop_len = loop_len;

        loop_extents.sort_by_logical();
        free_extents.sort_by_logical();

        Ok(ExtentInput {
            loop_extents,
            free_extents,
            to_zero_extents: ExtentList::new(),
            bitmask,
        })
    }

    fn create_storage(
        &mut self,
        primary: &mut ExtentList,
        secondary_len: u64,
        buffer_len: u64,
        resume: bool,
    ) -> Result<()> {
        if self.router.is_some() {
            return Err(FshError::AlreadyConnected);
        }
        for e in primary.iter() {
            validate_range(self.dev_len, "placing primary storage", e.physical, e.length)?;
        }

        let router = ArenaRouter::build(primary, secondary_len)?;

        if secondary_len > 0 {
            let path = &self.opts.secondary_storage_path;
            let file = if resume {
                let file = OpenOptions::new()
                    .read(true)
                    .write(!self.opts.simulate)
                    .open(path)?;
                let found = file.metadata()?.len();
                if found != secondary_len {
                    return Err(FshError::Protocol {
                        what: "secondary storage",
                        detail: format!(
                            "{} is {found} bytes, journal expects {secondary_len}",
                            path.display()
                        ),
                    });
                }
                file
            } else {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                file.set_len(secondary_len)?;
                file.sync_all()?;
                file
            };
            self.secondary = Some(file);
        }

        info!(
            "storage arena: {} primary + {} secondary, RAM buffer {}",
            pretty_size(router.total_len() - secondary_len),
            pretty_size(secondary_len),
            pretty_size(buffer_len)
        );
        self.buffer = Some(AlignedBuf::new(usize::try_from(buffer_len).map_err(
            |_| FshError::OutOfMemory(format!("RAM buffer of {buffer_len} bytes")),
        )?));
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
        self.stats.lock().copy_ops += 1;
        match dir {
            CopyDir::Dev2Dev => {
                validate_range(self.dev_len, "device copy source", from, length)?;
                validate_range(self.dev_len, "device copy target", to, length)?;
                self.pending.push(CopyReq { from, to, length });
                Ok(())
            }
            CopyDir::Dev2Storage => {
                validate_range(self.dev_len, "device copy source", from, length)?;
                validate_range(self.storage_length(), "storage copy target", to, length)?;
                self.copy_storage(from, to, length, true)
            }
            CopyDir::Storage2Dev => {
                validate_range(self.storage_length(), "storage copy source", from, length)?;
                validate_range(self.dev_len, "device copy target", to, length)?;
                self.copy_storage(to, from, length, false)
            }
        }
    }

    fn zero(&mut self, target: ZeroTarget, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.stats.lock().zero_ops += 1;
        if self.zero_buf.is_none() {
            self.zero_buf = Some(AlignedBuf::new(BOUNCE_LEN));
        }
        let zero_buf = self.zero_buf.take().ok_or(FshError::NotConnected)?;

        let res = (|| match target {
            ZeroTarget::Dev => {
                validate_range(self.dev_len, "zeroing device range", offset, length)?;
                let mut done = 0;
                while done < length {
                    let n = (length - done).min(zero_buf.len() as u64) as usize;
                    self.pwrite(offset + done, &zero_buf.as_slice()[..n], false)?;
                    done += n as u64;
                }
                Ok(())
            }
            ZeroTarget::Storage => {
                validate_range(self.storage_length(), "zeroing storage range", offset, length)?;
                let pieces = self.router()?.resolve(offset, length)?;
                for (backend, piece_len) in pieces {
                    let (backing_offset, secondary) = match backend {
                        ArenaBackend::Device(off) => (off, false),
                        ArenaBackend::Secondary(off) => (off, true),
                    };
                    let mut done = 0;
                    while done < piece_len {
                        let n = (piece_len - done).min(zero_buf.len() as u64) as usize;
                        self.pwrite(backing_offset + done, &zero_buf.as_slice()[..n], secondary)?;
                        done += n as u64;
                    }
                }
                Ok(())
            }
        })();
        self.zero_buf = Some(zero_buf);
        res
    }

    fn flush(&mut self) -> Result<()> {
        self.drain_pending()?;
        self.stats.lock().flush_ops += 1;
        if self.opts.simulate {
            return Ok(());
        }
        if let Some(secondary) = &self.secondary {
            secondary.sync_data()?;
        }
        self.dev.sync_data()?;
        Ok(())
    }

    fn check_last_block(&mut self) -> Result<()> {
        if self.loop_len == 0 || self.opts.simulate {
            return Ok(());
        }
        let offset = (self.loop_len - 1) / self.fs_block_size * self.fs_block_size;
        let n = (self.dev_len - offset).min(self.fs_block_size) as usize;
        let mut block = vec![0_u8; n];
        let probe = (|| -> Result<()> {
            self.pread(offset, &mut block, false)?;
            self.pwrite(offset, &block, false)?;
            self.dev.sync_data()?;
            Ok(())
        })();
        if let Err(err) = probe {
            return Err(FshError::NoSpace(format!(
                "final loop-file block at {offset} is not writable: {err}"
            )));
        }
        debug!("last block at {offset} is writable");
        Ok(())
    }

    fn umount_dev(&mut self) -> Result<()> {
        if self.opts.skip_umount {
            debug!("skipping umount of {}", self.dev_path());
            return Ok(());
        }
        let cmdline = self.opts.umount_cmd.clone().unwrap_or_else(|| "umount".to_owned());
        let mut parts = cmdline.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            FshError::InvalidArgument("empty umount command".to_owned())
        })?;
        let status = Command::new(program)
            .args(parts)
            .arg(&self.opts.dev_path)
            .status()?;
        if !status.success() {
            return Err(FshError::Io(std::io::Error::other(format!(
                "umount command {cmdline:?} failed with {status} for {}",
                self.dev_path()
            ))));
        }
        info!("unmounted {}", self.dev_path());
        Ok(())
    }

    fn zero_primary_storage(&mut self) -> Result<()> {
        let ranges: Vec<(u64, u64)> = self.router()?.primary_device_ranges().collect();
        for (offset, length) in ranges {
            self.zero(ZeroTarget::Dev, offset, length)?;
        }
        Ok(())
    }

    fn close_storage(&mut self) -> Result<()> {
        self.router = None;
        self.secondary = None;
        self.buffer = None;
        Ok(())
    }

    fn remove_storage_after_success(&mut self) -> Result<()> {
        self.secondary = None;
        match std::fs::remove_file(&self.opts.secondary_storage_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn stats(&self) -> IoStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsh_extent::Extent;
    use std::fs;
    use std::path::Path;

    fn write_extent_map(path: &Path, extents: &[Extent]) {
        let mut list = ExtentList::new();
        for e in extents {
            list.push(*e);
        }
        extent_file::save_extents_file(path, &list).unwrap();
    }

    fn fixture(dev_len: usize, loop_extents: &[Extent]) -> (tempfile::TempDir, FileIo, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("device.img");
        let content: Vec<u8> = (0..dev_len).map(|i| (i % 241) as u8).collect();
        fs::write(&dev_path, &content).unwrap();

        let loop_path = dir.path().join("loop.fsx");
        write_extent_map(&loop_path, loop_extents);

        let io = FileIo::open(FileIoOptions {
            dev_path,
            loop_extents_path: loop_path,
            zero_extents_path: None,
            secondary_storage_path: dir.path().join("storage.bin"),
            loop_file_length: None,
            simulate: false,
            umount_cmd: None,
            skip_umount: true,
        })
        .unwrap();
        (dir, io, content)
    }

    #[test]
    fn queued_device_copies_apply_on_flush() {
        let (dir, mut io, content) = fixture(16384, &[Extent::new(0, 8192, 8192)]);
        let mut primary = ExtentList::new();
        io.create_storage(&mut primary, 0, 4096, false).unwrap();

        io.copy(CopyDir::Dev2Dev, 0, 8192, 8192).unwrap();
        // Nothing hits the device until the flush drains the queue.
        let before = fs::read(dir.path().join("device.img")).unwrap();
        assert_eq!(before, content);

        io.flush().unwrap();
        let after = fs::read(dir.path().join("device.img")).unwrap();
        assert_eq!(&after[8192..], &content[..8192]);
    }

    #[test]
    fn storage_round_trip_through_secondary_file() {
        let (dir, mut io, content) = fixture(8192, &[Extent::new(0, 4096, 4096)]);
        let mut primary = ExtentList::new();
        io.create_storage(&mut primary, 4096, 4096, false).unwrap();
        assert_eq!(io.storage_length(), 4096);

        io.copy(CopyDir::Dev2Storage, 0, 0, 4096).unwrap();
        io.flush().unwrap();
        io.zero(ZeroTarget::Dev, 0, 4096).unwrap();
        io.copy(CopyDir::Storage2Dev, 0, 4096, 4096).unwrap();
        io.flush().unwrap();

        let after = fs::read(dir.path().join("device.img")).unwrap();
        assert_eq!(&after[..4096], &[0_u8; 4096][..]);
        assert_eq!(&after[4096..], &content[..4096]);

        io.remove_storage_after_success().unwrap();
        assert!(!dir.path().join("storage.bin").exists());
    }

    #[test]
    fn read_extents_complements_free_space_without_a_zero_file() {
        let (_dir, mut io, _) = fixture(16384, &[Extent::new(4096, 0, 4096)]);
        let input = io.read_extents().unwrap();
        assert_eq!(io.loop_file_length(), 4096);
        let free: Vec<(u64, u64)> = input
            .free_extents
            .iter()
            .map(|e| (e.physical, e.length))
            .collect();
        assert_eq!(free, vec![(0, 4096), (8192, 8192)]);
    }

    #[test]
    fn copies_are_validated_against_bounds() {
        let (_dir, mut io, _) = fixture(8192, &[Extent::new(0, 0, 4096)]);
        assert!(matches!(
            io.copy(CopyDir::Dev2Dev, 4096, 8192, 4096),
            Err(FshError::Overflow(_))
        ));
        // No storage yet: the arena has length zero.
        assert!(io.copy(CopyDir::Dev2Storage, 0, 0, 4096).is_err());
    }

    #[test]
    fn resume_rejects_wrong_secondary_length() {
        let (dir, mut io, _) = fixture(8192, &[Extent::new(0, 4096, 4096)]);
        fs::write(dir.path().join("storage.bin"), vec![0_u8; 100]).unwrap();
        let mut primary = ExtentList::new();
        let err = io
            .create_storage(&mut primary, 4096, 4096, true)
            .unwrap_err();
        assert!(matches!(err, FshError::Protocol { .. }));
    }

    #[test]
    fn simulate_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("device.img");
        let content = vec![7_u8; 8192];
        fs::write(&dev_path, &content).unwrap();
        let loop_path = dir.path().join("loop.fsx");
        write_extent_map(&loop_path, &[Extent::new(0, 4096, 4096)]);

        let mut io = FileIo::open(FileIoOptions {
            dev_path: dev_path.clone(),
            loop_extents_path: loop_path,
            zero_extents_path: None,
            secondary_storage_path: dir.path().join("storage.bin"),
            loop_file_length: None,
            simulate: true,
            umount_cmd: None,
            skip_umount: true,
        })
        .unwrap();

        let mut primary = ExtentList::new();
        io.create_storage(&mut primary, 0, 4096, false).unwrap();
        io.copy(CopyDir::Dev2Dev, 0, 4096, 4096).unwrap();
        io.zero(ZeroTarget::Dev, 0, 8192).unwrap();
        io.flush().unwrap();

        assert_eq!(fs::read(&dev_path).unwrap(), content);
    }
}
