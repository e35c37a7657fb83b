//! The remap planner/executor.

use crate::{sizer, CancelToken};
use fsh_error::{FshError, Result};
use fsh_extent::{show_extents, Extent, ExtentList, ExtentMap, ExtentPool, ZEROED_USER_DATA};
use fsh_io::{pretty_size, CopyDir, IoDriver, IoStats, ZeroTarget};
use fsh_persist::{ClearFreeSpace, Job, JobMeta, Journal, JournalState, Phase, StorageCaps};
use tracing::{debug, info, warn};

/// Engine-level knobs, independent of any job directory.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub clear: ClearFreeSpace,
    pub caps: StorageCaps,
    pub journal: Option<Journal>,
    pub resume: bool,
    pub force: bool,
    pub cancel: CancelToken,
    /// RAM override for the sizer; autodetected when absent.
    pub total_ram: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clear: ClearFreeSpace::Minimal,
            caps: StorageCaps::default(),
            journal: None,
            resume: false,
            force: false,
            cancel: CancelToken::new(),
            total_ram: None,
        }
    }
}

/// What a finished job did.
#[derive(Debug, Clone, Copy)]
pub struct RemapReport {
    /// Bytes that had to move.
    pub bytes_total: u64,
    /// Bytes landed at their logical offset.
    pub bytes_moved: u64,
    /// Executor batches run (journal points).
    pub batches: u64,
    pub io: IoStats,
}

/// One in-flight writeback piece.
#[derive(Debug, Clone, Copy)]
struct WritebackPiece {
    dest: u64,
    arena: u64,
    length: u64,
}

/// The in-place block shuffler.
///
/// Working maps:
/// - `dev_map`: blocks at the wrong physical location, keyed by where
///   they are, valued by where they belong.
/// - `dev_free`: free device ranges, self-mapped.
/// - `storage_free`: free arena ranges, self-mapped in arena
///   coordinates, with a best-fit pool on top.
/// - `pending`: blocks parked in the arena, keyed by destination, arena
///   offset in `user_data`.
/// - `done` / `dead`: destinations already written, and sources of
///   zero-reading extents; together with the maps above they partition
///   the device.
pub struct Remapper<'a> {
    io: &'a mut dyn IoDriver,
    opts: EngineOptions,
    meta: JobMeta,
    dev_map: ExtentMap,
    dev_free: ExtentMap,
    storage_free: ExtentMap,
    pool: ExtentPool,
    pending: ExtentMap,
    primary: ExtentList,
    dirty: ExtentMap,
    to_zero: ExtentMap,
    done: ExtentMap,
    dead: ExtentMap,
    work_total: u64,
    work_done: u64,
    batches: u64,
    last_decile: u64,
    partition_tracked: bool,
}

impl<'a> Remapper<'a> {
    /// Build a fresh job: discover extents, derive the effective block
    /// size, build the working maps, size and create scratch storage.
    pub fn prepare(io: &'a mut dyn IoDriver, opts: EngineOptions) -> Result<Self> {
        let input = io.read_extents()?;
        let dev_len = io.dev_length();
        let loop_len = io.loop_file_length();

        let mut bitmask = input.bitmask;
        bitmask.absorb(dev_len);
        let block = bitmask.effective_block_size();
        info!(
            "effective block size {}, device {}, loop file {}",
            block,
            pretty_size(dev_len),
            pretty_size(loop_len)
        );

        if loop_len > dev_len {
            return Err(FshError::InvalidArgument(format!(
                "loop-file length {loop_len} exceeds usable device length {dev_len}"
            )));
        }

        show_extents("loop file", &input.loop_extents, block);
        show_extents("free space", &input.free_extents, block);

        let mut loop_sorted = input.loop_extents.clone();
        loop_sorted.sort_by_logical();
        let mut prev_logical_end = 0_u64;
        for e in &loop_sorted {
            if e.logical < prev_logical_end {
                return Err(FshError::InvalidArgument(format!(
                    "loop extents overlap logically at offset {}",
                    e.logical
                )));
            }
            prev_logical_end = e.logical_end()?;
        }
        loop_sorted.sort_by_physical();

        // The complement doubles as the overlap/out-of-bounds check.
        let mut complement = ExtentMap::new();
        complement.complement0_physical_shift(&loop_sorted, 0, dev_len)?;

        let mut dev_map = ExtentMap::new();
        let mut to_zero = ExtentMap::new();
        let mut done = ExtentMap::new();
        let mut dead = ExtentMap::new();
        for e in &loop_sorted {
            if e.logical_end()? > loop_len {
                return Err(FshError::InvalidArgument(format!(
                    "loop extent at physical {} reaches logical {} past the loop-file length {}",
                    e.physical,
                    e.logical + e.length,
                    loop_len
                )));
            }
            if e.user_data == ZEROED_USER_DATA {
                // Known-zero content is never copied; its destination
                // just has to read zero when we are done.
                if e.physical != e.logical {
                    to_zero.insert(Extent::new(e.logical, e.logical, e.length))?;
                    dead.insert(Extent::new(e.physical, e.physical, e.length))?;
                } else {
                    done.insert(Extent::new(e.physical, e.physical, e.length))?;
                }
            } else if e.is_in_place() {
                done.insert(Extent::new(e.physical, e.physical, e.length))?;
            } else {
                dev_map.insert(Extent::new(e.physical, e.logical, e.length))?;
            }
        }

        for e in &input.to_zero_extents {
            to_zero.insert(Extent::new(e.physical, e.physical, e.length))?;
        }

        // Free space: the complement of the loop file, optionally
        // narrowed to the ranges the caller declared free. Complement
        // ranges outside the declared set are old-filesystem residue:
        // never read, never written, never handed out as scratch.
        let mut dev_free = ExtentMap::new();
        if input.free_extents.is_empty() {
            for gap in complement.iter() {
                dev_free.insert(Extent::new(gap.physical, gap.physical, gap.length))?;
            }
        } else {
            let mut declared = ExtentMap::new();
            for e in &input.free_extents {
                let end = e.physical_end()?;
                if end > dev_len {
                    return Err(FshError::Overflow("free extent extends past device end"));
                }
                declared.insert(Extent::new(e.physical, e.physical, e.length))?;
            }
            for gap in complement.iter() {
                let gap_end = gap.physical + gap.length;
                let mut pos = gap.physical;
                for (lo, len) in declared.covered_ranges(gap.physical, gap_end) {
                    if lo > pos {
                        dead.insert(Extent::new(pos, pos, lo - pos))?;
                    }
                    dev_free.insert(Extent::new(lo, lo, len))?;
                    pos = lo + len;
                }
                if gap_end > pos {
                    dead.insert(Extent::new(pos, pos, gap_end - pos))?;
                }
            }
        }

        let work_total = dev_map.total_length();
        info!(
            "{} to move in {} extents, {} free",
            pretty_size(work_total),
            dev_map.len(),
            pretty_size(dev_free.total_length())
        );

        // Size the scratch and carve primary storage out of the
        // largest free extents.
        let total_ram = opts.total_ram.unwrap_or_else(sizer::system_ram);
        let budget = sizer::compute(
            total_ram,
            dev_len,
            work_total,
            dev_free.total_length(),
            block,
            &opts.caps,
        )?;

        let mut primary = ExtentList::new();
        if budget.primary_target > 0 {
            let mut candidates = dev_free.to_list();
            candidates.sort_by_reverse_length();
            let mut acc = 0_u64;
            for e in &candidates {
                if acc >= budget.primary_target {
                    break;
                }
                let take = e.length.min(budget.primary_target - acc) / block * block;
                if take == 0 {
                    continue;
                }
                primary.push(Extent::new(e.physical, 0, take));
                acc += take;
            }
            primary.sort_by_physical();
        }

        io.create_storage(&mut primary, budget.secondary_len, budget.buffer_len, false)?;
        for e in &primary {
            dev_free.remove_range(e.physical, e.length)?;
        }

        let mut storage_free = ExtentMap::new();
        let arena_len = io.storage_length();
        if arena_len > 0 {
            storage_free.insert(Extent::new(0, 0, arena_len))?;
        }
        let pool = ExtentPool::new(&storage_free);

        let meta = JobMeta {
            dev_length: dev_len,
            loop_file_length: loop_len,
            effective_block_size: block,
            secondary_len: budget.secondary_len,
            buffer_len: budget.buffer_len,
            phase: Phase::Running,
        };

        let mut this = Self {
            io,
            opts,
            meta,
            dev_map,
            dev_free,
            storage_free,
            pool,
            pending: ExtentMap::new(),
            primary,
            dirty: ExtentMap::new(),
            to_zero,
            done,
            dead,
            work_total,
            work_done: 0,
            batches: 0,
            last_decile: 0,
            partition_tracked: true,
        };
        this.journal_batch()?;
        this.check_invariants()?;
        Ok(this)
    }

    /// Rebuild the executor from a journalled snapshot.
    pub fn resume(io: &'a mut dyn IoDriver, opts: EngineOptions) -> Result<Self> {
        let journal = opts
            .journal
            .clone()
            .ok_or_else(|| FshError::InvalidArgument("cannot resume without a job directory".to_owned()))?;
        let (meta, state) = journal.load_state()?;
        journal.check_secondary_storage(meta.secondary_len)?;

        let dev_len = io.dev_length();
        if dev_len != meta.dev_length {
            let msg = format!(
                "device length changed: journal says {}, device reports {}",
                meta.dev_length, dev_len
            );
            if opts.force {
                warn!("{msg} (continuing due to --force)");
            } else {
                return Err(FshError::InvalidArgument(msg));
            }
        }

        let mut primary = state.primary.clone();
        io.create_storage(&mut primary, meta.secondary_len, meta.buffer_len, true)?;

        let mut dev_map = ExtentMap::new();
        for e in &state.dev_map {
            dev_map.insert(*e)?;
        }
        let mut dev_free = ExtentMap::new();
        for e in &state.free_map {
            dev_free.insert(*e)?;
        }
        let mut storage_free = ExtentMap::new();
        for e in &state.storage_map {
            storage_free.insert(*e)?;
        }
        let mut pending = ExtentMap::new();
        for e in &state.pending {
            pending.insert(*e)?;
        }
        let mut dirty = ExtentMap::new();
        for e in &state.dirty {
            dirty.insert(*e)?;
        }
        let mut to_zero = ExtentMap::new();
        for e in &state.to_zero {
            to_zero.insert(*e)?;
        }
        let pool = ExtentPool::new(&storage_free);

        let remaining = dev_map.total_length() + pending.total_length();
        info!(
            "resuming: {} still to place in {} extents ({} parked in storage)",
            pretty_size(remaining),
            dev_map.len(),
            pretty_size(pending.total_length())
        );

        Ok(Self {
            io,
            opts,
            meta,
            dev_map,
            dev_free,
            storage_free,
            pool,
            pending,
            primary,
            dirty,
            to_zero,
            done: ExtentMap::new(),
            dead: ExtentMap::new(),
            work_total: remaining,
            work_done: 0,
            batches: 0,
            last_decile: 0,
            partition_tracked: false,
        })
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.dev_map.total_length() + self.pending.total_length()
    }

    /// Move every block to its logical offset.
    pub fn relocate(&mut self) -> Result<()> {
        self.io.check_last_block()?;

        while !self.dev_map.is_empty() || !self.pending.is_empty() {
            if self.opts.cancel.is_cancelled() {
                self.journal_batch()?;
                return Err(FshError::Cancelled);
            }

            let mut progress = self.writeback(false)?;
            progress |= self.move_direct()?;
            if !progress {
                progress = self.evacuate()?;
            }
            if !progress {
                progress = self.writeback(true)?;
            }
            if !progress {
                return Err(FshError::NoSpace(format!(
                    "remap cannot make progress: {} still to place but every destination \
                     is occupied and scratch storage is exhausted; re-run with a larger \
                     --storage-size",
                    pretty_size(self.remaining())
                )));
            }

            self.batches += 1;
            self.journal_batch()?;
            self.log_progress();
            self.check_invariants()?;
            self.opts.cancel.consume_batch();
        }

        info!(
            "all {} in place after {} batches",
            pretty_size(self.work_total),
            self.batches
        );
        Ok(())
    }

    /// Zero what must not leak, per policy, then flush.
    pub fn clear_free_space(&mut self) -> Result<()> {
        self.meta.phase = Phase::Clearing;
        self.journal_batch()?;

        self.io.zero_primary_storage()?;

        let targets: Vec<Extent> = self.to_zero.iter().collect();
        for e in &targets {
            self.io.zero(ZeroTarget::Dev, e.physical, e.length)?;
        }

        let policy_ranges: Vec<Extent> = match self.opts.clear {
            ClearFreeSpace::All => self.dev_free.iter().collect(),
            ClearFreeSpace::Minimal => self.dirty.iter().collect(),
            ClearFreeSpace::None => Vec::new(),
        };
        for e in &policy_ranges {
            self.io.zero(ZeroTarget::Dev, e.physical, e.length)?;
        }
        self.io.flush()?;

        info!(
            "cleared {} of free space ({:?} policy), {} of known-zero ranges",
            pretty_size(policy_ranges.iter().map(|e| e.length).sum()),
            self.opts.clear,
            pretty_size(targets.iter().map(|e| e.length).sum())
        );
        Ok(())
    }

    /// Mark the journal done and tear the storage down.
    pub fn finish(mut self) -> Result<RemapReport> {
        self.meta.phase = Phase::Done;
        if let Some(journal) = &self.opts.journal {
            journal.save_meta(&self.meta)?;
        }
        self.io.remove_storage_after_success()?;
        self.io.close_storage()?;
        Ok(RemapReport {
            bytes_total: self.work_total,
            bytes_moved: self.work_done,
            batches: self.batches,
            io: self.io.stats(),
        })
    }

    // ── Step selection ──────────────────────────────────────────────

    /// Write parked blocks out of the arena. With `allow_partial`
    /// false, only extents whose whole destination is free move; with
    /// true (the deadlock break) any free prefix or infix is written
    /// back and the parked extent split around it.
    fn writeback(&mut self, allow_partial: bool) -> Result<bool> {
        let mut jobs: Vec<WritebackPiece> = Vec::new();
        for p in self.pending.iter() {
            if allow_partial {
                for (lo, len) in self.dev_free.covered_ranges(p.physical, p.physical + p.length) {
                    jobs.push(WritebackPiece {
                        dest: lo,
                        arena: p.user_data + (lo - p.physical),
                        length: len,
                    });
                }
            } else if self.dev_free.covers(p.physical, p.length) {
                jobs.push(WritebackPiece {
                    dest: p.physical,
                    arena: p.user_data,
                    length: p.length,
                });
            }
        }
        if jobs.is_empty() {
            return Ok(false);
        }

        for j in &jobs {
            self.claim_free(j.dest, j.length)?;
            self.io.copy(CopyDir::Storage2Dev, j.arena, j.dest, j.length)?;
        }
        self.io.flush()?;

        for j in &jobs {
            self.split_pending(j.dest, j.length)?;
            self.pool
                .release(Extent::new(j.arena, j.arena, j.length), &mut self.storage_free)?;
            self.done.insert(Extent::new(j.dest, j.dest, j.length))?;
            self.work_done += j.length;
        }
        debug!(
            partial = allow_partial,
            pieces = jobs.len(),
            "wrote back parked extents"
        );
        Ok(true)
    }

    /// Queue direct moves for every sub-extent whose destination is
    /// already free, flush, then free the sources.
    fn move_direct(&mut self) -> Result<bool> {
        let mut batch: Vec<(u64, u64, u64)> = Vec::new();
        let snapshot: Vec<Extent> = self.dev_map.iter().collect();
        for e in snapshot {
            let target_end = e.logical_end()?;
            for (lo, len) in self.dev_free.covered_ranges(e.logical, target_end) {
                let src = e.physical + (lo - e.logical);
                self.claim_free(lo, len)?;
                batch.push((src, lo, len));
            }
        }
        if batch.is_empty() {
            return Ok(false);
        }

        for &(src, dst, len) in &batch {
            self.io.copy(CopyDir::Dev2Dev, src, dst, len)?;
        }
        self.io.flush()?;

        for &(src, dst, len) in &batch {
            let removed = self.dev_map.remove_range(src, len)?;
            if removed != len {
                return Err(FshError::Internal(format!(
                    "direct move source {src}+{len} was not fully mapped"
                )));
            }
            self.release_free(src, len)?;
            self.done.insert(Extent::new(dst, dst, len))?;
            self.work_done += len;
        }
        debug!(moves = batch.len(), "direct moves completed");
        Ok(true)
    }

    /// Park the largest blocked extent in the arena to break the cycle
    /// occupying its destination.
    fn evacuate(&mut self) -> Result<bool> {
        if self.pool.is_empty() {
            return Ok(false);
        }
        let Some(extent) = self.dev_map.largest() else {
            return Ok(false);
        };

        let mut allocated = ExtentMap::new();
        let mut request = extent;
        loop {
            match self
                .pool
                .allocate(&request, &mut self.storage_free, &mut allocated)?
            {
                None => break,
                Some(rem) if rem.length == request.length => break,
                Some(rem) => request = rem,
            }
        }
        if allocated.is_empty() {
            return Ok(false);
        }

        // Allocated pieces: physical = arena offset, logical = the
        // destination slice this piece will eventually fill.
        let pieces: Vec<Extent> = allocated.iter().collect();
        for p in &pieces {
            let src = extent.physical + (p.logical - extent.logical);
            self.io.copy(CopyDir::Dev2Storage, src, p.physical, p.length)?;
        }
        self.io.flush()?;

        for p in &pieces {
            let src = extent.physical + (p.logical - extent.logical);
            let removed = self.dev_map.remove_range(src, p.length)?;
            if removed != p.length {
                return Err(FshError::Internal(format!(
                    "evacuation source {src}+{} was not fully mapped",
                    p.length
                )));
            }
            self.release_free(src, p.length)?;
            self.pending
                .insert(Extent::with_user_data(p.logical, p.logical, p.length, p.physical))?;
        }
        debug!(
            bytes = pieces.iter().map(|p| p.length).sum::<u64>(),
            fragments = pieces.len(),
            "evacuated blocked extent to storage"
        );
        Ok(true)
    }

    // ── Map bookkeeping ─────────────────────────────────────────────

    /// Take a range out of the free map (it is about to be written).
    fn claim_free(&mut self, physical: u64, length: u64) -> Result<()> {
        let removed = self.dev_free.remove_range(physical, length)?;
        if removed != length {
            return Err(FshError::Internal(format!(
                "destination {physical}+{length} was not free"
            )));
        }
        self.dirty.remove_range(physical, length)?;
        Ok(())
    }

    /// Hand a vacated source range to the free map; it now holds stale
    /// data, so the minimal clear policy must see it.
    fn release_free(&mut self, physical: u64, length: u64) -> Result<()> {
        self.dev_free.insert(Extent::new(physical, physical, length))?;
        self.dirty.insert(Extent::new(physical, physical, length))?;
        Ok(())
    }

    /// Remove `[dest, dest + length)` from the parked extent covering
    /// it, re-inserting the remnants with adjusted arena offsets.
    fn split_pending(&mut self, dest: u64, length: u64) -> Result<()> {
        let entry = self.pending.entry_at(dest).ok_or_else(|| {
            FshError::Internal(format!("writeback target {dest} is not parked"))
        })?;
        let piece_end = dest + length;
        let entry_end = entry.physical + entry.length;
        if piece_end > entry_end {
            return Err(FshError::Internal(format!(
                "writeback piece {dest}+{length} exceeds parked extent"
            )));
        }

        self.pending.remove_range(entry.physical, entry.length)?;
        if dest > entry.physical {
            self.pending.insert(Extent::with_user_data(
                entry.physical,
                entry.physical,
                dest - entry.physical,
                entry.user_data,
            ))?;
        }
        if piece_end < entry_end {
            self.pending.insert(Extent::with_user_data(
                piece_end,
                piece_end,
                entry_end - piece_end,
                entry.user_data + (piece_end - entry.physical),
            ))?;
        }
        Ok(())
    }

    fn journal_batch(&mut self) -> Result<()> {
        let Some(journal) = &self.opts.journal else {
            return Ok(());
        };
        let state = JournalState {
            dev_map: self.dev_map.to_list(),
            free_map: self.dev_free.to_list(),
            storage_map: self.storage_free.to_list(),
            pending: self.pending.to_list(),
            primary: self.primary.clone(),
            dirty: self.dirty.to_list(),
            to_zero: self.to_zero.to_list(),
        };
        journal.save_state(&self.meta, &state)
    }

    fn log_progress(&mut self) {
        if self.work_total == 0 {
            return;
        }
        let decile = self.work_done * 10 / self.work_total;
        if decile > self.last_decile {
            self.last_decile = decile;
            info!(
                "progress: {} of {} in place ({}%)",
                pretty_size(self.work_done),
                pretty_size(self.work_total),
                decile * 10
            );
        }
    }

    // ── Invariants ──────────────────────────────────────────────────

    /// Verify the §-by-§ executor invariants; used after every batch
    /// and by tests.
    pub fn check_invariants(&self) -> Result<()> {
        let dev_len = self.meta.dev_length;
        let loop_len = self.meta.loop_file_length;

        for e in self.dev_map.iter() {
            if e.is_in_place() {
                return Err(FshError::Internal(format!(
                    "in-place extent {}+{} still queued",
                    e.physical, e.length
                )));
            }
            if e.physical_end()? > dev_len || e.logical_end()? > loop_len {
                return Err(FshError::Internal(format!(
                    "queued extent {}+{} out of bounds",
                    e.physical, e.length
                )));
            }
        }

        for e in self.pending.iter() {
            if e.physical_end()? > dev_len {
                return Err(FshError::Internal(format!(
                    "parked extent targets {}+{} past device end",
                    e.physical, e.length
                )));
            }
        }

        let arena_len = self.io.storage_length();
        for e in self.storage_free.iter() {
            if e.physical_end()? > arena_len {
                return Err(FshError::Internal(format!(
                    "free arena range {}+{} past arena end",
                    e.physical, e.length
                )));
            }
        }

        // dev_map, free, done, dead and primary storage must be
        // pairwise disjoint, and on a fresh job they partition the
        // device exactly. (A resumed job journals no done/dead
        // history, so only disjointness holds there.)
        let mut coverage = ExtentMap::new();
        let add_all = |m: &ExtentMap, coverage: &mut ExtentMap| -> Result<()> {
            for e in m.iter() {
                coverage.insert(Extent::new(e.physical, e.physical, e.length))?;
            }
            Ok(())
        };
        add_all(&self.dev_map, &mut coverage)?;
        add_all(&self.dev_free, &mut coverage)?;
        add_all(&self.done, &mut coverage)?;
        add_all(&self.dead, &mut coverage)?;
        for e in &self.primary {
            coverage.insert(Extent::new(e.physical, e.physical, e.length))?;
        }
        if self.partition_tracked && coverage.total_length() != dev_len {
            return Err(FshError::Internal(format!(
                "maps cover {} of {dev_len} device bytes",
                coverage.total_length()
            )));
        }
        Ok(())
    }
}

/// Run a complete job against `io` using `job`'s directory and flags.
pub fn run_remap(io: &mut dyn IoDriver, job: &Job) -> Result<RemapReport> {
    if job.simulate_run && !io.simulate_run() {
        return Err(FshError::InvalidArgument(
            "job requests a simulated run but the I/O driver would write".to_owned(),
        ));
    }
    if io.simulate_run() {
        info!("simulated run: no device writes will be issued");
    }
    let opts = EngineOptions {
        clear: job.clear,
        caps: job.caps,
        journal: Some(job.journal()),
        resume: job.resume,
        force: job.force_run,
        ..EngineOptions::default()
    };
    run_with(io, opts)
}

/// Run a complete job with explicit engine options.
pub fn run_with(io: &mut dyn IoDriver, opts: EngineOptions) -> Result<RemapReport> {
    io.umount_dev()?;

    if opts.resume {
        if let Some(journal) = &opts.journal {
            if journal.exists() && journal.load_meta()?.phase == Phase::Done {
                info!("job already completed, nothing to do");
                return Ok(RemapReport {
                    bytes_total: 0,
                    bytes_moved: 0,
                    batches: 0,
                    io: io.stats(),
                });
            }
        }
    }

    let mut remapper = if opts.resume {
        Remapper::resume(io, opts)?
    } else {
        Remapper::prepare(io, opts)?
    };
    remapper.relocate()?;
    remapper.clear_free_space()?;
    remapper.finish()
}
