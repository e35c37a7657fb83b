#![forbid(unsafe_code)]
//! Job configuration and the progress journal.
//!
//! A job owns a directory holding everything needed to resume after an
//! interruption: a JSON metadata document, the working extent sets in
//! the text format, and the secondary storage file. Every file is
//! rewritten atomically (temp + rename + fsync) so the journal is
//! always a consistent snapshot of the last completed batch.

use fsh_error::{FshError, Result};
use fsh_extent::{file as extent_file, BlockSizeBitmask, ExtentList};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which free blocks to clear once remapping is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearFreeSpace {
    /// Zero every free block.
    All,
    /// Zero only the blocks the run dirtied (renumbered sources and
    /// primary storage).
    #[default]
    Minimal,
    /// Zero nothing beyond primary storage and the to-zero set.
    None,
}

/// Hard caps on scratch sizing; `None` means autodetect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCaps {
    pub total: Option<u64>,
    pub primary: Option<u64>,
    pub secondary: Option<u64>,
    pub ram_buffer: Option<u64>,
}

/// Per-job options and the directory holding its state.
#[derive(Debug, Clone)]
pub struct Job {
    dir: PathBuf,
    pub clear: ClearFreeSpace,
    pub force_run: bool,
    pub simulate_run: bool,
    pub resume: bool,
    pub caps: StorageCaps,
}

impl Job {
    /// Create (or reuse, when resuming) the job directory.
    pub fn new(
        dir: PathBuf,
        clear: ClearFreeSpace,
        force_run: bool,
        simulate_run: bool,
        resume: bool,
        caps: StorageCaps,
    ) -> Result<Self> {
        if resume {
            if !dir.is_dir() {
                return Err(FshError::InvalidArgument(format!(
                    "cannot resume: job directory {} does not exist",
                    dir.display()
                )));
            }
        } else {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            clear,
            force_run,
            simulate_run,
            resume,
            caps,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn journal(&self) -> Journal {
        Journal {
            dir: self.dir.clone(),
        }
    }

    /// Where the secondary storage file lives.
    #[must_use]
    pub fn secondary_storage_path(&self) -> PathBuf {
        self.dir.join(SECONDARY_STORAGE_FILE)
    }
}

pub const META_FILE: &str = "job.json";
pub const SECONDARY_STORAGE_FILE: &str = "storage.bin";

const DEV_MAP_FILE: &str = "dev_map.fsx";
const FREE_MAP_FILE: &str = "free_map.fsx";
const STORAGE_MAP_FILE: &str = "storage_map.fsx";
const PENDING_FILE: &str = "pending.fsx";
const PRIMARY_FILE: &str = "primary.fsx";
const DIRTY_FILE: &str = "dirty.fsx";
const TO_ZERO_FILE: &str = "to_zero.fsx";

/// Job lifecycle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Blocks are still being moved.
    Running,
    /// All blocks are in place; the clearing pass is underway.
    Clearing,
    /// The job finished successfully.
    Done,
}

/// Everything `job.json` records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub dev_length: u64,
    pub loop_file_length: u64,
    pub effective_block_size: u64,
    pub secondary_len: u64,
    pub buffer_len: u64,
    pub phase: Phase,
}

/// A consistent snapshot of the executor's working state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalState {
    /// Blocks still waiting to move.
    pub dev_map: ExtentList,
    /// Free device ranges.
    pub free_map: ExtentList,
    /// Free arena ranges.
    pub storage_map: ExtentList,
    /// Blocks parked in the arena, keyed by destination, arena offset
    /// in `user_data`.
    pub pending: ExtentList,
    /// Primary storage extents with their arena offsets.
    pub primary: ExtentList,
    /// Free ranges dirtied by the run (for the minimal clear policy).
    pub dirty: ExtentList,
    /// Ranges that must read as zero on completion.
    pub to_zero: ExtentList,
}

/// Reads and writes the on-disk journal of one job.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.dir.join(META_FILE).is_file()
    }

    pub fn save_meta(&self, meta: &JobMeta) -> Result<()> {
        let body = serde_json::to_vec_pretty(meta).map_err(|e| FshError::Protocol {
            what: "job metadata",
            detail: e.to_string(),
        })?;
        write_atomic(&self.dir, META_FILE, &body)
    }

    pub fn load_meta(&self) -> Result<JobMeta> {
        let path = self.dir.join(META_FILE);
        let body = fs::read(&path)?;
        serde_json::from_slice(&body).map_err(|e| FshError::Protocol {
            what: "job metadata",
            detail: format!("{}: {e}", path.display()),
        })
    }

    /// Persist a full batch snapshot: metadata plus every extent set.
    pub fn save_state(&self, meta: &JobMeta, state: &JournalState) -> Result<()> {
        self.save_extents(DEV_MAP_FILE, &state.dev_map)?;
        self.save_extents(FREE_MAP_FILE, &state.free_map)?;
        self.save_extents(STORAGE_MAP_FILE, &state.storage_map)?;
        self.save_extents(PENDING_FILE, &state.pending)?;
        self.save_extents(PRIMARY_FILE, &state.primary)?;
        self.save_extents(DIRTY_FILE, &state.dirty)?;
        self.save_extents(TO_ZERO_FILE, &state.to_zero)?;
        // Metadata last: a crash mid-snapshot leaves the previous
        // consistent metadata in place.
        self.save_meta(meta)?;
        debug!(
            target: "fsshift::persist",
            pending_moves = state.dev_map.len(),
            in_storage = state.pending.len(),
            "journalled batch"
        );
        Ok(())
    }

    pub fn load_state(&self) -> Result<(JobMeta, JournalState)> {
        let meta = self.load_meta()?;
        let state = JournalState {
            dev_map: self.load_extents(DEV_MAP_FILE)?,
            free_map: self.load_extents(FREE_MAP_FILE)?,
            storage_map: self.load_extents(STORAGE_MAP_FILE)?,
            pending: self.load_extents(PENDING_FILE)?,
            primary: self.load_extents(PRIMARY_FILE)?,
            dirty: self.load_extents(DIRTY_FILE)?,
            to_zero: self.load_extents(TO_ZERO_FILE)?,
        };
        Ok((meta, state))
    }

    fn save_extents(&self, name: &str, list: &ExtentList) -> Result<()> {
        let mut body = Vec::new();
        extent_file::save_extents(&mut body, list)?;
        write_atomic(&self.dir, name, &body)
    }

    fn load_extents(&self, name: &str) -> Result<ExtentList> {
        let mut out = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        extent_file::load_extents_file(&self.dir.join(name), &mut out, &mut mask)?;
        Ok(out)
    }

    /// Verify the secondary storage file matches the journalled length.
    pub fn check_secondary_storage(&self, expected_len: u64) -> Result<()> {
        if expected_len == 0 {
            return Ok(());
        }
        let path = self.dir.join(SECONDARY_STORAGE_FILE);
        let found = fs::metadata(&path)?.len();
        if found != expected_len {
            return Err(FshError::Protocol {
                what: "secondary storage",
                detail: format!(
                    "{} is {found} bytes, journal expects {expected_len}",
                    path.display()
                ),
            });
        }
        Ok(())
    }
}

/// Write `body` to `dir/name` through a temp file so a crash never
/// leaves a half-written journal entry behind.
fn write_atomic(dir: &Path, name: &str, body: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let path = dir.join(name);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsh_extent::Extent;

    fn sample_state() -> JournalState {
        let mut dev_map = ExtentList::new();
        dev_map.push(Extent::new(8, 0, 8));
        let mut pending = ExtentList::new();
        pending.push(Extent::with_user_data(16, 16, 4, 0));
        JournalState {
            dev_map,
            pending,
            ..JournalState::default()
        }
    }

    fn sample_meta() -> JobMeta {
        JobMeta {
            dev_length: 1 << 20,
            loop_file_length: 1 << 19,
            effective_block_size: 4096,
            secondary_len: 8192,
            buffer_len: 65536,
            phase: Phase::Running,
        }
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        let meta = sample_meta();
        let state = sample_state();
        journal.save_state(&meta, &state).unwrap();

        let (meta2, state2) = journal.load_state().unwrap();
        assert_eq!(meta2, meta);
        assert_eq!(state2, state);
    }

    #[test]
    fn phase_updates_are_visible() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        let mut meta = sample_meta();
        journal.save_meta(&meta).unwrap();
        meta.phase = Phase::Done;
        journal.save_meta(&meta).unwrap();
        assert_eq!(journal.load_meta().unwrap().phase, Phase::Done);
    }

    #[test]
    fn secondary_storage_length_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join(SECONDARY_STORAGE_FILE), vec![0_u8; 100]).unwrap();
        assert!(journal.check_secondary_storage(100).is_ok());
        let err = journal.check_secondary_storage(200).unwrap_err();
        assert!(matches!(err, FshError::Protocol { .. }));
    }

    #[test]
    fn corrupt_meta_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join(META_FILE), b"not json").unwrap();
        assert!(matches!(
            journal.load_meta().unwrap_err(),
            FshError::Protocol { .. }
        ));
    }

    #[test]
    fn resume_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = Job::new(
            missing,
            ClearFreeSpace::Minimal,
            false,
            false,
            true,
            StorageCaps::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FshError::InvalidArgument(_)));
    }
}
