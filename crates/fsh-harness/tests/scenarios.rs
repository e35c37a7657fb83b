//! End-to-end scenarios against real files.
//!
//! Covers the full stack: extent files on disk, the positioned-I/O
//! driver, the journal, and resume after an interruption.

use fsh_engine::{run_remap, run_with, CancelToken, EngineOptions};
use fsh_error::FshError;
use fsh_extent::{file as extent_file, Extent, ExtentList};
use fsh_io::{FileIo, FileIoOptions};
use fsh_persist::{ClearFreeSpace, Job, Journal, Phase, StorageCaps};
use std::fs;
use std::path::{Path, PathBuf};

const DEV_LEN: usize = 64 * 1024;
const HALF: u64 = 32 * 1024;

fn fingerprint(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8 ^ 0x3c).collect()
}

fn write_extent_file(path: &Path, extents: &[Extent]) {
    let mut list = ExtentList::new();
    for e in extents {
        list.push(*e);
    }
    extent_file::save_extents_file(path, &list).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    dev_path: PathBuf,
    job_dir: PathBuf,
    io_opts: FileIoOptions,
    original: Vec<u8>,
}

/// A device file holding two swapped halves.
fn swapped_halves_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let dev_path = dir.path().join("device.img");
    let original = fingerprint(DEV_LEN);
    fs::write(&dev_path, &original).unwrap();

    let loop_path = dir.path().join("loop.fsx");
    write_extent_file(
        &loop_path,
        &[Extent::new(HALF, 0, HALF), Extent::new(0, HALF, HALF)],
    );

    let job_dir = dir.path().join("job");
    fs::create_dir(&job_dir).unwrap();

    let io_opts = FileIoOptions {
        dev_path: dev_path.clone(),
        loop_extents_path: loop_path,
        zero_extents_path: None,
        secondary_storage_path: job_dir.join("storage.bin"),
        loop_file_length: None,
        simulate: false,
        umount_cmd: None,
        skip_umount: true,
    };

    Fixture {
        _dir: dir,
        dev_path,
        job_dir,
        io_opts,
        original,
    }
}

fn assert_swapped(dev_path: &Path, original: &[u8]) {
    let after = fs::read(dev_path).unwrap();
    let half = HALF as usize;
    assert_eq!(&after[..half], &original[half..], "front half wrong");
    assert_eq!(&after[half..], &original[..half], "back half wrong");
}

fn caps(total: u64) -> StorageCaps {
    StorageCaps {
        total: Some(total),
        ram_buffer: Some(8 * 1024),
        ..StorageCaps::default()
    }
}

#[test]
fn full_job_relocates_a_device_file() {
    let fx = swapped_halves_fixture();
    let job = Job::new(
        fx.job_dir.clone(),
        ClearFreeSpace::None,
        false,
        false,
        false,
        caps(HALF),
    )
    .unwrap();

    let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
    let report = run_remap(&mut io, &job).unwrap();
    assert_eq!(report.bytes_moved, DEV_LEN as u64);

    assert_swapped(&fx.dev_path, &fx.original);
    // Success tears the secondary storage down and marks the job done.
    assert!(!fx.job_dir.join("storage.bin").exists());
    assert_eq!(job.journal().load_meta().unwrap().phase, Phase::Done);
}

#[test]
fn interrupted_job_resumes_from_the_journal() {
    let fx = swapped_halves_fixture();
    let journal = Journal::new(fx.job_dir.clone());

    // First run: stop after the first batch (the evacuation into
    // storage has been journalled at that point).
    {
        let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
        let opts = EngineOptions {
            clear: ClearFreeSpace::None,
            caps: caps(HALF),
            journal: Some(journal.clone()),
            cancel: CancelToken::with_batch_budget(1),
            ..EngineOptions::default()
        };
        let err = run_with(&mut io, opts).unwrap_err();
        assert!(matches!(err, FshError::Cancelled));
    }

    // The journal must show work parked in storage and the secondary
    // file must exist at its journalled length.
    let (meta, state) = journal.load_state().unwrap();
    assert_eq!(meta.phase, Phase::Running);
    assert!(!state.pending.is_empty(), "nothing parked after batch one");
    assert!(state.pending.total_length() > 0);
    let storage_len = fs::metadata(fx.job_dir.join("storage.bin")).unwrap().len();
    assert_eq!(storage_len, meta.secondary_len);

    // Second run: resume and finish.
    {
        let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
        let opts = EngineOptions {
            clear: ClearFreeSpace::None,
            caps: caps(HALF),
            journal: Some(journal.clone()),
            resume: true,
            ..EngineOptions::default()
        };
        let report = run_with(&mut io, opts).unwrap();
        assert!(report.bytes_moved > 0);
    }

    assert_swapped(&fx.dev_path, &fx.original);
    assert_eq!(journal.load_meta().unwrap().phase, Phase::Done);

    // Resuming a finished job is a no-op.
    {
        let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
        let opts = EngineOptions {
            journal: Some(journal.clone()),
            resume: true,
            ..EngineOptions::default()
        };
        let report = run_with(&mut io, opts).unwrap();
        assert_eq!(report.bytes_moved, 0);
    }
    assert_swapped(&fx.dev_path, &fx.original);
}

#[test]
fn tampered_secondary_storage_is_rejected_on_resume() {
    let fx = swapped_halves_fixture();
    let journal = Journal::new(fx.job_dir.clone());

    {
        let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
        let opts = EngineOptions {
            caps: caps(HALF),
            journal: Some(journal.clone()),
            cancel: CancelToken::with_batch_budget(1),
            ..EngineOptions::default()
        };
        run_with(&mut io, opts).unwrap_err();
    }

    // Truncate the parked data.
    let storage = fx.job_dir.join("storage.bin");
    let f = fs::OpenOptions::new().write(true).open(&storage).unwrap();
    f.set_len(16).unwrap();
    drop(f);

    let mut io = FileIo::open(fx.io_opts.clone()).unwrap();
    let opts = EngineOptions {
        caps: caps(HALF),
        journal: Some(journal),
        resume: true,
        ..EngineOptions::default()
    };
    let err = run_with(&mut io, opts).unwrap_err();
    assert!(matches!(err, FshError::Protocol { .. }), "got {err:?}");
}

#[test]
fn simulate_mode_leaves_the_device_untouched() {
    let fx = swapped_halves_fixture();
    let job = Job::new(
        fx.job_dir.clone(),
        ClearFreeSpace::All,
        false,
        true,
        false,
        caps(HALF),
    )
    .unwrap();

    let mut io_opts = fx.io_opts.clone();
    io_opts.simulate = true;
    let mut io = FileIo::open(io_opts).unwrap();
    let report = run_remap(&mut io, &job).unwrap();
    assert_eq!(report.bytes_moved, DEV_LEN as u64);

    let after = fs::read(&fx.dev_path).unwrap();
    assert_eq!(after, fx.original, "simulate mode wrote to the device");
}

#[test]
fn direct_moves_use_free_space_from_a_zero_file() {
    let dir = tempfile::tempdir().unwrap();
    let dev_path = dir.path().join("device.img");
    let original = fingerprint(DEV_LEN);
    fs::write(&dev_path, &original).unwrap();

    // One quarter of data at the front, destined for the second
    // quarter; the zero-file declares everything behind it free.
    let quarter = (DEV_LEN / 4) as u64;
    let loop_path = dir.path().join("loop.fsx");
    write_extent_file(&loop_path, &[Extent::new(0, quarter, quarter)]);
    let zero_path = dir.path().join("zero.fsx");
    write_extent_file(&zero_path, &[Extent::new(quarter, 0, 3 * quarter)]);

    let job_dir = dir.path().join("job");
    fs::create_dir(&job_dir).unwrap();
    let job = Job::new(
        job_dir.clone(),
        ClearFreeSpace::Minimal,
        false,
        false,
        false,
        caps(0),
    )
    .unwrap();

    let mut io = FileIo::open(FileIoOptions {
        dev_path: dev_path.clone(),
        loop_extents_path: loop_path,
        zero_extents_path: Some(zero_path),
        secondary_storage_path: job.secondary_storage_path(),
        loop_file_length: None,
        simulate: false,
        umount_cmd: None,
        skip_umount: true,
    })
    .unwrap();
    let report = run_remap(&mut io, &job).unwrap();
    assert_eq!(report.bytes_moved, quarter);

    let after = fs::read(&dev_path).unwrap();
    let q = quarter as usize;
    assert_eq!(&after[q..2 * q], &original[..q], "data not relocated");
    // The vacated source was dirtied, so minimal clearing zeroed it.
    assert_eq!(&after[..q], &vec![0_u8; q][..], "source not cleared");
    // Undeclared ranges are old-filesystem residue and stay untouched.
    assert_eq!(&after[2 * q..], &original[2 * q..]);
}
