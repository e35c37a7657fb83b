#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fsh_error::FshError;
use fsh_extent::{file as extent_file, BlockSizeBitmask, ExtentList};
use fsh_io::{pretty_size, FileIo, FileIoOptions};
use fsh_persist::{ClearFreeSpace, Job, StorageCaps};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fsshift",
    about = "In-place block renumbering: move a loop-file image onto its device"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remap a device so the loop-file image lands at offset zero.
    Run {
        /// Block device (or device image) to rewrite in place.
        device: PathBuf,
        /// Extent map of the loop file (extent-file text format).
        loop_extents: PathBuf,
        /// Optional extent map describing the device's free space.
        zero_extents: Option<PathBuf>,
        /// Directory for the journal and secondary storage.
        #[arg(long)]
        job_dir: PathBuf,
        /// Resume an interrupted job from its journal.
        #[arg(long)]
        resume: bool,
        /// Downgrade curated sanity-check failures to warnings.
        #[arg(long)]
        force: bool,
        /// Run without writing to the device.
        #[arg(long)]
        simulate: bool,
        /// Total scratch storage, e.g. 256m (default: autodetect).
        #[arg(long, value_parser = parse_size)]
        storage_size: Option<u64>,
        /// Cap on scratch carved from device free space.
        #[arg(long, value_parser = parse_size)]
        primary_storage_size: Option<u64>,
        /// Cap on the secondary storage file.
        #[arg(long, value_parser = parse_size)]
        secondary_storage_size: Option<u64>,
        /// RAM copy buffer size.
        #[arg(long, value_parser = parse_size)]
        buffer_size: Option<u64>,
        /// Which free blocks to zero on completion.
        #[arg(long, value_enum, default_value = "minimal")]
        clear: ClearArg,
        /// Command used to unmount the device.
        #[arg(long)]
        umount_cmd: Option<String>,
        /// Skip unmounting (the device is already quiescent).
        #[arg(long)]
        no_umount: bool,
    },
    /// Run randomized in-memory remaps and verify every byte.
    SelfTest {
        /// First seed to run.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Number of consecutive seeds.
        #[arg(long, default_value_t = 16)]
        iterations: u64,
    },
    /// Pretty-print an extent file.
    Show {
        /// Extent file to display.
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClearArg {
    All,
    Minimal,
    None,
}

impl From<ClearArg> for ClearFreeSpace {
    fn from(value: ClearArg) -> Self {
        match value {
            ClearArg::All => Self::All,
            ClearArg::Minimal => Self::Minimal,
            ClearArg::None => Self::None,
        }
    }
}

/// Parse a byte count with an optional k/m/g/t suffix.
fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last() {
        Some('k' | 'K') => (&text[..text.len() - 1], 10),
        Some('m' | 'M') => (&text[..text.len() - 1], 20),
        Some('g' | 'G') => (&text[..text.len() - 1], 30),
        Some('t' | 'T') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {text:?}"))?;
    value
        .checked_shl(shift)
        .filter(|_| value.leading_zeros() >= shift)
        .ok_or_else(|| format!("size {text:?} overflows"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<FshError>()
            .map_or(1, FshError::to_exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            device,
            loop_extents,
            zero_extents,
            job_dir,
            resume,
            force,
            simulate,
            storage_size,
            primary_storage_size,
            secondary_storage_size,
            buffer_size,
            clear,
            umount_cmd,
            no_umount,
        } => {
            let caps = StorageCaps {
                total: storage_size,
                primary: primary_storage_size,
                secondary: secondary_storage_size,
                ram_buffer: buffer_size,
            };
            let job = Job::new(job_dir, clear.into(), force, simulate, resume, caps)
                .context("setting up the job directory")?;

            let mut io = FileIo::open(FileIoOptions {
                dev_path: device.clone(),
                loop_extents_path: loop_extents,
                zero_extents_path: zero_extents,
                secondary_storage_path: job.secondary_storage_path(),
                loop_file_length: None,
                simulate,
                umount_cmd,
                skip_umount: no_umount,
            })
            .with_context(|| format!("opening {}", device.display()))?;

            let report = fsh_engine::run_remap(&mut io, &job)?;
            info!(
                "{}done: {} moved in {} batches ({} copies, {} written)",
                if simulate { "(simulated) " } else { "" },
                pretty_size(report.bytes_moved),
                report.batches,
                report.io.copy_ops,
                pretty_size(report.io.bytes_written)
            );
            Ok(())
        }
        Command::SelfTest { seed, iterations } => {
            for s in seed..seed.saturating_add(iterations) {
                let outcome = fsh_harness::run_self_test(s)?;
                info!(
                    "seed {}: {} in {} extents remapped (block size {})",
                    outcome.seed,
                    pretty_size(outcome.dev_len),
                    outcome.extents,
                    outcome.block_size
                );
            }
            Ok(())
        }
        Command::Show { file } => {
            let mut list = ExtentList::new();
            let mut mask = BlockSizeBitmask::new();
            extent_file::load_extents_file(&file, &mut list, &mut mask)
                .with_context(|| format!("loading {}", file.display()))?;
            println!("# {} extents, effective block size {}", list.len(), mask.effective_block_size());
            println!("#  extent           physical         logical      length  user_data");
            for (i, e) in list.iter().enumerate() {
                println!(
                    "#{i:8}\t{:12}\t{:12}\t{:8}\t({})",
                    e.physical, e.logical, e.length, e.user_data
                );
            }
            Ok(())
        }
    }
}
