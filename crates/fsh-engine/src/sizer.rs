//! Scratch storage sizing.

use fsh_error::Result;
use fsh_io::pretty_size;
use fsh_persist::StorageCaps;
use tracing::{info, warn};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Smallest scratch worth having when there is anything to move.
const MIN_STORAGE_LEN: u64 = 16 * MIB;
/// Default scratch target as a fraction of the data to move: 1/128.
const STORAGE_FRACTION_SHIFT: u32 = 7;

const MIN_BUFFER_LEN: u64 = 4 * MIB;
const MAX_BUFFER_LEN: u64 = 256 * MIB;
/// RAM buffer defaults to 1/16 of available RAM.
const BUFFER_RAM_SHIFT: u32 = 4;

/// Free space floor for operations that consume device space:
/// 96 KiB up to 6 GiB devices, 1/65536 of the device up to 64 TiB,
/// 1 GiB above that.
#[must_use]
pub fn critical_free_space_threshold(dev_length: u64) -> u64 {
    if dev_length <= 6 * GIB {
        96 * KIB
    } else if dev_length <= 64 * TIB {
        dev_length / 65536
    } else {
        GIB
    }
}

/// The sizer's verdict: how much scratch, where, and how big a RAM
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBudget {
    /// Bytes of scratch to carve from device free space.
    pub primary_target: u64,
    /// Exact length of the secondary storage file (0 = none).
    pub secondary_len: u64,
    /// RAM copy buffer length.
    pub buffer_len: u64,
}

fn round_down(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        value
    } else {
        value - value % unit
    }
}

/// Decide the scratch layout for a job.
///
/// Prefers primary storage (free device ranges) because it costs no
/// extra disk; only the shortfall becomes a secondary file. Free space
/// below the critically-low threshold is never touched.
pub fn compute(
    total_ram: u64,
    dev_length: u64,
    dev_map_length: u64,
    free_length: u64,
    effective_block_size: u64,
    caps: &StorageCaps,
) -> Result<StorageBudget> {
    let block = effective_block_size.max(1);

    let buffer_len = caps
        .ram_buffer
        .unwrap_or((total_ram >> BUFFER_RAM_SHIFT).clamp(MIN_BUFFER_LEN, MAX_BUFFER_LEN))
        .max(64 * KIB);

    // Scratch larger than the data to move is wasted; an explicit cap
    // is honored as-is, the autodetected target never drops below one
    // block while there is work.
    let total_target = match caps.total {
        Some(cap) => round_down(cap.min(dev_map_length), block),
        None => {
            let auto = MIN_STORAGE_LEN.max(dev_map_length >> STORAGE_FRACTION_SHIFT);
            let auto = round_down(auto.min(dev_map_length), block);
            if auto == 0 && dev_map_length >= block {
                block
            } else {
                auto
            }
        }
    };

    let threshold = critical_free_space_threshold(dev_length);
    let primary_avail = round_down(free_length.saturating_sub(threshold), block);
    let mut primary_target = total_target.min(primary_avail);
    if let Some(cap) = caps.primary {
        primary_target = primary_target.min(round_down(cap, block));
    }

    let mut secondary_len = round_down(total_target - primary_target, block);
    if let Some(cap) = caps.secondary {
        secondary_len = secondary_len.min(round_down(cap, block));
    }

    if total_target > 0 && primary_target + secondary_len == 0 {
        warn!(
            "no scratch storage available ({} to move, {} free); \
             only directly movable extents will relocate",
            pretty_size(dev_map_length),
            pretty_size(free_length)
        );
    }

    info!(
        "scratch storage: {} primary + {} secondary (target {}), RAM buffer {}",
        pretty_size(primary_target),
        pretty_size(secondary_len),
        pretty_size(total_target),
        pretty_size(buffer_len)
    );

    Ok(StorageBudget {
        primary_target,
        secondary_len,
        buffer_len,
    })
}

/// Approximate available system RAM in bytes.
///
/// Reads `/proc/meminfo`; falls back to 1 GiB when it cannot be
/// determined.
#[must_use]
pub fn system_ram() -> u64 {
    match read_meminfo() {
        Some(bytes) => bytes,
        None => {
            warn!("cannot determine system RAM, assuming 1 gigabyte");
            GIB
        }
    }
}

fn read_meminfo() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for key in ["MemAvailable:", "MemTotal:"] {
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix(key) {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb * KIB);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_matches_the_three_regimes() {
        assert_eq!(critical_free_space_threshold(GIB), 96 * KIB);
        assert_eq!(critical_free_space_threshold(6 * GIB), 96 * KIB);
        assert_eq!(critical_free_space_threshold(8 * GIB), 8 * GIB / 65536);
        assert_eq!(critical_free_space_threshold(64 * TIB), GIB);
        assert_eq!(critical_free_space_threshold(65 * TIB), GIB);
    }

    #[test]
    fn prefers_primary_storage() {
        let caps = StorageCaps::default();
        let budget = compute(GIB, 10 * GIB, 4 * GIB, 2 * GIB, 4096, &caps).unwrap();
        assert_eq!(budget.secondary_len, 0);
        assert_eq!(budget.primary_target, 32 * MIB);
    }

    #[test]
    fn shortfall_goes_to_secondary() {
        let caps = StorageCaps {
            total: Some(64 * MIB),
            ..StorageCaps::default()
        };
        // Only ~8 MiB of free space above the threshold.
        let budget = compute(
            GIB,
            GIB,
            512 * MIB,
            8 * MIB + 96 * KIB,
            4096,
            &caps,
        )
        .unwrap();
        assert_eq!(budget.primary_target, 8 * MIB);
        assert_eq!(budget.secondary_len, 56 * MIB);
    }

    #[test]
    fn scratch_never_exceeds_work() {
        let caps = StorageCaps::default();
        let budget = compute(GIB, GIB, 4096, GIB, 4096, &caps).unwrap();
        assert_eq!(budget.primary_target + budget.secondary_len, 4096);
    }

    #[test]
    fn zero_work_means_zero_scratch() {
        let caps = StorageCaps::default();
        let budget = compute(GIB, GIB, 0, GIB, 4096, &caps).unwrap();
        assert_eq!(budget.primary_target, 0);
        assert_eq!(budget.secondary_len, 0);
    }

    #[test]
    fn ram_buffer_respects_cap() {
        let caps = StorageCaps {
            ram_buffer: Some(MIB),
            ..StorageCaps::default()
        };
        let budget = compute(64 * GIB, GIB, GIB, GIB, 4096, &caps).unwrap();
        assert_eq!(budget.buffer_len, MIB);

        let auto = compute(64 * GIB, GIB, GIB, GIB, 4096, &StorageCaps::default()).unwrap();
        assert_eq!(auto.buffer_len, MAX_BUFFER_LEN);
    }
}
