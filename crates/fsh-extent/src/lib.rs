#![forbid(unsafe_code)]
//! Extent algebra: the data model of a block renumbering job.
//!
//! An extent is a contiguous run of bytes described by `(physical,
//! logical, length)` plus a small user-data tag. `physical` is where the
//! data currently sits on the device; `logical` is where it must end up.
//! This crate provides the containers the remap engine works on:
//!
//! - **[`ExtentList`]**: a vector with append-merging, sorting by
//!   physical / logical / reverse length, transposition and composition.
//! - **[`ExtentMap`]**: an ordered map keyed by physical offset with
//!   neighbour-merging insertion, range subtraction, intersections and
//!   complement.
//! - **[`ExtentPool`]**: a best-fit allocator indexed by extent length
//!   over a backing map.
//! - **[`file`]**: the plain-text extent-file format used for journals
//!   and test inputs.

pub mod file;
mod list;
mod map;
mod pool;

pub use list::ExtentList;
pub use map::{ExtentMap, MatchMode};
pub use pool::ExtentPool;

use fsh_error::{FshError, Result};

/// `user_data` value when the caller has nothing to record.
pub const DEFAULT_USER_DATA: u64 = 0;

/// `user_data` value marking an extent whose on-disk contents are known
/// to read as zeroes, so it never needs to be physically copied.
pub const ZEROED_USER_DATA: u64 = 1;

/// A contiguous run of bytes: where it is, where it belongs, how long it
/// is, plus a caller-owned tag.
///
/// During remap execution the tag is overloaded to carry the extent's
/// offset inside the scratch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    /// Byte offset on the device.
    pub physical: u64,
    /// Byte offset where this data must end up.
    pub logical: u64,
    /// Length in bytes.
    pub length: u64,
    /// Caller-owned tag; see [`DEFAULT_USER_DATA`] and [`ZEROED_USER_DATA`].
    pub user_data: u64,
}

impl Extent {
    #[must_use]
    pub fn new(physical: u64, logical: u64, length: u64) -> Self {
        Self {
            physical,
            logical,
            length,
            user_data: DEFAULT_USER_DATA,
        }
    }

    #[must_use]
    pub fn with_user_data(physical: u64, logical: u64, length: u64, user_data: u64) -> Self {
        Self {
            physical,
            logical,
            length,
            user_data,
        }
    }

    /// One past the last physical byte, or `Overflow`.
    pub fn physical_end(&self) -> Result<u64> {
        self.physical
            .checked_add(self.length)
            .ok_or(FshError::Overflow("computing extent physical end"))
    }

    /// One past the last logical byte, or `Overflow`.
    pub fn logical_end(&self) -> Result<u64> {
        self.logical
            .checked_add(self.length)
            .ok_or(FshError::Overflow("computing extent logical end"))
    }

    /// True if the data already sits at its target offset.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        self.physical == self.logical
    }
}

/// How two extents relate once ordered by physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentRelation {
    /// First ends strictly before second starts (or they touch but
    /// cannot merge).
    Before,
    /// First ends exactly where second starts, and logical offsets and
    /// user data line up: the two can merge into one extent.
    TouchBefore,
    /// Physical ranges overlap by at least one byte.
    Intersect,
    /// Mirror of `TouchBefore`.
    TouchAfter,
    /// Mirror of `Before`.
    After,
}

/// Classify the relation between two extents.
///
/// `TouchBefore`/`TouchAfter` require all three of physical adjacency,
/// logical adjacency and equal user data (the merge precondition).
pub fn relation(e1: &Extent, e2: &Extent) -> Result<ExtentRelation> {
    let end1 = e1.physical_end()?;
    let end2 = e2.physical_end()?;

    if end1 <= e2.physical {
        if end1 == e2.physical
            && e1.logical_end()? == e2.logical
            && e1.user_data == e2.user_data
        {
            Ok(ExtentRelation::TouchBefore)
        } else {
            Ok(ExtentRelation::Before)
        }
    } else if end2 <= e1.physical {
        if end2 == e1.physical
            && e2.logical_end()? == e1.logical
            && e2.user_data == e1.user_data
        {
            Ok(ExtentRelation::TouchAfter)
        } else {
            Ok(ExtentRelation::After)
        }
    } else {
        Ok(ExtentRelation::Intersect)
    }
}

/// OR-accumulator over every offset and length seen in a job's inputs.
///
/// The effective block size is the largest power of two dividing all of
/// them (and the device length): the lowest set bit of the accumulated
/// mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSizeBitmask(u64);

impl BlockSizeBitmask {
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    pub fn absorb(&mut self, value: u64) {
        self.0 |= value;
    }

    pub fn absorb_extent(&mut self, extent: &Extent) {
        self.0 |= extent.physical | extent.logical | extent.length;
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Largest power of two dividing everything absorbed so far.
    ///
    /// An empty mask (nothing absorbed, or only zeroes) divides by any
    /// power of two; report 1 so callers can treat the result as a unit.
    #[must_use]
    pub fn effective_block_size(self) -> u64 {
        if self.0 == 0 {
            1
        } else {
            1 << self.0.trailing_zeros()
        }
    }

    #[must_use]
    pub fn effective_block_size_log2(self) -> u32 {
        if self.0 == 0 {
            0
        } else {
            self.0.trailing_zeros()
        }
    }
}

/// Log an extent collection at DEBUG, one `#`-prefixed row per extent.
pub fn show_extents<'a, I>(label: &str, extents: I, effective_block_size: u64)
where
    I: IntoIterator<Item = &'a Extent>,
{
    let mut count = 0_usize;
    tracing::debug!(target: "fsshift::extent", "# extents in {label}");
    tracing::debug!(
        target: "fsshift::extent",
        "# effective block size = {effective_block_size}"
    );
    tracing::debug!(
        target: "fsshift::extent",
        "#  extent           physical         logical      length  user_data"
    );
    for (i, e) in extents.into_iter().enumerate() {
        tracing::debug!(
            target: "fsshift::extent",
            "#{:8}\t{:12}\t{:12}\t{:8}\t({})",
            i,
            e.physical,
            e.logical,
            e.length,
            e.user_data
        );
        count = i + 1;
    }
    if count == 0 {
        tracing::debug!(target: "fsshift::extent", "#   no extents in {label}");
    }
}
