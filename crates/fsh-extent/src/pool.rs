//! Best-fit extent allocation.

use crate::{Extent, ExtentMap};
use fsh_error::{FshError, Result};
use std::collections::{BTreeMap, VecDeque};

/// A secondary index over a free-space [`ExtentMap`], ordered by extent
/// length with ties broken by insertion order. Used for best-fit
/// allocation of scratch space.
///
/// The backing map holds free segments; by convention its entries are
/// self-mapped (`logical == physical`), so carving the head of a
/// segment keeps the convention intact. Allocated fragments are written
/// into a separate map with their `user_data` set to the pool-side
/// offset they were carved from (the scratch arena offset when the
/// backing map is the arena free map).
///
/// Between [`ExtentPool::new`] and the last allocation the backing map
/// must only be mutated through the pool, or the index goes stale.
#[derive(Debug, Default)]
pub struct ExtentPool {
    index: BTreeMap<u64, VecDeque<u64>>,
}

impl ExtentPool {
    /// Build the length index from the backing map.
    #[must_use]
    pub fn new(backing: &ExtentMap) -> Self {
        let mut pool = Self {
            index: BTreeMap::new(),
        };
        for e in backing.iter() {
            pool.insert_index(e.length, e.physical);
        }
        pool
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Length of the largest free segment.
    #[must_use]
    pub fn largest_length(&self) -> Option<u64> {
        self.index.keys().next_back().copied()
    }

    fn insert_index(&mut self, length: u64, key: u64) {
        self.index.entry(length).or_default().push_back(key);
    }

    fn remove_index(&mut self, length: u64, key: u64) -> Result<()> {
        let bucket = self.index.get_mut(&length).ok_or_else(|| {
            FshError::Internal(format!("pool index missing length bucket {length}"))
        })?;
        let pos = bucket.iter().position(|&k| k == key).ok_or_else(|| {
            FshError::Internal(format!("pool index missing segment {key}+{length}"))
        })?;
        bucket.remove(pos);
        if bucket.is_empty() {
            self.index.remove(&length);
        }
        Ok(())
    }

    fn backing_entry(&self, backing: &ExtentMap, key: u64, length: u64) -> Result<Extent> {
        let entry = backing
            .entry_at(key)
            .filter(|e| e.physical == key && e.length == length)
            .ok_or_else(|| {
                FshError::Internal(format!("pool index out of sync at segment {key}+{length}"))
            })?;
        Ok(entry)
    }

    /// Satisfy `request` from the smallest free segment that fits.
    ///
    /// On the best-fit path the head of the chosen segment is carved off
    /// and the segment re-indexed under its reduced length; returns
    /// `None`. When no segment is large enough the largest one is fully
    /// consumed and the unsatisfied remainder of the request is
    /// returned for the caller to retry (the fragmentation path). When
    /// the pool is empty the request comes back untouched.
    ///
    /// The satisfied fragment lands in `allocated` with its physical
    /// set to the carved segment offset and its logical preserved.
    pub fn allocate(
        &mut self,
        request: &Extent,
        backing: &mut ExtentMap,
        allocated: &mut ExtentMap,
    ) -> Result<Option<Extent>> {
        if request.length == 0 {
            return Ok(None);
        }

        if let Some((seg_len, key)) = self.best_fit(request.length) {
            self.remove_index(seg_len, key)?;
            self.backing_entry(backing, key, seg_len)?;
            backing.remove_range(key, request.length)?;
            if seg_len > request.length {
                self.insert_index(seg_len - request.length, key + request.length);
            }
            allocated.insert(Extent::with_user_data(
                key,
                request.logical,
                request.length,
                key,
            ))?;
            return Ok(None);
        }

        let Some((seg_len, key)) = self.largest() else {
            return Ok(Some(*request));
        };
        self.remove_index(seg_len, key)?;
        self.backing_entry(backing, key, seg_len)?;
        backing.remove_range(key, seg_len)?;
        allocated.insert(Extent::with_user_data(key, request.logical, seg_len, key))?;

        Ok(Some(Extent {
            physical: request
                .physical
                .checked_add(seg_len)
                .ok_or(FshError::Overflow("advancing fragmented request"))?,
            logical: request
                .logical
                .checked_add(seg_len)
                .ok_or(FshError::Overflow("advancing fragmented request"))?,
            length: request.length - seg_len,
            user_data: request.user_data,
        }))
    }

    /// Allocate every extent of `requests`, largest first so big
    /// requests are served from big holes. Fully and partially
    /// satisfied portions move into `allocated`; whatever the pool
    /// cannot hold stays in `requests`.
    pub fn allocate_all(
        &mut self,
        requests: &mut ExtentMap,
        backing: &mut ExtentMap,
        allocated: &mut ExtentMap,
    ) -> Result<()> {
        let mut ordered = requests.to_list();
        ordered.sort_by_reverse_length();

        for e in &ordered {
            requests.remove_range(e.physical, e.length)?;
            let mut req = *e;
            loop {
                match self.allocate(&req, backing, allocated)? {
                    None => break,
                    Some(rem) => {
                        if rem.length == req.length {
                            // Pool exhausted; put the remainder back.
                            requests.insert(rem)?;
                            break;
                        }
                        req = rem;
                    }
                }
            }
            if self.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Return a segment to the pool, merging with backing neighbours.
    pub fn release(&mut self, extent: Extent, backing: &mut ExtentMap) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        let end = extent.physical_end()?;

        let pred = if extent.physical > 0 {
            backing.entry_at(extent.physical - 1)
        } else {
            None
        };
        let succ = backing.entry_at(end);
        if let Some(p) = pred {
            self.remove_index(p.length, p.physical)?;
        }
        if let Some(s) = succ {
            self.remove_index(s.length, s.physical)?;
        }

        backing.insert(extent)?;

        let merged = backing.entry_at(extent.physical).ok_or_else(|| {
            FshError::Internal("released segment vanished from backing map".to_owned())
        })?;
        self.insert_index(merged.length, merged.physical);

        // Neighbours that did not merge get their index entries back.
        if let Some(p) = pred {
            if merged.physical > p.physical {
                self.insert_index(p.length, p.physical);
            }
        }
        if let Some(s) = succ {
            if merged.physical + merged.length <= s.physical {
                self.insert_index(s.length, s.physical);
            }
        }
        Ok(())
    }

    fn best_fit(&self, length: u64) -> Option<(u64, u64)> {
        self.index
            .range(length..)
            .find_map(|(&len, bucket)| bucket.front().map(|&key| (len, key)))
    }

    fn largest(&self) -> Option<(u64, u64)> {
        self.index
            .iter()
            .rev()
            .find_map(|(&len, bucket)| bucket.front().map(|&key| (len, key)))
    }
}
