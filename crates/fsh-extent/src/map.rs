//! Ordered extent maps keyed by physical offset.

use crate::{relation, Extent, ExtentList, ExtentRelation, DEFAULT_USER_DATA};
use fsh_error::{FshError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Payload {
    logical: u64,
    length: u64,
    user_data: u64,
}

/// Which side of an intersection contributes the logical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Simultaneous physical-and-logical intersection: only regions
    /// where both mappings agree on the physical→logical shift.
    Both,
    /// Intersect physical ranges, keep the first map's logical axis.
    Physical1,
    /// Intersect physical ranges, keep the second map's logical axis.
    Physical2,
}

/// An ordered mapping keyed by physical offset.
///
/// Keys are unique and physical ranges never overlap; zero-length
/// extents are never stored. Insertion merges with the immediate
/// neighbours when physical adjacency, logical adjacency and user data
/// all line up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    map: BTreeMap<u64, Payload>,
    total: u64,
}

impl ExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of all extent lengths.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.total = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.map.iter().map(|(&physical, v)| Extent {
            physical,
            logical: v.logical,
            length: v.length,
            user_data: v.user_data,
        })
    }

    #[must_use]
    pub fn first(&self) -> Option<Extent> {
        self.iter().next()
    }

    /// The longest extent in the map (first of that length in physical
    /// order).
    #[must_use]
    pub fn largest(&self) -> Option<Extent> {
        let mut best: Option<Extent> = None;
        for e in self.iter() {
            match &best {
                Some(b) if b.length >= e.length => {}
                _ => best = Some(e),
            }
        }
        best
    }

    /// The entry containing `pos`, if any.
    #[must_use]
    pub fn entry_at(&self, pos: u64) -> Option<Extent> {
        let (&physical, v) = self.map.range(..=pos).next_back()?;
        if physical + v.length > pos {
            Some(Extent {
                physical,
                logical: v.logical,
                length: v.length,
                user_data: v.user_data,
            })
        } else {
            None
        }
    }

    /// Copy entries into a list, in physical order, without merging.
    #[must_use]
    pub fn to_list(&self) -> ExtentList {
        let mut out = ExtentList::new();
        for e in self.iter() {
            out.push(e);
        }
        out
    }

    fn insert_raw(&mut self, physical: u64, payload: Payload) {
        debug_assert!(payload.length > 0);
        self.total += payload.length;
        let clash = self.map.insert(physical, payload);
        debug_assert!(clash.is_none());
    }

    /// Insert an extent, merging with its neighbours where the merge
    /// precondition holds. Overlap with an existing entry is a fatal
    /// inconsistency.
    pub fn insert(&mut self, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        let end = extent.physical_end()?;
        extent.logical_end()?;

        if let Some((&pk, pv)) = self.map.range(..=extent.physical).next_back() {
            if pk + pv.length > extent.physical {
                return Err(FshError::Internal(format!(
                    "extent insert overlaps existing entry: new {}+{} hits {}+{}",
                    extent.physical, extent.length, pk, pv.length
                )));
            }
        }
        if let Some((&nk, nv)) = self.map.range(extent.physical..).next() {
            if nk < end {
                return Err(FshError::Internal(format!(
                    "extent insert overlaps existing entry: new {}+{} hits {}+{}",
                    extent.physical, extent.length, nk, nv.length
                )));
            }
        }

        let mut merged = extent;
        if let Some((&pk, pv)) = self.map.range(..merged.physical).next_back() {
            let pred = Extent {
                physical: pk,
                logical: pv.logical,
                length: pv.length,
                user_data: pv.user_data,
            };
            if relation(&pred, &merged)? == ExtentRelation::TouchBefore {
                self.map.remove(&pk);
                self.total -= pred.length;
                merged.physical = pred.physical;
                merged.logical = pred.logical;
                merged.length += pred.length;
            }
        }
        if let Some((&nk, nv)) = self.map.range(merged.physical..).next() {
            let succ = Extent {
                physical: nk,
                logical: nv.logical,
                length: nv.length,
                user_data: nv.user_data,
            };
            if relation(&merged, &succ)? == ExtentRelation::TouchBefore {
                self.map.remove(&nk);
                self.total -= succ.length;
                merged.length += succ.length;
            }
        }

        self.insert_raw(
            merged.physical,
            Payload {
                logical: merged.logical,
                length: merged.length,
                user_data: merged.user_data,
            },
        );
        Ok(())
    }

    /// Subtract the physical range `[physical, physical + length)` from
    /// the map, splitting straddling entries. A split tail keeps its
    /// user data and has its logical offset advanced by the split
    /// distance. Returns the number of bytes actually removed.
    pub fn remove_range(&mut self, physical: u64, length: u64) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }
        let end = physical
            .checked_add(length)
            .ok_or(FshError::Overflow("removing extent range"))?;

        let mut affected: Vec<(u64, Payload)> = Vec::new();
        if let Some((&k, v)) = self.map.range(..physical).next_back() {
            if k + v.length > physical {
                affected.push((k, *v));
            }
        }
        for (&k, v) in self.map.range(physical..end) {
            affected.push((k, *v));
        }

        let mut removed = 0;
        for (k, v) in affected {
            let e_end = k + v.length;
            let lo = k.max(physical);
            let hi = e_end.min(end);
            removed += hi - lo;

            self.map.remove(&k);
            self.total -= v.length;

            if k < lo {
                self.insert_raw(
                    k,
                    Payload {
                        logical: v.logical,
                        length: lo - k,
                        user_data: v.user_data,
                    },
                );
            }
            if hi < e_end {
                self.insert_raw(
                    hi,
                    Payload {
                        logical: v.logical + (hi - k),
                        length: e_end - hi,
                        user_data: v.user_data,
                    },
                );
            }
        }
        Ok(removed)
    }

    /// Subtract every extent of `other` from this map.
    pub fn remove_all(&mut self, other: &ExtentMap) -> Result<()> {
        for e in other.iter() {
            self.remove_range(e.physical, e.length)?;
        }
        Ok(())
    }

    /// True when `[physical, physical + length)` is entirely covered,
    /// possibly by several adjacent entries.
    #[must_use]
    pub fn covers(&self, physical: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let Some(end) = physical.checked_add(length) else {
            return false;
        };
        let mut pos = physical;
        loop {
            let Some(e) = self.entry_at(pos) else {
                return false;
            };
            let e_end = e.physical + e.length;
            if e_end >= end {
                return true;
            }
            pos = e_end;
        }
    }

    /// The covered sub-ranges of `[lo, hi)`, as `(start, length)` pairs
    /// in ascending order. Adjacent entries are coalesced.
    #[must_use]
    pub fn covered_ranges(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let mut out: Vec<(u64, u64)> = Vec::new();
        if lo >= hi {
            return out;
        }
        let mut push = |start: u64, len: u64| {
            if len == 0 {
                return;
            }
            if let Some(last) = out.last_mut() {
                if last.0 + last.1 == start {
                    last.1 += len;
                    return;
                }
            }
            out.push((start, len));
        };
        if let Some((&k, v)) = self.map.range(..lo).next_back() {
            let e_end = k + v.length;
            if e_end > lo {
                push(lo, e_end.min(hi) - lo);
            }
        }
        for (&k, v) in self.map.range(lo..hi) {
            let e_end = k + v.length;
            push(k, e_end.min(hi) - k);
        }
        out
    }

    /// Populate this map with the pairwise intersection of `a` and `b`.
    ///
    /// `mode` selects which side contributes the logical axis
    /// ([`MatchMode::Physical1`] / [`MatchMode::Physical2`]), or
    /// restricts the result to regions where both mappings agree on the
    /// physical→logical shift ([`MatchMode::Both`], user data from `a`).
    pub fn intersect_all_all(&mut self, a: &ExtentMap, b: &ExtentMap, mode: MatchMode) -> Result<()> {
        self.clear();
        for ea in a.iter() {
            let a_end = ea.physical_end()?;
            // Entries of b overlapping ea's physical range.
            let mut overlaps: Vec<Extent> = Vec::new();
            if let Some(e) = b.entry_at(ea.physical) {
                overlaps.push(e);
            }
            for (&k, v) in b.map.range(ea.physical + 1..a_end) {
                overlaps.push(Extent {
                    physical: k,
                    logical: v.logical,
                    length: v.length,
                    user_data: v.user_data,
                });
            }

            for eb in overlaps {
                let b_end = eb.physical_end()?;
                let lo = ea.physical.max(eb.physical);
                let hi = a_end.min(b_end);
                if lo >= hi {
                    continue;
                }
                let piece = match mode {
                    MatchMode::Physical1 => Extent::with_user_data(
                        lo,
                        ea.logical + (lo - ea.physical),
                        hi - lo,
                        ea.user_data,
                    ),
                    MatchMode::Physical2 => Extent::with_user_data(
                        lo,
                        eb.logical + (lo - eb.physical),
                        hi - lo,
                        eb.user_data,
                    ),
                    MatchMode::Both => {
                        let shift_a = i128::from(ea.logical) - i128::from(ea.physical);
                        let shift_b = i128::from(eb.logical) - i128::from(eb.physical);
                        if shift_a != shift_b {
                            continue;
                        }
                        Extent::with_user_data(
                            lo,
                            ea.logical + (lo - ea.physical),
                            hi - lo,
                            ea.user_data,
                        )
                    }
                };
                self.insert(piece)?;
            }
        }
        Ok(())
    }

    /// Populate this map with the physical complement of `occupied`
    /// (which must be sorted by physical with disjoint ranges) within
    /// `[start, device_length)`. Gap extents carry `logical = 0`.
    pub fn complement0_physical_shift(
        &mut self,
        occupied: &ExtentList,
        start: u64,
        device_length: u64,
    ) -> Result<()> {
        self.clear();
        let mut pos = start;
        for e in occupied {
            if e.physical < pos {
                return Err(FshError::Internal(format!(
                    "complement input not sorted/disjoint at physical {}",
                    e.physical
                )));
            }
            let e_end = e.physical_end()?;
            if e_end > device_length {
                return Err(FshError::Overflow("extent extends past device end"));
            }
            if e.physical > pos {
                self.insert(Extent::with_user_data(
                    pos,
                    0,
                    e.physical - pos,
                    DEFAULT_USER_DATA,
                ))?;
            }
            pos = e_end;
        }
        if device_length > pos {
            self.insert(Extent::with_user_data(
                pos,
                0,
                device_length - pos,
                DEFAULT_USER_DATA,
            ))?;
        }
        Ok(())
    }
}
