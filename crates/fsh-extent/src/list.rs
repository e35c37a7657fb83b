//! Growable extent vectors.

use crate::{BlockSizeBitmask, Extent};
use fsh_error::{FshError, Result};
use std::ops::Range;

fn add(a: u64, b: u64, what: &'static str) -> Result<u64> {
    a.checked_add(b).ok_or(FshError::Overflow(what))
}

/// A vector of extents with the merge-on-append behaviour the remap
/// engine relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentList {
    items: Vec<Extent>,
}

impl ExtentList {
    #[must_use]
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Extent] {
        &self.items
    }

    #[must_use]
    pub fn last(&self) -> Option<&Extent> {
        self.items.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Sum of all extent lengths.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.items.iter().map(|e| e.length).sum()
    }

    /// Append one extent, merging with the tail when physical offset,
    /// logical offset and user data all continue the last extent.
    ///
    /// Zero-length extents are dropped. Overflowing offsets are fatal.
    pub fn append(&mut self, physical: u64, logical: u64, length: u64, user_data: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        add(physical, length, "appending extent (physical end)")?;
        add(logical, length, "appending extent (logical end)")?;

        if let Some(tail) = self.items.last_mut() {
            if tail.physical + tail.length == physical
                && tail.logical + tail.length == logical
                && tail.user_data == user_data
            {
                tail.length = add(tail.length, length, "merging appended extent")?;
                return Ok(());
            }
        }
        self.items.push(Extent::with_user_data(physical, logical, length, user_data));
        Ok(())
    }

    /// [`append`](Self::append) taking a whole extent.
    pub fn append_extent(&mut self, extent: &Extent) -> Result<()> {
        self.append(extent.physical, extent.logical, extent.length, extent.user_data)
    }

    /// Concatenate without merging.
    pub fn append_all(&mut self, other: &ExtentList) {
        self.items.extend_from_slice(&other.items);
    }

    pub fn push(&mut self, extent: Extent) {
        if extent.length != 0 {
            self.items.push(extent);
        }
    }

    pub fn sort_by_physical(&mut self) {
        self.items.sort_by_key(|e| e.physical);
    }

    pub fn sort_by_logical(&mut self) {
        self.items.sort_by_key(|e| e.logical);
    }

    /// Largest extents first.
    pub fn sort_by_reverse_length(&mut self) {
        self.items.sort_by(|a, b| b.length.cmp(&a.length));
    }

    pub fn sort_range_by_physical(&mut self, range: Range<usize>) {
        self.items[range].sort_by_key(|e| e.physical);
    }

    pub fn sort_range_by_logical(&mut self, range: Range<usize>) {
        self.items[range].sort_by_key(|e| e.logical);
    }

    pub fn sort_range_by_reverse_length(&mut self, range: Range<usize>) {
        self.items[range].sort_by(|a, b| b.length.cmp(&a.length));
    }

    /// Swap physical and logical in every extent. Does not re-sort.
    pub fn transpose(&mut self) {
        for e in &mut self.items {
            std::mem::swap(&mut e.physical, &mut e.logical);
        }
    }

    /// Drop extents whose logical offset is at or past `logical_end`
    /// and trim any extent straddling it.
    pub fn truncate_at_logical(&mut self, logical_end: u64) {
        self.items.retain_mut(|e| {
            if e.logical >= logical_end {
                return false;
            }
            let end = e.logical.saturating_add(e.length);
            if end > logical_end {
                e.length = logical_end - e.logical;
            }
            e.length > 0
        });
    }

    /// Compose two extent mappings that share a domain.
    ///
    /// `a2b` maps domain A to B, `a2c` maps A to C; both must be sorted
    /// by physical (their A offsets) with disjoint ranges. Appends the
    /// B→C mapping to `self`, copying user data from `a2b` and absorbing
    /// every emitted value into `bitmask`.
    ///
    /// Portions of B whose A range is not covered by `a2c` are appended
    /// to `unmapped` (physical = B offset, logical = 0) when supplied.
    /// It is an error for `a2c` to cover any part of A that `a2b` does
    /// not: the A domain of `a2b` must be a superset.
    pub fn compose(
        &mut self,
        a2b: &ExtentList,
        a2c: &ExtentList,
        bitmask: &mut BlockSizeBitmask,
        mut unmapped: Option<&mut ExtentList>,
    ) -> Result<()> {
        let bs = a2b.as_slice();
        let cs = a2c.as_slice();

        let hole = || {
            FshError::InvalidArgument(
                "composing extent mappings: second mapping covers a region the first does not"
                    .to_owned(),
            )
        };

        let mut j = 0_usize;
        let mut c_done = cs.first().map_or(0, |c| c.physical);

        for b in bs {
            let b_end = b.physical_end()?;
            let mut pos = b.physical;
            while pos < b_end {
                // Skip mappings in C that end at or before the cursor;
                // each must have been fully consumed.
                while j < cs.len() {
                    let c_end = cs[j].physical_end()?;
                    if c_end <= pos {
                        if c_done < c_end {
                            return Err(hole());
                        }
                        j += 1;
                        if j < cs.len() {
                            c_done = cs[j].physical;
                        }
                    } else {
                        break;
                    }
                }

                if j >= cs.len() || cs[j].physical >= b_end {
                    self.push_unmapped(b, pos, b_end, unmapped.as_deref_mut())?;
                    pos = b_end;
                    break;
                }

                let c = &cs[j];
                let c_end = c.physical_end()?;
                if c.physical > pos {
                    self.push_unmapped(b, pos, c.physical, unmapped.as_deref_mut())?;
                    pos = c.physical;
                }
                if c_done < pos {
                    return Err(hole());
                }

                let hi = b_end.min(c_end);
                let out = Extent::with_user_data(
                    add(b.logical, pos - b.physical, "composing extents (B offset)")?,
                    add(c.logical, pos - c.physical, "composing extents (C offset)")?,
                    hi - pos,
                    b.user_data,
                );
                bitmask.absorb_extent(&out);
                self.append_extent(&out)?;
                c_done = hi;
                pos = hi;
            }
        }

        while j < cs.len() {
            let c_end = cs[j].physical_end()?;
            if c_done < c_end {
                return Err(hole());
            }
            j += 1;
            if j < cs.len() {
                c_done = cs[j].physical;
            }
        }
        Ok(())
    }

    fn push_unmapped(
        &self,
        b: &Extent,
        from: u64,
        to: u64,
        unmapped: Option<&mut ExtentList>,
    ) -> Result<()> {
        if let Some(out) = unmapped {
            out.append(
                add(b.logical, from - b.physical, "collecting unmapped extent")?,
                0,
                to - from,
                b.user_data,
            )?;
        }
        Ok(())
    }
}

impl From<Vec<Extent>> for ExtentList {
    fn from(items: Vec<Extent>) -> Self {
        let mut list = Self::new();
        for e in items {
            list.push(e);
        }
        list
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_USER_DATA, ZEROED_USER_DATA};

    fn list(items: &[(u64, u64, u64)]) -> ExtentList {
        let mut v = ExtentList::new();
        for &(p, l, len) in items {
            v.append(p, l, len, DEFAULT_USER_DATA).unwrap();
        }
        v
    }

    #[test]
    fn append_merges_continuations() {
        let mut v = ExtentList::new();
        v.append(0, 100, 4, DEFAULT_USER_DATA).unwrap();
        v.append(4, 104, 4, DEFAULT_USER_DATA).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v.as_slice()[0], Extent::new(0, 100, 8));

        // Logical discontinuity breaks the merge.
        v.append(8, 200, 4, DEFAULT_USER_DATA).unwrap();
        assert_eq!(v.len(), 2);

        // So does a differing tag.
        v.append(12, 204, 4, ZEROED_USER_DATA).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn append_drops_empty_and_rejects_overflow() {
        let mut v = ExtentList::new();
        v.append(5, 5, 0, DEFAULT_USER_DATA).unwrap();
        assert!(v.is_empty());
        assert!(v.append(u64::MAX, 0, 2, DEFAULT_USER_DATA).is_err());
    }

    #[test]
    fn transpose_is_an_involution() {
        let mut v = list(&[(0, 32, 8), (16, 0, 8), (40, 48, 4)]);
        let original = v.clone();
        v.transpose();
        assert_ne!(v, original);
        v.transpose();
        assert_eq!(v, original);
    }

    #[test]
    fn sort_physical_is_idempotent_through_logical() {
        let mut v = list(&[(16, 0, 8), (0, 32, 8), (40, 48, 4)]);
        v.sort_by_physical();
        let sorted = v.clone();
        v.sort_by_logical();
        v.sort_by_physical();
        assert_eq!(v, sorted);
    }

    #[test]
    fn sort_by_reverse_length_puts_largest_first() {
        let mut v = list(&[(0, 0, 4), (10, 10, 16), (30, 30, 8)]);
        v.sort_by_reverse_length();
        let lengths: Vec<u64> = v.iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![16, 8, 4]);
    }

    #[test]
    fn truncate_at_logical_trims_straddlers() {
        let mut v = list(&[(0, 0, 8), (8, 8, 8), (16, 20, 8)]);
        v.truncate_at_logical(12);
        assert_eq!(v.len(), 2);
        assert_eq!(v.as_slice()[0].length, 8);
        // Second extent straddled 12: trimmed to 4.
        assert_eq!(v.as_slice()[1].length, 4);
    }

    #[test]
    fn compose_produces_b_to_c() {
        // A = [0,16): B offsets 100.., C offsets 200..
        let a2b = list(&[(0, 100, 16)]);
        let a2c = list(&[(0, 200, 16)]);
        let mut out = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        out.compose(&a2b, &a2c, &mut mask, None).unwrap();
        assert_eq!(out.as_slice(), &[Extent::new(100, 200, 16)]);
    }

    #[test]
    fn compose_splits_on_c_boundaries() {
        let a2b = list(&[(0, 100, 16)]);
        let a2c = list(&[(0, 200, 8), (8, 400, 8)]);
        let mut out = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        out.compose(&a2b, &a2c, &mut mask, None).unwrap();
        assert_eq!(
            out.as_slice(),
            &[Extent::new(100, 200, 8), Extent::new(108, 400, 8)]
        );
    }

    #[test]
    fn compose_collects_unmapped() {
        // a2b covers [0,16), a2c only [4,8).
        let a2b = list(&[(0, 100, 16)]);
        let a2c = list(&[(4, 200, 4)]);
        let mut out = ExtentList::new();
        let mut unmapped = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        out.compose(&a2b, &a2c, &mut mask, Some(&mut unmapped)).unwrap();
        assert_eq!(out.as_slice(), &[Extent::new(104, 200, 4)]);
        assert_eq!(
            unmapped.as_slice(),
            &[Extent::new(100, 0, 4), Extent::new(108, 0, 8)]
        );
    }

    #[test]
    fn compose_rejects_uncovered_c() {
        // a2c reaches past the a2b domain.
        let a2b = list(&[(0, 100, 8)]);
        let a2c = list(&[(0, 200, 16)]);
        let mut out = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        assert!(out.compose(&a2b, &a2c, &mut mask, None).is_err());

        // Hole in a2b where a2c has data.
        let a2b = list(&[(0, 100, 4), (12, 300, 4)]);
        let a2c = list(&[(0, 200, 16)]);
        let mut out = ExtentList::new();
        assert!(out.compose(&a2b, &a2c, &mut mask, None).is_err());
    }

    #[test]
    fn compose_with_transpose_is_identity_on_range() {
        // a2b maps [0,12) -> [100,112); composing with its own domain
        // (a2a) yields b2a, the transposed mapping.
        let a2b = list(&[(0, 100, 8), (8, 200, 4)]);
        let mut a2a = ExtentList::new();
        for e in &a2b {
            a2a.append(e.physical, e.physical, e.length, e.user_data).unwrap();
        }
        let mut out = ExtentList::new();
        let mut mask = BlockSizeBitmask::new();
        out.compose(&a2b, &a2a, &mut mask, None).unwrap();

        let mut expected = a2b.clone();
        expected.transpose();
        assert_eq!(out, expected);
    }
}
