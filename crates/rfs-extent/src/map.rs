//! Ordered extent map keyed on physical block number.

use crate::{DEFAULT_USER_DATA, Extent, ExtentList};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Payload {
    logical: u64,
    length: u64,
    user_data: u64,
}

/// Ordered map from `physical` to `(logical, length, user_data)`.
///
/// Invariants:
/// - no two entries overlap on the physical axis;
/// - no two adjacent entries are both contiguous (physical *and* logical)
///   with matching `user_data` — [`insert`](Self::insert) coalesces them.
///
/// `total_count` / `used_count` are aggregate counters maintained by
/// callers, not derived from the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    entries: BTreeMap<u64, Payload>,
    total_count: u64,
    used_count: u64,
}

impl ExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_count = 0;
        self.used_count = 0;
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn set_total_count(&mut self, count: u64) {
        self.total_count = count;
    }

    #[must_use]
    pub fn used_count(&self) -> u64 {
        self.used_count
    }

    pub fn set_used_count(&mut self, count: u64) {
        self.used_count = count;
    }

    /// Iterate entries in physical order.
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.entries.iter().map(|(&physical, p)| Extent {
            physical,
            logical: p.logical,
            length: p.length,
            user_data: p.user_data,
        })
    }

    /// Entry whose physical start equals `physical`, if any.
    #[must_use]
    pub fn get(&self, physical: u64) -> Option<Extent> {
        self.entries.get(&physical).map(|p| Extent {
            physical,
            logical: p.logical,
            length: p.length,
            user_data: p.user_data,
        })
    }

    #[must_use]
    pub fn first(&self) -> Option<Extent> {
        self.iter().next()
    }

    /// Sum of all entry lengths (derived, not the `total_count` counter).
    #[must_use]
    pub fn length_sum(&self) -> u64 {
        self.entries.values().map(|p| p.length).sum()
    }

    /// Copy all entries into an [`ExtentList`], physical order.
    #[must_use]
    pub fn to_list(&self) -> ExtentList {
        let mut list = ExtentList::with_capacity(self.len());
        for extent in self.iter() {
            list.append(extent);
        }
        list
    }

    /// O(1) content exchange with `other`.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Insert an extent, coalescing with both neighbours when physical and
    /// logical run contiguously and `user_data` matches. Inserting a range
    /// that overlaps an existing entry on the physical axis is a programmer
    /// error (debug assertion).
    pub fn insert(&mut self, physical: u64, logical: u64, length: u64, user_data: u64) {
        if length == 0 {
            return;
        }
        let mut physical = physical;
        let mut logical = logical;
        let mut length = length;

        debug_assert!(
            !self.overlaps_range(physical, length),
            "extent [{physical}, {}) overlaps an existing entry",
            physical + length
        );

        // Coalesce with the left neighbour.
        if let Some((&prev_key, prev)) = self.entries.range(..=physical).next_back() {
            if prev_key + prev.length == physical
                && prev.logical + prev.length == logical
                && prev.user_data == user_data
            {
                physical = prev_key;
                logical = prev.logical;
                length += prev.length;
                self.entries.remove(&prev_key);
            }
        }

        // Coalesce with the right neighbour (possibly merging all three).
        if let Some((&next_key, next)) = self.entries.range(physical + length..).next() {
            if next_key == physical + length
                && next.logical == logical + length
                && next.user_data == user_data
            {
                length += next.length;
                self.entries.remove(&next_key);
            }
        }

        self.entries.insert(
            physical,
            Payload {
                logical,
                length,
                user_data,
            },
        );
    }

    pub fn insert_extent(&mut self, extent: Extent) {
        self.insert(
            extent.physical,
            extent.logical,
            extent.length,
            extent.user_data,
        );
    }

    /// Remove the entry starting at `physical`, returning it.
    pub fn remove(&mut self, physical: u64) -> Option<Extent> {
        self.entries.remove(&physical).map(|p| Extent {
            physical,
            logical: p.logical,
            length: p.length,
            user_data: p.user_data,
        })
    }

    /// Whether `[start, start + length)` intersects any entry.
    #[must_use]
    pub fn overlaps_range(&self, start: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = start + length;
        if let Some((&key, p)) = self.entries.range(..=start).next_back() {
            if key + p.length > start {
                return true;
            }
        }
        self.entries.range(start..end).next().is_some()
    }

    /// Whether `[start, start + length)` intersects any entry other than the
    /// one keyed at `exclude`.
    #[must_use]
    pub fn overlaps_range_excluding(&self, start: u64, length: u64, exclude: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = start + length;
        if let Some((&key, p)) = self.entries.range(..=start).next_back() {
            if key != exclude && key + p.length > start {
                return true;
            }
        }
        self.entries
            .range(start..end)
            .any(|(&key, _)| key != exclude)
    }

    /// Entries intersecting `[start, start + length)`, in physical order.
    #[must_use]
    pub fn overlapping_range(&self, start: u64, length: u64) -> Vec<Extent> {
        if length == 0 {
            return Vec::new();
        }
        let end = start + length;
        let mut out = Vec::new();
        if let Some((&key, p)) = self.entries.range(..start).next_back() {
            if key + p.length > start {
                out.push(Extent {
                    physical: key,
                    logical: p.logical,
                    length: p.length,
                    user_data: p.user_data,
                });
            }
        }
        for (&key, p) in self.entries.range(start..end) {
            out.push(Extent {
                physical: key,
                logical: p.logical,
                length: p.length,
                user_data: p.user_data,
            });
        }
        out
    }

    /// Subtract `[start, start + length)` from the map, splitting straddling
    /// entries into head/tail remainders.
    pub fn remove_range(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = start + length;

        // Collect keys of entries touching the range: the predecessor that
        // may straddle `start`, plus everything keyed inside [start, end).
        let mut touched: Vec<u64> = Vec::new();
        if let Some((&key, p)) = self.entries.range(..start).next_back() {
            if key + p.length > start {
                touched.push(key);
            }
        }
        touched.extend(self.entries.range(start..end).map(|(&key, _)| key));

        for key in touched {
            let Some(p) = self.entries.remove(&key) else {
                continue;
            };
            let entry_end = key + p.length;
            if key < start {
                // Head remainder keeps the original key.
                self.entries.insert(
                    key,
                    Payload {
                        logical: p.logical,
                        length: start - key,
                        user_data: p.user_data,
                    },
                );
            }
            if entry_end > end {
                // Tail remainder re-keyed at the cut point.
                self.entries.insert(
                    end,
                    Payload {
                        logical: p.logical + (end - key),
                        length: entry_end - end,
                        user_data: p.user_data,
                    },
                );
            }
        }
    }

    /// Subtract every physical range of `other` from `self`.
    pub fn remove_all(&mut self, other: &Self) {
        for extent in other.iter() {
            self.remove_range(extent.physical, extent.length);
        }
    }

    /// Fill `self` with the physical intersection of `a` and `b`.
    ///
    /// For each overlap region the resulting `logical` follows `a`'s
    /// mapping, as does `user_data`. (Every caller in the analysis phase
    /// intersects maps whose entries satisfy `logical == physical`, where
    /// the two mappings agree by construction.)
    pub fn intersect_all_all(&mut self, a: &Self, b: &Self) {
        self.clear();
        for ea in a.iter() {
            let a_end = ea.end_physical();
            // b entries possibly overlapping ea: the predecessor plus all
            // keyed inside [ea.physical, a_end).
            let mut candidates: Vec<Extent> = Vec::new();
            if let Some((&key, p)) = b.entries.range(..ea.physical).next_back() {
                if key + p.length > ea.physical {
                    candidates.push(Extent {
                        physical: key,
                        logical: p.logical,
                        length: p.length,
                        user_data: p.user_data,
                    });
                }
            }
            for (&key, p) in b.entries.range(ea.physical..a_end) {
                candidates.push(Extent {
                    physical: key,
                    logical: p.logical,
                    length: p.length,
                    user_data: p.user_data,
                });
            }
            for eb in candidates {
                let start = ea.physical.max(eb.physical);
                let end = a_end.min(eb.end_physical());
                if start < end {
                    self.insert(
                        start,
                        ea.logical + (start - ea.physical),
                        end - start,
                        ea.user_data,
                    );
                }
            }
        }
    }

    /// Fill `self` with the physical complement of `list` within
    /// `[0, device_length)`, right-shifting physical and length by `shift`.
    /// Resulting entries have `logical == physical`.
    ///
    /// `list` must be sorted by physical and free of physical overlaps.
    pub fn complement_physical_shifted(&mut self, list: &ExtentList, shift: u32, device_length: u64) {
        self.clear();
        let device_blocks = device_length >> shift;
        let mut cursor = 0_u64;
        for extent in list.iter() {
            let physical = extent.physical >> shift;
            let length = extent.length >> shift;
            debug_assert!(physical >= cursor, "list not sorted by physical");
            if physical > cursor {
                self.insert(cursor, cursor, physical - cursor, DEFAULT_USER_DATA);
            }
            cursor = physical + length;
        }
        if cursor < device_blocks {
            self.insert(cursor, cursor, device_blocks - cursor, DEFAULT_USER_DATA);
        }
    }

    /// As [`complement_physical_shifted`](Self::complement_physical_shifted)
    /// but complements the logical axis. `list` must be sorted by logical.
    pub fn complement_logical_shifted(&mut self, list: &ExtentList, shift: u32, device_length: u64) {
        self.clear();
        let device_blocks = device_length >> shift;
        let mut cursor = 0_u64;
        for extent in list.iter() {
            let logical = extent.logical >> shift;
            let length = extent.length >> shift;
            debug_assert!(logical >= cursor, "list not sorted by logical");
            if logical > cursor {
                self.insert(cursor, cursor, logical - cursor, DEFAULT_USER_DATA);
            }
            cursor = logical + length;
        }
        if cursor < device_blocks {
            self.insert(cursor, cursor, device_blocks - cursor, DEFAULT_USER_DATA);
        }
    }

    /// Append every entry of `list` right-shifted by `shift`, preserving the
    /// physical→logical mapping and `user_data`.
    pub fn append_shifted(&mut self, list: &ExtentList, shift: u32) {
        for extent in list.iter() {
            self.insert(
                extent.physical >> shift,
                extent.logical >> shift,
                extent.length >> shift,
                extent.user_data,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(extents: &[(u64, u64, u64)]) -> ExtentMap {
        let mut map = ExtentMap::new();
        for &(physical, logical, length) in extents {
            map.insert(physical, logical, length, DEFAULT_USER_DATA);
        }
        map
    }

    fn entries_of(map: &ExtentMap) -> Vec<(u64, u64, u64)> {
        map.iter()
            .map(|e| (e.physical, e.logical, e.length))
            .collect()
    }

    #[test]
    fn insert_coalesces_left_and_right() {
        let mut map = ExtentMap::new();
        map.insert(0, 100, 4, DEFAULT_USER_DATA);
        map.insert(8, 108, 4, DEFAULT_USER_DATA);
        assert_eq!(map.len(), 2);

        // Filling the gap merges all three into one.
        map.insert(4, 104, 4, DEFAULT_USER_DATA);
        assert_eq!(entries_of(&map), vec![(0, 100, 12)]);
    }

    #[test]
    fn insert_does_not_coalesce_across_logical_discontinuity() {
        let mut map = ExtentMap::new();
        map.insert(0, 100, 4, DEFAULT_USER_DATA);
        // Physically adjacent but logically elsewhere.
        map.insert(4, 200, 4, DEFAULT_USER_DATA);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn insert_does_not_coalesce_across_user_data() {
        let mut map = ExtentMap::new();
        map.insert(0, 0, 4, 1);
        map.insert(4, 4, 4, 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn remove_range_splits_straddling_entry() {
        let mut map = map_of(&[(0, 100, 10)]);
        map.remove_range(3, 4);
        assert_eq!(entries_of(&map), vec![(0, 100, 3), (7, 107, 3)]);
    }

    #[test]
    fn remove_range_hits_multiple_entries() {
        let mut map = map_of(&[(0, 0, 4), (6, 6, 4), (12, 12, 4)]);
        map.remove_range(2, 12);
        assert_eq!(entries_of(&map), vec![(0, 0, 2), (14, 14, 2)]);
    }

    #[test]
    fn remove_all_subtracts_other_map() {
        let mut map = map_of(&[(0, 0, 16)]);
        let cut = map_of(&[(2, 2, 2), (10, 10, 4)]);
        map.remove_all(&cut);
        assert_eq!(entries_of(&map), vec![(0, 0, 2), (4, 4, 6), (14, 14, 2)]);
    }

    #[test]
    fn overlaps_range_sees_predecessor_tail() {
        let map = map_of(&[(0, 0, 8)]);
        assert!(map.overlaps_range(7, 1));
        assert!(!map.overlaps_range(8, 4));
        assert!(map.overlaps_range(4, 10));
        assert!(!map.overlaps_range(4, 0));
    }

    #[test]
    fn overlaps_range_excluding_skips_self() {
        let map = map_of(&[(0, 0, 8), (10, 10, 4)]);
        assert!(!map.overlaps_range_excluding(0, 8, 0));
        assert!(map.overlaps_range_excluding(6, 6, 0));
        assert!(map.overlaps_range_excluding(0, 12, 10));
    }

    #[test]
    fn intersect_is_contained_in_both() {
        let a = map_of(&[(0, 0, 8), (12, 12, 4)]);
        let b = map_of(&[(4, 4, 10)]);
        let mut out = ExtentMap::new();
        out.intersect_all_all(&a, &b);
        assert_eq!(entries_of(&out), vec![(4, 4, 4), (12, 12, 2)]);

        // Commutative up to user_data.
        let mut flipped = ExtentMap::new();
        flipped.intersect_all_all(&b, &a);
        assert_eq!(entries_of(&flipped), entries_of(&out));
    }

    #[test]
    fn intersect_empty_when_disjoint() {
        let a = map_of(&[(0, 0, 4)]);
        let b = map_of(&[(4, 4, 4)]);
        let mut out = ExtentMap::new();
        out.intersect_all_all(&a, &b);
        assert!(out.is_empty());
    }

    #[test]
    fn complement_physical_covers_gaps() {
        // Device of 16 blocks, extents at [2,4) and [8,12) (in bytes with
        // shift 0 the units coincide).
        let mut list = ExtentList::new();
        list.append(Extent::new(2, 2, 2, DEFAULT_USER_DATA));
        list.append(Extent::new(8, 8, 4, DEFAULT_USER_DATA));
        let mut map = ExtentMap::new();
        map.complement_physical_shifted(&list, 0, 16);
        assert_eq!(entries_of(&map), vec![(0, 0, 2), (4, 4, 4), (12, 12, 4)]);
    }

    #[test]
    fn complement_shifts_byte_extents_to_blocks() {
        // 4 KiB blocks: bytes [0, 8192) used, device 16 KiB.
        let mut list = ExtentList::new();
        list.append(Extent::new(0, 0, 8192, DEFAULT_USER_DATA));
        let mut map = ExtentMap::new();
        map.complement_physical_shifted(&list, 12, 16384);
        assert_eq!(entries_of(&map), vec![(2, 2, 2)]);
    }

    #[test]
    fn complement_round_trips() {
        let mut list = ExtentList::new();
        list.append(Extent::new(0, 0, 3, DEFAULT_USER_DATA));
        list.append(Extent::new(5, 5, 4, DEFAULT_USER_DATA));
        list.append(Extent::new(12, 12, 4, DEFAULT_USER_DATA));

        let mut complement = ExtentMap::new();
        complement.complement_physical_shifted(&list, 0, 16);

        let mut back = ExtentMap::new();
        back.complement_physical_shifted(&complement.to_list(), 0, 16);

        let mut original = ExtentMap::new();
        original.append_shifted(&list, 0);
        assert_eq!(entries_of(&back), entries_of(&original));
    }

    #[test]
    fn complement_of_full_device_is_empty() {
        let mut list = ExtentList::new();
        list.append(Extent::new(0, 0, 16, DEFAULT_USER_DATA));
        let mut map = ExtentMap::new();
        map.complement_physical_shifted(&list, 0, 16);
        assert!(map.is_empty());
    }

    #[test]
    fn complement_logical_uses_logical_axis() {
        // Physical scattered, logical occupying [0, 4) and [8, 12).
        let mut list = ExtentList::new();
        list.append(Extent::new(40, 0, 4, DEFAULT_USER_DATA));
        list.append(Extent::new(20, 8, 4, DEFAULT_USER_DATA));
        let mut map = ExtentMap::new();
        map.complement_logical_shifted(&list, 0, 16);
        assert_eq!(entries_of(&map), vec![(4, 4, 4), (12, 12, 4)]);
    }

    #[test]
    fn append_shifted_preserves_logical_mapping() {
        let mut list = ExtentList::new();
        list.append(Extent::new(8192, 0, 4096, 7));
        let mut map = ExtentMap::new();
        map.append_shifted(&list, 12);
        let extent = map.first().expect("entry");
        assert_eq!(
            (extent.physical, extent.logical, extent.length, extent.user_data),
            (2, 0, 1, 7)
        );
    }

    #[test]
    fn swap_is_total() {
        let mut a = map_of(&[(0, 0, 4)]);
        a.set_total_count(4);
        let mut b = ExtentMap::new();
        a.swap(&mut b);
        assert!(a.is_empty());
        assert_eq!(b.total_count(), 4);
        assert_eq!(b.len(), 1);
    }
}
