//! Best-fit allocation of logical holes to relocated device extents.

use crate::{DEFAULT_USER_DATA, ExtentMap};
use std::collections::BTreeSet;

/// Length-indexed multiset over free logical holes.
///
/// Built from a complement map (every entry has `logical == physical`), the
/// pool serves the renumbering step of the analysis: each device extent gets
/// the shortest hole that still fits it, which preserves the large holes for
/// large extents and keeps fragmentation down.
#[derive(Debug, Clone, Default)]
pub struct BestFitPool {
    /// `(length, start)` — ordered so `range(len..)` yields the shortest
    /// sufficient hole, ties broken by smallest start.
    holes: BTreeSet<(u64, u64)>,
}

impl BestFitPool {
    /// Index the holes of `map` by length.
    #[must_use]
    pub fn new(map: &ExtentMap) -> Self {
        let mut holes = BTreeSet::new();
        for extent in map.iter() {
            holes.insert((extent.length, extent.logical));
        }
        Self { holes }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    /// Total length of the remaining holes.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.holes.iter().map(|&(length, _)| length).sum()
    }

    /// Allocate a hole for every extent of `src`, emitting the assignments
    /// into `dst` (`physical` from `src`, `logical` from the chosen hole).
    ///
    /// A source extent with no sufficient hole is split: the largest
    /// available hole is consumed wholly and the remainder retried. `src` is
    /// fully drained unless the pool runs dry first, in which case the
    /// unplaced remainder is left in `src` for the caller to detect.
    pub fn allocate_all(&mut self, src: &mut ExtentMap, dst: &mut ExtentMap) {
        let keys: Vec<u64> = src.iter().map(|e| e.physical).collect();
        for key in keys {
            let Some(extent) = src.remove(key) else {
                continue;
            };
            let mut physical = extent.physical;
            let mut logical = extent.logical;
            let mut remaining = extent.length;

            while remaining > 0 {
                if let Some(&(hole_len, hole_start)) =
                    self.holes.range((remaining, 0)..).next()
                {
                    // Shortest hole that fits; consume wholly or partially.
                    self.holes.remove(&(hole_len, hole_start));
                    dst.insert(physical, hole_start, remaining, extent.user_data);
                    if hole_len > remaining {
                        self.holes
                            .insert((hole_len - remaining, hole_start + remaining));
                    }
                    remaining = 0;
                } else if let Some(&(hole_len, hole_start)) = self.holes.iter().next_back() {
                    // No hole large enough: consume the largest wholly and
                    // split the source.
                    self.holes.remove(&(hole_len, hole_start));
                    dst.insert(physical, hole_start, hole_len, extent.user_data);
                    physical += hole_len;
                    logical += hole_len;
                    remaining -= hole_len;
                } else {
                    // Pool exhausted: put the unplaced remainder back.
                    src.insert(physical, logical, remaining, extent.user_data);
                    return;
                }
            }
        }
    }

    /// Rebuild an extent map (`logical == physical`) from the holes still
    /// unallocated.
    #[must_use]
    pub fn into_map(self) -> ExtentMap {
        let mut map = ExtentMap::new();
        for (length, start) in self.holes {
            map.insert(start, start, length, DEFAULT_USER_DATA);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holes_of(lengths_at: &[(u64, u64)]) -> ExtentMap {
        // (start, length) pairs with logical == physical.
        let mut map = ExtentMap::new();
        for &(start, length) in lengths_at {
            map.insert(start, start, length, DEFAULT_USER_DATA);
        }
        map
    }

    #[test]
    fn best_fit_picks_shortest_sufficient_hole() {
        // Holes of lengths {2, 3, 5}; requests {3, 2}.
        let holes = holes_of(&[(0, 2), (10, 3), (20, 5)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 3, DEFAULT_USER_DATA);
        src.insert(110, 110, 2, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert!(src.is_empty());
        assert_eq!(dst.get(100).map(|e| e.logical), Some(10)); // 3 → hole-3
        assert_eq!(dst.get(110).map(|e| e.logical), Some(0)); // 2 → hole-2
        // Hole of length 5 remains untouched.
        let rest = pool.into_map();
        assert_eq!(rest.get(20).map(|e| e.length), Some(5));
    }

    #[test]
    fn best_fit_is_order_independent_for_distinct_fits() {
        let holes = holes_of(&[(0, 2), (10, 3), (20, 5)]);
        let mut pool = BestFitPool::new(&holes);

        // Same requests, swapped physical order.
        let mut src = ExtentMap::new();
        src.insert(100, 100, 2, DEFAULT_USER_DATA);
        src.insert(110, 110, 3, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert_eq!(dst.get(100).map(|e| e.logical), Some(0));
        assert_eq!(dst.get(110).map(|e| e.logical), Some(10));
    }

    #[test]
    fn equal_length_holes_tie_break_on_smallest_start() {
        let holes = holes_of(&[(40, 4), (8, 4)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 4, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert_eq!(dst.get(100).map(|e| e.logical), Some(8));
    }

    #[test]
    fn partial_consumption_advances_hole() {
        let holes = holes_of(&[(0, 10)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 4, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        let rest = pool.into_map();
        assert_eq!(rest.get(4).map(|e| e.length), Some(6));
    }

    #[test]
    fn oversized_request_splits_across_holes() {
        let holes = holes_of(&[(0, 3), (10, 4)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 6, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert!(src.is_empty());
        // Largest hole (4) consumed first, remainder (2) best-fits hole-3.
        assert_eq!(dst.get(100).map(|e| (e.logical, e.length)), Some((10, 4)));
        assert_eq!(dst.get(104).map(|e| (e.logical, e.length)), Some((0, 2)));
        let rest = pool.into_map();
        assert_eq!(rest.get(2).map(|e| e.length), Some(1));
    }

    #[test]
    fn exhausted_pool_leaves_remainder_in_src() {
        let holes = holes_of(&[(0, 2)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 5, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert!(!src.is_empty());
        assert_eq!(src.length_sum(), 3);
        assert_eq!(dst.length_sum(), 2);
    }

    #[test]
    fn drains_total_when_capacity_suffices() {
        let holes = holes_of(&[(0, 2), (10, 3), (20, 5)]);
        let mut pool = BestFitPool::new(&holes);

        let mut src = ExtentMap::new();
        src.insert(100, 100, 4, DEFAULT_USER_DATA);
        src.insert(110, 110, 4, DEFAULT_USER_DATA);
        src.insert(120, 120, 2, DEFAULT_USER_DATA);
        let mut dst = ExtentMap::new();
        pool.allocate_all(&mut src, &mut dst);

        assert!(src.is_empty());
        assert_eq!(dst.length_sum(), 10);
        assert_eq!(pool.remaining(), 0);
    }
}
