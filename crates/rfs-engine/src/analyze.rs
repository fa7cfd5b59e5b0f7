//! Analysis phase: derive the shuffle plan and the PRIMARY-STORAGE
//! candidates from the LOOP-FILE and FREE-SPACE extent lists.

use crate::{TAG_DEVICE, TAG_LOOP_FILE, Work, show};
use rfs_error::{RemapError, Result};
use rfs_extent::{BestFitPool, DEFAULT_USER_DATA, Extent, ExtentList, ExtentMap};
use rfs_types::{align_down, align_up, pretty_size};
use tracing::{error, info};

impl Work<'_> {
    /// Compute `dev_map` (the shuffle plan) and `dev_free_map` (candidate
    /// staging holes) from the two input lists.
    ///
    /// The lists must be in bytes and sorted by logical; they are mutated
    /// in place and their contents are undefined afterwards.
    pub(crate) fn analyze(
        &mut self,
        loop_file_extents: &mut ExtentList,
        free_space_extents: &mut ExtentList,
    ) -> Result<()> {
        self.dev_map.clear();
        self.dev_free_map.clear();
        self.work_count = 0;

        let log2 = self.io.effective_block_size_log2();
        let dev_length = self.io.dev_length();

        let mut loop_map = ExtentMap::new();
        let mut loop_holes_map = ExtentMap::new();
        let mut renumbered = ExtentMap::new();

        // LOOP-HOLES: the logical gaps of the loop file, i.e. the logical
        // addresses free for arbitrary assignment of device blocks.
        loop_file_extents.sort_by_logical();
        loop_holes_map.complement_logical_shifted(loop_file_extents, log2, dev_length);

        // LOOP-FILE extents by physical.
        loop_file_extents.sort_by_physical();
        loop_map.append_shifted(loop_file_extents, log2);
        show("loop file", log2, &loop_map);

        // FREE-SPACE extents: the zero file's own logical positions are
        // meaningless here, so rewrite logical := physical (which also
        // lets adjacent extents coalesce).
        for extent in free_space_extents.iter() {
            let physical = extent.physical >> log2;
            let length = extent.length >> log2;
            self.dev_free_map
                .insert(physical, physical, length, DEFAULT_USER_DATA);
        }
        show("free space", log2, &self.dev_free_map);

        // DEVICE in-use extents: the physical complement of the union of
        // LOOP-FILE and FREE-SPACE.
        loop_file_extents.append_all(free_space_extents);
        loop_file_extents.sort_by_physical();
        self.dev_map
            .complement_physical_shifted(loop_file_extents, log2, dev_length);
        show("device", log2, &self.dev_map);

        show("initial loop holes", log2, &loop_holes_map);

        // Device blocks already sitting inside a hole with the same
        // address need no work: drop them from both maps.
        renumbered.intersect_all_all(&self.dev_map, &loop_holes_map);
        show("device (invariant)", log2, &renumbered);
        self.dev_map.remove_all(&renumbered);
        loop_holes_map.remove_all(&renumbered);
        renumbered.clear();
        show("loop holes after device (invariant)", log2, &loop_holes_map);

        // Renumber the remaining device blocks into the remaining holes,
        // best fit.
        let mut pool = BestFitPool::new(&loop_holes_map);
        pool.allocate_all(&mut self.dev_map, &mut renumbered);
        show("device (renumbered)", log2, &renumbered);
        let loop_holes_map = pool.into_map();
        show("final loop holes", log2, &loop_holes_map);

        if !self.dev_map.is_empty() {
            error!(
                target: "rfs::engine",
                "internal error: device extents do not fit the holes left by the loop \
                 file, giving up"
            );
            show("device (not fitting)", log2, &self.dev_map);
            return Err(RemapError::NoSpace);
        }
        self.dev_map.swap(&mut renumbered);
        renumbered.clear();

        // Drop LOOP-FILE blocks already in their final position; tag and
        // count the rest.
        let mut tagged = ExtentMap::new();
        for extent in loop_map.iter() {
            if extent.is_invariant() {
                renumbered.insert_extent(extent);
            } else {
                self.work_count += extent.length;
                tagged.insert(extent.physical, extent.logical, extent.length, TAG_LOOP_FILE);
            }
        }
        show("loop file (invariant)", log2, &renumbered);
        renumbered.clear();
        loop_map = tagged;

        // Merge the renumbered device extents into the plan.
        for extent in self.dev_map.iter() {
            self.work_count += extent.length;
            loop_map.insert(extent.physical, extent.logical, extent.length, TAG_DEVICE);
        }
        self.dev_map.clear();
        self.dev_map.swap(&mut loop_map);
        self.dev_map.set_total_count(self.work_count);
        self.dev_map.set_used_count(self.work_count);
        show("device + loop file (merged)", log2, &self.dev_map);

        let (len, unit) = pretty_size(self.work_count << log2);
        info!(
            target: "rfs::engine",
            "analysis completed: {len:.2} {unit}bytes must be relocated"
        );

        // PRIMARY-STORAGE candidates: free space that is also a hole.
        renumbered.intersect_all_all(&self.dev_free_map, &loop_holes_map);
        show("free space (invariant)", log2, &renumbered);
        let page_blocks = rfs_io::system_page_size() >> log2;
        let mut candidates = ExtentMap::new();
        let mut total = 0_u64;
        for extent in renumbered.iter() {
            if let Some(trimmed) = filter_candidate(extent, self.work_count, page_blocks) {
                total += trimmed.length;
                candidates.insert_extent(trimmed);
            }
        }
        self.dev_free_map = candidates;
        self.dev_free_map.set_total_count(total);
        show(
            "primary storage (free, invariant, contiguous, aligned)",
            log2,
            &self.dev_free_map,
        );

        let (len, unit) = pretty_size(total << log2);
        let fragments = self.dev_free_map.len();
        info!(
            target: "rfs::engine",
            "primary storage: located {len:.2} {unit}bytes ({fragments} fragment{}) usable \
             on the device",
            if fragments == 1 { "" } else { "s" }
        );

        Ok(())
    }
}

/// Threshold for a usable staging hole, in blocks: holes shorter than one
/// 1024th of the work (capped at 4096 pages) are not worth a mapping, and
/// anything below one page cannot be mapped at all.
fn hole_threshold(work_count: u64, page_blocks: u64) -> u64 {
    (work_count >> 10)
        .min(page_blocks << 12)
        .max(page_blocks.max(1))
}

/// Trim `extent` to page alignment on both ends and apply the length
/// threshold. Returns the surviving extent, if any.
fn filter_candidate(extent: Extent, work_count: u64, page_blocks: u64) -> Option<Extent> {
    let threshold = hole_threshold(work_count, page_blocks);
    if extent.length < threshold {
        return None;
    }
    if page_blocks <= 1 {
        return Some(extent);
    }
    let physical = align_up(extent.physical, page_blocks)?;
    let end = align_down(extent.end_physical(), page_blocks)?;
    if end <= physical {
        return None;
    }
    let length = end - physical;
    if length < threshold {
        return None;
    }
    Some(Extent::new(
        physical,
        extent.logical + (physical - extent.physical),
        length,
        extent.user_data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_caps_at_4096_pages_and_floors_at_one_page() {
        // Small workload, page == block: floor of one page.
        assert_eq!(hole_threshold(100, 1), 1);
        // Large workload: the work/1024 term, capped by 4096 pages.
        assert_eq!(hole_threshold(1 << 20, 1), 1024);
        assert_eq!(hole_threshold(1 << 30, 1), 4096);
        // Page smaller than block: floor of one block.
        assert_eq!(hole_threshold(0, 0), 1);
    }

    #[test]
    fn candidate_filter_keeps_only_large_holes() {
        // Work of 2^20 blocks, page == block: threshold is 1024 blocks.
        let work = 1_u64 << 20;
        assert!(filter_candidate(Extent::new(0, 0, 1, 0), work, 1).is_none());
        assert!(filter_candidate(Extent::new(8, 8, 2, 0), work, 1).is_none());
        let kept = filter_candidate(Extent::new(64, 64, 1024, 0), work, 1).expect("kept");
        assert_eq!(kept.length, 1024);
    }

    #[test]
    fn candidate_filter_trims_to_page_alignment() {
        // 4-block pages: [3, 21) trims to [4, 20).
        let kept = filter_candidate(Extent::new(3, 3, 18, 0), 0, 4).expect("kept");
        assert_eq!((kept.physical, kept.logical, kept.length), (4, 4, 16));

        // Trimming can consume the whole hole.
        assert!(filter_candidate(Extent::new(5, 5, 6, 0), 0, 4).is_none());
    }
}
