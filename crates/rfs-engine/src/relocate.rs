//! Relocation: drain the shuffle plan through the three copy directions.
//!
//! Round-based. Every round, in order:
//!
//! 1. write back staged data whose destination no longer overlaps any
//!    pending source (`STORAGE2DEV`, logical order);
//! 2. move pending extents whose destination is already clear straight
//!    across the device (`DEV2DEV`), splitting an extent when only part
//!    of its destination is clear;
//! 3. if neither produced progress, stage pending extents into free
//!    window space (`DEV2STORAGE`, physical order), splitting to fit.
//!    Staging removes their source ranges from the pending set, which
//!    unblocks the destinations of their cycle predecessors.
//!
//! Every round strictly shrinks pending or staged work, so the loop
//! terminates; a round with no progress and no free window space would
//! contradict the plan invariants and aborts as an internal error.

use crate::Work;
use rfs_error::{RemapError, Result};
use rfs_extent::{DEFAULT_USER_DATA, Extent, ExtentList, ExtentMap};
use rfs_io::{CopyDir, ZeroTarget};
use rfs_types::pretty_size;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A pending chunk parked in the staging window.
#[derive(Debug, Clone, Copy)]
struct StagedChunk {
    /// Destination, in blocks.
    dest: u64,
    /// Length, in blocks.
    length: u64,
    /// Position in the staging window, in bytes.
    window_offset: u64,
}

/// Free byte ranges of the staging window. Offsets and lengths stay
/// multiples of the block size because every allocation is.
#[derive(Debug, Default)]
struct WindowSpace {
    free: BTreeMap<u64, u64>,
}

impl WindowSpace {
    fn new(total_len: u64) -> Self {
        let mut free = BTreeMap::new();
        if total_len > 0 {
            free.insert(0, total_len);
        }
        Self { free }
    }

    /// Carve up to `want` bytes out of the first free range.
    fn alloc_up_to(&mut self, want: u64) -> Option<(u64, u64)> {
        let (&offset, &length) = self.free.iter().next()?;
        let take = want.min(length);
        self.free.remove(&offset);
        if take < length {
            self.free.insert(offset + take, length - take);
        }
        Some((offset, take))
    }

    /// Return `[offset, offset+length)`, merging with adjacent free ranges.
    fn release(&mut self, offset: u64, length: u64) {
        let mut offset = offset;
        let mut length = length;
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                length += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + length)) {
            self.free.remove(&(offset + length));
            length += next_len;
        }
        self.free.insert(offset, length);
    }
}

/// The parts of `[start, start+length)` not covered by any entry of
/// `map`, skipping the entry keyed at `exclude` (if any), in order.
fn clear_parts(
    map: &ExtentMap,
    start: u64,
    length: u64,
    exclude: Option<u64>,
) -> Vec<(u64, u64)> {
    let end = start + length;
    let mut parts = Vec::new();
    let mut cursor = start;
    for blocker in map.overlapping_range(start, length) {
        if Some(blocker.physical) == exclude {
            continue;
        }
        let blocked_start = blocker.physical.max(start);
        if blocked_start > cursor {
            parts.push((cursor, blocked_start - cursor));
        }
        cursor = cursor.max(blocker.end_physical().min(end));
    }
    if cursor < end {
        parts.push((cursor, end - cursor));
    }
    parts
}

impl Work<'_> {
    /// Execute the shuffle plan. `dev_map` is drained; the staging window
    /// is zeroed and flushed at the end.
    pub(crate) fn relocate(&mut self) -> Result<()> {
        let log2 = self.io.effective_block_size_log2();
        let mut space = WindowSpace::new(self.storage_len);
        let mut staged: Vec<StagedChunk> = Vec::new();
        let mut moved_blocks = 0_u64;

        let (len, unit) = pretty_size(self.work_count << log2);
        info!(
            target: "rfs::engine",
            "relocation started: {len:.2} {unit}bytes to move"
        );

        let mut round = 0_u64;
        while !self.dev_map.is_empty() || !staged.is_empty() {
            self.cancel.checkpoint()?;
            round += 1;
            let mut progressed = false;

            // 1) Staged chunks whose destination has cleared.
            let mut requests = ExtentList::new();
            let mut blocked: Vec<StagedChunk> = Vec::new();
            for chunk in staged.drain(..) {
                let clear = clear_parts(&self.dev_map, chunk.dest, chunk.length, None);
                if clear.is_empty() {
                    blocked.push(chunk);
                    continue;
                }
                let mut cursor = chunk.dest;
                for &(part_start, part_len) in &clear {
                    if part_start > cursor {
                        blocked.push(StagedChunk {
                            dest: cursor,
                            length: part_start - cursor,
                            window_offset: chunk.window_offset + ((cursor - chunk.dest) << log2),
                        });
                    }
                    requests.append(Extent::new(
                        chunk.window_offset + ((part_start - chunk.dest) << log2),
                        part_start << log2,
                        part_len << log2,
                        DEFAULT_USER_DATA,
                    ));
                    cursor = part_start + part_len;
                }
                if cursor < chunk.dest + chunk.length {
                    blocked.push(StagedChunk {
                        dest: cursor,
                        length: chunk.dest + chunk.length - cursor,
                        window_offset: chunk.window_offset + ((cursor - chunk.dest) << log2),
                    });
                }
            }
            staged = blocked;
            if !requests.is_empty() {
                requests.sort_by_logical();
                self.io.flush_copy_bytes(CopyDir::Storage2Dev, &mut requests)?;
                for request in &requests {
                    space.release(request.physical, request.length);
                    moved_blocks += request.length >> log2;
                }
                progressed = true;
                self.cancel.checkpoint()?;
            }

            // 2) Pending extents with a clear destination: straight moves.
            // Selection runs against the full pending set, so no batch
            // member's destination can overlap another member's source.
            let mut direct = ExtentList::new();
            let mut consumed: Vec<(u64, u64)> = Vec::new();
            let pending: Vec<Extent> = self.dev_map.iter().collect();
            for extent in pending {
                let dest_overlaps_own_source = extent.physical < extent.end_logical()
                    && extent.logical < extent.end_physical();
                if dest_overlaps_own_source {
                    // Whole-extent move only; safe when the batch copy
                    // reads it fully before writing (fits the RAM buffer)
                    // or when the chunked copy walks away from the source.
                    let safe = (extent.length << log2) <= self.buffer_len
                        || extent.logical < extent.physical;
                    if safe
                        && !self.dev_map.overlaps_range_excluding(
                            extent.logical,
                            extent.length,
                            extent.physical,
                        )
                    {
                        direct.append(Extent::new(
                            extent.physical << log2,
                            extent.logical << log2,
                            extent.length << log2,
                            DEFAULT_USER_DATA,
                        ));
                        consumed.push((extent.physical, extent.length));
                    }
                } else {
                    for (part_start, part_len) in clear_parts(
                        &self.dev_map,
                        extent.logical,
                        extent.length,
                        Some(extent.physical),
                    ) {
                        let src = extent.physical + (part_start - extent.logical);
                        direct.append(Extent::new(
                            src << log2,
                            part_start << log2,
                            part_len << log2,
                            DEFAULT_USER_DATA,
                        ));
                        consumed.push((src, part_len));
                    }
                }
            }
            if !direct.is_empty() {
                for &(src, len) in &consumed {
                    self.dev_map.remove_range(src, len);
                    moved_blocks += len;
                }
                direct.sort_by_physical();
                self.io.flush_copy_bytes(CopyDir::Dev2Dev, &mut direct)?;
                progressed = true;
                self.cancel.checkpoint()?;
            }

            // 3) Stuck: park pending extents in the window to break cycles.
            if !progressed {
                let mut stage_requests = ExtentList::new();
                let mut newly_staged: Vec<StagedChunk> = Vec::new();
                let pending: Vec<Extent> = self.dev_map.iter().collect();
                'fill: for extent in pending {
                    let mut src = extent.physical;
                    let mut dest = extent.logical;
                    let mut remaining = extent.length;
                    while remaining > 0 {
                        let Some((window_offset, taken_bytes)) =
                            space.alloc_up_to(remaining << log2)
                        else {
                            break 'fill;
                        };
                        let taken = taken_bytes >> log2;
                        stage_requests.append(Extent::new(
                            src << log2,
                            window_offset,
                            taken_bytes,
                            DEFAULT_USER_DATA,
                        ));
                        newly_staged.push(StagedChunk {
                            dest,
                            length: taken,
                            window_offset,
                        });
                        src += taken;
                        dest += taken;
                        remaining -= taken;
                    }
                }
                if newly_staged.is_empty() {
                    return Err(RemapError::Internal(
                        "relocation stalled: staging window exhausted with no writable \
                         destination"
                            .into(),
                    ));
                }
                for request in &stage_requests {
                    self.dev_map
                        .remove_range(request.physical >> log2, request.length >> log2);
                }
                stage_requests.sort_by_physical();
                self.io
                    .flush_copy_bytes(CopyDir::Dev2Storage, &mut stage_requests)?;
                staged.extend(newly_staged);
            }

            debug!(
                target: "rfs::engine",
                round,
                pending = self.dev_map.len(),
                staged = staged.len(),
                moved_blocks,
                "relocation round complete"
            );
        }

        // Do not leave relocated payload behind in reclaimed free space.
        if self.storage_len > 0 {
            self.io.zero_bytes(ZeroTarget::Storage, 0, self.storage_len)?;
        }
        self.io.flush_bytes()?;

        let (len, unit) = pretty_size(moved_blocks << log2);
        info!(
            target: "rfs::engine",
            rounds = round,
            "relocation completed: {len:.2} {unit}bytes moved"
        );
        Ok(())
    }
}
