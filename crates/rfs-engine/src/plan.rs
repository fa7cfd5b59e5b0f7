//! Storage planning: choose the staging window size, split it between
//! PRIMARY (device free extents) and SECONDARY (scratch file), and hand
//! the chosen extents to the I/O layer.

use crate::{RunOptions, Work, show};
use rfs_error::{RemapError, Result};
use rfs_extent::{Extent, ExtentList};
use rfs_types::{align_down, align_up, ceil_div, pretty_size};
use tracing::{error, info, warn};

const MIB: u64 = 1024 * 1024;

impl Work<'_> {
    /// Size the staging window, fill the I/O layer's primary storage list
    /// and materialize the window plus the RAM buffer.
    pub(crate) fn create_storage(&mut self, options: &RunOptions) -> Result<()> {
        let log2 = self.io.effective_block_size_log2();
        let block_size = 1_u64 << log2;
        let page_size = rfs_io::system_page_size();
        let free_ram = rfs_io::system_free_ram();

        let mut primary_len = self.dev_free_map.total_count() << log2;
        let requested = self.io.job_storage_size();
        let exact = self.io.job_storage_size_exact();
        let mut total_len = requested;

        if exact && requested == 0 {
            error!(
                target: "rfs::engine",
                "resumed job storage size is 0 bytes, impossible"
            );
            return Err(RemapError::Config("resumed job storage size is 0 bytes".into()));
        }

        if total_len != 0 {
            // Honour the request, but point out likely trouble.
            let (ram, ram_unit) = pretty_size(free_ram);
            if free_ram == 0 {
                warn!(
                    target: "rfs::engine",
                    "cannot detect free RAM, no idea if the requested staging window fits; \
                     continuing, but memory exhaustion is possible"
                );
            } else if total_len > free_ram / 3 * 2 {
                let (req, req_unit) = pretty_size(total_len);
                warn!(
                    target: "rfs::engine",
                    "requested {req:.2} {req_unit}bytes for the staging window, but only \
                     {ram:.2} {ram_unit}bytes RAM are free; honoring the request, but \
                     memory exhaustion is possible"
                );
            }
        } else {
            // Auto-size: a third of free RAM, a tenth of the work, whichever
            // is smaller, rounded up to 1 MiB.
            let free_ram_third = if free_ram != 0 {
                (free_ram + 2) / 3
            } else {
                let assumed = if usize::BITS <= 32 { 16 * MIB } else { 256 * MIB };
                let (ram, ram_unit) = pretty_size(assumed * 3);
                warn!(
                    target: "rfs::engine",
                    "cannot detect free RAM, assuming at least {ram:.2} {ram_unit}bytes are \
                     free; expect trouble if not"
                );
                assumed
            };
            let work_tenth = ceil_div(self.work_count << log2, 10);
            total_len = free_ram_third.min(work_tenth);
            total_len = align_up(total_len, MIB).ok_or_else(overflow)?;
        }

        total_len = align_up(total_len, page_size).ok_or_else(overflow)?;
        if exact && total_len != requested {
            return Err(unusable(requested, page_size, "a smaller RAM page size"));
        }
        total_len = align_up(total_len, block_size).ok_or_else(overflow)?;
        if exact && total_len != requested {
            return Err(unusable(
                requested,
                block_size,
                "a smaller file-system block size",
            ));
        }

        let alignment = block_size.max(page_size);
        primary_len = align_down(primary_len, alignment).unwrap_or(0);
        if options.primary_storage_size != 0 {
            primary_len =
                primary_len.min(align_down(options.primary_storage_size, alignment).unwrap_or(0));
        }

        // Clamp to what file offsets can address…
        let off_max = align_down(u64::MAX >> 1, alignment).unwrap_or(0);
        primary_len = primary_len.min(off_max);
        total_len = total_len.min(off_max);
        if exact && total_len != requested {
            return Err(unusable(requested, off_max, "a larger maximum file size"));
        }
        // …and to a quarter of addressable memory (all of it when resuming).
        let addr_max = usize::MAX as u64;
        let mem_max = align_down(
            if exact { addr_max } else { addr_max / 4 + 1 },
            alignment,
        )
        .unwrap_or(0);
        primary_len = primary_len.min(mem_max);
        total_len = total_len.min(mem_max);
        if exact && total_len != requested {
            return Err(unusable(requested, mem_max, "more addressable memory"));
        }

        if total_len == 0 {
            total_len = alignment;
            let (len, unit) = pretty_size(total_len);
            warn!(
                target: "rfs::engine",
                "staging window would be 0 bytes, increasing to {len:.2} {unit}bytes"
            );
        }

        if primary_len > total_len {
            primary_len = total_len;
        }
        let secondary_len = total_len - primary_len;

        self.io.set_job_storage_size(total_len)?;
        self.fill_primary_storage(primary_len);

        let (len, unit) = pretty_size(primary_len);
        let fragments = self.io.primary_storage().len();
        info!(
            target: "rfs::engine",
            "primary storage: actually using {len:.2} {unit}bytes ({fragments} \
             fragment{}) of device free space",
            if fragments == 1 { "" } else { "s" }
        );

        let mut buffer_len = if options.mem_buffer_size != 0 {
            options.mem_buffer_size
        } else {
            total_len
        };
        buffer_len = align_up(buffer_len, block_size)
            .unwrap_or(total_len)
            .clamp(block_size, mem_max.max(block_size));

        self.storage_len = total_len;
        self.buffer_len = buffer_len;
        self.secondary_len = secondary_len;
        self.io.create_storage(secondary_len, buffer_len)
    }

    /// Copy the chosen candidates into the I/O layer's primary storage
    /// list (bytes). When more candidate space is available than will be
    /// used, drop the smallest extents (the last one may be shrunk
    /// instead), then re-sort by physical.
    fn fill_primary_storage(&mut self, primary_len: u64) {
        let log2 = self.io.effective_block_size_log2();
        let available = self.dev_free_map.total_count() << log2;

        let mut primary = ExtentList::new();
        for extent in self.dev_free_map.iter() {
            primary.append(Extent::new(
                extent.physical << log2,
                extent.physical << log2,
                extent.length << log2,
                extent.user_data,
            ));
        }

        if available > primary_len {
            shrink_to(&mut primary, available - primary_len);
            self.dev_free_map.clear();
            self.dev_free_map.append_shifted(&primary, log2);
        }
        self.dev_free_map.set_total_count(primary_len >> log2);
        show("primary storage (actually used)", log2, &self.dev_free_map);

        *self.io.primary_storage_mut() = primary;
    }
}

/// Drop the smallest extents until `extra` bytes are gone; the last
/// extent considered may be truncated instead. Leaves the list sorted by
/// physical.
fn shrink_to(list: &mut ExtentList, mut extra: u64) {
    list.sort_by_reverse_length();
    while extra != 0 {
        let Some(back) = list.back_mut() else { break };
        if back.length <= extra {
            extra -= back.length;
            list.pop_back();
        } else {
            back.length -= extra;
            extra = 0;
        }
    }
    list.sort_by_physical();
}

fn overflow() -> RemapError {
    RemapError::Overflow("staging window size overflows".into())
}

fn unusable(requested: u64, limit: u64, reason: &str) -> RemapError {
    error!(
        target: "rfs::engine",
        "cannot reuse job storage size {requested} bytes on this system (limit {limit}): \
         the original job was probably created on a platform with {reason}"
    );
    RemapError::StorageSizeMismatch {
        requested,
        reason: format!("this platform would need {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_extent::DEFAULT_USER_DATA;

    fn list_of(extents: &[(u64, u64)]) -> ExtentList {
        extents
            .iter()
            .map(|&(physical, length)| Extent::new(physical, physical, length, DEFAULT_USER_DATA))
            .collect()
    }

    #[test]
    fn shrink_keeps_the_largest_extents() {
        // Available 1 MiB in [256K, 512K, 256K]; requested 512 KiB.
        let mut list = list_of(&[(0, 256 << 10), (1 << 20, 512 << 10), (4 << 20, 256 << 10)]);
        shrink_to(&mut list, 512 << 10);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].physical, 1 << 20);
        assert_eq!(list[0].length, 512 << 10);
    }

    #[test]
    fn shrink_truncates_the_boundary_extent() {
        let mut list = list_of(&[(0, 300), (1000, 500)]);
        shrink_to(&mut list, 400);
        // The 300-byte extent is dropped, the 500-byte one loses 100.
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].physical, 1000);
        assert_eq!(list[0].length, 400);
    }

    #[test]
    fn shrink_result_is_sorted_by_physical() {
        let mut list = list_of(&[(5000, 100), (0, 100), (9000, 400)]);
        shrink_to(&mut list, 150);
        let physical: Vec<u64> = list.iter().map(|e| e.physical).collect();
        assert!(physical.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(list.length_sum(), 450);
    }
}
