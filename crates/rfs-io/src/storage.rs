//! The staging window: PRIMARY device extents and the SECONDARY scratch
//! file presented as one contiguous byte range.
//!
//! Each extent is its own read-write file mapping; a segment table keyed by
//! window offset stitches them into a flat window, and every extent's
//! window offset is stored back into its `user_data`. Offsets must add up
//! to the full window length; a mismatch is a fatal internal error.

use memmap2::{MmapMut, MmapOptions};
use rfs_error::{RemapError, Result};
use rfs_extent::ExtentList;
use rfs_types::u64_to_usize;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::{debug, trace, warn};

struct Segment {
    map: MmapMut,
    window_offset: u64,
    length: u64,
}

/// Contiguous virtual staging window over device and scratch-file mappings.
pub struct StorageWindow {
    segments: Vec<Segment>,
    total_len: u64,
}

impl std::fmt::Debug for StorageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWindow")
            .field("segments", &self.segments.len())
            .field("total_len", &self.total_len)
            .finish()
    }
}

impl StorageWindow {
    /// Map every PRIMARY extent of the device, then `secondary_len` bytes of
    /// the scratch file, assigning window offsets in order. Each primary
    /// extent's offset is written into its `user_data`.
    pub fn build(
        device: &File,
        primary: &mut ExtentList,
        secondary: Option<&File>,
        secondary_len: u64,
    ) -> Result<Self> {
        let expected = primary
            .iter()
            .map(|e| e.length)
            .try_fold(0_u64, |acc, len| acc.checked_add(len))
            .and_then(|sum| sum.checked_add(secondary_len))
            .ok_or_else(|| {
                RemapError::Overflow("staging window length overflows u64".into())
            })?;
        u64_to_usize(expected, "staging window length")?;

        let mut segments = Vec::with_capacity(primary.len() + 1);
        let mut offset = 0_u64;

        for (index, extent) in primary.iter_mut().enumerate() {
            let length = extent.length;
            let mut map = map_file_range(device, extent.physical, length)?;
            if let Err(err) = map.lock() {
                warn!(
                    target: "rfs::io::storage",
                    extent = index,
                    error = %err,
                    "cannot pin primary storage extent in RAM, continuing"
                );
            }
            trace!(
                target: "rfs::io::storage",
                extent = index,
                device_offset = extent.physical,
                window_offset = offset,
                length,
                "mapped primary storage extent"
            );
            extent.user_data = offset;
            segments.push(Segment {
                map,
                window_offset: offset,
                length,
            });
            offset += length;
        }

        if secondary_len != 0 {
            let file = secondary.ok_or_else(|| {
                RemapError::Internal("secondary storage file missing".into())
            })?;
            let mut map = map_file_range(file, 0, secondary_len)?;
            if let Err(err) = map.lock() {
                warn!(
                    target: "rfs::io::storage",
                    error = %err,
                    "cannot pin secondary storage in RAM, continuing"
                );
            }
            segments.push(Segment {
                map,
                window_offset: offset,
                length: secondary_len,
            });
            offset += secondary_len;
        }

        if offset != expected {
            return Err(RemapError::Internal(format!(
                "mapped storage extents cover {offset} bytes instead of expected {expected}"
            )));
        }

        debug!(
            target: "rfs::io::storage",
            segments = segments.len(),
            total_len = offset,
            "staging window mapped"
        );
        Ok(Self {
            segments,
            total_len: offset,
        })
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Run `f` over the mutable slices covering `[offset, offset+length)`,
    /// passing the byte count already consumed.
    fn for_each_mut(
        &mut self,
        offset: u64,
        length: u64,
        mut f: impl FnMut(&mut [u8], u64) -> Result<()>,
    ) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.total_len)
            .ok_or_else(|| {
                RemapError::Internal(format!(
                    "window range [{offset}, +{length}) outside staging window of {} bytes",
                    self.total_len
                ))
            })?;

        let start = self
            .segments
            .partition_point(|s| s.window_offset + s.length <= offset);
        let mut consumed = 0_u64;
        for segment in &mut self.segments[start..] {
            if segment.window_offset >= end {
                break;
            }
            let seg_start = offset.max(segment.window_offset) - segment.window_offset;
            let seg_end = end.min(segment.window_offset + segment.length) - segment.window_offset;
            let from = u64_to_usize(seg_start, "window segment offset")?;
            let to = u64_to_usize(seg_end, "window segment offset")?;
            let chunk = to - from;
            f(&mut segment.map[from..to], consumed)?;
            consumed += chunk as u64;
        }
        debug_assert_eq!(consumed, length);
        Ok(())
    }

    /// Fill `[window_offset, +length)` from `file` at `file_offset`.
    pub fn read_from_file(
        &mut self,
        file: &File,
        file_offset: u64,
        window_offset: u64,
        length: u64,
    ) -> Result<()> {
        self.for_each_mut(window_offset, length, |slice, consumed| {
            file.read_exact_at(slice, file_offset + consumed)?;
            Ok(())
        })
    }

    /// Write `[window_offset, +length)` to `file` at `file_offset`.
    pub fn write_to_file(
        &mut self,
        file: &File,
        file_offset: u64,
        window_offset: u64,
        length: u64,
    ) -> Result<()> {
        self.for_each_mut(window_offset, length, |slice, consumed| {
            file.write_all_at(slice, file_offset + consumed)?;
            Ok(())
        })
    }

    /// Copy out of the window into a caller buffer.
    pub fn read_into(&mut self, window_offset: u64, out: &mut [u8]) -> Result<()> {
        self.for_each_mut(window_offset, out.len() as u64, |slice, consumed| {
            let at = u64_to_usize(consumed, "window copy offset")?;
            out[at..at + slice.len()].copy_from_slice(slice);
            Ok(())
        })
    }

    /// Copy a caller buffer into the window.
    pub fn write_from(&mut self, window_offset: u64, data: &[u8]) -> Result<()> {
        self.for_each_mut(window_offset, data.len() as u64, |slice, consumed| {
            let at = u64_to_usize(consumed, "window copy offset")?;
            slice.copy_from_slice(&data[at..at + slice.len()]);
            Ok(())
        })
    }

    /// Zero `[offset, offset+length)`.
    pub fn zero_range(&mut self, offset: u64, length: u64) -> Result<()> {
        self.for_each_mut(offset, length, |slice, _| {
            slice.fill(0);
            Ok(())
        })
    }

    /// msync every segment. Failures are logged at warning level and do not
    /// mask an otherwise successful flush.
    pub fn flush(&self) {
        for (index, segment) in self.segments.iter().enumerate() {
            if let Err(err) = segment.map.flush() {
                warn!(
                    target: "rfs::io::storage",
                    segment = index,
                    error = %err,
                    "storage segment flush failed"
                );
            }
        }
    }
}

fn map_file_range(file: &File, offset: u64, length: u64) -> Result<MmapMut> {
    let len = u64_to_usize(length, "storage mapping length")?;
    // SAFETY: the mapping stays private to this process and is dropped
    // before the backing descriptor; remapfs is the only writer of the
    // device and scratch file while the window exists.
    unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file) }.map_err(|err| {
        RemapError::Io(err)
    })
}

/// Fully committed anonymous RAM buffer for DEV2DEV copies.
///
/// The zero fill after mapping forces the kernel to actually back every
/// page, so later writes cannot fail from overcommit.
pub struct RamBuffer {
    map: MmapMut,
}

impl std::fmt::Debug for RamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamBuffer")
            .field("len", &self.map.len())
            .finish()
    }
}

impl RamBuffer {
    pub fn new(length: u64) -> Result<Self> {
        let len = u64_to_usize(length, "RAM buffer length")?;
        let mut map = MmapMut::map_anon(len)
            .map_err(|err| RemapError::NoMemory(format!("RAM buffer of {length} bytes: {err}")))?;
        map.fill(0);
        Ok(Self { map })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_extent::{DEFAULT_USER_DATA, Extent};
    use std::io::Write;

    fn temp_file_of(len: usize, fill: u8) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backing.bin");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("create backing file");
        file.write_all(&vec![fill; len]).expect("fill");
        (dir, file)
    }

    #[test]
    fn window_offsets_are_assigned_in_order() {
        let (_dir, device) = temp_file_of(64 * 1024, 0xAA);
        let mut primary = ExtentList::new();
        primary.append(Extent::new(0, 0, 8192, DEFAULT_USER_DATA));
        primary.append(Extent::new(32768, 32768, 4096, DEFAULT_USER_DATA));

        let window = StorageWindow::build(&device, &mut primary, None, 0).expect("window");
        assert_eq!(window.total_len(), 12288);
        assert_eq!(primary[0].user_data, 0);
        assert_eq!(primary[1].user_data, 8192);
    }

    #[test]
    fn window_spans_primary_and_secondary() {
        let (_dir, device) = temp_file_of(16 * 1024, 0x11);
        let (_dir2, scratch) = temp_file_of(8 * 1024, 0x22);
        let mut primary = ExtentList::new();
        primary.append(Extent::new(4096, 4096, 4096, DEFAULT_USER_DATA));

        let mut window =
            StorageWindow::build(&device, &mut primary, Some(&scratch), 8192).expect("window");
        assert_eq!(window.total_len(), 4096 + 8192);

        // A read crossing the primary/secondary seam sees both backings.
        let mut out = vec![0_u8; 8192];
        window.read_into(0, &mut out).expect("read");
        assert!(out[..4096].iter().all(|&b| b == 0x11));
        assert!(out[4096..].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn writes_reach_the_backing_file() {
        let (_dir, device) = temp_file_of(16 * 1024, 0);
        let mut primary = ExtentList::new();
        primary.append(Extent::new(8192, 8192, 4096, DEFAULT_USER_DATA));

        let mut window = StorageWindow::build(&device, &mut primary, None, 0).expect("window");
        window.write_from(0, &[0x5A; 4096]).expect("write");
        window.flush();

        let mut back = vec![0_u8; 4096];
        device.read_exact_at(&mut back, 8192).expect("readback");
        assert!(back.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn zero_range_clears_across_segments() {
        let (_dir, device) = temp_file_of(16 * 1024, 0xFF);
        let mut primary = ExtentList::new();
        primary.append(Extent::new(0, 0, 4096, DEFAULT_USER_DATA));
        primary.append(Extent::new(8192, 8192, 4096, DEFAULT_USER_DATA));

        let mut window = StorageWindow::build(&device, &mut primary, None, 0).expect("window");
        window.zero_range(2048, 4096).expect("zero");

        let mut out = vec![0_u8; 8192];
        window.read_into(0, &mut out).expect("read");
        assert!(out[..2048].iter().all(|&b| b == 0xFF));
        assert!(out[2048..6144].iter().all(|&b| b == 0));
        assert!(out[6144..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn out_of_window_range_is_internal_error() {
        let (_dir, device) = temp_file_of(16 * 1024, 0);
        let mut primary = ExtentList::new();
        primary.append(Extent::new(0, 0, 4096, DEFAULT_USER_DATA));

        let mut window = StorageWindow::build(&device, &mut primary, None, 0).expect("window");
        let err = window.zero_range(4000, 200).unwrap_err();
        assert!(matches!(err, RemapError::Internal(_)));
    }

    #[test]
    fn ram_buffer_is_zeroed_and_writable() {
        let mut buffer = RamBuffer::new(64 * 1024).expect("buffer");
        assert_eq!(buffer.len(), 64 * 1024);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
        buffer.as_mut_slice()[0] = 1;
        assert_eq!(buffer.as_slice()[0], 1);
    }
}
