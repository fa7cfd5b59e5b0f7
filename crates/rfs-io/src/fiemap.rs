//! LOOP-FILE / ZERO-FILE extent probe via the FIEMAP ioctl.
//!
//! Yields `(physical, logical, length)` triples in bytes, logical order,
//! and ORs every boundary into the caller's block-size bitmask (the lowest
//! set bit of the accumulated mask is the effective block size).

#![allow(clippy::struct_field_names)]

use rfs_error::{RemapError, Result};
use rfs_extent::{DEFAULT_USER_DATA, Extent, ExtentList};
use std::fs::File;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::unix::io::AsRawFd;

    const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

    const FIEMAP_FLAG_SYNC: u32 = 0x0001;

    const FIEMAP_EXTENT_LAST: u32 = 0x0001;
    const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0002;
    const FIEMAP_EXTENT_DELALLOC: u32 = 0x0004;
    const FIEMAP_EXTENT_ENCODED: u32 = 0x0008;
    const FIEMAP_EXTENT_DATA_ENCRYPTED: u32 = 0x0080;
    const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0200;
    const FIEMAP_EXTENT_DATA_TAIL: u32 = 0x0400;

    /// Extent flags that make in-place remapping impossible: the physical
    /// address is either unknown, not yet assigned, or not a plain block
    /// range.
    const UNSUPPORTED: u32 = FIEMAP_EXTENT_UNKNOWN
        | FIEMAP_EXTENT_DELALLOC
        | FIEMAP_EXTENT_ENCODED
        | FIEMAP_EXTENT_DATA_ENCRYPTED
        | FIEMAP_EXTENT_DATA_INLINE
        | FIEMAP_EXTENT_DATA_TAIL;

    const BATCH: usize = 256;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct FiemapExtent {
        fe_logical: u64,
        fe_physical: u64,
        fe_length: u64,
        fe_reserved64: [u64; 2],
        fe_flags: u32,
        fe_reserved: [u32; 3],
    }

    impl FiemapExtent {
        const ZERO: Self = Self {
            fe_logical: 0,
            fe_physical: 0,
            fe_length: 0,
            fe_reserved64: [0; 2],
            fe_flags: 0,
            fe_reserved: [0; 3],
        };
    }

    #[repr(C)]
    struct FiemapRequest {
        fm_start: u64,
        fm_length: u64,
        fm_flags: u32,
        fm_mapped_extents: u32,
        fm_extent_count: u32,
        fm_reserved: u32,
        fm_extents: [FiemapExtent; BATCH],
    }

    pub(super) fn read_file_extents(
        file: &File,
        label: &str,
        out: &mut ExtentList,
        block_size_bitmask: &mut u64,
    ) -> Result<()> {
        let fd = file.as_raw_fd();
        let mut start = 0_u64;

        loop {
            let mut request = FiemapRequest {
                fm_start: start,
                fm_length: u64::MAX - start,
                fm_flags: FIEMAP_FLAG_SYNC,
                fm_mapped_extents: 0,
                fm_extent_count: BATCH as u32,
                fm_reserved: 0,
                fm_extents: [FiemapExtent::ZERO; BATCH],
            };

            // SAFETY: request is a properly initialized, repr(C) FIEMAP
            // buffer owned by this frame; the kernel writes only into it.
            let rc = unsafe {
                libc::ioctl(fd, FS_IOC_FIEMAP, std::ptr::addr_of_mut!(request))
            };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                return Err(RemapError::Config(format!(
                    "FIEMAP ioctl failed on {label}: {err}"
                )));
            }

            let mapped = request.fm_mapped_extents as usize;
            if mapped == 0 {
                break;
            }

            let mut saw_last = false;
            for extent in &request.fm_extents[..mapped.min(BATCH)] {
                if extent.fe_flags & UNSUPPORTED != 0 {
                    return Err(RemapError::Config(format!(
                        "{label} has an extent at logical {} that cannot be remapped \
                         (flags {:#x}); sync the file system and retry",
                        extent.fe_logical, extent.fe_flags
                    )));
                }
                out.append(Extent::new(
                    extent.fe_physical,
                    extent.fe_logical,
                    extent.fe_length,
                    DEFAULT_USER_DATA,
                ));
                *block_size_bitmask |=
                    extent.fe_physical | extent.fe_logical | extent.fe_length;
                start = extent.fe_logical + extent.fe_length;
                if extent.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                    saw_last = true;
                }
            }
            if saw_last {
                break;
            }
        }

        out.sort_by_logical();
        Ok(())
    }
}

/// Probe `file`'s extents, appending them to `out` in logical order.
#[cfg(target_os = "linux")]
pub fn read_file_extents(
    file: &File,
    label: &str,
    out: &mut ExtentList,
    block_size_bitmask: &mut u64,
) -> Result<()> {
    linux::read_file_extents(file, label, out, block_size_bitmask)
}

#[cfg(not(target_os = "linux"))]
pub fn read_file_extents(
    _file: &File,
    label: &str,
    _out: &mut ExtentList,
    _block_size_bitmask: &mut u64,
) -> Result<()> {
    Err(RemapError::Config(format!(
        "cannot probe {label}: extent mapping is only supported on Linux"
    )))
}
