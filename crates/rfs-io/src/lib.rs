//! I/O substrate for remapfs.
//!
//! The engine talks to the device through the [`DeviceIo`] trait: device
//! geometry, the staging window, the three copy directions, zeroing and
//! flushing. [`PosixIo`] is the concrete implementation over three file
//! descriptors (DEVICE read-write, LOOP-FILE and ZERO-FILE read-only), a
//! memory-mapped staging window and an anonymous RAM buffer.
//!
//! This is the only crate in the workspace with `unsafe` code: the two
//! blocks that construct file-backed memory maps and the FIEMAP/sysconf
//! syscalls have no safe equivalent.

mod fiemap;
mod job;
mod posix;
mod storage;

pub use job::{JobDir, JobState};
pub use posix::{IoStats, PosixIo, PosixIoConfig};
pub use storage::{RamBuffer, StorageWindow};

use rfs_error::Result;
use rfs_extent::{Extent, ExtentList};

/// Copy direction for [`DeviceIo::flush_copy_bytes`].
///
/// Request extents are interpreted per direction, all offsets in bytes:
/// - `Dev2Storage`: `physical` = device offset, `logical` = window offset;
///   pre-sorted by physical.
/// - `Storage2Dev`: `physical` = window offset, `logical` = device offset;
///   pre-sorted by logical.
/// - `Dev2Dev`: `physical` = source device offset, `logical` = destination
///   device offset; pre-sorted by physical. `user_data` is scratch space
///   for the RAM-buffer offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    Dev2Storage,
    Storage2Dev,
    Dev2Dev,
}

/// Target of [`DeviceIo::zero_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroTarget {
    Device,
    Storage,
}

/// Where a UI-visible read comes from / write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEndpoint {
    Device,
    Storage,
}

/// Optional progress observer. Side-effect free with respect to the core.
pub trait UiView {
    fn show_io_read(&self, from: IoEndpoint, offset: u64, length: u64);
    fn show_io_write(&self, to: IoEndpoint, offset: u64, length: u64);
    fn show_io_flush(&self);
}

/// The I/O façade consumed by the transformation engine.
pub trait DeviceIo {
    /// Device length in bytes.
    fn dev_length(&self) -> u64;

    /// LOOP-FILE length in bytes.
    fn loop_file_length(&self) -> u64;

    /// log2 of the effective block size (largest power of two dividing
    /// every extent boundary and the device length).
    fn effective_block_size_log2(&self) -> u32;

    /// Record the effective block size once the driver has derived it from
    /// the extent probe's bitmask.
    fn set_effective_block_size_log2(&mut self, log2: u32);

    fn is_open(&self) -> bool;

    /// PRIMARY-STORAGE extents (device byte ranges doubling as staging).
    /// `user_data` of each holds its window offset once the window exists.
    fn primary_storage(&self) -> &ExtentList;
    fn primary_storage_mut(&mut self) -> &mut ExtentList;

    /// SECONDARY-STORAGE extent (the scratch file); zero length when the
    /// primary extents cover the whole window.
    fn secondary_storage(&self) -> Extent;

    /// Requested total staging size in bytes (0 = auto-size).
    fn job_storage_size(&self) -> u64;

    /// Persist the chosen staging size for a later resume.
    fn set_job_storage_size(&mut self, bytes: u64) -> Result<()>;

    /// Whether the requested size must be honoured exactly (resumed job).
    fn job_storage_size_exact(&self) -> bool;

    /// Materialize the staging window: primary extents mapped from the
    /// device, `secondary_len` bytes mapped from a fresh scratch file, plus
    /// the RAM buffer for DEV2DEV copies.
    fn create_storage(&mut self, secondary_len: u64, mem_buffer_size: u64) -> Result<()>;

    /// Release window, RAM buffer and scratch file. Idempotent.
    fn close_storage(&mut self) -> Result<()>;

    /// Execute a batch of copies; see [`CopyDir`] for request conventions.
    fn flush_copy_bytes(&mut self, dir: CopyDir, requests: &mut ExtentList) -> Result<()>;

    /// Force staged data and device writes to stable storage.
    fn flush_bytes(&mut self) -> Result<()>;

    /// Write zeros to the device or into the staging window.
    fn zero_bytes(&mut self, target: ZeroTarget, offset: u64, length: u64) -> Result<()>;

    /// Probe LOOP-FILE and ZERO-FILE extents (bytes, sorted by logical),
    /// OR-ing every boundary into `block_size_bitmask`.
    fn read_extents(
        &mut self,
        loop_out: &mut ExtentList,
        free_out: &mut ExtentList,
        block_size_bitmask: &mut u64,
    ) -> Result<()>;

    /// Unmount the device using the configured command.
    fn umount_dev(&mut self) -> Result<()>;

    /// Whether device writes are suppressed.
    fn simulate_run(&self) -> bool;

    fn ui(&self) -> Option<&dyn UiView>;
}

/// System page size in bytes; warns and assumes 4 KiB when undetectable.
#[must_use]
pub fn system_page_size() -> u64 {
    // sysconf is benign; the unsafe block is only the FFI call.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 {
        tracing::warn!(
            target: "rfs::io",
            "cannot detect system page size, assuming 4 KiB"
        );
        4096
    } else {
        raw as u64
    }
}

/// Free RAM in bytes, or 0 when it cannot be detected.
///
/// Reads `MemAvailable` from /proc/meminfo; other platforms report 0 and
/// let the planner fall back to its fixed assumption.
#[must_use]
pub fn system_free_ram() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(text) = std::fs::read_to_string("/proc/meminfo") {
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    let kib: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kib.saturating_mul(1024);
                }
            }
        }
    }
    0
}
