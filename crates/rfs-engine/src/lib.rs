#![forbid(unsafe_code)]
//! The transformation engine: analysis, storage planning and relocation.
//!
//! Given the LOOP-FILE extents (where the target layout wants each block)
//! and the ZERO-FILE extents (the source file system's free space), the
//! engine derives a shuffle plan, carves a bounded staging area out of
//! free space plus an on-disk scratch file, and drives the device I/O
//! until every block sits where the target layout expects it.

mod analyze;
mod plan;
mod relocate;

use rfs_error::{RemapError, Result};
use rfs_extent::{ExtentList, ExtentMap};
use rfs_io::DeviceIo;
use rfs_types::{CancelToken, lowest_set_bit};
use serde::Serialize;
use tracing::{debug, info, trace};

/// `user_data` tag: the extent carries LOOP-FILE payload.
pub const TAG_LOOP_FILE: u64 = 1;
/// `user_data` tag: the extent carries DEVICE metadata renumbered into a
/// loop hole.
pub const TAG_DEVICE: u64 = 2;

/// Tunables not derived from the device itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// RAM buffer for DEV2DEV copies, bytes (0 = match the staging size).
    pub mem_buffer_size: u64,
    /// Cap on the PRIMARY share of the staging window, bytes (0 = use all
    /// the free device extents the analysis found).
    pub primary_storage_size: u64,
}

/// What a run did, for the caller's report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub block_size: u64,
    pub work_blocks: u64,
    pub relocated_bytes: u64,
    pub storage_bytes: u64,
    pub secondary_storage_bytes: u64,
}

/// Analysis outcome: the shuffle plan and the staging candidates, in
/// blocks.
#[derive(Debug, Clone)]
pub struct PlanReport {
    /// Every entry lives at `physical`, must land at `logical`; tagged
    /// [`TAG_LOOP_FILE`] or [`TAG_DEVICE`].
    pub plan: ExtentList,
    pub work_blocks: u64,
    pub primary_candidates: ExtentList,
    pub block_size_log2: u32,
}

/// One full transformation: analysis, staging, relocation.
pub struct Work<'io> {
    io: &'io mut dyn DeviceIo,
    cancel: CancelToken,
    /// The shuffle plan: each entry lives at `physical`, belongs at
    /// `logical`, tagged [`TAG_LOOP_FILE`] or [`TAG_DEVICE`].
    dev_map: ExtentMap,
    /// PRIMARY-STORAGE candidates (free, invariant, aligned), in blocks.
    dev_free_map: ExtentMap,
    /// Blocks that must be physically moved.
    work_count: u64,
    /// Staging window length in bytes, once planned.
    storage_len: u64,
    /// RAM buffer length in bytes, once planned.
    buffer_len: u64,
    secondary_len: u64,
}

impl<'io> Work<'io> {
    /// Probe the extents through the I/O façade, derive the effective
    /// block size, then run the transformation.
    pub fn run_with_probe(
        io: &'io mut dyn DeviceIo,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<RunSummary> {
        if !io.is_open() {
            return Err(RemapError::NotOpen);
        }
        let mut loop_extents = ExtentList::new();
        let mut free_extents = ExtentList::new();
        let mut bitmask = io.dev_length();
        io.read_extents(&mut loop_extents, &mut free_extents, &mut bitmask)?;
        let block_size_log2 = lowest_set_bit(bitmask);
        io.set_effective_block_size_log2(block_size_log2);
        info!(
            target: "rfs::engine",
            block_size = 1_u64 << block_size_log2,
            "effective block size derived from extent boundaries"
        );
        Self::run(&mut loop_extents, &mut free_extents, io, options, cancel)
    }

    /// Run the transformation on already-probed extent lists (bytes,
    /// sorted by logical). The lists are consumed: their contents are
    /// undefined afterwards.
    pub fn run(
        loop_extents: &mut ExtentList,
        free_extents: &mut ExtentList,
        io: &'io mut dyn DeviceIo,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<RunSummary> {
        let mut work = Work {
            io,
            cancel: cancel.clone(),
            dev_map: ExtentMap::new(),
            dev_free_map: ExtentMap::new(),
            work_count: 0,
            storage_len: 0,
            buffer_len: 0,
            secondary_len: 0,
        };
        work.init()?;
        work.analyze(loop_extents, free_extents)?;
        work.cancel.checkpoint()?;
        work.create_storage(options)?;
        work.cancel.checkpoint()?;
        let result = work.relocate();
        // The window is released on every exit path.
        let closed = work.io.close_storage();
        result?;
        closed?;

        let log2 = work.io.effective_block_size_log2();
        Ok(RunSummary {
            block_size: 1_u64 << log2,
            work_blocks: work.work_count,
            relocated_bytes: work.work_count << log2,
            storage_bytes: work.storage_len,
            secondary_storage_bytes: work.secondary_len,
        })
    }

    /// Run only the analysis phase and report the plan. The lists are
    /// consumed exactly as by [`run`](Self::run).
    pub fn analyze_plan(
        loop_extents: &mut ExtentList,
        free_extents: &mut ExtentList,
        io: &'io mut dyn DeviceIo,
    ) -> Result<PlanReport> {
        let mut work = Work {
            io,
            cancel: CancelToken::new(),
            dev_map: ExtentMap::new(),
            dev_free_map: ExtentMap::new(),
            work_count: 0,
            storage_len: 0,
            buffer_len: 0,
            secondary_len: 0,
        };
        work.init()?;
        work.analyze(loop_extents, free_extents)?;
        Ok(PlanReport {
            plan: work.dev_map.to_list(),
            work_blocks: work.work_count,
            primary_candidates: work.dev_free_map.to_list(),
            block_size_log2: work.io.effective_block_size_log2(),
        })
    }

    /// Sanity-check the device geometry against the derived block size.
    fn init(&mut self) -> Result<()> {
        if !self.io.is_open() {
            return Err(RemapError::NotOpen);
        }
        let log2 = self.io.effective_block_size_log2();
        let dev_length = self.io.dev_length();
        if dev_length == 0 || (dev_length >> log2) == 0 {
            return Err(RemapError::Config("device is empty".into()));
        }
        if (dev_length >> log2) << log2 != dev_length {
            return Err(RemapError::Internal(format!(
                "device length {dev_length} is not a multiple of the effective block size {}",
                1_u64 << log2
            )));
        }
        if self.io.loop_file_length() > dev_length {
            return Err(RemapError::Config(
                "loop file is longer than the device".into(),
            ));
        }
        Ok(())
    }
}

/// Dump an extent map at debug level (header) and trace level (entries).
pub(crate) fn show(label: &str, block_size_log2: u32, map: &ExtentMap) {
    if map.is_empty() {
        debug!(target: "rfs::engine", "no extents in {label}");
        return;
    }
    debug!(
        target: "rfs::engine",
        "{} extent{} in {label}, effective block size = {}",
        map.len(),
        if map.len() == 1 { "" } else { "s" },
        1_u64 << block_size_log2
    );
    if tracing::enabled!(tracing::Level::TRACE) {
        trace!(target: "rfs::engine", "# extent\tphysical\tlogical\tlength\tuser_data");
        for (index, extent) in map.iter().enumerate() {
            trace!(
                target: "rfs::engine",
                "{index}\t{}\t{}\t{}\t({})",
                extent.physical,
                extent.logical,
                extent.length,
                extent.user_data
            );
        }
    }
}
