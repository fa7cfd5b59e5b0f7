//! POSIX implementation of the I/O façade.
//!
//! Owns the three file descriptors (DEVICE read-write, LOOP-FILE and
//! ZERO-FILE read-only), the memory-mapped staging window, the RAM buffer
//! for DEV2DEV copies, and the job directory. All copy parameters are in
//! bytes.

use crate::fiemap;
use crate::job::{JobDir, JobState};
use crate::storage::{RamBuffer, StorageWindow};
use crate::{CopyDir, DeviceIo, IoEndpoint, UiView, ZeroTarget};
use parking_lot::Mutex;
use rfs_error::{RemapError, Result};
use std::os::unix::fs::FileTypeExt;
use rfs_extent::{DEFAULT_USER_DATA, Extent, ExtentList};
use rfs_types::pretty_size;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, error, info, trace, warn};

const ZERO_BUF_LEN: usize = 1024 * 1024;
const SECONDARY_FILL_CHUNK: usize = 64 * 1024;

/// Configuration bundle for a POSIX run.
#[derive(Debug, Clone)]
pub struct PosixIoConfig {
    pub device_path: PathBuf,
    pub loop_file_path: PathBuf,
    pub zero_file_path: PathBuf,
    /// Downgrade configuration checks to warnings.
    pub force_run: bool,
    /// Suppress device writes; analysis and logging run in full.
    pub simulate_run: bool,
    /// Requested total staging size in bytes (0 = auto).
    pub storage_size: u64,
    /// Custom unmount command, space-separated (`/bin/umount <dev>` when
    /// unset).
    pub umount_cmd: Option<String>,
}

/// Aggregate I/O counters (reads/writes of payload bytes, flushes).
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct PosixIo {
    job: JobDir,
    cfg: PosixIoConfig,
    device: Option<File>,
    loop_file: Option<File>,
    zero_file: Option<File>,
    secondary_file: Option<File>,
    dev_len: u64,
    loop_len: u64,
    block_size_log2: u32,
    primary: ExtentList,
    secondary: Extent,
    storage_size: u64,
    storage_size_exact: bool,
    window: Option<StorageWindow>,
    buffer: Option<RamBuffer>,
    /// Lazily allocated zero source for device zeroing; lives for the rest
    /// of the run once created.
    zero_buf: Option<Box<[u8]>>,
    stats: Mutex<IoStats>,
    ui: Option<Box<dyn UiView>>,
}

impl std::fmt::Debug for PosixIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixIo")
            .field("device", &self.cfg.device_path)
            .field("dev_len", &self.dev_len)
            .field("block_size_log2", &self.block_size_log2)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl PosixIo {
    /// Bind a job directory and configuration; call [`open`](Self::open)
    /// before anything else.
    pub fn new(job: JobDir, cfg: PosixIoConfig) -> Result<Self> {
        let mut storage_size = cfg.storage_size;
        let mut storage_size_exact = false;
        if job.resumed() {
            // A pre-existing job directory implies the prior sizing must be
            // reproduced exactly.
            storage_size_exact = true;
            if let Some(state) = job.load_state()? {
                storage_size = state.storage_size;
                info!(
                    target: "rfs::io",
                    storage_size,
                    "resuming job with persisted storage size"
                );
            }
        }
        Ok(Self {
            job,
            cfg,
            device: None,
            loop_file: None,
            zero_file: None,
            secondary_file: None,
            dev_len: 0,
            loop_len: 0,
            block_size_log2: 0,
            primary: ExtentList::new(),
            secondary: Extent::new(0, 0, 0, DEFAULT_USER_DATA),
            storage_size,
            storage_size_exact,
            window: None,
            buffer: None,
            zero_buf: None,
            stats: Mutex::new(IoStats::default()),
            ui: None,
        })
    }

    pub fn set_ui(&mut self, ui: Box<dyn UiView>) {
        self.ui = Some(ui);
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }

    #[must_use]
    pub fn job(&self) -> &JobDir {
        &self.job
    }

    /// End-of-run cleanup: release descriptors and apply the job clear
    /// policy.
    pub fn finish_job(&mut self, policy: rfs_types::JobClear, success: bool) {
        self.release();
        self.job.finish(policy, success);
    }

    fn warn_or_fail(&self, message: String) -> Result<()> {
        if self.cfg.force_run {
            warn!(target: "rfs::io", "{message}, continuing due to --force");
            Ok(())
        } else {
            Err(RemapError::Config(format!(
                "{message}, use --force to override"
            )))
        }
    }

    /// Open and validate DEVICE, LOOP-FILE and ZERO-FILE.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            error!(target: "rfs::io", "unexpected call, I/O is already open");
            return Err(RemapError::AlreadyOpen);
        }

        // SAFETY: geteuid has no preconditions and touches no memory.
        if unsafe { libc::geteuid() } != 0 {
            warn!(
                target: "rfs::io",
                "not running as root! expect permission errors"
            );
        }

        let result = self.open_inner();
        if result.is_err() {
            self.release();
        }
        result
    }

    fn open_inner(&mut self) -> Result<()> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.cfg.device_path)
            .map_err(|err| {
                RemapError::Config(format!(
                    "error opening device '{}': {err}",
                    self.cfg.device_path.display()
                ))
            })?;
        let meta = device.metadata()?;
        let device_id = if meta.file_type().is_block_device() {
            Some(meta.rdev())
        } else {
            self.warn_or_fail(format!(
                "'{}' is not a block device",
                self.cfg.device_path.display()
            ))?;
            None
        };
        // Works for both block devices and regular-file images.
        let dev_len = device_length(&device)?;
        let (len, unit) = pretty_size(dev_len);
        info!(target: "rfs::io", "device length is {len:.2} {unit}bytes");
        self.dev_len = dev_len;
        self.device = Some(device);

        for (path, is_loop) in [
            (self.cfg.loop_file_path.clone(), true),
            (self.cfg.zero_file_path.clone(), false),
        ] {
            let label = if is_loop { "loop file" } else { "zero file" };
            let file = OpenOptions::new().read(true).open(&path).map_err(|err| {
                RemapError::Config(format!("error opening {label} '{}': {err}", path.display()))
            })?;
            let meta = file.metadata()?;
            if meta.len() > self.dev_len {
                return Err(RemapError::Config(format!(
                    "{label} size = {} bytes exceeds device length = {} bytes",
                    meta.len(),
                    self.dev_len
                )));
            }
            if let Some(id) = device_id {
                if meta.dev() != id {
                    self.warn_or_fail(format!(
                        "{label} '{}' is not stored inside device '{}'",
                        path.display(),
                        self.cfg.device_path.display()
                    ))?;
                }
            }
            if is_loop {
                if meta.len() < self.dev_len {
                    info!(
                        target: "rfs::io",
                        "{label} '{}' is shorter than the device, remapping will also \
                         shrink the file-system",
                        path.display()
                    );
                }
                self.loop_len = meta.len();
                self.loop_file = Some(file);
            } else {
                self.zero_file = Some(file);
            }
        }

        Ok(())
    }

    /// Drop every descriptor and mapping. Idempotent.
    pub fn release(&mut self) {
        let _ = self.close_storage();
        self.loop_file = None;
        self.zero_file = None;
        self.device = None;
        self.dev_len = 0;
        self.loop_len = 0;
    }

    fn create_secondary_storage(&mut self, length: u64) -> Result<()> {
        let path = self.job.storage_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;

        let (len, unit) = pretty_size(length);
        let simulated = if self.cfg.simulate_run { " (simulated)" } else { "" };
        info!(
            target: "rfs::io",
            "secondary storage:{simulated} writing {len:.2} {unit}bytes to '{}'",
            path.display()
        );

        let fill = || -> Result<()> {
            if self.cfg.simulate_run {
                // Just extend the file; pages materialize on demand.
                file.write_all_at(&[0_u8], length - 1)?;
                return Ok(());
            }
            let chunk = vec![0_u8; SECONDARY_FILL_CHUNK];
            let mut pos = 0_u64;
            while pos < length {
                let step = (length - pos).min(chunk.len() as u64) as usize;
                file.write_all_at(&chunk[..step], pos)?;
                pos += step as u64;
            }
            Ok(())
        };
        if let Err(err) = fill() {
            drop(file);
            if let Err(unlink_err) = std::fs::remove_file(&path) {
                warn!(
                    target: "rfs::io",
                    "removing secondary storage file '{}' failed: {unlink_err}",
                    path.display()
                );
            }
            return Err(err);
        }

        info!(target: "rfs::io", "secondary storage:{simulated} file created");
        self.secondary_file = Some(file);
        Ok(())
    }

    fn notify_read(&self, from: IoEndpoint, offset: u64, length: u64) {
        if let Some(ui) = &self.ui {
            ui.show_io_read(from, offset, length);
        }
    }

    fn notify_write(&self, to: IoEndpoint, offset: u64, length: u64) {
        if let Some(ui) = &self.ui {
            ui.show_io_write(to, offset, length);
        }
    }

    /// `EOVERFLOW` check: `offset + length` must stay within `max` and
    /// within address arithmetic.
    fn validate(what: &str, offset: u64, length: u64, max: u64) -> Result<()> {
        let end = offset.checked_add(length).ok_or_else(|| {
            RemapError::Overflow(format!("{what} range [{offset}, +{length}) overflows"))
        })?;
        if end > max {
            return Err(RemapError::Overflow(format!(
                "{what} range [{offset}, +{length}) exceeds {max} bytes"
            )));
        }
        rfs_types::u64_to_usize(end, "copy range end")?;
        Ok(())
    }

    /// One DEVICE↔STORAGE copy through the window mappings.
    fn copy_dev_storage(&mut self, read_dev: bool, dev_offset: u64, win_offset: u64, length: u64) -> Result<()> {
        Self::validate("device", dev_offset, length, self.dev_len)?;
        let window_len = self.window.as_ref().map_or(0, StorageWindow::total_len);
        Self::validate("storage", win_offset, length, window_len)?;

        if read_dev {
            self.notify_read(IoEndpoint::Device, dev_offset, length);
            self.notify_write(IoEndpoint::Storage, win_offset, length);
        } else {
            self.notify_read(IoEndpoint::Storage, win_offset, length);
            self.notify_write(IoEndpoint::Device, dev_offset, length);
        }

        if !self.cfg.simulate_run {
            let window = self.window.as_mut().ok_or(RemapError::NotOpen)?;
            let device = self.device.as_ref().ok_or(RemapError::NotOpen)?;
            if read_dev {
                window.read_from_file(device, dev_offset, win_offset, length)?;
            } else {
                window.write_to_file(device, dev_offset, win_offset, length)?;
            }
        }

        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.writes += 1;
        stats.bytes_read += length;
        stats.bytes_written += length;
        drop(stats);

        trace!(
            target: "rfs::io",
            direction = if read_dev { "dev->storage" } else { "storage->dev" },
            dev_offset,
            win_offset,
            length,
            simulated = self.cfg.simulate_run,
            "copy ok"
        );
        Ok(())
    }

    /// One DEVICE↔RAM-buffer copy.
    fn copy_dev_ram(&mut self, read_dev: bool, dev_offset: u64, buf_offset: u64, length: u64) -> Result<()> {
        Self::validate("device", dev_offset, length, self.dev_len)?;
        let buffer_len = self.buffer.as_ref().map_or(0, RamBuffer::len);
        Self::validate("memory buffer", buf_offset, length, buffer_len)?;

        if read_dev {
            self.notify_read(IoEndpoint::Device, dev_offset, length);
        } else {
            self.notify_write(IoEndpoint::Device, dev_offset, length);
        }

        if !self.cfg.simulate_run {
            let buffer = self.buffer.as_mut().ok_or(RemapError::NotOpen)?;
            let device = self.device.as_ref().ok_or(RemapError::NotOpen)?;
            let from = rfs_types::u64_to_usize(buf_offset, "buffer offset")?;
            let to = rfs_types::u64_to_usize(buf_offset + length, "buffer offset")?;
            let slice = &mut buffer.as_mut_slice()[from..to];
            if read_dev {
                device.read_exact_at(slice, dev_offset)?;
            } else {
                device.write_all_at(slice, dev_offset)?;
            }
        }

        let mut stats = self.stats.lock();
        if read_dev {
            stats.reads += 1;
            stats.bytes_read += length;
        } else {
            stats.writes += 1;
            stats.bytes_written += length;
        }
        drop(stats);

        trace!(
            target: "rfs::io",
            direction = if read_dev { "dev->ram" } else { "ram->dev" },
            dev_offset,
            buf_offset,
            length,
            simulated = self.cfg.simulate_run,
            "copy ok"
        );
        Ok(())
    }

    /// DEVICE→DEVICE batches through the RAM buffer.
    ///
    /// Fill passes pack extents in physical order until the next one would
    /// not fit, then the packed batch is re-sorted by logical destination
    /// and drained, then flushed. Extents larger than the whole buffer are
    /// chunked read→write→flush.
    fn flush_copy_dev2dev(&mut self, requests: &mut ExtentList) -> Result<()> {
        requests.sort_by_physical();
        let buffer_len = self.buffer.as_ref().map_or(0, RamBuffer::len);
        if buffer_len == 0 {
            return Err(RemapError::NotOpen);
        }

        let n = requests.len();
        let mut start = 0_usize;
        while start < n {
            let mut buf_offset = 0_u64;
            let mut buf_free = buffer_len;
            let mut i = start;
            // Fill pass: sequential reads in physical order.
            while i < n {
                let length = requests[i].length;
                if length > buf_free {
                    break;
                }
                let physical = requests[i].physical;
                self.copy_dev_ram(true, physical, buf_offset, length)?;
                requests[i].user_data = buf_offset;
                buf_offset += length;
                buf_free -= length;
                i += 1;
            }
            let filled = i;

            // Drain pass: sequential writes in logical order.
            if filled != start {
                requests[start..filled].sort_unstable_by_key(|e| (e.logical, e.length));
                for j in start..filled {
                    let request = requests[j];
                    self.copy_dev_ram(false, request.logical, request.user_data, request.length)?;
                }
            }
            self.flush_bytes()?;

            // Extents that do not fit the buffer at all: chunked copies.
            let mut i = filled;
            while i < n {
                let request = requests[i];
                if request.length <= buffer_len {
                    break;
                }
                let mut from = request.physical;
                let mut to = request.logical;
                let mut remaining = request.length;
                while remaining != 0 {
                    let chunk = remaining.min(buffer_len);
                    self.copy_dev_ram(true, from, 0, chunk)?;
                    self.copy_dev_ram(false, to, 0, chunk)?;
                    self.flush_bytes()?;
                    from += chunk;
                    to += chunk;
                    remaining -= chunk;
                }
                i += 1;
            }
            start = i;
        }
        Ok(())
    }
}

fn device_length(device: &File) -> Result<u64> {
    use std::io::Seek;
    let mut file = device;
    let len = file.seek(std::io::SeekFrom::End(0))?;
    if len == 0 {
        return Err(RemapError::Config("device length is zero".into()));
    }
    Ok(len)
}

impl DeviceIo for PosixIo {
    fn dev_length(&self) -> u64 {
        self.dev_len
    }

    fn loop_file_length(&self) -> u64 {
        self.loop_len
    }

    fn effective_block_size_log2(&self) -> u32 {
        self.block_size_log2
    }

    fn set_effective_block_size_log2(&mut self, log2: u32) {
        self.block_size_log2 = log2;
    }

    fn is_open(&self) -> bool {
        self.dev_len != 0 && self.device.is_some()
    }

    fn primary_storage(&self) -> &ExtentList {
        &self.primary
    }

    fn primary_storage_mut(&mut self) -> &mut ExtentList {
        &mut self.primary
    }

    fn secondary_storage(&self) -> Extent {
        self.secondary
    }

    fn job_storage_size(&self) -> u64 {
        self.storage_size
    }

    fn set_job_storage_size(&mut self, bytes: u64) -> Result<()> {
        self.storage_size = bytes;
        Ok(())
    }

    fn job_storage_size_exact(&self) -> bool {
        self.storage_size_exact
    }

    fn create_storage(&mut self, secondary_len: u64, mem_buffer_size: u64) -> Result<()> {
        if self.window.is_some() || self.secondary_file.is_some() {
            error!(
                target: "rfs::io",
                "unexpected call to create_storage, storage is already initialized"
            );
            return Err(RemapError::AlreadyOpen);
        }
        let device_open = self.device.is_some();
        if !device_open {
            return Err(RemapError::NotOpen);
        }

        let result = (|| -> Result<()> {
            let buffer = RamBuffer::new(mem_buffer_size)?;
            let (len, unit) = pretty_size(buffer.len());
            info!(
                target: "rfs::io",
                "allocated {len:.2} {unit}bytes RAM as memory buffer"
            );
            self.buffer = Some(buffer);

            if secondary_len != 0 {
                self.create_secondary_storage(secondary_len)?;
            } else {
                info!(
                    target: "rfs::io",
                    "not creating secondary storage, primary storage is large enough"
                );
            }

            let device = self.device.as_ref().ok_or(RemapError::NotOpen)?;
            let window = StorageWindow::build(
                device,
                &mut self.primary,
                self.secondary_file.as_ref(),
                secondary_len,
            )?;
            let primary_len = window.total_len() - secondary_len;
            self.secondary = Extent::new(0, 0, secondary_len, primary_len);

            // Remember the sizing for a later resume.
            self.job.save_state(&JobState {
                storage_size: window.total_len(),
                mem_buffer_size,
                block_size_log2: self.block_size_log2,
            })?;

            let (len, unit) = pretty_size(window.total_len());
            info!(
                target: "rfs::io",
                segments = self.primary.len() + usize::from(secondary_len != 0),
                "staging storage is {len:.2} {unit}bytes, initialized and mapped to a \
                 contiguous window"
            );
            self.window = Some(window);
            Ok(())
        })();

        if result.is_err() {
            let _ = self.close_storage();
        }
        result
    }

    fn close_storage(&mut self) -> Result<()> {
        self.window = None;
        self.buffer = None;
        self.secondary_file = None;
        Ok(())
    }

    fn flush_copy_bytes(&mut self, dir: CopyDir, requests: &mut ExtentList) -> Result<()> {
        match dir {
            CopyDir::Dev2Storage => {
                // Pre-sorted by physical: sequential device reads.
                for i in 0..requests.len() {
                    let request = requests[i];
                    self.copy_dev_storage(true, request.physical, request.logical, request.length)?;
                }
                Ok(())
            }
            CopyDir::Storage2Dev => {
                // Pre-sorted by logical: sequential device writes.
                for i in 0..requests.len() {
                    let request = requests[i];
                    self.copy_dev_storage(false, request.logical, request.physical, request.length)?;
                }
                Ok(())
            }
            CopyDir::Dev2Dev => self.flush_copy_dev2dev(requests),
        }
    }

    fn flush_bytes(&mut self) -> Result<()> {
        if let Some(ui) = &self.ui {
            ui.show_io_flush();
        }
        self.stats.lock().flushes += 1;
        if self.cfg.simulate_run {
            return Ok(());
        }
        if let Some(window) = &self.window {
            window.flush();
        }
        if let Some(device) = &self.device {
            if let Err(err) = device.sync_all() {
                warn!(target: "rfs::io", "device sync failed: {err}");
            }
        }
        if let Some(secondary) = &self.secondary_file {
            if let Err(err) = secondary.sync_all() {
                warn!(target: "rfs::io", "secondary storage sync failed: {err}");
            }
        }
        Ok(())
    }

    fn zero_bytes(&mut self, target: ZeroTarget, offset: u64, length: u64) -> Result<()> {
        let max = match target {
            ZeroTarget::Device => self.dev_len,
            ZeroTarget::Storage => self.window.as_ref().map_or(0, StorageWindow::total_len),
        };
        let end = offset.checked_add(length);
        if end.is_none() || end.unwrap_or(u64::MAX) > max {
            return Err(RemapError::Overflow(format!(
                "zero range [{offset}, +{length}) overflows maximum allowed {max}"
            )));
        }

        self.notify_write(
            match target {
                ZeroTarget::Device => IoEndpoint::Device,
                ZeroTarget::Storage => IoEndpoint::Storage,
            },
            offset,
            length,
        );
        if self.cfg.simulate_run {
            return Ok(());
        }

        match target {
            ZeroTarget::Storage => {
                let window = self.window.as_mut().ok_or(RemapError::NotOpen)?;
                window.zero_range(offset, length)
            }
            ZeroTarget::Device => {
                let zero_buf = self
                    .zero_buf
                    .get_or_insert_with(|| vec![0_u8; ZERO_BUF_LEN].into_boxed_slice());
                let device = self.device.as_ref().ok_or(RemapError::NotOpen)?;
                let mut pos = offset;
                let mut remaining = length;
                while remaining != 0 {
                    let chunk = remaining.min(zero_buf.len() as u64) as usize;
                    device.write_all_at(&zero_buf[..chunk], pos)?;
                    pos += chunk as u64;
                    remaining -= chunk as u64;
                }
                Ok(())
            }
        }
    }

    fn read_extents(
        &mut self,
        loop_out: &mut ExtentList,
        free_out: &mut ExtentList,
        block_size_bitmask: &mut u64,
    ) -> Result<()> {
        let loop_file = self.loop_file.as_ref().ok_or(RemapError::NotOpen)?;
        let zero_file = self.zero_file.as_ref().ok_or(RemapError::NotOpen)?;
        fiemap::read_file_extents(loop_file, "loop file", loop_out, block_size_bitmask)?;
        fiemap::read_file_extents(zero_file, "zero file", free_out, block_size_bitmask)?;
        debug!(
            target: "rfs::io",
            loop_extents = loop_out.len(),
            free_extents = free_out.len(),
            bitmask = format_args!("{block_size_bitmask:#x}"),
            "extent probe complete"
        );
        Ok(())
    }

    fn umount_dev(&mut self) -> Result<()> {
        let dev = self.cfg.device_path.display().to_string();
        let (program, args) = match &self.cfg.umount_cmd {
            Some(cmd) => {
                let mut parts = cmd.split_whitespace();
                let program = parts.next().ok_or_else(|| {
                    RemapError::Config("empty umount command".into())
                })?;
                (program.to_owned(), parts.map(str::to_owned).collect())
            }
            None => ("/bin/umount".to_owned(), vec![dev.clone()]),
        };

        info!(
            target: "rfs::io",
            "unmounting device '{dev}'... command: {program} {}",
            args.join(" ")
        );
        let status = Command::new(&program).args(&args).status().map_err(|err| {
            RemapError::Config(format!("cannot run umount command '{program}': {err}"))
        })?;
        if !status.success() {
            return Err(RemapError::Config(format!(
                "umount command '{program}' failed with {status}"
            )));
        }
        info!(target: "rfs::io", "successfully unmounted device '{dev}'");
        Ok(())
    }

    fn simulate_run(&self) -> bool {
        self.cfg.simulate_run
    }

    fn ui(&self) -> Option<&dyn UiView> {
        self.ui.as_deref()
    }
}

impl Drop for PosixIo {
    fn drop(&mut self) {
        self.release();
    }
}
