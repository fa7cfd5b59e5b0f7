#![forbid(unsafe_code)]
//! remapfs — transform a block device in place to a new file-system
//! layout, preserving user data, without a backup device.
//!
//! Expects the preparatory phase to have created a LOOP-FILE (whose
//! extents describe the target layout) and a ZERO-FILE (occupying the
//! source file system's free space) on the device being transformed.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rfs_engine::{RunOptions, Work};
use rfs_error::RemapError;
use rfs_io::{DeviceIo, IoEndpoint, JobDir, PosixIo, PosixIoConfig, UiView};
use rfs_types::{CancelToken, JobClear, pretty_size};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "remapfs",
    about = "Remap a block device in place to a new file-system layout"
)]
struct Cli {
    /// Block device to transform (opened read-write).
    device: PathBuf,
    /// Sparse file whose physical extents describe the target layout.
    loop_file: PathBuf,
    /// Sparse file occupying the source file system's free space.
    zero_file: PathBuf,

    /// Directory for job data and logs (default: $HOME).
    #[arg(long)]
    root_dir: Option<PathBuf>,
    /// Reuse a specific job id instead of probing for a free one.
    #[arg(long, default_value_t = 0)]
    job_id: u32,
    /// Downgrade configuration checks to warnings.
    #[arg(short, long)]
    force: bool,
    /// Analyse and log everything, but write nothing to the device.
    #[arg(long)]
    simulate: bool,
    /// Total staging size in bytes (0 = auto-size).
    #[arg(long, default_value_t = 0)]
    storage_size: u64,
    /// Cap on the device-resident share of the staging area, bytes
    /// (0 = use all suitable free extents).
    #[arg(long, default_value_t = 0)]
    primary_storage_size: u64,
    /// RAM buffer for device-to-device copies, bytes (0 = staging size).
    #[arg(long, default_value_t = 0)]
    mem_buffer_size: u64,
    /// What to remove from the job directory on success.
    #[arg(long, value_enum, default_value = "auto")]
    job_clear: JobClearArg,
    /// Unmount command to run after a successful transformation,
    /// space-separated (the device path is not appended).
    #[arg(long)]
    umount_cmd: Option<String>,
    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json_summary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JobClearArg {
    Auto,
    All,
    Minimal,
    None,
}

impl From<JobClearArg> for JobClear {
    fn from(arg: JobClearArg) -> Self {
        match arg {
            JobClearArg::Auto => Self::Auto,
            JobClearArg::All => Self::All,
            JobClearArg::Minimal => Self::Minimal,
            JobClearArg::None => Self::None,
        }
    }
}

/// Coarse progress meter: one stderr line per 256 MiB written.
#[derive(Debug, Default)]
struct ProgressMeter {
    written: AtomicU64,
}

const PROGRESS_STEP: u64 = 256 * 1024 * 1024;

impl UiView for ProgressMeter {
    fn show_io_read(&self, _from: IoEndpoint, _offset: u64, _length: u64) {}

    fn show_io_write(&self, _to: IoEndpoint, _offset: u64, length: u64) {
        let before = self.written.fetch_add(length, Ordering::Relaxed);
        let after = before + length;
        if before / PROGRESS_STEP != after / PROGRESS_STEP {
            let (len, unit) = pretty_size(after);
            eprintln!("progress: {len:.2} {unit}bytes written");
        }
    }

    fn show_io_flush(&self) {}
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("remapfs: error: {error:#}");
            error
                .downcast_ref::<RemapError>()
                .map_or(1, RemapError::to_errno)
        }
    });
}

fn run(cli: Cli) -> Result<()> {
    let job = JobDir::init(cli.root_dir.as_deref(), cli.job_id)
        .context("cannot initialize the job directory")?;

    let cfg = PosixIoConfig {
        device_path: cli.device,
        loop_file_path: cli.loop_file,
        zero_file_path: cli.zero_file,
        force_run: cli.force,
        simulate_run: cli.simulate,
        storage_size: cli.storage_size,
        umount_cmd: cli.umount_cmd.clone(),
    };
    let mut io = PosixIo::new(job, cfg).context("cannot set up device I/O")?;
    io.set_ui(Box::new(ProgressMeter::default()));

    let cancel = CancelToken::new();
    let options = RunOptions {
        mem_buffer_size: cli.mem_buffer_size,
        primary_storage_size: cli.primary_storage_size,
    };

    let result = (|| -> Result<()> {
        io.open()?;
        let summary = Work::run_with_probe(&mut io, &options, &cancel)?;
        info!(
            target: "rfs::cli",
            work_blocks = summary.work_blocks,
            block_size = summary.block_size,
            "transformation complete"
        );
        if cli.json_summary {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serialize summary")?
            );
        }
        if cli.umount_cmd.is_some() {
            io.umount_dev()?;
        }
        Ok(())
    })();

    io.finish_job(cli.job_clear.into(), result.is_ok());
    result
}
