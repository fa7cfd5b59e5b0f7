//! Per-run job directory: log sink, scratch file location, resume state.
//!
//! The job root is `$ROOT/.fstransform` (argument, else `$HOME`, else the
//! current directory with a warning). Job ids are probed as `job.1`,
//! `job.2`, … until a directory can be created, unless the caller forces an
//! id — in which case an existing directory is reused and the run is
//! treated as a resume.

use rfs_error::{RemapError, Result};
use rfs_types::JobClear;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

const JOB_ROOT_NAME: &str = ".fstransform";
const LOG_FILE_NAME: &str = "fstransform.log";
const STATE_FILE_NAME: &str = "job.json";
const STORAGE_FILE_NAME: &str = "storage.bin";
const JOB_ID_PROBE_LIMIT: u32 = 10_000;

/// Sizing decisions persisted for a later resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub storage_size: u64,
    pub mem_buffer_size: u64,
    pub block_size_log2: u32,
}

/// A claimed job directory with its registered log sink.
pub struct JobDir {
    dir: PathBuf,
    id: u32,
    resumed: bool,
    log_guard: Option<tracing::subscriber::DefaultGuard>,
}

impl std::fmt::Debug for JobDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDir")
            .field("dir", &self.dir)
            .field("id", &self.id)
            .field("resumed", &self.resumed)
            .finish()
    }
}

impl JobDir {
    /// Claim a job directory under `root_dir` (or the `$HOME` fallback) and
    /// register `fstransform.log` as the log sink.
    pub fn init(root_dir: Option<&Path>, forced_id: u32) -> Result<Self> {
        let root = match root_dir {
            Some(dir) => dir.to_path_buf(),
            None => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home),
                None => {
                    warn!(
                        target: "rfs::job",
                        "$HOME is not set, job data will live under the current directory"
                    );
                    PathBuf::from(".")
                }
            },
        };
        let root = root.join(JOB_ROOT_NAME);
        std::fs::create_dir_all(&root)?;

        let (dir, id, resumed) = if forced_id != 0 {
            let dir = root.join(format!("job.{forced_id}"));
            let resumed = dir.is_dir();
            if !resumed {
                std::fs::create_dir(&dir)?;
            }
            (dir, forced_id, resumed)
        } else {
            let mut claimed = None;
            for id in 1..=JOB_ID_PROBE_LIMIT {
                let dir = root.join(format!("job.{id}"));
                match std::fs::create_dir(&dir) {
                    Ok(()) => {
                        claimed = Some((dir, id));
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
            }
            let (dir, id) = claimed.ok_or_else(|| {
                RemapError::Config(format!(
                    "failed to locate a free job id under '{}', tried 1..={JOB_ID_PROBE_LIMIT}",
                    root.display()
                ))
            })?;
            (dir, id, false)
        };

        let mut job = Self {
            dir,
            id,
            resumed,
            log_guard: None,
        };
        job.init_log()?;
        info!(target: "rfs::job", job_id = job.id, resumed = job.resumed, "starting job");
        info!(
            target: "rfs::job",
            "job persistent data and logs will be in '{}'",
            job.dir.display()
        );
        Ok(job)
    }

    /// Open the log file in append mode and register it as the thread
    /// default log sink (file at debug verbosity, stderr at info).
    fn init_log(&mut self) -> Result<()> {
        let log_path = self.dir.join(LOG_FILE_NAME);
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)?;

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(std::sync::Mutex::new(log_file))
            .with_filter(LevelFilter::DEBUG);
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(LevelFilter::INFO);
        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer);
        self.log_guard = Some(tracing::subscriber::set_default(subscriber));
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether an existing job directory was reused (resume semantics).
    #[must_use]
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.dir.join(STORAGE_FILE_NAME)
    }

    /// Load the persisted sizing state, if any.
    pub fn load_state(&self) -> Result<Option<JobState>> {
        let path = self.dir.join(STATE_FILE_NAME);
        match File::open(&path) {
            Ok(file) => {
                let state = serde_json::from_reader(file).map_err(|err| {
                    RemapError::Config(format!(
                        "corrupt job state '{}': {err}",
                        path.display()
                    ))
                })?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist the sizing state for a later resume.
    pub fn save_state(&self, state: &JobState) -> Result<()> {
        let path = self.dir.join(STATE_FILE_NAME);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, state)
            .map_err(|err| RemapError::Config(format!("cannot write job state: {err}")))?;
        Ok(())
    }

    /// Apply the clear policy at end of run. Unregisters the log sink first
    /// when the whole directory goes away.
    pub fn finish(&mut self, policy: JobClear, success: bool) {
        let remove_dir = match policy {
            JobClear::All => true,
            JobClear::Auto => success,
            JobClear::Minimal | JobClear::None => false,
        };
        let remove_storage = matches!(policy, JobClear::Auto | JobClear::Minimal) && success;

        if remove_dir {
            drop(self.log_guard.take());
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                eprintln!(
                    "warning: cannot remove job directory '{}': {err}",
                    self.dir.display()
                );
            }
            return;
        }
        if remove_storage {
            let storage = self.storage_path();
            if let Err(err) = std::fs::remove_file(&storage) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        target: "rfs::job",
                        "cannot remove scratch file '{}': {err}",
                        storage.display()
                    );
                }
            }
        }
    }
}
