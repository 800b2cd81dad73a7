use std::path::PathBuf;

use crate::driver::RunOpts;
use crate::partition::PartitionPolicy;
use crate::writer::WriterOpts;
use crate::{Error, Result};

/// Options for a sequential packing run.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
/// The CLI is responsible for mapping user input into this type so that:
/// - the library remains reusable outside of a CLI context
/// - other frontends (batch jobs, tests) can construct options programmatically
#[derive(Debug, Clone)]
pub struct PackOpts {
    /// Directory receiving `{shard:010}.tar` archives. Shared by all workers of a job.
    pub output_dir: PathBuf,

    /// Samples per shard.
    pub capacity: u64,

    /// First shard this worker writes. The source is skipped to `start_shard_id * capacity`.
    pub start_shard_id: u64,

    /// Exclusive end of this worker's shard range. `None` runs to the end of the stream.
    pub end_shard_id: Option<u64>,

    /// Stop after this many samples (test mode). Ignored when `force_download_all` is set.
    pub sample_cap: Option<u64>,

    /// Stop after this many closed shards and report timing (estimate mode).
    pub estimate_shard_count: Option<u64>,

    /// Disable `sample_cap` and consume the whole stream.
    pub force_download_all: bool,

    /// Persist archives for shards that end up empty.
    pub keep_empty_shards: bool,

    /// Replace existing archives instead of refusing to open their shards.
    pub overwrite: bool,

    /// Check upstream ordering against shard `start_shard_id - 1` when it already exists.
    pub verify_resume: bool,

    /// Log a progress line every N closed shards.
    pub progress_every: u64,

    /// Where remote payloads are downloaded before archiving. Defaults to
    /// `output_dir/.staging`.
    pub staging_dir: Option<PathBuf>,
}

impl PackOpts {
    /// Defaults mirror the reference downloader: ten samples per shard, whole stream.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            capacity: 10,
            start_shard_id: 0,
            end_shard_id: None,
            sample_cap: None,
            estimate_shard_count: None,
            force_download_all: false,
            keep_empty_shards: false,
            overwrite: false,
            verify_resume: false,
            progress_every: 5,
            staging_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::config("capacity must be greater than zero"));
        }
        if let Some(end) = self.end_shard_id {
            if end <= self.start_shard_id {
                return Err(Error::config(format!(
                    "end shard {end} must be greater than start shard {}",
                    self.start_shard_id
                )));
            }
        }
        if self.effective_sample_cap() == Some(0) {
            return Err(Error::config("sample cap must be greater than zero"));
        }
        if self.estimate_shard_count == Some(0) {
            return Err(Error::config("estimate shard count must be greater than zero"));
        }
        if self
            .start_shard_id
            .checked_mul(self.capacity)
            .is_none()
        {
            return Err(Error::config("start shard times capacity overflows"));
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".staging"))
    }

    /// The sample cap actually in force.
    pub fn effective_sample_cap(&self) -> Option<u64> {
        if self.force_download_all {
            None
        } else {
            self.sample_cap
        }
    }

    pub fn policy(&self) -> Result<PartitionPolicy> {
        PartitionPolicy::fixed_count(self.capacity)
    }

    pub fn run_opts(&self) -> RunOpts {
        RunOpts {
            sample_cap: self.effective_sample_cap(),
            estimate_shard_count: self.estimate_shard_count,
            end_shard: self.end_shard_id,
            progress_every: self.progress_every,
        }
    }

    pub fn writer_opts(&self) -> WriterOpts {
        WriterOpts {
            keep_empty_shards: self.keep_empty_shards,
            overwrite: self.overwrite,
            ..WriterOpts::default()
        }
    }
}
