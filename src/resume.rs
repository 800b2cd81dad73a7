//! Resuming and splitting a sequential run.
//!
//! A worker that starts at shard `S` skips `S * capacity` samples before the driver sees the
//! source. As long as every worker agrees on `capacity` and the upstream replays the same
//! sequence on every connection, workers owning disjoint shard ranges produce exactly the
//! archives a single from-scratch run would.
//!
//! Stable upstream ordering is an assumption, so [`ResumePoint::apply_verified`] can check it
//! against the previous shard when that archive is already on disk.

use std::fs::File;
use std::io::Read;
use std::num::NonZeroU64;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::partition::{ShardId, member_name};
use crate::source::SampleSource;
use crate::{Error, Result};

/// Where a sequential run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub start_shard: ShardId,
    pub capacity: NonZeroU64,
}

impl ResumePoint {
    pub fn new(start_shard: u64, capacity: u64) -> Result<Self> {
        let capacity = NonZeroU64::new(capacity)
            .ok_or_else(|| Error::config("shard capacity must be greater than zero"))?;
        Ok(Self {
            start_shard: ShardId(start_shard),
            capacity,
        })
    }

    /// Number of samples preceding the start shard.
    pub fn skip_count(&self) -> Result<u64> {
        self.start_shard
            .0
            .checked_mul(self.capacity.get())
            .ok_or_else(|| {
                Error::config(format!(
                    "start shard {} with capacity {} overflows the sample index",
                    self.start_shard, self.capacity
                ))
            })
    }

    /// Skip the source to the start shard. Returns how many samples were skipped, which is
    /// less than [`ResumePoint::skip_count`] only if the stream is shorter than that.
    pub fn apply<S: SampleSource + ?Sized>(&self, source: &mut S) -> Result<u64> {
        let want = self.skip_count()?;
        if want == 0 {
            return Ok(0);
        }

        let skipped = source.skip(want)?;
        if skipped < want {
            warn!(
                start_shard = %self.start_shard,
                wanted = want,
                skipped,
                "stream ended before the resume point"
            );
        } else {
            info!(start_shard = %self.start_shard, skipped, "resumed");
        }
        Ok(skipped)
    }

    /// Like [`ResumePoint::apply`], but when archive `S-1` already exists in `output_dir`,
    /// compare the last sample before the resume point against that archive's copy of its
    /// metadata. A mismatch means the upstream did not replay the same sequence.
    ///
    /// Fields added to the archived copy by a stage are ignored; every upstream field must
    /// match.
    pub fn apply_verified<S: SampleSource + ?Sized>(
        &self,
        source: &mut S,
        output_dir: &Path,
    ) -> Result<u64> {
        let want = self.skip_count()?;
        if want == 0 {
            return Ok(0);
        }

        let previous = ShardId(self.start_shard.0 - 1);
        let archive = output_dir.join(previous.archive_name());
        if !archive.is_file() {
            return self.apply(source);
        }

        let boundary = want - 1;
        let skipped = source.skip(boundary)?;
        if skipped < boundary {
            warn!(start_shard = %self.start_shard, skipped, "stream ended before the resume point");
            return Ok(skipped);
        }

        let Some(sample) = source.next_sample()? else {
            return Ok(skipped);
        };
        let index = sample.index;
        let upstream = sample.metadata.clone();
        sample.discard();

        let archived = read_archived_metadata(&archive, index)?;
        if !archived.is_some_and(|archived| replays(&upstream, &archived)) {
            return Err(Error::ResumeMismatch { index, archive });
        }

        info!(start_shard = %self.start_shard, skipped = want, "resumed (ordering verified)");
        Ok(want)
    }
}

/// Whether `archived` is what `upstream` became after packing. Stages may add fields to the
/// metadata before it is written, so only the fields present upstream are compared.
fn replays(upstream: &Value, archived: &Value) -> bool {
    match (upstream, archived) {
        (Value::Object(up), Value::Object(arch)) => {
            up.iter().all(|(key, value)| arch.get(key) == Some(value))
        }
        _ => upstream == archived,
    }
}

fn read_archived_metadata(archive_path: &Path, index: u64) -> Result<Option<Value>> {
    let file = File::open(archive_path).map_err(Error::source_io(format!(
        "opening {}",
        archive_path.display()
    )))?;
    let mut archive = tar::Archive::new(file);
    let wanted = member_name(index, "json");

    let read_err = || Error::source_io(format!("reading {}", archive_path.display()));
    for entry in archive.entries().map_err(read_err())? {
        let mut entry = entry.map_err(read_err())?;
        let is_wanted = entry
            .path()
            .map_err(read_err())?
            .to_str()
            .is_some_and(|p| p == wanted);
        if !is_wanted {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(read_err())?;
        return Ok(Some(serde_json::from_slice(&buf)?));
    }
    Ok(None)
}

/// A contiguous, half-open range of shard ids owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub start: u64,

    /// Exclusive end. `None` means "until the stream ends".
    pub end: Option<u64>,
}

impl ShardRange {
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if end <= start {
                return Err(Error::config(format!(
                    "end shard {end} must be greater than start shard {start}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Split `0..total_shards` into `world_size` contiguous ranges and return the one for `rank`.
    ///
    /// The first `total_shards % world_size` workers take one extra shard. Ranges are disjoint
    /// and together cover every shard. A worker with nothing to do gets an empty range
    /// (`start == end`).
    pub fn for_worker(rank: u64, world_size: u64, total_shards: u64) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::config("world size must be greater than zero"));
        }
        if rank >= world_size {
            return Err(Error::config(format!(
                "worker rank {rank} is out of range for world size {world_size}"
            )));
        }

        let base = total_shards / world_size;
        let extra = total_shards % world_size;
        let start = rank * base + rank.min(extra);
        let len = base + u64::from(rank < extra);
        Ok(Self {
            start,
            end: Some(start + len),
        })
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        shard.0 >= self.start && self.end.is_none_or(|end| shard.0 < end)
    }

    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end <= self.start)
    }
}
