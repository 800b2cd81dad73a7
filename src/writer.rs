//! Tar shard writer.
//!
//! The writer owns at most one open archive. Design:
//! - Members stream directly into a hidden temporary file in the output directory; nothing is
//!   buffered per shard in memory.
//! - `close()` finishes the tar, fsyncs, and renames it to `{shard:010}.tar`. A crash or an
//!   aborted shard therefore never leaves a complete-looking archive behind.
//! - Tar headers carry a fixed mode/mtime/owner so identical input yields byte-identical
//!   archives, which is what lets resumed runs line up with from-scratch runs.

use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tar::{EntryType, Header, HeaderMode};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::partition::{ShardId, member_name};
use crate::sample::Sample;
use crate::{Error, Result};

/// Knobs for [`ShardWriter`].
#[derive(Debug, Clone)]
pub struct WriterOpts {
    /// Persist archives for shards that received no samples.
    ///
    /// When `false` (the default) an empty shard is discarded on `close()`.
    pub keep_empty_shards: bool,

    /// Replace an existing archive with the same name instead of refusing to open the shard.
    ///
    /// Workers sharing an output directory rely on the default (`false`) to catch overlapping
    /// shard ranges.
    pub overwrite: bool,

    /// Modification time stamped on every member header.
    pub member_mtime: u64,
}

impl Default for WriterOpts {
    fn default() -> Self {
        Self {
            keep_empty_shards: false,
            overwrite: false,
            member_mtime: 0,
        }
    }
}

/// What a closed shard produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSummary {
    pub id: ShardId,

    /// Number of samples archived.
    pub samples: u64,

    /// Total bytes of metadata and payload members (excluding tar framing).
    pub payload_bytes: u64,

    /// Final archive path, or `None` when an empty shard was discarded.
    pub path: Option<PathBuf>,

    /// Wall-clock time between `open` and `close`.
    pub elapsed: Duration,
}

struct OpenShard {
    id: ShardId,
    tmp_path: PathBuf,
    builder: tar::Builder<BufWriter<NamedTempFile>>,
    samples: u64,
    payload_bytes: u64,
    opened_at: Instant,
}

/// Writes one shard archive at a time into an output directory.
pub struct ShardWriter {
    output_dir: PathBuf,
    opts: WriterOpts,
    open: Option<OpenShard>,
}

impl ShardWriter {
    /// Create a writer for `output_dir` (created if missing).
    pub fn new(output_dir: impl Into<PathBuf>, opts: WriterOpts) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(Error::write_io(&output_dir))?;
        Ok(Self {
            output_dir,
            opts,
            open: None,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn opts(&self) -> &WriterOpts {
        &self.opts
    }

    /// Final path of the archive for `id`.
    pub fn archive_path(&self, id: ShardId) -> PathBuf {
        self.output_dir.join(id.archive_name())
    }

    /// The currently open shard, if any.
    pub fn current(&self) -> Option<ShardId> {
        self.open.as_ref().map(|s| s.id)
    }

    /// Start a new shard. Fails if a shard is already open or the archive already exists
    /// (unless `overwrite` is set).
    pub fn open(&mut self, id: ShardId) -> Result<()> {
        if let Some(open) = &self.open {
            return Err(Error::msg(format!(
                "cannot open shard {id}: shard {} is still open",
                open.id
            )));
        }

        let final_path = self.archive_path(id);
        if !self.opts.overwrite && final_path.exists() {
            return Err(Error::config(format!(
                "archive already exists: {} (another worker may own this shard range)",
                final_path.display()
            )));
        }

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", id.file_stem()))
            .suffix(".tar.part")
            .tempfile_in(&self.output_dir)
            .map_err(Error::write_io(&self.output_dir))?;
        let tmp_path = tmp.path().to_path_buf();

        let mut builder = tar::Builder::new(BufWriter::new(tmp));
        builder.mode(HeaderMode::Deterministic);

        debug!(shard = %id, tmp = %tmp_path.display(), "opened shard");
        self.open = Some(OpenShard {
            id,
            tmp_path,
            builder,
            samples: 0,
            payload_bytes: 0,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    /// Append `sample` to the open shard: `{index:016}.json` first, then each blob as
    /// `{index:016}.{ext}` in order.
    ///
    /// Staged blobs are removed right after they are archived. On failure the shard is left
    /// as-is (already-added members are not rolled back); call [`ShardWriter::abort`] to drop it.
    pub fn add(&mut self, sample: Sample) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            sample.discard();
            return Err(Error::msg("cannot add sample: no shard is open"));
        };

        if let Err(err) = check_member_names(&sample) {
            sample.discard();
            return Err(err);
        }

        let result = append_sample(open, &sample, self.opts.member_mtime);
        // Staged copies go away whether or not the append succeeded.
        for blob in &sample.blobs {
            blob.data.remove_staged();
        }
        result?;

        open.samples += 1;
        Ok(())
    }

    /// Finalize the open shard under its canonical name.
    ///
    /// This method is idempotent: with no shard open it returns `Ok(None)`.
    pub fn close(&mut self) -> Result<Option<ShardSummary>> {
        let Some(open) = self.open.take() else {
            return Ok(None);
        };

        let elapsed = open.opened_at.elapsed();
        let mut summary = ShardSummary {
            id: open.id,
            samples: open.samples,
            payload_bytes: open.payload_bytes,
            path: None,
            elapsed,
        };

        if open.samples == 0 && !self.opts.keep_empty_shards {
            debug!(shard = %open.id, "discarding empty shard");
            return Ok(Some(summary));
        }

        let final_path = self.archive_path(open.id);
        let tmp_path = open.tmp_path;

        let buf = open
            .builder
            .into_inner()
            .map_err(Error::write_io(&tmp_path))?;
        let tmp = buf
            .into_inner()
            .map_err(|err| Error::write_io(&tmp_path)(err.into_error()))?;
        tmp.as_file().sync_all().map_err(Error::write_io(&tmp_path))?;

        let persisted = if self.opts.overwrite {
            tmp.persist(&final_path)
        } else {
            tmp.persist_noclobber(&final_path)
        };
        persisted.map_err(|err| Error::write_io(&final_path)(err.error))?;

        info!(
            shard = %summary.id,
            samples = summary.samples,
            bytes = summary.payload_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "shard closed"
        );
        summary.path = Some(final_path);
        Ok(Some(summary))
    }

    /// Drop the open shard without publishing it.
    pub fn abort(&mut self) {
        if let Some(open) = self.open.take() {
            debug!(shard = %open.id, samples = open.samples, "aborting shard");
            // Dropping the builder drops the temp file, which deletes it.
        }
    }
}

fn check_member_names(sample: &Sample) -> Result<()> {
    let mut seen = HashSet::with_capacity(sample.blobs.len() + 1);
    seen.insert("json");
    for blob in &sample.blobs {
        if blob.ext.is_empty() || blob.ext.contains('/') {
            return Err(Error::msg(format!(
                "sample {}: blob '{}' has invalid extension '{}'",
                sample.index, blob.name, blob.ext
            )));
        }
        if !seen.insert(blob.ext.as_str()) {
            return Err(Error::msg(format!(
                "sample {}: duplicate member {}",
                sample.index,
                member_name(sample.index, &blob.ext)
            )));
        }
    }
    Ok(())
}

fn append_sample(open: &mut OpenShard, sample: &Sample, mtime: u64) -> Result<()> {
    let metadata = serde_json::to_vec(&sample.metadata)?;
    append_member(
        open,
        &member_name(sample.index, "json"),
        metadata.len() as u64,
        metadata.as_slice(),
        mtime,
    )?;

    for blob in &sample.blobs {
        let len = blob.data.len().map_err(Error::write_io(&open.tmp_path))?;
        let reader = blob.data.reader().map_err(Error::write_io(&open.tmp_path))?;
        append_member(open, &member_name(sample.index, &blob.ext), len, reader, mtime)?;
    }
    Ok(())
}

fn append_member<R: Read>(
    open: &mut OpenShard,
    name: &str,
    len: u64,
    data: R,
    mtime: u64,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(len);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);

    open.builder
        .append_data(&mut header, name, data)
        .map_err(Error::write_io(&open.tmp_path))?;
    open.payload_bytes += len;
    Ok(())
}
