//! Keyed (grouped) packaging: one shard per categorical group.
//!
//! Two ways in:
//! - [`pack_groups`] walks a pre-scanned [`GroupIndex`]. Group completeness is known up front,
//!   so each group is opened, filled from a [`MemberStore`], closed, and its metadata table
//!   written, one after another.
//! - [`GroupBuffer`] handles fully streamed keyed input: samples are buffered per key and a
//!   key is flushed into its shard only when the caller says it is exhausted.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::partition::{KeyAssignment, ShardId};
use crate::resume::ShardRange;
use crate::sample::{BlobData, Sample};
use crate::table::{MetadataTable, TableRow};
use crate::writer::{ShardSummary, ShardWriter};
use crate::{Error, Result};

/// Pre-built index mapping each group to its ordered members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupIndex {
    /// Recorded in every member's metadata and table row.
    pub original_dataset: String,
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    /// Shard id for this group.
    pub id: u64,

    /// Categorical label (e.g. a class name).
    pub label: String,

    /// Caption stored with each member. Defaults to the label.
    #[serde(default)]
    pub caption: Option<String>,

    pub members: Vec<MemberEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Location of the payload inside the member store.
    pub path: String,

    pub original_split: String,

    #[serde(default)]
    pub original_metadata: Value,
}

impl GroupIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(Error::source_io(format!("opening group index {}", path.display())))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| Error::Malformed {
            line: err.line() as u64,
            message: format!("{}: {err}", path.display()),
        })
    }

    /// Frozen key assignment (label → id). Fails on duplicate labels or ids.
    pub fn assignment(&self) -> Result<KeyAssignment> {
        KeyAssignment::declared(self.groups.iter().map(|g| (g.label.clone(), g.id)))
    }

    pub fn member_count(&self) -> u64 {
        self.groups.iter().map(|g| g.members.len() as u64).sum()
    }
}

impl GroupEntry {
    pub fn caption(&self) -> &str {
        self.caption.as_deref().unwrap_or(&self.label)
    }
}

/// Random-access store holding group members.
pub trait MemberStore {
    /// Resolve `path` into blob data. `Ok(None)` means the member does not exist.
    fn fetch_member(&mut self, path: &str) -> Result<Option<BlobData>>;
}

/// A [`MemberStore`] over a directory tree (e.g. an unpacked dataset archive).
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MemberStore for DirStore {
    fn fetch_member(&mut self, path: &str) -> Result<Option<BlobData>> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::Schema {
                group: String::new(),
                message: format!("member path escapes the store root: {path}"),
            });
        }

        let full = self.root.join(rel);
        Ok(full.is_file().then_some(BlobData::File(full)))
    }
}

/// A [`MemberStore`] reading members straight out of a zip archive, without unpacking it.
///
/// Member paths are archive entry names. Members are read fully into memory.
pub struct ZipStore<R> {
    archive: ZipArchive<R>,
}

impl ZipStore<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(Error::source_io(format!("opening zip {}", path.display())))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> ZipStore<R> {
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader)
            .map_err(|err| Error::source_io("reading zip directory")(io::Error::from(err)))?;
        Ok(Self { archive })
    }

    /// Copy every non-video file entry (index CSVs, category lists, ...) into `out_dir` under
    /// its base name. Returns the written paths in archive order.
    pub fn copy_sidecars(&mut self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for i in 0..self.archive.len() {
            let mut entry = self
                .archive
                .by_index(i)
                .map_err(|err| Error::source_io(format!("zip entry {i}"))(io::Error::from(err)))?;
            if entry.is_dir() || entry.name().ends_with(".mp4") {
                continue;
            }
            let Some(base) = entry
                .enclosed_name()
                .and_then(|p| p.file_name().map(|n| n.to_owned()))
            else {
                warn!(entry = entry.name(), "skipping sidecar with an unsafe name");
                continue;
            };

            let dest = out_dir.join(base);
            let mut tmp = tempfile::Builder::new()
                .prefix(".sidecar.")
                .suffix(".part")
                .tempfile_in(out_dir)
                .map_err(Error::write_io(out_dir))?;
            io::copy(&mut entry, tmp.as_file_mut())
                .map_err(Error::source_io(format!("reading zip entry {}", entry.name())))?;
            tmp.as_file().sync_all().map_err(Error::write_io(tmp.path()))?;
            tmp.persist(&dest)
                .map_err(|err| Error::write_io(&dest)(err.error))?;

            debug!(entry = entry.name(), dest = %dest.display(), "copied sidecar");
            written.push(dest);
        }
        Ok(written)
    }
}

impl<R: Read + Seek> MemberStore for ZipStore<R> {
    fn fetch_member(&mut self, path: &str) -> Result<Option<BlobData>> {
        let mut entry = match self.archive.by_name(path) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => {
                return Err(Error::source_io(format!("zip member {path}"))(io::Error::from(err)));
            }
        };
        let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut buf)
            .map_err(Error::source_io(format!("reading zip member {path}")))?;
        Ok(Some(BlobData::Bytes(buf)))
    }
}

/// Per-group outcome of [`pack_groups`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub id: ShardId,
    pub label: String,
    pub expected: u64,
    pub extracted: u64,
    pub failures: u64,
    pub archive: Option<PathBuf>,
    pub table: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyedReport {
    pub groups: Vec<GroupReport>,
}

impl KeyedReport {
    pub fn extracted(&self) -> u64 {
        self.groups.iter().map(|g| g.extracted).sum()
    }

    pub fn failures(&self) -> u64 {
        self.groups.iter().map(|g| g.failures).sum()
    }
}

/// Package every group of `index` whose id falls in `range`, one shard per group.
///
/// Per member, the archive gets `{index:016}.json` (metadata), `{index:016}.mp4` (payload)
/// and `{index:016}.txt` (caption with `+` replaced by spaces). `index` is the member's
/// position in the whole index, so names do not depend on which worker packs which range.
///
/// A member missing from the store is a schema error: counted, logged, and skipped. Any other
/// error aborts the open shard and fails the run.
pub fn pack_groups<M: MemberStore + ?Sized>(
    index: &GroupIndex,
    store: &mut M,
    writer: &mut ShardWriter,
    range: ShardRange,
) -> Result<KeyedReport> {
    // Validates that labels and ids are unique before anything is written.
    index.assignment()?;

    let mut report = KeyedReport::default();
    let mut first_index = 0u64;

    for group in &index.groups {
        let group_first = first_index;
        first_index += group.members.len() as u64;

        let id = ShardId(group.id);
        if !range.contains(id) {
            continue;
        }

        info!(shard = %id, label = %group.label, members = group.members.len(), "packing group");
        match pack_group(index, group, group_first, store, writer) {
            Ok(group_report) => report.groups.push(group_report),
            Err(err) => {
                writer.abort();
                return Err(err);
            }
        }
    }

    info!(
        groups = report.groups.len(),
        extracted = report.extracted(),
        failures = report.failures(),
        "keyed packing finished"
    );
    Ok(report)
}

fn pack_group<M: MemberStore + ?Sized>(
    index: &GroupIndex,
    group: &GroupEntry,
    first_index: u64,
    store: &mut M,
    writer: &mut ShardWriter,
) -> Result<GroupReport> {
    let id = ShardId(group.id);
    let caption = group.caption();
    let caption_text = caption.replace('+', " ");

    writer.open(id)?;
    let mut table = MetadataTable::new();
    let mut failures = 0u64;

    for (offset, member) in group.members.iter().enumerate() {
        let sample_index = first_index + offset as u64;

        let data = match store.fetch_member(&member.path) {
            Ok(Some(data)) => data,
            Ok(None) => {
                failures += 1;
                let err = Error::Schema {
                    group: group.label.clone(),
                    message: format!("member {} missing from store", member.path),
                };
                warn!(shard = %id, error = %err, failures, "skipping member");
                continue;
            }
            Err(Error::Schema { message, .. }) => {
                failures += 1;
                warn!(shard = %id, group = %group.label, %message, failures, "skipping member");
                continue;
            }
            Err(err) => return Err(err),
        };

        let key = format!("{sample_index:016}");
        let metadata = json!({
            "key": key,
            "status": "success",
            "error_message": null,
            "caption": caption,
            "original_dataset": index.original_dataset,
            "original_split": member.original_split,
            "original_metadata": member.original_metadata,
        });

        let sample = Sample::new(sample_index, metadata)
            .with_group_key(group.label.clone())
            .with_blob("video", "mp4", data)
            .with_blob("caption", "txt", BlobData::Bytes(caption_text.clone().into_bytes()));
        writer.add(sample)?;

        table.push(TableRow {
            key,
            status: "success".to_owned(),
            error_message: None,
            caption: caption.to_owned(),
            original_dataset: index.original_dataset.clone(),
            original_split: member.original_split.clone(),
            original_metadata: member.original_metadata.clone(),
        });
    }

    let summary = writer
        .close()?
        .ok_or_else(|| Error::msg(format!("shard {id} was not open at close")))?;

    // The table is only written next to a persisted archive.
    let table_path = match &summary.path {
        Some(_) => {
            let path = writer.output_dir().join(id.table_name());
            table.write_parquet(&path)?;
            Some(path)
        }
        None => None,
    };

    Ok(GroupReport {
        id,
        label: group.label.clone(),
        expected: group.members.len() as u64,
        extracted: table.len() as u64,
        failures,
        archive: summary.path,
        table: table_path,
    })
}

/// Buffers streamed keyed samples until their group is declared complete.
///
/// Staged payloads of buffered samples stay on disk until the group is flushed; dropping the
/// buffer discards whatever is still pending.
#[derive(Debug, Default)]
pub struct GroupBuffer {
    assignment: KeyAssignment,
    pending: BTreeMap<ShardId, Vec<Sample>>,
    flushed: HashSet<ShardId>,
}

impl GroupBuffer {
    pub fn new(assignment: KeyAssignment) -> Self {
        Self {
            assignment,
            pending: BTreeMap::new(),
            flushed: HashSet::new(),
        }
    }

    /// Buffer `sample` under its group and return the group's shard id.
    pub fn push(&mut self, sample: Sample) -> Result<ShardId> {
        let resolved = match sample.group_key.as_deref() {
            Some(key) => self.assignment.resolve(key),
            None => Err(Error::Schema {
                group: String::new(),
                message: format!("sample {} has no group key", sample.index),
            }),
        };
        let id = match resolved {
            Ok(id) => id,
            Err(err) => {
                sample.discard();
                return Err(err);
            }
        };

        if self.flushed.contains(&id) {
            let key = sample.group_key.clone().unwrap_or_default();
            sample.discard();
            return Err(Error::Schema {
                group: key,
                message: format!("sample arrived after shard {id} was flushed"),
            });
        }

        self.pending.entry(id).or_default().push(sample);
        Ok(id)
    }

    /// Number of samples waiting to be flushed.
    pub fn pending_samples(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Flush the group `key` into its own shard. Returns `Ok(None)` for a key never seen.
    pub fn finish_group(&mut self, key: &str, writer: &mut ShardWriter) -> Result<Option<ShardSummary>> {
        let Some(id) = self.assignment.get(key) else {
            return Ok(None);
        };
        self.flush(id, writer)
    }

    /// Flush every pending group in shard id order.
    pub fn finish_all(&mut self, writer: &mut ShardWriter) -> Result<Vec<ShardSummary>> {
        let ids: Vec<ShardId> = self.pending.keys().copied().collect();
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(summary) = self.flush(id, writer)? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    fn flush(&mut self, id: ShardId, writer: &mut ShardWriter) -> Result<Option<ShardSummary>> {
        let Some(mut samples) = self.pending.remove(&id) else {
            return Ok(None);
        };
        self.flushed.insert(id);
        samples.sort_by_key(|s| s.index);

        if let Err(err) = writer.open(id) {
            samples.into_iter().for_each(Sample::discard);
            return Err(err);
        }

        let mut samples = samples.into_iter();
        while let Some(sample) = samples.next() {
            if let Err(err) = writer.add(sample) {
                samples.for_each(Sample::discard);
                writer.abort();
                return Err(err);
            }
        }
        writer.close()
    }
}

impl Drop for GroupBuffer {
    fn drop(&mut self) {
        for (_, samples) in std::mem::take(&mut self.pending) {
            samples.into_iter().for_each(Sample::discard);
        }
    }
}
