//! The unit of work flowing through the packager.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

/// One sample pulled from a [`crate::source::SampleSource`].
///
/// `index` is global, zero-based and assigned by the source in pull order. Everything
/// downstream (shard assignment, member names) derives from it, so a sample is never
/// re-indexed after it leaves the source.
#[derive(Debug)]
pub struct Sample {
    pub index: u64,
    pub blobs: Vec<Blob>,
    pub metadata: Value,
    pub group_key: Option<String>,
}

/// A named payload member, archived as `{index:016}.{ext}`.
#[derive(Debug)]
pub struct Blob {
    /// Logical role (e.g. `"video"`, `"audio"`, `"caption"`).
    pub name: String,

    /// File extension used for the archive member (e.g. `"mp4"`, `"m4a"`, `"txt"`).
    pub ext: String,

    pub data: BlobData,
}

/// Where a blob's bytes live until they are archived.
#[derive(Debug)]
pub enum BlobData {
    /// Held in memory.
    Bytes(Vec<u8>),

    /// An external file. Streamed into the archive and left in place.
    File(PathBuf),

    /// A transient staging copy owned by the sample.
    ///
    /// The writer removes it as soon as it has been archived, and [`Sample::discard`]
    /// removes it for samples that never reach a writer, so local disk usage stays bounded
    /// no matter how long the stream is.
    Staged(PathBuf),
}

impl Sample {
    pub fn new(index: u64, metadata: Value) -> Self {
        Self {
            index,
            blobs: Vec::new(),
            metadata,
            group_key: None,
        }
    }

    pub fn with_blob(mut self, name: impl Into<String>, ext: impl Into<String>, data: BlobData) -> Self {
        self.blobs.push(Blob {
            name: name.into(),
            ext: ext.into(),
            data,
        });
        self
    }

    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    /// Find a blob by its logical name.
    pub fn blob(&self, name: &str) -> Option<&Blob> {
        self.blobs.iter().find(|b| b.name == name)
    }

    /// Drop the sample without archiving it, removing any staged payload copies.
    pub fn discard(self) {
        for blob in self.blobs {
            blob.data.remove_staged();
        }
    }
}

impl BlobData {
    /// Size in bytes, reading file metadata when needed.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            BlobData::Bytes(bytes) => Ok(bytes.len() as u64),
            BlobData::File(path) | BlobData::Staged(path) => Ok(fs::metadata(path)?.len()),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Open a reader over the blob's bytes.
    pub fn reader(&self) -> io::Result<Box<dyn Read + '_>> {
        match self {
            BlobData::Bytes(bytes) => Ok(Box::new(bytes.as_slice())),
            BlobData::File(path) | BlobData::Staged(path) => Ok(Box::new(File::open(path)?)),
        }
    }

    /// Read the whole blob into memory.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        match self {
            BlobData::Bytes(bytes) => Ok(bytes.clone()),
            BlobData::File(path) | BlobData::Staged(path) => fs::read(path),
        }
    }

    /// Remove the staging copy, if this blob owns one. Best-effort.
    pub(crate) fn remove_staged(&self) {
        if let BlobData::Staged(path) = self {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove staged payload");
                }
            }
        }
    }
}
