//! JSON-lines manifest source.
//!
//! Each non-blank line describes one sample:
//!
//! ```json
//! {"metadata": {"title": "..."}, "group_key": "bowling", "payload": [{"name": "video", "ext": "mp4", "uri": "clips/0001.mp4"}]}
//! ```
//!
//! Payload URIs are resolved lazily by a [`Fetcher`] when the sample is pulled, so skipping
//! only has to read lines.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sample::{Blob, Sample};
use crate::source::{Fetcher, SampleSource};
use crate::{Error, Result};

/// One manifest line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub group_key: Option<String>,

    #[serde(default)]
    pub payload: Vec<ManifestPayload>,
}

/// A payload member reference inside a manifest line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub name: String,
    pub ext: String,
    pub uri: String,
}

/// A [`SampleSource`] over a JSON-lines manifest.
pub struct ManifestSource<R> {
    reader: R,
    fetcher: Fetcher,
    line_no: u64,
    next_index: u64,
    buf: String,

    /// Parsed record whose payloads have not been fetched yet. Kept across a failed fetch so
    /// a retry yields the same sample under the same index.
    pending: Option<ManifestRecord>,
}

impl ManifestSource<Box<dyn BufRead>> {
    /// Open a manifest file, or stdin when `path` is `-`.
    pub fn open(path: impl AsRef<Path>, fetcher: Fetcher) -> Result<Self> {
        let path = path.as_ref();
        let reader: Box<dyn BufRead> = if path == Path::new("-") {
            Box::new(io::stdin().lock())
        } else {
            let file = File::open(path)
                .map_err(Error::source_io(format!("opening manifest {}", path.display())))?;
            Box::new(BufReader::new(file))
        };
        Ok(Self::new(reader, fetcher))
    }
}

impl<R: BufRead> ManifestSource<R> {
    pub fn new(reader: R, fetcher: Fetcher) -> Self {
        Self {
            reader,
            fetcher,
            line_no: 0,
            next_index: 0,
            buf: String::new(),
            pending: None,
        }
    }

    /// Advance to the next non-blank line, leaving it in `self.buf`.
    fn advance_line(&mut self) -> Result<bool> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_line(&mut self.buf)
                .map_err(Error::source_io(format!("reading manifest line {}", self.line_no + 1)))?;
            if n == 0 {
                return Ok(false);
            }
            self.line_no += 1;
            if !self.buf.trim().is_empty() {
                return Ok(true);
            }
        }
    }

    fn materialize(&self, index: u64, record: &ManifestRecord) -> Result<Sample> {
        let mut exts = HashSet::with_capacity(record.payload.len());
        if let Some(dup) = record.payload.iter().find(|p| !exts.insert(p.ext.as_str())) {
            return Err(Error::Malformed {
                line: self.line_no,
                message: format!("duplicate payload extension '{}'", dup.ext),
            });
        }

        let mut blobs = Vec::with_capacity(record.payload.len());
        for payload in &record.payload {
            let stage_name = format!("{index:016}.{}.{}", payload.name, payload.ext);
            match self.fetcher.fetch(&payload.uri, &stage_name) {
                Ok(data) => blobs.push(Blob {
                    name: payload.name.clone(),
                    ext: payload.ext.clone(),
                    data,
                }),
                Err(err) => {
                    // Don't leak staging copies of the members we already fetched.
                    for blob in &blobs {
                        blob.data.remove_staged();
                    }
                    return Err(err);
                }
            }
        }

        Ok(Sample {
            index,
            blobs,
            metadata: record.metadata.clone(),
            group_key: record.group_key.clone(),
        })
    }
}

impl<R: BufRead> SampleSource for ManifestSource<R> {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let record = match self.pending.take() {
            Some(record) => record,
            None => {
                if !self.advance_line()? {
                    return Ok(None);
                }
                serde_json::from_str(self.buf.trim()).map_err(|err| Error::Malformed {
                    line: self.line_no,
                    message: err.to_string(),
                })?
            }
        };

        let index = self.next_index;
        match self.materialize(index, &record) {
            Ok(sample) => {
                self.next_index += 1;
                Ok(Some(sample))
            }
            Err(err) => {
                self.pending = Some(record);
                Err(err)
            }
        }
    }

    fn position(&self) -> u64 {
        self.next_index
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        if n > 0 && self.pending.take().is_some() {
            skipped += 1;
        }
        while skipped < n && self.advance_line()? {
            skipped += 1;
        }
        self.next_index += skipped;
        Ok(skipped)
    }
}
