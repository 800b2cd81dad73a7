use std::collections::VecDeque;

use serde_json::Value;

use crate::Result;
use crate::sample::{Blob, Sample};
use crate::source::SampleSource;

/// An in-memory source. Indexes are assigned in insertion order starting at zero.
///
/// Useful for tests, demos, and callers that already hold a batch of samples.
#[derive(Debug, Default)]
pub struct MemorySource {
    pending: VecDeque<Sample>,
    next_index: u64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to the end of the stream and return the index it was given.
    pub fn push(&mut self, metadata: Value, blobs: Vec<Blob>, group_key: Option<String>) -> u64 {
        let index = self.next_index + self.pending.len() as u64;
        self.pending.push_back(Sample {
            index,
            blobs,
            metadata,
            group_key,
        });
        index
    }

    /// Number of samples not yet pulled.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl SampleSource for MemorySource {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let sample = self.pending.pop_front();
        if sample.is_some() {
            self.next_index += 1;
        }
        Ok(sample)
    }

    fn position(&self) -> u64 {
        self.next_index
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let take = n.min(self.pending.len() as u64);
        for sample in self.pending.drain(..take as usize) {
            sample.discard();
        }
        self.next_index += take;
        Ok(take)
    }
}
