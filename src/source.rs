//! Pull-based sample supply.
//!
//! A source is a single forward-only cursor over a logical stream of samples. It knows nothing
//! about shards or archives. Sources may block on network I/O; a failed pull surfaces as
//! [`crate::Error::SourceIo`] and is never silently skipped.

mod fetch;
mod manifest;
mod memory;

pub use fetch::Fetcher;
pub use manifest::{ManifestPayload, ManifestRecord, ManifestSource};
pub use memory::MemorySource;

use crate::Result;
use crate::sample::Sample;

/// A forward-only supply of samples.
pub trait SampleSource {
    /// Pull the next sample. `Ok(None)` marks the end of the stream.
    fn next_sample(&mut self) -> Result<Option<Sample>>;

    /// Global index of the next sample this source will yield.
    fn position(&self) -> u64;

    /// Advance past `n` samples without handing them to a writer.
    ///
    /// Returns how many samples were actually skipped; this is less than `n` only when the
    /// stream ends first. The default pulls and discards each sample, which is `O(n)` in wall
    /// time. Sources that can skip without fetching payloads should override it.
    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            let Some(sample) = self.next_sample()? else {
                break;
            };
            sample.discard();
            skipped += 1;
        }
        Ok(skipped)
    }
}

impl<S: SampleSource + ?Sized> SampleSource for &mut S {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        (**self).next_sample()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        (**self).skip(n)
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        (**self).next_sample()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        (**self).skip(n)
    }
}
