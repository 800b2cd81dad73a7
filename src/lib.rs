//! `shardpack`: a resumable streaming shard packager.
//!
//! It consumes an ordered (or grouped) stream of media samples and writes them into
//! deterministically named tar archives of bounded size, with per-sample JSON metadata next to
//! each payload. Runs can be resumed at any shard boundary or split across independent workers
//! without reprocessing or misnumbering samples.
//!
//! This crate provides:
//! - Sample sources (in-memory, JSON-lines manifests with local or remote payloads)
//! - Partitioning (fixed count per shard, or one shard per group key)
//! - An atomic tar shard writer and a Parquet metadata table for keyed shards
//! - Resume/worker-range handling and a run driver with test and estimate modes
//! - A seam for attaching transcriptions to samples as they pass through
//!
//! Most consumers start with [`pack`] (sequential streams) or [`pack_groups`] (pre-indexed
//! groups).

// Errors shared by every module.
pub mod error;

// Configuration and the data model.
pub mod opts;
pub mod sample;

// Input side.
pub mod source;

// Deciding and writing shards.
pub mod partition;
pub mod table;
pub mod writer;

// Running a job.
pub mod driver;
pub mod keyed;
pub mod resume;

// Transcription collaborator support.
pub mod gate;
pub mod retry;
pub mod transcribe;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use driver::{CancelToken, Driver, RunOpts, RunReport, Stage, StopReason, pack};
pub use error::{Error, Result};
pub use keyed::{
    DirStore, GroupBuffer, GroupIndex, KeyedReport, MemberStore, ZipStore, pack_groups,
};
pub use opts::PackOpts;
pub use partition::{KeyAssignment, PartitionPolicy, ShardId};
pub use resume::{ResumePoint, ShardRange};
pub use sample::{Blob, BlobData, Sample};
pub use source::{Fetcher, ManifestSource, MemorySource, SampleSource};
pub use writer::{ShardSummary, ShardWriter, WriterOpts};
