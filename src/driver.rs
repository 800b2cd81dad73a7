//! Run driver: Source → Policy → (Stage) → Writer.
//!
//! The loop is synchronous and single-threaded per source: pull, assign, write, repeat. Shard
//! boundaries are decided from strictly increasing sample indexes only, so nothing is ever
//! reordered across a boundary.
//!
//! Bounded modes:
//! - test mode (`sample_cap`): stop after N samples; the truncated shard is still closed and
//!   persisted as a partial shard.
//! - estimate mode (`estimate_shard_count`): stop after N closed shards and report timing.
//! - `end_shard`: stop at the first sample belonging to a shard outside the worker's range.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::opts::PackOpts;
use crate::partition::{PartitionPolicy, ShardId};
use crate::resume::ResumePoint;
use crate::sample::Sample;
use crate::source::SampleSource;
use crate::writer::{ShardSummary, ShardWriter};
use crate::{Error, Result};

/// A per-sample transformation applied between partitioning and writing
/// (e.g. attaching a transcript to the metadata).
///
/// A stage owns the sample it is given; on error it is responsible for discarding it.
pub trait Stage {
    fn process(&mut self, sample: Sample) -> Result<Sample>;
}

/// Driver limits.
#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Stop after this many samples have been written (test mode).
    pub sample_cap: Option<u64>,

    /// Stop after this many shards have been closed (estimate mode).
    pub estimate_shard_count: Option<u64>,

    /// Stop before writing any sample whose shard id is `>= end_shard`.
    pub end_shard: Option<u64>,

    /// Log a progress line every N closed shards. `0` disables progress lines.
    pub progress_every: u64,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            sample_cap: None,
            estimate_shard_count: None,
            end_shard: None,
            progress_every: 5,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    SampleCap,
    EstimateReached,
    EndOfRange,
    Cancelled,
}

/// Outcome of [`Driver::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,

    /// Closed shards in close order. `elapsed` on each is boundary-to-boundary wall time, so it
    /// includes fetching as well as writing.
    pub shards: Vec<ShardSummary>,

    pub samples_written: u64,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl RunReport {
    /// Shards that were persisted (empty shards may have been discarded).
    pub fn persisted(&self) -> impl Iterator<Item = &ShardSummary> {
        self.shards.iter().filter(|s| s.path.is_some())
    }

    /// Mean wall time per closed shard.
    pub fn mean_shard_duration(&self) -> Option<Duration> {
        let n = u32::try_from(self.shards.len()).ok().filter(|n| *n > 0)?;
        let total: Duration = self.shards.iter().map(|s| s.elapsed).sum();
        Some(total / n)
    }

    /// Projected wall time for `total_shards` shards at the measured mean. `None` when nothing
    /// was timed or the projection does not fit in a `Duration`.
    pub fn projected_duration(&self, total_shards: u64) -> Option<Duration> {
        let mean = self.mean_shard_duration()?;
        Duration::try_from_secs_f64(mean.as_secs_f64() * total_shards as f64).ok()
    }
}

const RUNNING: u8 = 0;
const AT_BOUNDARY: u8 = 1;
const NOW: u8 = 2;

/// Cooperative cancellation for a running [`Driver`].
///
/// Clones share state, so a signal handler or another thread can stop the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop cleanly at the next shard boundary. The open shard is finished first.
    pub fn stop_at_boundary(&self) {
        let _ = self
            .0
            .compare_exchange(RUNNING, AT_BOUNDARY, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stop before the next sample. The open shard is dropped unpublished.
    pub fn stop_now(&self) {
        self.0.store(NOW, Ordering::SeqCst);
    }

    fn state(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrates one source into one writer.
pub struct Driver<'a> {
    policy: PartitionPolicy,
    writer: ShardWriter,
    opts: RunOpts,
    cancel: CancelToken,
    stage: Option<Box<dyn Stage + 'a>>,
    on_shard: Option<Box<dyn FnMut(&ShardSummary) + 'a>>,
}

/// Mutable bookkeeping for a single run.
struct RunState {
    last_index: Option<u64>,
    closed: HashSet<ShardId>,
    shard_clock: Instant,
    report: RunReport,
}

impl<'a> Driver<'a> {
    pub fn new(policy: PartitionPolicy, writer: ShardWriter, opts: RunOpts) -> Self {
        Self {
            policy,
            writer,
            opts,
            cancel: CancelToken::new(),
            stage: None,
            on_shard: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Stage + 'a) -> Self {
        self.stage = Some(Box::new(stage));
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Call `f` every time a shard is closed.
    pub fn on_shard_closed(mut self, f: impl FnMut(&ShardSummary) + 'a) -> Self {
        self.on_shard = Some(Box::new(f));
        self
    }

    pub fn writer(&self) -> &ShardWriter {
        &self.writer
    }

    pub fn into_writer(self) -> ShardWriter {
        self.writer
    }

    /// Drain `source` into shards until it ends or a limit is hit.
    ///
    /// Source and write errors abort the open shard (nothing partial is published) and
    /// propagate; they are never retried here.
    pub fn run<S: SampleSource + ?Sized>(&mut self, source: &mut S) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let _enter = span.enter();

        let started = Instant::now();
        let mut state = RunState {
            last_index: None,
            closed: HashSet::new(),
            shard_clock: started,
            report: RunReport {
                run_id,
                shards: Vec::new(),
                samples_written: 0,
                stop: StopReason::Exhausted,
                elapsed: Duration::ZERO,
            },
        };

        let stop = match self.run_loop(source, &mut state) {
            Ok(stop) => stop,
            Err(err) => {
                self.writer.abort();
                warn!(error = %err, samples = state.report.samples_written, "run failed");
                return Err(err);
            }
        };

        let mut report = state.report;
        report.stop = stop;
        report.elapsed = started.elapsed();
        info!(
            stop = ?report.stop,
            shards = report.shards.len(),
            samples = report.samples_written,
            elapsed_s = report.elapsed.as_secs_f64(),
            "run finished"
        );
        Ok(report)
    }

    fn run_loop<S: SampleSource + ?Sized>(
        &mut self,
        source: &mut S,
        state: &mut RunState,
    ) -> Result<StopReason> {
        loop {
            if self.cancel.state() == NOW {
                self.writer.abort();
                return Ok(StopReason::Cancelled);
            }

            if let Some(cap) = self.opts.sample_cap {
                if state.report.samples_written >= cap {
                    self.close_current(state)?;
                    return Ok(StopReason::SampleCap);
                }
            }

            let Some(sample) = source.next_sample()? else {
                self.close_current(state)?;
                return Ok(StopReason::Exhausted);
            };

            if let Some(previous) = state.last_index {
                if sample.index <= previous {
                    let index = sample.index;
                    sample.discard();
                    return Err(Error::OutOfOrder { previous, index });
                }
            }
            state.last_index = Some(sample.index);

            let shard = match self.policy.shard_for(&sample) {
                Ok(shard) => shard,
                Err(err) => {
                    sample.discard();
                    return Err(err);
                }
            };

            if self.opts.end_shard.is_some_and(|end| shard.0 >= end) {
                sample.discard();
                self.close_current(state)?;
                return Ok(StopReason::EndOfRange);
            }

            if self.writer.current() != Some(shard) {
                if self.writer.current().is_some() {
                    self.close_current(state)?;

                    let closed = state.report.shards.len() as u64;
                    if self.opts.estimate_shard_count.is_some_and(|n| closed >= n) {
                        sample.discard();
                        return Ok(StopReason::EstimateReached);
                    }
                    if self.cancel.state() != RUNNING {
                        sample.discard();
                        return Ok(StopReason::Cancelled);
                    }
                }

                if state.closed.contains(&shard) {
                    sample.discard();
                    return Err(Error::msg(format!(
                        "sample {} maps to shard {shard}, which is already closed; \
                         keyed input must arrive grouped (buffer it with GroupBuffer otherwise)",
                        state.last_index.unwrap_or_default()
                    )));
                }

                if let Err(err) = self.writer.open(shard) {
                    sample.discard();
                    return Err(err);
                }
            }

            let sample = match self.stage.as_mut() {
                Some(stage) => stage.process(sample)?,
                None => sample,
            };
            self.writer.add(sample)?;
            state.report.samples_written += 1;
        }
    }

    fn close_current(&mut self, state: &mut RunState) -> Result<()> {
        let Some(mut summary) = self.writer.close()? else {
            return Ok(());
        };

        summary.elapsed = state.shard_clock.elapsed();
        state.shard_clock = Instant::now();
        state.closed.insert(summary.id);

        let closed = state.report.shards.len() as u64 + 1;
        if self.opts.progress_every > 0 && closed % self.opts.progress_every == 0 {
            info!(
                shards = closed,
                samples = state.report.samples_written,
                last_shard = %summary.id,
                last_shard_s = summary.elapsed.as_secs_f64(),
                "progress"
            );
        }

        if let Some(on_shard) = self.on_shard.as_mut() {
            on_shard(&summary);
        }
        state.report.shards.push(summary);
        Ok(())
    }
}

/// Run a sequential (fixed-count) pack described by `opts`: validate, resume, drive.
///
/// `stage` is applied to every sample before it is written.
pub fn pack<S: SampleSource + ?Sized>(
    source: &mut S,
    opts: &PackOpts,
    stage: Option<&mut dyn Stage>,
    cancel: Option<CancelToken>,
    on_shard: Option<&mut dyn FnMut(&ShardSummary)>,
) -> Result<RunReport> {
    opts.validate()?;

    let resume = ResumePoint::new(opts.start_shard_id, opts.capacity)?;
    if opts.verify_resume {
        resume.apply_verified(source, &opts.output_dir)?;
    } else {
        resume.apply(source)?;
    }

    let writer = ShardWriter::new(&opts.output_dir, opts.writer_opts())?;
    let mut driver = Driver::new(opts.policy()?, writer, opts.run_opts());
    if let Some(stage) = stage {
        driver = driver.with_stage(StageRef(stage));
    }
    if let Some(cancel) = cancel {
        driver = driver.with_cancel_token(cancel);
    }
    if let Some(on_shard) = on_shard {
        driver = driver.on_shard_closed(on_shard);
    }
    driver.run(source)
}

struct StageRef<'s>(&'s mut dyn Stage);

impl Stage for StageRef<'_> {
    fn process(&mut self, sample: Sample) -> Result<Sample> {
        self.0.process(sample)
    }
}
