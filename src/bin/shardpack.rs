// Command-line front end for shardpack: sequential packing from a JSON-lines manifest, and
// keyed packing from a pre-built group index.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use shardpack::logging;
use shardpack::{
    DirStore, Fetcher, GroupIndex, KeyedReport, ManifestSource, PackOpts, RunReport,
    ShardRange, ShardSummary, ShardWriter, WriterOpts, ZipStore, pack, pack_groups,
};

#[derive(Parser, Debug)]
#[command(name = "shardpack")]
#[command(about = "Pack media sample streams into resumable tar shards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack a manifest into fixed-size shards.
    Pack(PackArgs),

    /// Pack a group index into one shard (plus metadata table) per group.
    Groups(GroupsArgs),
}

#[derive(Args, Debug)]
struct PackArgs {
    /// JSON-lines manifest, or `-` for stdin.
    #[arg(long)]
    manifest: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    /// Samples per shard. Every worker of a job must use the same value.
    #[arg(long, default_value_t = 10)]
    per_shard: u64,

    /// First shard to write (resume point).
    #[arg(long, default_value_t = 0)]
    start_shard: u64,

    /// Exclusive last shard.
    #[arg(long)]
    end_shard: Option<u64>,

    /// This worker's rank; derives the shard range from --world-size and --total-shards.
    #[arg(
        long,
        requires = "world_size",
        conflicts_with_all = ["start_shard", "end_shard"]
    )]
    worker_rank: Option<u64>,

    #[arg(long, requires = "worker_rank", requires = "total_shards")]
    world_size: Option<u64>,

    /// Total shards in the job. Also used to project the full run time in estimate mode.
    #[arg(long)]
    total_shards: Option<u64>,

    /// Stop after this many samples (test mode). Ignored with --download-all or --estimate.
    #[arg(long, default_value_t = 1000)]
    max_samples: u64,

    /// Consume the whole stream.
    #[arg(long)]
    download_all: bool,

    /// Time the first few shards and exit.
    #[arg(long)]
    estimate: bool,

    /// Shards to time in estimate mode.
    #[arg(long, default_value_t = 10)]
    estimate_shards: u64,

    /// Where remote payloads are downloaded (default: <output-dir>/.staging).
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Replace existing archives.
    #[arg(long)]
    overwrite: bool,

    /// Keep archives of shards that end up empty.
    #[arg(long)]
    keep_empty: bool,

    /// Check the previous shard against the upstream before resuming.
    #[arg(long)]
    verify_resume: bool,
}

#[derive(Args, Debug)]
struct GroupsArgs {
    /// Group index (JSON).
    #[arg(long)]
    index: PathBuf,

    /// Directory holding the members named in the index.
    #[arg(long, required_unless_present = "zip", conflicts_with = "zip")]
    root: Option<PathBuf>,

    /// Zip archive holding the members named in the index. Its non-video files are copied
    /// into the output dir.
    #[arg(long)]
    zip: Option<PathBuf>,

    #[arg(long)]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 0)]
    start_shard: u64,

    #[arg(long)]
    end_shard: Option<u64>,

    #[arg(long)]
    overwrite: bool,

    #[arg(long)]
    keep_empty: bool,
}

fn main() -> Result<()> {
    logging::init();

    match Cli::parse().command {
        Command::Pack(args) => run_pack(&args),
        Command::Groups(args) => run_groups(&args),
    }
}

fn run_pack(args: &PackArgs) -> Result<()> {
    let range = shard_range(args)?;
    if range.is_empty() {
        println!("nothing to do: worker owns no shards");
        return Ok(());
    }

    let opts = pack_opts(args, range);
    let mut fetcher = Fetcher::new(opts.staging_dir())
        .with_context(|| format!("failed to create staging dir: {}", opts.staging_dir().display()))?;
    if args.manifest != Path::new("-") {
        if let Some(parent) = args.manifest.parent() {
            fetcher = fetcher.with_base_dir(parent);
        }
    }
    let mut source = ManifestSource::open(&args.manifest, fetcher)
        .with_context(|| format!("failed to open manifest: {}", args.manifest.display()))?;

    let expected_shards = if args.estimate {
        Some(args.estimate_shards)
    } else {
        range.end.map(|end| end - range.start)
    };
    let pb = progress_bar(expected_shards);
    let mut on_shard = |summary: &ShardSummary| {
        pb.inc(1);
        pb.set_message(format!("shard {} ({} samples)", summary.id, summary.samples));
    };

    let on_shard: &mut dyn FnMut(&ShardSummary) = &mut on_shard;
    let result = pack(&mut source, &opts, None, None, Some(on_shard));
    pb.finish_and_clear();
    let report = result.context("packing failed")?;

    print!("{}", run_summary(&report));
    if args.estimate {
        print!("{}", estimate_summary(&report, args.total_shards));
    }
    Ok(())
}

fn run_groups(args: &GroupsArgs) -> Result<()> {
    let index = GroupIndex::load(&args.index)
        .with_context(|| format!("failed to load group index: {}", args.index.display()))?;
    let range = ShardRange::new(args.start_shard, args.end_shard)?;
    let mut writer = ShardWriter::new(
        &args.output_dir,
        WriterOpts {
            overwrite: args.overwrite,
            keep_empty_shards: args.keep_empty,
            ..WriterOpts::default()
        },
    )
    .with_context(|| format!("failed to create output dir: {}", args.output_dir.display()))?;

    let report = match (&args.zip, &args.root) {
        (Some(zip), _) => {
            let mut store = ZipStore::open(zip)
                .with_context(|| format!("failed to open zip: {}", zip.display()))?;
            let sidecars = store
                .copy_sidecars(&args.output_dir)
                .context("failed to copy metadata files")?;
            println!("copied {} metadata files", sidecars.len());
            pack_groups(&index, &mut store, &mut writer, range)
        }
        (None, Some(root)) => pack_groups(&index, &mut DirStore::new(root), &mut writer, range),
        (None, None) => anyhow::bail!("one of --root or --zip is required"),
    }
    .context("packing failed")?;
    print!("{}", groups_summary(&report));
    Ok(())
}

fn shard_range(args: &PackArgs) -> Result<ShardRange> {
    match (args.worker_rank, args.world_size, args.total_shards) {
        (Some(rank), Some(world), Some(total)) => Ok(ShardRange::for_worker(rank, world, total)?),
        (Some(_), _, _) => anyhow::bail!("--worker-rank needs --world-size and --total-shards"),
        _ => Ok(ShardRange::new(args.start_shard, args.end_shard)?),
    }
}

fn pack_opts(args: &PackArgs, range: ShardRange) -> PackOpts {
    let mut opts = PackOpts::new(&args.output_dir);
    opts.capacity = args.per_shard;
    opts.start_shard_id = range.start;
    opts.end_shard_id = range.end;
    opts.sample_cap = (!args.estimate).then_some(args.max_samples);
    opts.force_download_all = args.download_all;
    opts.estimate_shard_count = args.estimate.then_some(args.estimate_shards);
    opts.keep_empty_shards = args.keep_empty;
    opts.overwrite = args.overwrite;
    opts.verify_resume = args.verify_resume;
    opts.staging_dir = args.staging_dir.clone();
    opts
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    let (pb, template) = match total {
        Some(total) => (
            ProgressBar::new(total),
            "{spinner:.green} {pos}/{len} shards {bar:40.cyan/blue} {eta} {msg}",
        ),
        None => (ProgressBar::new_spinner(), "{spinner:.green} {pos} shards {msg}"),
    };
    pb.set_style(
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

fn run_summary(report: &RunReport) -> String {
    let persisted = report.persisted().count();
    format!(
        "✅ run {}: {} shards ({} persisted), {} samples, stopped: {:?}, took {:.1?}\n",
        report.run_id,
        report.shards.len(),
        persisted,
        report.samples_written,
        report.stop,
        report.elapsed,
    )
}

fn estimate_summary(report: &RunReport, total_shards: Option<u64>) -> String {
    let mut out = String::new();
    for shard in &report.shards {
        out.push_str(&format!("  shard {}: {:.2?}\n", shard.id, shard.elapsed));
    }
    match report.mean_shard_duration() {
        Some(mean) => out.push_str(&format!("mean per shard: {mean:.2?}\n")),
        None => out.push_str("no shards closed, nothing to estimate\n"),
    }
    if let Some(projected) = total_shards.and_then(|t| report.projected_duration(t)) {
        out.push_str(&format!(
            "projected for {} shards: {:.1} h\n",
            total_shards.unwrap_or_default(),
            projected.as_secs_f64() / 3600.0
        ));
    }
    out
}

fn groups_summary(report: &KeyedReport) -> String {
    let mut out = String::new();
    for group in &report.groups {
        out.push_str(&format!(
            "  {} {}: {}/{} extracted, {} failed\n",
            group.id, group.label, group.extracted, group.expected, group.failures
        ));
    }
    out.push_str(&format!(
        "✅ {} groups, {} extracted, {} failed\n",
        report.groups.len(),
        report.extracted(),
        report.failures()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardpack::ShardId;
    use std::time::Duration;

    fn parse_pack(args: &[&str]) -> PackArgs {
        let mut argv = vec!["shardpack", "pack", "--manifest", "m.jsonl", "--output-dir", "out"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).expect("parse pack args").command {
            Command::Pack(args) => args,
            Command::Groups(_) => panic!("expected pack"),
        }
    }

    #[test]
    fn pack_defaults() {
        let args = parse_pack(&[]);
        let range = shard_range(&args).expect("range");
        let opts = pack_opts(&args, range);
        assert_eq!(opts.capacity, 10);
        assert_eq!(opts.start_shard_id, 0);
        assert_eq!(opts.effective_sample_cap(), Some(1000));
        assert_eq!(opts.estimate_shard_count, None);

        let args = parse_pack(&["--download-all", "--estimate"]);
        let opts = pack_opts(&args, shard_range(&args).expect("range"));
        assert_eq!(opts.effective_sample_cap(), None);
        assert_eq!(opts.estimate_shard_count, Some(10));
    }

    #[test]
    fn estimate_mode_is_not_cut_short_by_the_sample_cap() {
        let args = parse_pack(&["--per-shard", "200", "--estimate"]);
        let opts = pack_opts(&args, shard_range(&args).expect("range"));
        assert_eq!(opts.effective_sample_cap(), None);
        assert_eq!(opts.estimate_shard_count, Some(10));
        assert_eq!(opts.capacity, 200);
    }

    #[test]
    fn worker_flags_derive_the_shard_range() {
        let args = parse_pack(&["--worker-rank", "1", "--world-size", "3", "--total-shards", "10"]);
        let range = shard_range(&args).expect("range");
        assert_eq!(range, ShardRange { start: 4, end: Some(7) });

        let opts = pack_opts(&args, range);
        assert_eq!((opts.start_shard_id, opts.end_shard_id), (4, Some(7)));
    }

    #[test]
    fn worker_rank_requires_world_size() {
        let err = Cli::try_parse_from([
            "shardpack", "pack", "--manifest", "m", "--output-dir", "o", "--worker-rank", "0",
        ])
        .err()
        .expect("expected missing-args error");
        assert!(err.to_string().contains("--world-size"));

        assert!(
            Cli::try_parse_from([
                "shardpack", "pack", "--manifest", "m", "--output-dir", "o", "--worker-rank",
                "0", "--world-size", "2", "--total-shards", "4", "--start-shard", "1",
            ])
            .is_err()
        );
    }

    #[test]
    fn groups_requires_index_and_root() {
        let err = Cli::try_parse_from(["shardpack", "groups", "--output-dir", "o"])
            .err()
            .expect("expected missing-args error");
        assert!(err.to_string().contains("--index"));
    }

    #[test]
    fn groups_takes_either_a_root_or_a_zip() {
        let base = ["shardpack", "groups", "--index", "i.json", "--output-dir", "o"];
        let parse = |extra: &[&str]| Cli::try_parse_from(base.iter().chain(extra));

        match parse(&["--zip", "raw.zip"]).expect("zip only").command {
            Command::Groups(args) => {
                assert_eq!(args.zip.as_deref(), Some(Path::new("raw.zip")));
                assert!(args.root.is_none());
            }
            Command::Pack(_) => panic!("expected groups"),
        }
        assert!(parse(&["--root", "data"]).is_ok());
        assert!(parse(&[]).is_err());
        assert!(parse(&["--root", "data", "--zip", "raw.zip"]).is_err());
    }

    #[test]
    fn estimate_summary_projects_total_time() {
        let shard = |id, secs| ShardSummary {
            id: ShardId(id),
            samples: 10,
            payload_bytes: 0,
            path: None,
            elapsed: Duration::from_secs(secs),
        };
        let report = RunReport {
            run_id: uuid::Uuid::nil(),
            shards: vec![shard(0, 10), shard(1, 30)],
            samples_written: 20,
            stop: shardpack::StopReason::EstimateReached,
            elapsed: Duration::from_secs(40),
        };

        let out = estimate_summary(&report, Some(360));
        assert!(out.contains("mean per shard: 20.00s"), "{out}");
        assert!(out.contains("projected for 360 shards: 2.0 h"), "{out}");
    }
}
