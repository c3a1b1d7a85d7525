use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};

use anyhow::{bail, Context};
use bucketmap_rs::config::{
    BucketmapConfig, CacheOverrides, ConfigOverrides, JobOverrides, SinkOverrides,
};
use bucketmap_rs::{
    prepare_cache, AggregationJob, BucketRegistry, DistributionCache, FragmentRecord, RocksTable,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  bucketmap setup --buckets <names.json> --datasources <datasources.json> [--config <file>] [--cache-root <dir>] [--no-broadcast]
  bucketmap aggregate --input <records.jsonl> [--config <file>] [--cache-root <dir>] [--workers <n>] [--sink <dir>] [--keep-work-dir] [--no-broadcast]
  bucketmap list [--config <file>] [--cache-root <dir>]";

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn load_config() -> anyhow::Result<BucketmapConfig> {
    let workers = parse_arg("--workers")
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("--workers must be a positive integer")?;
    let overrides = ConfigOverrides {
        cache: parse_arg("--cache-root").map(|root| CacheOverrides {
            root: Some(root.into()),
        }),
        job: Some(JobOverrides {
            workers,
            keep_work_dir: has_flag("--keep-work-dir").then_some(true),
            broadcast: has_flag("--no-broadcast").then_some(false),
            ..Default::default()
        }),
        sink: parse_arg("--sink").map(|path| SinkOverrides {
            path: Some(path.into()),
        }),
    };
    Ok(BucketmapConfig::load(
        parse_arg("--config").as_deref(),
        overrides,
    )?)
}

fn run_setup(config: &BucketmapConfig) -> anyhow::Result<()> {
    let buckets_path = parse_arg("--buckets").context("setup requires --buckets")?;
    let datasources_path = parse_arg("--datasources").context("setup requires --datasources")?;

    let names: Vec<String> = serde_json::from_str(
        &fs::read_to_string(&buckets_path).with_context(|| format!("reading {buckets_path}"))?,
    )
    .with_context(|| format!("parsing bucket names in {buckets_path}"))?;
    let datasources: BTreeMap<u32, String> = serde_json::from_str(
        &fs::read_to_string(&datasources_path)
            .with_context(|| format!("reading {datasources_path}"))?,
    )
    .with_context(|| format!("parsing datasources in {datasources_path}"))?;

    let mut broadcast = DistributionCache::new();
    let summary = prepare_cache(
        &config.cache,
        names,
        datasources,
        config.job.broadcast.then_some(&mut broadcast),
    )?;
    for (name, index) in &summary.buckets {
        println!("{index}\t{name}");
    }
    println!(
        "wrote {} and {} ({} datasources)",
        summary.bucket_snapshot.display(),
        summary.datasource_table.display(),
        summary.datasources
    );
    for file in broadcast.files() {
        println!("broadcast {}", file.display());
    }
    Ok(())
}

fn run_aggregate(config: &BucketmapConfig) -> anyhow::Result<()> {
    let input = parse_arg("--input").context("aggregate requires --input")?;
    let reader = BufReader::new(File::open(&input).with_context(|| format!("opening {input}"))?);
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FragmentRecord = serde_json::from_str(&line)
            .with_context(|| format!("{input}:{}: invalid fragment record", line_no + 1))?;
        records.push(record);
    }

    let mut broadcast = DistributionCache::new();
    for root in config.cache.roots() {
        broadcast.register(config.cache.bucket_snapshot(root));
    }
    broadcast.register(config.cache.datasource_table());

    let mut table = RocksTable::open(&config.sink.path, &config.sink)?;
    let job = AggregationJob::new(config.job.clone(), broadcast).with_cache_layout(&config.cache);
    let report = job.run(records, &mut table)?;

    println!(
        "groups={} entries={} failed={} workers={}",
        report.groups,
        report.entries_written,
        report.failures.len(),
        report.workers
    );
    for failure in &report.failures {
        println!("FAILED {}: {}", failure.key, failure.reason);
    }
    if !report.is_complete() {
        bail!("{} groups failed", report.failures.len());
    }
    Ok(())
}

fn run_list(config: &BucketmapConfig) -> anyhow::Result<()> {
    let roots = config.cache.roots();
    let snapshots: Vec<_> = roots
        .iter()
        .map(|root| config.cache.bucket_snapshot(root))
        .collect();
    let registry = BucketRegistry::load(&snapshots)?;
    let mut buckets: Vec<_> = registry.all_buckets().collect();
    buckets.sort_by_key(|bucket| bucket.cache_index());
    for bucket in buckets {
        println!("{}\t{}", bucket.cache_index(), bucket.name());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let command = std::env::args().nth(1);
    let config = load_config()?;
    match command.as_deref() {
        Some("setup") => run_setup(&config),
        Some("aggregate") => run_aggregate(&config),
        Some("list") => run_list(&config),
        _ => {
            eprintln!("{USAGE}");
            bail!("unknown or missing command")
        }
    }
}
