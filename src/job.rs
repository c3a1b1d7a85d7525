//! # Aggregation Job
//!
//! Local shared-nothing runner for the bitmap reduction. Records are grouped by
//! key, each group is owned by exactly one worker, and every worker loads its
//! own registry and lookup client from its own copy of the broadcast files, or
//! from the registered files directly when broadcast is turned off.
//!
//! Failure handling is two-level:
//! - a group whose bucket or datasource cannot be resolved is recorded in the
//!   [`JobReport`] and its siblings carry on;
//! - a worker that cannot initialize (missing or corrupt snapshot) fails the
//!   whole run before anything reaches the sink.

use crate::aggregation::{BitFragment, BitmapAggregator, FragmentKey, TableEntry};
use crate::config::{CacheConfig, JobConfig};
use crate::distribution::{DistributionCache, LocalizedFiles};
use crate::error::{BucketmapError, Result};
use crate::lookup::{LookupCacheClient, DATASOURCE_TABLE_NAME};
use crate::registry::{BucketRegistry, BUCKET_SNAPSHOT_NAME};
use crate::sink::TableSink;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use xxhash_rust::xxh3::Xxh3;

/// One producer output: a key and the bit positions it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub key: FragmentKey,
    pub fragment: BitFragment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFailure {
    pub key: FragmentKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub workers: usize,
    pub groups: usize,
    pub entries_written: usize,
    pub failures: Vec<GroupFailure>,
}

impl JobReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &FragmentKey> {
        self.failures.iter().map(|failure| &failure.key)
    }
}

/// Stable owner of a group: the same key maps to the same worker in every run.
pub fn worker_for_key(key: &FragmentKey, workers: usize) -> usize {
    let mut hasher = Xxh3::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

pub struct AggregationJob {
    config: JobConfig,
    cache: DistributionCache,
    bucket_file: String,
    datasource_file: String,
}

impl AggregationJob {
    pub fn new(config: JobConfig, cache: DistributionCache) -> Self {
        Self {
            config,
            cache,
            bucket_file: BUCKET_SNAPSHOT_NAME.to_string(),
            datasource_file: DATASOURCE_TABLE_NAME.to_string(),
        }
    }

    /// Look up broadcast files by the names configured for the cache layout.
    pub fn with_cache_layout(mut self, cache: &CacheConfig) -> Self {
        self.bucket_file = file_name_of(&cache.bucket_subpath);
        self.datasource_file = file_name_of(&cache.datasource_subpath);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers.max(1)
    }

    #[instrument(skip_all, fields(workers = self.worker_count()))]
    pub fn run<I, S>(&self, records: I, sink: &mut S) -> Result<JobReport>
    where
        I: IntoIterator<Item = FragmentRecord>,
        S: TableSink + ?Sized,
    {
        let workers = self.worker_count();

        let mut groups: BTreeMap<FragmentKey, Vec<BitFragment>> = BTreeMap::new();
        for record in records {
            groups.entry(record.key).or_default().push(record.fragment);
        }
        let group_count = groups.len();

        let mut partitions: Vec<Vec<(FragmentKey, Vec<BitFragment>)>> =
            (0..workers).map(|_| Vec::new()).collect();
        for (key, fragments) in groups {
            partitions[worker_for_key(&key, workers)].push((key, fragments));
        }
        info!(groups = group_count, "grouped fragments");

        let outputs = std::thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .into_iter()
                .enumerate()
                .map(|(worker, partition)| {
                    let dir = self.worker_dir(worker);
                    scope.spawn(move || self.run_worker(worker, &dir, partition))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(output) => output,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect::<Vec<Result<WorkerOutput>>>()
        });

        if self.config.broadcast && !self.config.keep_work_dir {
            self.clean_work_dirs(workers);
        }

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for output in outputs {
            let output = output?;
            entries.extend(output.entries);
            failures.extend(output.failures);
        }

        for entry in &entries {
            sink.write(entry)?;
        }
        sink.flush()?;

        for failure in &failures {
            warn!(key = %failure.key, reason = %failure.reason, "group failed");
        }
        info!(
            groups = group_count,
            entries = entries.len(),
            failed = failures.len(),
            "aggregation finished"
        );

        Ok(JobReport {
            workers,
            groups: group_count,
            entries_written: entries.len(),
            failures,
        })
    }

    fn run_worker(
        &self,
        worker: usize,
        dir: &Path,
        partition: Vec<(FragmentKey, Vec<BitFragment>)>,
    ) -> Result<WorkerOutput> {
        let files = if self.config.broadcast {
            self.cache.localize(dir)?
        } else {
            self.cache.in_place()?
        };
        let context = WorkerContext::initialize(
            dir,
            &files,
            &self.bucket_file,
            &self.datasource_file,
        )?;
        let mut aggregator = BitmapAggregator::new(&context.datasources);
        let mut output = WorkerOutput::default();

        for (key, fragments) in partition {
            let result = context
                .registry
                .resolve_key(&key)
                .and_then(|aggregation_key| aggregator.aggregate(aggregation_key, &fragments));
            match result {
                Ok(entry) => output.entries.push(entry),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => output.failures.push(GroupFailure {
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        let stats = aggregator.stats();
        debug!(
            worker,
            flushed = stats.groups_flushed,
            bits = stats.bits_set,
            failed = output.failures.len(),
            "worker done"
        );
        Ok(output)
    }

    fn worker_dir(&self, worker: usize) -> PathBuf {
        self.config.work_dir.join(format!("worker-{worker}"))
    }

    fn clean_work_dirs(&self, workers: usize) {
        for worker in 0..workers {
            let dir = self.worker_dir(worker);
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "failed to remove worker directory");
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct WorkerOutput {
    entries: Vec<TableEntry>,
    failures: Vec<GroupFailure>,
}

/// Per-worker read-only state, built once before the first group.
struct WorkerContext {
    registry: BucketRegistry,
    datasources: LookupCacheClient,
}

impl WorkerContext {
    fn initialize(
        dir: &Path,
        localized: &LocalizedFiles,
        bucket_file: &str,
        datasource_file: &str,
    ) -> Result<Self> {
        let snapshots = localized.find(bucket_file);
        if snapshots.is_empty() {
            return Err(missing_broadcast(dir, bucket_file));
        }
        let registry = BucketRegistry::load(&snapshots)?;

        let table = localized
            .first(datasource_file)
            .ok_or_else(|| missing_broadcast(dir, datasource_file))?;
        let datasources = LookupCacheClient::open(table)?;

        Ok(Self {
            registry,
            datasources,
        })
    }
}

fn missing_broadcast(dir: &Path, file_name: &str) -> BucketmapError {
    BucketmapError::io(
        dir.join(file_name),
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{file_name} was not broadcast to this worker"),
        ),
    )
}

fn file_name_of(subpath: &str) -> String {
    Path::new(subpath)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| subpath.to_string())
}
