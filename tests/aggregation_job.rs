use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use bucketmap_rs::test_support::{
    generate_workload, unregistered_key, write_fixture_cache, FIXTURE_BUCKETS,
    FIXTURE_DATASOURCES,
};
use bucketmap_rs::{
    AggregationJob, BitFragment, Bucket, CellKey, DistributionCache, FragmentKey,
    FragmentRecord, JobConfig, MemoryTable, RocksTable, SinkConfig, TableSink, Visibility,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use roaring::RoaringBitmap;
use tempfile::tempdir;

fn job_config(work_dir: &std::path::Path, workers: usize) -> JobConfig {
    JobConfig {
        workers,
        broadcast: true,
        work_dir: work_dir.to_path_buf(),
        keep_work_dir: false,
    }
}

fn country_key(datasource_index: u32) -> FragmentKey {
    FragmentKey {
        bin_number: 2,
        datasource_index,
        bucket: Bucket::new("country").with_value("US").to_reference(),
        salt: 42,
        visibility: Visibility::from("U"),
    }
}

fn record(key: &FragmentKey, positions: Vec<u32>) -> FragmentRecord {
    FragmentRecord {
        key: key.clone(),
        fragment: BitFragment::from(positions),
    }
}

fn bits(bytes: &[u8]) -> Vec<u32> {
    RoaringBitmap::deserialize_from(bytes)
        .expect("valid bitmap")
        .iter()
        .collect()
}

#[test]
fn country_scenario_end_to_end() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, broadcast) = write_fixture_cache(&dir.path().join("cache"))?;
    let job = AggregationJob::new(job_config(&dir.path().join("work"), 2), broadcast);

    let key = country_key(7);
    let mut table = MemoryTable::new();
    let report = job.run(
        vec![record(&key, vec![3, 1, 5]), record(&key, vec![5, 2])],
        &mut table,
    )?;

    assert!(report.is_complete());
    assert_eq!(report.groups, 1);
    assert_eq!(report.entries_written, 1);
    assert_eq!(table.len(), 1);
    assert_eq!(table.flush_count(), 1);

    let cell = CellKey {
        row: "2:Census:country".to_string(),
        column: "US".to_string(),
        tag: "42".to_string(),
        visibility: Visibility::from("U"),
    };
    let stored = table.get(&cell).expect("cell written");
    assert_eq!(bits(stored), vec![1, 2, 3, 5]);

    // Worker scratch directories are removed after the run.
    assert!(!dir.path().join("work").join("worker-0").exists());
    Ok(())
}

#[test]
fn unresolved_groups_fail_alone() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, broadcast) = write_fixture_cache(&dir.path().join("cache"))?;
    let job = AggregationJob::new(job_config(&dir.path().join("work"), 3), broadcast);

    let good = country_key(7);
    let unknown_datasource = country_key(404);
    let unknown_bucket = unregistered_key(2);
    let mut table = MemoryTable::new();
    let report = job.run(
        vec![
            record(&unknown_datasource, vec![1]),
            record(&good, vec![9, 4]),
            record(&unknown_bucket, vec![2]),
            record(&good, vec![4]),
        ],
        &mut table,
    )?;

    assert_eq!(report.groups, 3);
    assert_eq!(report.entries_written, 1);
    assert_eq!(report.failures.len(), 2);
    let failed: BTreeSet<&FragmentKey> = report.failed_keys().collect();
    assert!(failed.contains(&unknown_datasource));
    assert!(failed.contains(&unknown_bucket));

    let (cell, stored) = table.cells().next().expect("sibling written");
    assert_eq!(cell.row, "2:Census:country");
    assert_eq!(bits(stored), vec![4, 9]);
    Ok(())
}

#[test]
fn missing_snapshot_fails_before_sink() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (summary, _) = write_fixture_cache(&dir.path().join("cache"))?;

    let mut only_table = DistributionCache::new();
    only_table.register(&summary.datasource_table);
    let job = AggregationJob::new(job_config(&dir.path().join("work"), 2), only_table);
    let mut table = MemoryTable::new();
    let err = job
        .run(vec![record(&country_key(7), vec![1])], &mut table)
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(table.is_empty());
    assert_eq!(table.flush_count(), 0);

    let mut vanished = DistributionCache::new();
    vanished.register(&summary.bucket_snapshot);
    vanished.register(&summary.datasource_table);
    fs::remove_file(&summary.bucket_snapshot)?;
    let job = AggregationJob::new(job_config(&dir.path().join("work"), 2), vanished);
    let err = job
        .run(vec![record(&country_key(7), vec![1])], &mut table)
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(table.flush_count(), 0);
    Ok(())
}

#[test]
fn output_is_independent_of_order_and_worker_count() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, broadcast) = write_fixture_cache(&dir.path().join("cache"))?;
    let workload = generate_workload(40, 6, 5_000, 11);

    let mut expected: BTreeMap<FragmentKey, BTreeSet<u32>> = BTreeMap::new();
    for record in &workload.records {
        expected
            .entry(record.key.clone())
            .or_default()
            .extend(record.fragment.positions.iter().copied());
    }
    assert_eq!(expected.len(), workload.distinct_keys);

    let mut shuffled = workload.records.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(99));

    let mut single = MemoryTable::new();
    AggregationJob::new(job_config(&dir.path().join("w1"), 1), broadcast.clone())
        .run(workload.records.clone(), &mut single)?;
    let mut many = MemoryTable::new();
    let report = AggregationJob::new(job_config(&dir.path().join("w4"), 4), broadcast)
        .run(shuffled, &mut many)?;

    assert!(report.is_complete());
    assert_eq!(report.entries_written, workload.distinct_keys);
    let left: Vec<_> = single.cells().collect();
    let right: Vec<_> = many.cells().collect();
    assert_eq!(left, right);

    let datasources: BTreeMap<u32, &str> = FIXTURE_DATASOURCES.into_iter().collect();
    for (key, positions) in &expected {
        let bucket_name = FIXTURE_BUCKETS
            .into_iter()
            .find(|candidate| Bucket::new(*candidate).cache_index() == key.bucket.cache_index)
            .expect("fixture bucket");
        let cell = CellKey {
            row: format!(
                "{}:{}:{}",
                key.bin_number, datasources[&key.datasource_index], bucket_name
            ),
            column: key.bucket.value.clone(),
            tag: key.salt.to_string(),
            visibility: key.visibility.clone(),
        };
        let stored = many.get(&cell).expect("every group written");
        assert_eq!(bits(stored), positions.iter().copied().collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn rocks_table_receives_job_output() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, broadcast) = write_fixture_cache(&dir.path().join("cache"))?;
    let job = AggregationJob::new(job_config(&dir.path().join("work"), 2), broadcast);

    let table_path = dir.path().join("table");
    let mut table = RocksTable::open(
        &table_path,
        &SinkConfig {
            path: table_path.clone(),
            ..Default::default()
        },
    )?;
    let key = country_key(7);
    job.run(vec![record(&key, vec![8, 3])], &mut table)?;
    table.flush()?;

    let cells = table.scan("2:Census:")?;
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].0.column, "US");
    assert_eq!(bits(&cells[0].1), vec![3, 8]);
    Ok(())
}

#[test]
fn without_broadcast_workers_read_cache_in_place() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (_, broadcast) = write_fixture_cache(&dir.path().join("cache"))?;
    let work_dir = dir.path().join("work");
    let config = JobConfig {
        broadcast: false,
        keep_work_dir: true,
        ..job_config(&work_dir, 3)
    };

    let key = country_key(7);
    let mut table = MemoryTable::new();
    let report = AggregationJob::new(config, broadcast)
        .run(vec![record(&key, vec![6, 2]), record(&key, vec![2])], &mut table)?;

    assert!(report.is_complete());
    assert_eq!(report.entries_written, 1);
    let (_, stored) = table.cells().next().expect("cell written");
    assert_eq!(bits(stored), vec![2, 6]);
    // Nothing was copied, so no worker directory was ever created.
    assert!(!work_dir.exists());
    Ok(())
}
