//! Setup phase: build the bucket registry and datasource table under a cache
//! root and register both for broadcast.

use crate::config::CacheConfig;
use crate::distribution::DistributionCache;
use crate::error::Result;
use crate::lookup::stage_lookup_table;
use crate::mapfile::publish_all;
use crate::model::{Bucket, CacheIndex};
use crate::registry::BucketRegistry;
use std::path::PathBuf;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupSummary {
    pub bucket_snapshot: PathBuf,
    pub datasource_table: PathBuf,
    pub buckets: Vec<(String, CacheIndex)>,
    pub datasources: usize,
}

/// Persist the registry and the datasource table below `cache.root`.
///
/// Both files are fully written before either is published, and they are
/// published as a pair: if the second cannot be put in place, the first is
/// restored to what it was. When `broadcast` is given, both are registered
/// with it after a successful publish.
#[instrument(skip_all, fields(root = %cache.root.display()))]
pub fn prepare_cache<N, D>(
    cache: &CacheConfig,
    bucket_names: N,
    datasources: D,
    broadcast: Option<&mut DistributionCache>,
) -> Result<SetupSummary>
where
    N: IntoIterator,
    N::Item: Into<String>,
    D: IntoIterator<Item = (u32, String)>,
{
    let mut registry = BucketRegistry::new();
    let mut buckets = Vec::new();
    for name in bucket_names {
        let bucket = Bucket::new(name);
        let index = registry.add_bucket(&bucket)?;
        buckets.push((bucket.name().to_string(), index));
    }

    let snapshot_path = cache.bucket_snapshot(&cache.root);
    let table_path = cache.datasource_table();
    let staged = vec![
        registry.stage_to(&snapshot_path)?,
        stage_lookup_table(&table_path, datasources)?,
    ];
    let published = publish_all(staged)?;
    let datasource_count = published.last().map_or(0, |table| table.entries as usize);
    if let Some(files) = broadcast {
        files.register(&snapshot_path);
        files.register(&table_path);
    }

    info!(
        buckets = registry.len(),
        datasources = datasource_count,
        "cache prepared"
    );
    Ok(SetupSummary {
        bucket_snapshot: snapshot_path,
        datasource_table: table_path,
        buckets,
        datasources: datasource_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{IndexLookup, LookupCacheClient};
    use tempfile::tempdir;

    #[test]
    fn test_prepare_cache_writes_and_registers_both_files() {
        let dir = tempdir().unwrap();
        let cache = CacheConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut broadcast = DistributionCache::new();

        let summary = prepare_cache(
            &cache,
            ["country", "city"],
            vec![(7, "Census".to_string())],
            Some(&mut broadcast),
        )
        .unwrap();

        assert_eq!(summary.buckets.len(), 2);
        assert_eq!(summary.buckets[0].1, CacheIndex::for_name("country"));
        assert_eq!(
            broadcast.files(),
            &[summary.bucket_snapshot.clone(), summary.datasource_table.clone()]
        );

        let registry = BucketRegistry::load(&[&summary.bucket_snapshot]).unwrap();
        assert_eq!(registry.len(), 2);
        let client = LookupCacheClient::open(&summary.datasource_table).unwrap();
        assert_eq!(client.get_item(7).unwrap(), "Census");
    }

    #[test]
    fn test_failed_table_publish_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let cache = CacheConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let first = prepare_cache(&cache, ["country"], vec![(7, "Census".to_string())], None)
            .unwrap();
        let snapshot_before = std::fs::read(&first.bucket_snapshot).unwrap();

        // Replace the table with something the publish cannot rename over.
        std::fs::remove_file(&first.datasource_table).unwrap();
        std::fs::create_dir(&first.datasource_table).unwrap();
        std::fs::write(first.datasource_table.join("occupant"), b"x").unwrap();

        let mut broadcast = DistributionCache::new();
        let err = prepare_cache(
            &cache,
            ["country", "city"],
            vec![(7, "Census".to_string())],
            Some(&mut broadcast),
        )
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(broadcast.is_empty());
        assert_eq!(std::fs::read(&first.bucket_snapshot).unwrap(), snapshot_before);
        assert_eq!(BucketRegistry::load(&[&first.bucket_snapshot]).unwrap().len(), 1);
    }
}
