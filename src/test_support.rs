use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

use crate::aggregation::{BitFragment, FragmentKey, Visibility};
use crate::config::CacheConfig;
use crate::distribution::DistributionCache;
use crate::error::Result;
use crate::job::FragmentRecord;
use crate::model::{Bucket, BucketReference};
use crate::setup::{prepare_cache, SetupSummary};

pub const FIXTURE_BUCKETS: [&str; 4] = ["country", "city", "state", "language"];

pub const FIXTURE_DATASOURCES: [(u32, &str); 3] = [(1, "Weather"), (7, "Census"), (9, "Traffic")];

const BUCKET_VALUES: [&str; 6] = ["US", "FR", "DE", "Paris", "Ohio", "en"];
const VISIBILITIES: [&str; 2] = ["U", "U&FOUO"];

/// Write the fixture registry and datasource table under `root` and return a
/// distribution cache holding both.
pub fn write_fixture_cache(root: &Path) -> Result<(SetupSummary, DistributionCache)> {
    let cache = CacheConfig {
        root: root.to_path_buf(),
        ..Default::default()
    };
    let mut broadcast = DistributionCache::new();
    let summary = prepare_cache(
        &cache,
        FIXTURE_BUCKETS,
        FIXTURE_DATASOURCES
            .iter()
            .map(|(index, name)| (*index, name.to_string())),
        Some(&mut broadcast),
    )?;
    Ok((summary, broadcast))
}

#[derive(Debug, Clone)]
pub struct GeneratedWorkload {
    pub records: Vec<FragmentRecord>,
    pub distinct_keys: usize,
}

/// Seeded fragment records over the fixture buckets and datasources. Every key
/// resolves against [`write_fixture_cache`]. A `max_position` of zero yields
/// fragments that only set bit 0.
pub fn generate_workload(
    groups: usize,
    fragments_per_group: usize,
    max_position: u32,
    seed: u64,
) -> GeneratedWorkload {
    let distinct = FIXTURE_BUCKETS.len()
        * BUCKET_VALUES.len()
        * FIXTURE_DATASOURCES.len()
        * VISIBILITIES.len()
        * 16
        * 4;
    let groups = groups.min(distinct);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = Vec::with_capacity(groups);
    while keys.len() < groups {
        let bucket = Bucket::new(FIXTURE_BUCKETS[rng.random_range(0..FIXTURE_BUCKETS.len())])
            .with_value(BUCKET_VALUES[rng.random_range(0..BUCKET_VALUES.len())]);
        let key = FragmentKey {
            bin_number: rng.random_range(0..16),
            datasource_index: FIXTURE_DATASOURCES[rng.random_range(0..FIXTURE_DATASOURCES.len())].0,
            bucket: bucket.to_reference(),
            salt: rng.random_range(0..4),
            visibility: Visibility::from(VISIBILITIES[rng.random_range(0..VISIBILITIES.len())]),
        };
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut records = Vec::with_capacity(groups * fragments_per_group);
    for key in &keys {
        for _ in 0..fragments_per_group {
            let len = rng.random_range(1..8);
            let fragment: BitFragment = (0..len)
                .map(|_| rng.random_range(0..max_position.max(1)))
                .collect();
            records.push(FragmentRecord {
                key: key.clone(),
                fragment,
            });
        }
    }
    records.shuffle(&mut rng);

    GeneratedWorkload {
        records,
        distinct_keys: keys.len(),
    }
}

/// Key whose bucket reference is absent from the fixture registry.
pub fn unregistered_key(bin_number: i32) -> FragmentKey {
    FragmentKey {
        bin_number,
        datasource_index: 7,
        bucket: BucketReference::new(Bucket::new("not-registered").cache_index(), "x"),
        salt: 0,
        visibility: Visibility::from("U"),
    }
}
