//! # Bucket Registry
//!
//! Maps compact cache indices to bucket definitions. The registry is built once
//! during setup, persisted as a sorted-map snapshot under the cache root, and
//! reloaded by every worker from its broadcast copy. Workers never share or
//! mutate each other's registry.

use crate::aggregation::{AggregationKey, FragmentKey};
use crate::distribution::DistributionCache;
use crate::error::{BucketmapError, Result};
use crate::mapfile::{MapFileSummary, SortedMapReader, SortedMapWriter, StagedMapFile};
use crate::model::{Bucket, BucketDefinition, BucketReference, CacheIndex};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Fixed subpath of the bucket snapshot below a cache root.
pub const BUCKET_SNAPSHOT_NAME: &str = "buckets";

#[derive(Debug, Clone, Default)]
pub struct BucketRegistry {
    buckets: HashMap<CacheIndex, BucketDefinition>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_path(cache_root: &Path) -> PathBuf {
        cache_root.join(BUCKET_SNAPSHOT_NAME)
    }

    /// Load and union one or more snapshots. A later snapshot wins on key
    /// collision. Any unreadable snapshot aborts the whole load.
    #[instrument(skip_all, fields(snapshots = paths.len()))]
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut registry = Self::new();
        for path in paths {
            let path = path.as_ref();
            let reader = SortedMapReader::open(path)?;
            for entry in reader.typed_entries::<CacheIndex, BucketDefinition>()? {
                let (index, definition) = entry?;
                if definition.cache_index != index {
                    return Err(BucketmapError::corrupt(
                        path,
                        format!(
                            "entry {} holds definition for {}",
                            index, definition.cache_index
                        ),
                    ));
                }
                registry.buckets.insert(index, definition);
            }
            debug!(path = %path.display(), entries = reader.len(), "loaded bucket snapshot");
        }
        info!(buckets = registry.len(), "bucket registry loaded");
        Ok(registry)
    }

    pub fn load_from_cache_roots<P: AsRef<Path>>(cache_roots: &[P]) -> Result<Self> {
        let paths: Vec<PathBuf> = cache_roots
            .iter()
            .map(|root| Self::snapshot_path(root.as_ref()))
            .collect();
        Self::load(&paths)
    }

    /// Register a bucket under its content-derived index.
    ///
    /// Re-adding a bucket with the same name overwrites the entry. A different
    /// name landing on an occupied index is refused with
    /// [`BucketmapError::CacheIndexCollision`].
    pub fn add_bucket(&mut self, bucket: &Bucket) -> Result<CacheIndex> {
        let definition = bucket.definition();
        let index = definition.cache_index;
        if let Some(existing) = self.buckets.get(&index) {
            if existing.name != definition.name {
                return Err(BucketmapError::CacheIndexCollision {
                    index: index.0,
                    existing: existing.name.clone(),
                    incoming: definition.name,
                });
            }
        }
        self.buckets.insert(index, definition);
        Ok(index)
    }

    /// Persist to `<cache_root>/buckets` and optionally broadcast the file.
    pub fn persist(
        &self,
        cache_root: &Path,
        broadcast: Option<&mut DistributionCache>,
    ) -> Result<MapFileSummary> {
        self.persist_to(&Self::snapshot_path(cache_root), broadcast)
    }

    /// Write every entry in ascending index order. The file is published
    /// atomically; a failed write leaves any previous snapshot in place.
    #[instrument(skip_all, fields(path = %path.display(), buckets = self.len()))]
    pub fn persist_to(
        &self,
        path: &Path,
        broadcast: Option<&mut DistributionCache>,
    ) -> Result<MapFileSummary> {
        let summary = self.stage_to(path)?.publish()?;
        info!(entries = summary.entries, bytes = summary.bytes, "bucket snapshot written");

        if let Some(cache) = broadcast {
            cache.register(&summary.path);
        }
        Ok(summary)
    }

    /// Write the snapshot for `path` without publishing it.
    pub fn stage_to(&self, path: &Path) -> Result<StagedMapFile> {
        let mut indices: Vec<&CacheIndex> = self.buckets.keys().collect();
        indices.sort_unstable();

        let mut writer = SortedMapWriter::create(path)?;
        for index in indices {
            writer.append_entry(index, &self.buckets[index])?;
        }
        writer.finish_staged()
    }

    /// Pack every definition, keyed by cache index, for shipment inside a
    /// job payload.
    pub fn to_key_map(&self) -> BucketKeyMap {
        let entries = self
            .buckets
            .iter()
            .map(|(index, definition)| {
                (
                    u64::from(index.0),
                    PackedBucket {
                        definition: definition.clone(),
                        value: None,
                    },
                )
            })
            .collect();
        BucketKeyMap { entries }
    }

    /// Rebuild a registry from a packed map. Only the definitions are kept.
    pub fn from_key_map(map: &BucketKeyMap) -> Self {
        let buckets = map
            .entries
            .values()
            .map(|packed| (packed.definition.cache_index, packed.definition.clone()))
            .collect();
        Self { buckets }
    }

    /// Resolve a reference and pack the full bucket keyed by its content hash.
    pub fn bucket_as_key(&self, reference: &BucketReference) -> Result<BucketKeyMap> {
        let bucket = self.resolve(reference)?;
        let mut entries = BTreeMap::new();
        entries.insert(
            bucket.content_hash(),
            PackedBucket {
                definition: bucket.definition(),
                value: bucket.value().map(str::to_string),
            },
        );
        Ok(BucketKeyMap { entries })
    }

    /// Rebuild the full bucket for a reference. The returned bucket is a fresh
    /// value; the stored definition is left untouched.
    pub fn resolve(&self, reference: &BucketReference) -> Result<Bucket> {
        let definition = self.definition(reference.cache_index)?;
        Ok(Bucket::from_definition(definition).with_value(reference.value.clone()))
    }

    pub fn bucket_name(&self, reference: &BucketReference) -> Result<&str> {
        Ok(&self.definition(reference.cache_index)?.name)
    }

    /// Turn a producer key into the full aggregation key.
    pub fn resolve_key(&self, key: &FragmentKey) -> Result<AggregationKey> {
        let bucket = self.resolve(&key.bucket)?;
        Ok(key.to_aggregation_key(bucket.name()))
    }

    pub fn get(&self, index: CacheIndex) -> Option<&BucketDefinition> {
        self.buckets.get(&index)
    }

    /// Every registered bucket, without a value, in no particular order.
    pub fn all_buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        self.buckets.values().map(Bucket::from_definition)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn definition(&self, index: CacheIndex) -> Result<&BucketDefinition> {
        self.buckets.get(&index).ok_or(BucketmapError::NotFound {
            what: "cache index",
            index: index.0,
        })
    }
}

/// One bucket inside a [`BucketKeyMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBucket {
    pub definition: BucketDefinition,
    pub value: Option<String>,
}

/// Buckets packed into a single serializable map, keyed by cache index for a
/// whole registry or by content hash for one resolved bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketKeyMap {
    entries: BTreeMap<u64, PackedBucket>,
}

impl BucketKeyMap {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    /// Unpack every bucket in key order. Content hashes are recomputed from
    /// name and value rather than trusted from the payload.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.entries
            .values()
            .map(|packed| {
                let bucket = Bucket::from_definition(&packed.definition);
                match &packed.value {
                    Some(value) => bucket.with_value(value.clone()),
                    None => bucket,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Visibility;
    use tempfile::tempdir;

    fn registry_with(names: &[&str]) -> BucketRegistry {
        let mut registry = BucketRegistry::new();
        for name in names {
            registry.add_bucket(&Bucket::new(*name)).unwrap();
        }
        registry
    }

    #[test]
    fn test_add_and_resolve() {
        let registry = registry_with(&["country", "city"]);
        assert_eq!(registry.len(), 2);

        let reference = BucketReference::new(CacheIndex::for_name("country"), "US");
        let bucket = registry.resolve(&reference).unwrap();
        assert_eq!(bucket.name(), "country");
        assert_eq!(bucket.value(), Some("US"));
        assert_eq!(bucket, Bucket::new("country").with_value("US"));
        assert_eq!(registry.bucket_name(&reference).unwrap(), "country");
    }

    #[test]
    fn test_resolve_does_not_touch_stored_definition() {
        let registry = registry_with(&["country"]);
        let index = CacheIndex::for_name("country");
        let before = registry.get(index).cloned().unwrap();

        let us = registry.resolve(&BucketReference::new(index, "US")).unwrap();
        let fr = registry.resolve(&BucketReference::new(index, "FR")).unwrap();

        assert_eq!(us.value(), Some("US"));
        assert_eq!(fr.value(), Some("FR"));
        assert_ne!(us.content_hash(), fr.content_hash());
        assert_eq!(registry.get(index), Some(&before));
    }

    #[test]
    fn test_resolve_unknown_index_is_not_found() {
        let registry = registry_with(&["country"]);
        let err = registry
            .resolve(&BucketReference::new(CacheIndex(12), "US"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(registry
            .bucket_name(&BucketReference::new(CacheIndex(12), "US"))
            .is_err());
    }

    #[test]
    fn test_re_adding_same_name_is_idempotent() {
        let mut registry = registry_with(&["country"]);
        let index = registry
            .add_bucket(&Bucket::new("country").with_value("FR"))
            .unwrap();
        assert_eq!(index, CacheIndex::for_name("country"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_colliding_name_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(BUCKET_SNAPSHOT_NAME);
        let index = CacheIndex::for_name("country");
        let mut writer = SortedMapWriter::create(&path).unwrap();
        writer
            .append_entry(
                &index,
                &BucketDefinition {
                    cache_index: index,
                    name: "impostor".to_string(),
                    content_hash: 0,
                },
            )
            .unwrap();
        writer.finish().unwrap();

        let mut registry = BucketRegistry::load(&[&path]).unwrap();
        let err = registry.add_bucket(&Bucket::new("country")).unwrap_err();
        assert!(matches!(
            err,
            BucketmapError::CacheIndexCollision { ref existing, .. } if existing == "impostor"
        ));
        assert_eq!(registry.get(index).unwrap().name, "impostor");
    }

    #[test]
    fn test_persist_registers_broadcast_file() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&["country", "city", "state"]);
        let mut cache = DistributionCache::new();

        let summary = registry.persist(dir.path(), Some(&mut cache)).unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.path, dir.path().join(BUCKET_SNAPSHOT_NAME));
        assert_eq!(cache.files(), &[summary.path.clone()]);

        let without = tempdir().unwrap();
        registry.persist(without.path(), None).unwrap();
        assert_eq!(cache.files().len(), 1);
    }

    #[test]
    fn test_snapshot_keys_ascending() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&["a", "b", "c", "d", "e", "f", "g"]);
        let summary = registry.persist(dir.path(), None).unwrap();

        let reader = SortedMapReader::open(&summary.path).unwrap();
        let keys: Vec<CacheIndex> = reader
            .typed_entries::<CacheIndex, BucketDefinition>()
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_resolve_key() {
        let registry = registry_with(&["country"]);
        let key = FragmentKey {
            bin_number: 2,
            datasource_index: 7,
            bucket: BucketReference::new(CacheIndex::for_name("country"), "US"),
            salt: 42,
            visibility: Visibility::from("U"),
        };
        let resolved = registry.resolve_key(&key).unwrap();
        assert_eq!(resolved.bucket_name, "country");
        assert_eq!(resolved.bucket_value, "US");
        assert_eq!(resolved.bin_number, 2);
        assert_eq!(resolved.salt, 42);
    }

    #[test]
    fn test_all_buckets_have_no_value() {
        let registry = registry_with(&["country", "city"]);
        let mut names: Vec<String> = registry
            .all_buckets()
            .map(|bucket| {
                assert!(bucket.value().is_none());
                bucket.name().to_string()
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["city", "country"]);
    }

    #[test]
    fn test_key_map_carries_whole_registry() {
        let registry = registry_with(&["country", "city", "zip"]);
        let map = registry.to_key_map();
        assert_eq!(map.len(), 3);
        assert!(map
            .keys()
            .all(|key| registry.get(CacheIndex(key as u32)).is_some()));

        let shipped = BucketKeyMap::from_bytes(&map.to_bytes().unwrap()).unwrap();
        let rebuilt = BucketRegistry::from_key_map(&shipped);
        assert_eq!(rebuilt.len(), 3);
        let reference = BucketReference::new(CacheIndex::for_name("city"), "Paris");
        assert_eq!(
            rebuilt.resolve(&reference).unwrap(),
            registry.resolve(&reference).unwrap()
        );
        assert!(shipped.buckets().iter().all(|bucket| bucket.value().is_none()));
    }

    #[test]
    fn test_bucket_as_key_keys_by_content_hash() {
        let registry = registry_with(&["country"]);
        let reference = BucketReference::new(CacheIndex::for_name("country"), "US");
        let expected = Bucket::new("country").with_value("US");

        let map = registry.bucket_as_key(&reference).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![expected.content_hash()]);
        let shipped = BucketKeyMap::from_bytes(&map.to_bytes().unwrap()).unwrap();
        assert_eq!(shipped.buckets(), vec![expected]);

        let unknown = BucketReference::new(CacheIndex::for_name("never-added"), "US");
        assert!(registry.bucket_as_key(&unknown).unwrap_err().is_not_found());
    }

    #[test]
    fn test_garbled_key_map_is_codec_error() {
        let err = BucketKeyMap::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, BucketmapError::Codec(_)));
    }
}
