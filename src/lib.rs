//! # Bucketmap
//!
//! Bucket index cache and bitmap index aggregation.
//!
//! Producers tag high-cardinality records with a compact [`BucketReference`]
//! instead of a full bucket definition. A setup phase persists the
//! [`BucketRegistry`] that maps those references back to buckets, plus a
//! datasource lookup table, and broadcasts both to every worker. The
//! aggregation phase groups bit-position fragments by key and merges each group
//! into one roaring bitmap per output cell.

pub mod aggregation;
pub mod config;
pub mod distribution;
pub mod error;
pub mod job;
pub mod lookup;
pub mod mapfile;
pub mod metadata;
pub mod model;
pub mod registry;
pub mod setup;
pub mod sink;
pub mod test_support;

// Re-export main types for convenience
pub use aggregation::{
    AggregationKey, AggregatorStats, BitFragment, BitmapAggregator, FragmentKey, TableEntry,
    Visibility,
};
pub use config::{BucketmapConfig, CacheConfig, JobConfig, SinkConfig};
pub use distribution::DistributionCache;
pub use error::{BucketmapError, Result};
pub use job::{AggregationJob, FragmentRecord, GroupFailure, JobReport};
pub use lookup::{IndexLookup, LookupCacheClient};
pub use metadata::{MetadataDocument, MetadataKind};
pub use model::{Bucket, BucketDefinition, BucketReference, CacheIndex};
pub use registry::{BucketKeyMap, BucketRegistry, PackedBucket};
pub use setup::{prepare_cache, SetupSummary};
pub use sink::{CellKey, MemoryTable, RocksTable, TableSink};
