//! Default constants for bucketmap configuration.
//!
//! All magic numbers are centralized here.

// =============================================================================
// Cache Layout Defaults
// =============================================================================

/// Default cache root holding the bucket snapshot and the datasource table
pub const DEFAULT_CACHE_ROOT: &str = "bucketmap-cache";

/// Subpath of the bucket snapshot below a cache root
pub const DEFAULT_BUCKET_SUBPATH: &str = crate::registry::BUCKET_SNAPSHOT_NAME;

/// Subpath of the datasource lookup table below a cache root
pub const DEFAULT_DATASOURCE_SUBPATH: &str = crate::lookup::DATASOURCE_TABLE_NAME;

// =============================================================================
// Job Defaults
// =============================================================================

/// Default number of aggregation workers.
/// Uses the number of CPU cores.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Default scratch directory for worker-local copies of broadcast files
pub const DEFAULT_WORK_DIR: &str = "bucketmap-work";

// =============================================================================
// Sink Defaults (RocksDB)
// =============================================================================

/// Default table location for the aggregate command
pub const DEFAULT_SINK_PATH: &str = "bucketmap-table";

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Default number of background compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: usize = 2;
