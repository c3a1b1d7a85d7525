//! Configuration for the setup and aggregation phases.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (bucketmap.toml)
//! ```toml
//! [cache]
//! root = "/var/lib/bucketmap/cache"
//! extra_roots = ["/var/lib/bucketmap/shared-cache"]
//!
//! [job]
//! workers = 8
//! work_dir = "/tmp/bucketmap-work"
//!
//! [sink]
//! path = "/var/lib/bucketmap/table"
//! ```
//!
//! Environment variables use the `BUCKETMAP_` prefix with `__` between nested
//! keys, e.g. `BUCKETMAP_JOB__WORKERS=16`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketmapConfig {
    /// Where setup writes and workers read the broadcast files
    pub cache: CacheConfig,
    /// Aggregation job runner
    pub job: JobConfig,
    /// Output table
    pub sink: SinkConfig,
}

impl BucketmapConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(BucketmapConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with BUCKETMAP_ prefix
        figment = figment.merge(Env::prefixed("BUCKETMAP_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Cache roots and the fixed subpaths below them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Primary cache root; setup persists here
    pub root: PathBuf,
    /// Further roots whose snapshots are unioned after the primary one
    pub extra_roots: Vec<PathBuf>,
    pub bucket_subpath: String,
    pub datasource_subpath: String,
}

impl CacheConfig {
    /// Every cache root in load order. Later roots win on collision.
    pub fn roots(&self) -> Vec<&Path> {
        std::iter::once(self.root.as_path())
            .chain(self.extra_roots.iter().map(PathBuf::as_path))
            .collect()
    }

    pub fn bucket_snapshot(&self, root: &Path) -> PathBuf {
        root.join(&self.bucket_subpath)
    }

    pub fn datasource_table(&self) -> PathBuf {
        self.root.join(&self.datasource_subpath)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CACHE_ROOT),
            extra_roots: Vec::new(),
            bucket_subpath: DEFAULT_BUCKET_SUBPATH.to_string(),
            datasource_subpath: DEFAULT_DATASOURCE_SUBPATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of shared-nothing workers
    pub workers: usize,
    /// Setup registers its files for broadcast and workers copy them into their
    /// own directory. When off, workers read the registered files in place.
    pub broadcast: bool,
    /// Scratch directory for worker-local copies
    pub work_dir: PathBuf,
    /// Leave worker directories behind after the run
    pub keep_work_dir: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            broadcast: true,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            keep_work_dir: false,
        }
    }
}

/// RocksDB table sink tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub path: PathBuf,
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Maximum number of background compaction threads
    pub max_background_jobs: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SINK_PATH),
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_work_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
