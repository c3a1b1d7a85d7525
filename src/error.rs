//! # Errors
//!
//! Failure taxonomy shared by the registry, the lookup cache, the aggregator and
//! the job runner.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = BucketmapError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BucketmapError {
    /// A snapshot or lookup table could not be read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sorted-map file exists but its framing does not validate.
    #[error("corrupt sorted map {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// A cache index or lookup index has no entry.
    #[error("{what} {index} not found")]
    NotFound { what: &'static str, index: u32 },

    /// A group could not be turned into an output record.
    #[error("failed to resolve group {key}: {reason}")]
    Resolution { key: String, reason: String },

    /// Malformed input that cannot be recovered locally.
    #[error("schema error: {0}")]
    Schema(String),

    /// Two distinct bucket names derived the same cache index.
    #[error("cache index {index} already holds bucket {existing:?}, refusing {incoming:?}")]
    CacheIndexCollision {
        index: u32,
        existing: String,
        incoming: String,
    },

    /// Value (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl BucketmapError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// IOError-class failures abort the phase that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Corrupt { .. } | Self::Codec(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<bincode::Error> for BucketmapError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = BucketmapError::io("/tmp/x", std::io::Error::other("boom"));
        assert!(io.is_fatal());
        assert!(BucketmapError::corrupt("/tmp/x", "bad magic").is_fatal());

        let missing = BucketmapError::NotFound {
            what: "cache index",
            index: 7,
        };
        assert!(!missing.is_fatal());
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "cache index 7 not found");
    }

    #[test]
    fn test_io_message_names_path() {
        let err = BucketmapError::io("/data/cache/buckets", std::io::Error::other("denied"));
        assert!(err.to_string().contains("/data/cache/buckets"));
    }
}
