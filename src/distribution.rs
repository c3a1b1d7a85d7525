//! # Distribution Cache
//!
//! Broadcast of read-only auxiliary files to workers. Setup registers the files
//! it publishes; each worker localizes its own copies before it processes any
//! group. With broadcast turned off, workers read the registered files in place.

use crate::error::{BucketmapError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default)]
pub struct DistributionCache {
    files: Vec<PathBuf>,
}

impl DistributionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file for distribution. Returns `false` if it was already
    /// registered.
    pub fn register(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref().to_path_buf();
        if self.files.contains(&path) {
            return false;
        }
        self.files.push(path);
        true
    }

    /// Registered files in registration order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Copy every registered file to `worker_dir/<slot>/<file name>` and mark
    /// the copies read-only.
    #[instrument(skip(self), fields(files = self.files.len()))]
    pub fn localize(&self, worker_dir: &Path) -> Result<LocalizedFiles> {
        let mut localized = LocalizedFiles {
            worker_dir: Some(worker_dir.to_path_buf()),
            files: Vec::with_capacity(self.files.len()),
        };
        for (slot, source) in self.files.iter().enumerate() {
            let file_name = file_name_of(source)?;
            let slot_dir = worker_dir.join(slot.to_string());
            fs::create_dir_all(&slot_dir).map_err(|e| BucketmapError::io(&slot_dir, e))?;

            let target = slot_dir.join(file_name);
            let _ = fs::remove_file(&target);
            fs::copy(source, &target).map_err(|e| BucketmapError::io(source, e))?;
            let mut permissions = fs::metadata(&target)
                .map_err(|e| BucketmapError::io(&target, e))?
                .permissions();
            permissions.set_readonly(true);
            fs::set_permissions(&target, permissions)
                .map_err(|e| BucketmapError::io(&target, e))?;

            debug!(source = %source.display(), target = %target.display(), "localized file");
            localized
                .files
                .push((file_name.to_string_lossy().into_owned(), target));
        }
        Ok(localized)
    }

    /// The registered files themselves, without copying.
    pub fn in_place(&self) -> Result<LocalizedFiles> {
        let files = self
            .files
            .iter()
            .map(|source| -> Result<(String, PathBuf)> {
                let name = file_name_of(source)?.to_string_lossy().into_owned();
                Ok((name, source.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LocalizedFiles {
            worker_dir: None,
            files,
        })
    }
}

fn file_name_of(source: &Path) -> Result<&std::ffi::OsStr> {
    source.file_name().ok_or_else(|| {
        BucketmapError::Schema(format!(
            "distributed path {} has no file name",
            source.display()
        ))
    })
}

/// The distributed files as one worker sees them.
#[derive(Debug, Clone)]
pub struct LocalizedFiles {
    worker_dir: Option<PathBuf>,
    files: Vec<(String, PathBuf)>,
}

impl LocalizedFiles {
    /// Directory holding the copies; `None` when files are read in place.
    pub fn worker_dir(&self) -> Option<&Path> {
        self.worker_dir.as_deref()
    }

    /// All local copies named `file_name`, in registration order.
    pub fn find(&self, file_name: &str) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|(name, _)| name == file_name)
            .map(|(_, path)| path.as_path())
            .collect()
    }

    pub fn first(&self, file_name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|(name, _)| name == file_name)
            .map(|(_, path)| path.as_path())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
