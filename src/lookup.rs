//! # Lookup Cache
//!
//! Read-only integer to name tables, loaded once per worker before any group is
//! processed. The aggregator only sees the [`IndexLookup`] trait; tables are
//! written during setup with [`write_lookup_table`].

use crate::error::{BucketmapError, Result};
use crate::mapfile::{MapFileSummary, SortedMapReader, SortedMapWriter, StagedMapFile};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Fixed subpath of the datasource lookup table below a cache root.
pub const DATASOURCE_TABLE_NAME: &str = "datasources";

pub trait IndexLookup {
    fn get_item(&self, index: u32) -> Result<&str>;
}

impl<T: IndexLookup + ?Sized> IndexLookup for &T {
    fn get_item(&self, index: u32) -> Result<&str> {
        (**self).get_item(index)
    }
}

impl IndexLookup for HashMap<u32, String> {
    fn get_item(&self, index: u32) -> Result<&str> {
        self.get(&index).map(String::as_str).ok_or(BucketmapError::NotFound {
            what: "lookup index",
            index,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LookupCacheClient {
    items: HashMap<u32, String>,
    source: Option<PathBuf>,
}

impl LookupCacheClient {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let reader = SortedMapReader::open(path)?;
        let mut items = HashMap::new();
        for entry in reader.typed_entries::<u32, String>()? {
            let (index, name) = entry?;
            items.insert(index, name);
        }
        info!(items = items.len(), "lookup table loaded");
        Ok(Self {
            items,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn from_items(items: impl IntoIterator<Item = (u32, String)>) -> Self {
        Self {
            items: items.into_iter().collect(),
            source: None,
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl IndexLookup for LookupCacheClient {
    fn get_item(&self, index: u32) -> Result<&str> {
        self.items.get_item(index)
    }
}

/// Write a lookup table. Later items win on duplicate indices.
pub fn write_lookup_table(
    path: &Path,
    items: impl IntoIterator<Item = (u32, String)>,
) -> Result<MapFileSummary> {
    stage_lookup_table(path, items)?.publish()
}

/// Like [`write_lookup_table`], but leaves the table unpublished.
pub fn stage_lookup_table(
    path: &Path,
    items: impl IntoIterator<Item = (u32, String)>,
) -> Result<StagedMapFile> {
    let sorted: BTreeMap<u32, String> = items.into_iter().collect();
    let mut writer = SortedMapWriter::create(path)?;
    for (index, name) in &sorted {
        writer.append_entry(index, name)?;
    }
    writer.finish_staged()
}
