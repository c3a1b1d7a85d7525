//! Table sinks: where flushed groups go.
//!
//! A cell is addressed by `(row, column, tag, visibility)` which the aggregator
//! fills with `(storage_key, bucket_value, salt, visibility)`. The bitmap bytes
//! are the cell value. Writing the same cell twice keeps the last value.

use crate::aggregation::{TableEntry, Visibility};
use crate::config::SinkConfig;
use crate::error::{BucketmapError, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const KEY_SEPARATOR: u8 = 0;

pub trait TableSink {
    fn write(&mut self, entry: &TableEntry) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl<T: TableSink + ?Sized> TableSink for &mut T {
    fn write(&mut self, entry: &TableEntry) -> Result<()> {
        (**self).write(entry)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub row: String,
    pub column: String,
    pub tag: String,
    pub visibility: Visibility,
}

impl CellKey {
    pub fn for_entry(entry: &TableEntry) -> Self {
        Self {
            row: entry.storage_key.clone(),
            column: entry.bucket_value.clone(),
            tag: entry.salt.clone(),
            visibility: entry.visibility.clone(),
        }
    }

    /// Components joined by a zero byte. Components may not contain one.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let parts = [
            self.row.as_str(),
            self.column.as_str(),
            self.tag.as_str(),
            self.visibility.as_str(),
        ];
        let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for (i, part) in parts.iter().enumerate() {
            if part.as_bytes().contains(&KEY_SEPARATOR) {
                return Err(BucketmapError::Schema(format!(
                    "cell key component {part:?} contains a zero byte"
                )));
            }
            if i > 0 {
                out.push(KEY_SEPARATOR);
            }
            out.extend_from_slice(part.as_bytes());
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let parts: Vec<&[u8]> = bytes.split(|b| *b == KEY_SEPARATOR).collect();
        let [row, column, tag, visibility] = parts.as_slice() else {
            return Err(BucketmapError::Schema(format!(
                "cell key has {} components, expected 4",
                parts.len()
            )));
        };
        let text = |part: &[u8]| {
            String::from_utf8(part.to_vec())
                .map_err(|e| BucketmapError::Schema(format!("cell key is not UTF-8: {e}")))
        };
        Ok(Self {
            row: text(*row)?,
            column: text(*column)?,
            tag: text(*tag)?,
            visibility: Visibility(text(*visibility)?),
        })
    }
}

/// Sorted in-memory table.
#[derive(Debug, Default, Clone)]
pub struct MemoryTable {
    cells: BTreeMap<CellKey, Vec<u8>>,
    flushes: usize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CellKey) -> Option<&[u8]> {
        self.cells.get(key).map(Vec::as_slice)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&CellKey, &[u8])> {
        self.cells.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}

impl TableSink for MemoryTable {
    fn write(&mut self, entry: &TableEntry) -> Result<()> {
        self.cells
            .insert(CellKey::for_entry(entry), entry.bitmap.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// RocksDB-backed table. Writes are batched until [`TableSink::flush`].
pub struct RocksTable {
    db: DB,
    path: PathBuf,
    pending: WriteBatch,
}

impl RocksTable {
    pub fn open(path: &Path, config: &SinkConfig) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_paranoid_checks(true);
        options.set_write_buffer_size(config.write_buffer_mb * 1024 * 1024);
        options.set_max_background_jobs(config.max_background_jobs as i32);
        let db = DB::open(&options, path).map_err(|e| rocks_error(path, e))?;
        info!(path = %path.display(), "opened table");
        Ok(Self {
            db,
            path: path.to_path_buf(),
            pending: WriteBatch::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &CellKey) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key.encode()?)
            .map_err(|e| rocks_error(&self.path, e))
    }

    /// Every flushed cell whose row starts with `row_prefix`, in key order.
    pub fn scan(&self, row_prefix: &str) -> Result<Vec<(CellKey, Vec<u8>)>> {
        let prefix = row_prefix.as_bytes();
        let mut cells = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| rocks_error(&self.path, e))?;
            if !key.starts_with(prefix) {
                break;
            }
            cells.push((CellKey::decode(&key)?, value.to_vec()));
        }
        Ok(cells)
    }
}

impl TableSink for RocksTable {
    fn write(&mut self, entry: &TableEntry) -> Result<()> {
        let key = CellKey::for_entry(entry).encode()?;
        self.pending.put(key, &entry.bitmap);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        let cells = batch.len();
        self.db
            .write(batch)
            .map_err(|e| rocks_error(&self.path, e))?;
        self.db.flush().map_err(|e| rocks_error(&self.path, e))?;
        debug!(cells, "table flushed");
        Ok(())
    }
}

fn rocks_error(path: &Path, e: rocksdb::Error) -> BucketmapError {
    BucketmapError::io(path, io::Error::other(e.into_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(storage_key: &str, value: &str, bitmap: &[u8]) -> TableEntry {
        TableEntry {
            storage_key: storage_key.to_string(),
            bucket_value: value.to_string(),
            salt: "42".to_string(),
            visibility: Visibility::from("U"),
            bitmap: bitmap.to_vec(),
        }
    }

    #[test]
    fn test_cell_key_encoding() {
        let key = CellKey::for_entry(&entry("2:Census:country", "US", &[]));
        let bytes = key.encode().unwrap();
        assert_eq!(bytes, b"2:Census:country\0US\042\0U".to_vec());
        assert_eq!(CellKey::decode(&bytes).unwrap(), key);

        let bad = CellKey {
            row: "a\0b".to_string(),
            ..key
        };
        assert!(matches!(bad.encode(), Err(BucketmapError::Schema(_))));
        assert!(CellKey::decode(b"only\0three\0parts").is_err());
    }

    #[test]
    fn test_memory_table_last_write_wins() {
        let mut table = MemoryTable::new();
        table.write(&entry("2:Census:country", "US", &[1])).unwrap();
        table.write(&entry("2:Census:country", "US", &[2])).unwrap();
        table.write(&entry("2:Census:country", "FR", &[3])).unwrap();
        table.flush().unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.flush_count(), 1);
        let key = CellKey::for_entry(&entry("2:Census:country", "US", &[]));
        assert_eq!(table.get(&key), Some(&[2u8][..]));
    }

    #[test]
    fn test_rocks_table_write_flush_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        let config = SinkConfig {
            path: path.clone(),
            ..Default::default()
        };

        let mut table = RocksTable::open(&path, &config).unwrap();
        table.write(&entry("2:Census:country", "US", &[1, 2])).unwrap();
        table.write(&entry("2:Census:city", "Paris", &[3])).unwrap();
        table.write(&entry("3:Census:country", "US", &[4])).unwrap();

        let key = CellKey::for_entry(&entry("2:Census:country", "US", &[]));
        assert_eq!(table.get(&key).unwrap(), None);
        table.flush().unwrap();
        assert_eq!(table.get(&key).unwrap(), Some(vec![1, 2]));

        let rows: Vec<String> = table
            .scan("2:")
            .unwrap()
            .into_iter()
            .map(|(cell, _)| cell.row)
            .collect();
        assert_eq!(rows, vec!["2:Census:city", "2:Census:country"]);
    }
}
