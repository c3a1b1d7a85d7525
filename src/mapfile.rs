//! # Sorted Map Files
//!
//! Append-only, key-ordered snapshot files used for the bucket registry and for
//! lookup tables.
//!
//! ```text
//! header  : "BMSM" | version u8
//! entries : { key_len u32 | key | value_len u32 | value }*      (ascending keys)
//! index   : { key_len u32 | key | offset u64 }*                 (every INDEX_INTERVAL entries)
//! footer  : index_offset u64 | entry_count u64 | index_count u64 | "BMSM"
//! ```
//!
//! Integers are little endian. A writer streams into a hidden temp file next to
//! the destination and renames it into place on [`SortedMapWriter::finish`], so
//! readers only ever observe a complete file. Identical input yields identical
//! bytes.
//!
//! Several files that must change together are staged with
//! [`SortedMapWriter::finish_staged`] and published with [`publish_all`], which
//! restores the previous files if any rename fails.

use crate::error::{BucketmapError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"BMSM";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;
const FOOTER_LEN: u64 = 8 + 8 + 8 + 4;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
/// Two empty length-prefixed frames.
const MIN_ENTRY_LEN: u64 = 4 + 4;
/// Empty key frame plus the offset.
const MIN_INDEX_ENTRY_LEN: u64 = 4 + 8;

/// One sparse index entry is written for every `INDEX_INTERVAL` data entries.
pub const INDEX_INTERVAL: u64 = 128;

/// Keys are stored as fixed-width big-endian bytes so byte order matches
/// numeric order.
pub trait MapKey: Sized {
    fn to_key_bytes(&self) -> Vec<u8>;
    fn from_key_bytes(bytes: &[u8]) -> Option<Self>;
}

impl MapKey for u32 {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

/// Result of publishing a sorted map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFileSummary {
    pub path: PathBuf,
    pub entries: u64,
    pub bytes: u64,
}

pub struct SortedMapWriter {
    path: PathBuf,
    temp_path: PathBuf,
    out: Option<BufWriter<File>>,
    offset: u64,
    entries: u64,
    last_key: Option<Vec<u8>>,
    index: Vec<(Vec<u8>, u64)>,
    released: bool,
}

impl SortedMapWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| BucketmapError::io(parent, e))?;
            }
        }
        let temp_path = temp_path_for(&path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| BucketmapError::io(&temp_path, e))?;

        let mut writer = Self {
            path,
            temp_path,
            out: Some(BufWriter::new(file)),
            offset: 0,
            entries: 0,
            last_key: None,
            index: Vec::new(),
            released: false,
        };
        writer.write_bytes(MAGIC)?;
        writer.write_bytes(&[FORMAT_VERSION])?;
        Ok(writer)
    }

    /// Append one entry. Keys must be strictly ascending.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(BucketmapError::Schema(format!(
                    "key {:02x?} is not greater than previous key {:02x?} in {}",
                    key,
                    last,
                    self.path.display()
                )));
            }
        }
        if self.entries % INDEX_INTERVAL == 0 {
            self.index.push((key.to_vec(), self.offset));
        }
        self.write_frame(key)?;
        self.write_frame(value)?;
        self.entries += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub fn append_entry<K: MapKey, V: Serialize>(&mut self, key: &K, value: &V) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.append(&key.to_key_bytes(), &bytes)
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Write the index and footer, sync, and atomically publish the file.
    pub fn finish(self) -> Result<MapFileSummary> {
        self.finish_staged()?.publish()
    }

    /// Write the index and footer and sync, leaving the complete file under its
    /// temp name. Nothing at the destination changes until the returned
    /// [`StagedMapFile`] is published.
    pub fn finish_staged(mut self) -> Result<StagedMapFile> {
        let index_offset = self.offset;
        let index = std::mem::take(&mut self.index);
        for (key, offset) in &index {
            self.write_frame(key)?;
            self.write_bytes(&offset.to_le_bytes())?;
        }
        let entries = self.entries;
        self.write_bytes(&index_offset.to_le_bytes())?;
        self.write_bytes(&entries.to_le_bytes())?;
        self.write_bytes(&(index.len() as u64).to_le_bytes())?;
        self.write_bytes(MAGIC)?;

        let out = self
            .out
            .take()
            .ok_or_else(|| BucketmapError::Schema("sorted map writer already closed".into()))?;
        let file = out
            .into_inner()
            .map_err(|e| BucketmapError::io(&self.temp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| BucketmapError::io(&self.temp_path, e))?;
        drop(file);

        self.released = true;
        Ok(StagedMapFile {
            path: self.path.clone(),
            temp_path: self.temp_path.clone(),
            entries: self.entries,
            bytes: self.offset,
            published: false,
        })
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                BucketmapError::Schema(format!("frame of {} bytes is too large", bytes.len()))
            })?;
        self.write_bytes(&len.to_le_bytes())?;
        self.write_bytes(bytes)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| BucketmapError::Schema("sorted map writer already closed".into()))?;
        out.write_all(bytes)
            .map_err(|e| BucketmapError::io(&self.temp_path, e))?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for SortedMapWriter {
    fn drop(&mut self) {
        if !self.released {
            self.out.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// A complete, synced sorted map waiting under its temp name. Dropping it
/// unpublished removes the temp file.
#[derive(Debug)]
pub struct StagedMapFile {
    path: PathBuf,
    temp_path: PathBuf,
    entries: u64,
    bytes: u64,
    published: bool,
}

impl StagedMapFile {
    /// Final destination.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(mut self) -> Result<MapFileSummary> {
        fs::rename(&self.temp_path, &self.path).map_err(|e| BucketmapError::io(&self.path, e))?;
        self.published = true;
        sync_parent(&self.path);
        Ok(MapFileSummary {
            path: self.path.clone(),
            entries: self.entries,
            bytes: self.bytes,
        })
    }
}

impl Drop for StagedMapFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Publish staged files in order. If any publish fails, files already
/// published are put back to what they were before the call (or removed when
/// there was nothing before), and the remaining temp files are discarded.
pub fn publish_all(staged: Vec<StagedMapFile>) -> Result<Vec<MapFileSummary>> {
    let mut done: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    let mut summaries = Vec::with_capacity(staged.len());
    for file in staged {
        let backup = match preserve_previous(file.path()) {
            Ok(backup) => backup,
            Err(e) => {
                roll_back(&done);
                return Err(e);
            }
        };
        match file.publish() {
            Ok(summary) => {
                done.push((summary.path.clone(), backup));
                summaries.push(summary);
            }
            Err(e) => {
                if let Some(backup) = backup {
                    let _ = fs::remove_file(backup);
                }
                roll_back(&done);
                return Err(e);
            }
        }
    }
    for (_, backup) in done {
        if let Some(backup) = backup {
            let _ = fs::remove_file(backup);
        }
    }
    Ok(summaries)
}

/// Keep a link to the file currently at `path`, if there is one.
fn preserve_previous(path: &Path) -> Result<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let backup = sibling_path(path, "prev");
    let _ = fs::remove_file(&backup);
    if fs::hard_link(path, &backup).is_err() {
        fs::copy(path, &backup).map_err(|e| BucketmapError::io(&backup, e))?;
    }
    Ok(Some(backup))
}

fn roll_back(done: &[(PathBuf, Option<PathBuf>)]) {
    for (path, backup) in done.iter().rev() {
        let restored = match backup {
            Some(backup) => fs::rename(backup, path),
            None => fs::remove_file(path),
        };
        if let Err(e) = restored {
            tracing::error!(path = %path.display(), error = %e, "failed to restore previous file");
        }
        sync_parent(path);
    }
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    sibling_path(path, "tmp")
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sorted-map".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

#[derive(Debug)]
pub struct SortedMapReader {
    path: PathBuf,
    index_offset: u64,
    entry_count: u64,
    index: Vec<(Vec<u8>, u64)>,
}

impl SortedMapReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| BucketmapError::io(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| BucketmapError::io(&path, e))?
            .len();
        if len < HEADER_LEN + FOOTER_LEN {
            return Err(BucketmapError::corrupt(&path, "file is truncated"));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        read_exact(&mut file, &mut header, &path)?;
        if &header[..4] != MAGIC {
            return Err(BucketmapError::corrupt(&path, "bad header magic"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(BucketmapError::corrupt(
                &path,
                format!("unsupported format version {}", header[4]),
            ));
        }

        let footer_start = len - FOOTER_LEN;
        file.seek(SeekFrom::Start(footer_start))
            .map_err(|e| BucketmapError::io(&path, e))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        read_exact(&mut file, &mut footer, &path)?;
        if &footer[24..28] != MAGIC {
            return Err(BucketmapError::corrupt(&path, "bad footer magic"));
        }
        let index_offset = read_u64(&footer[0..8]);
        let entry_count = read_u64(&footer[8..16]);
        let index_count = read_u64(&footer[16..24]);
        if index_offset < HEADER_LEN || index_offset > footer_start {
            return Err(BucketmapError::corrupt(&path, "index offset out of range"));
        }
        if entry_count > (index_offset - HEADER_LEN) / MIN_ENTRY_LEN {
            return Err(BucketmapError::corrupt(
                &path,
                format!("entry count {entry_count} exceeds data region"),
            ));
        }
        if index_count > (footer_start - index_offset) / MIN_INDEX_ENTRY_LEN {
            return Err(BucketmapError::corrupt(
                &path,
                format!("index count {index_count} exceeds index region"),
            ));
        }
        if index_count != entry_count.div_ceil(INDEX_INTERVAL) {
            return Err(BucketmapError::corrupt(&path, "index size mismatch"));
        }

        file.seek(SeekFrom::Start(index_offset))
            .map_err(|e| BucketmapError::io(&path, e))?;
        let mut reader = BufReader::new(file.take(footer_start - index_offset));
        let mut index = Vec::new();
        for _ in 0..index_count {
            let key = read_frame(&mut reader, &path)?;
            let mut offset = [0u8; 8];
            read_exact(&mut reader, &mut offset, &path)?;
            let offset = u64::from_le_bytes(offset);
            if offset < HEADER_LEN || offset >= index_offset {
                return Err(BucketmapError::corrupt(&path, "index entry out of range"));
            }
            index.push((key, offset));
        }

        Ok(Self {
            path,
            index_offset,
            entry_count,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Iterate every entry in key order. Each item owns its buffers.
    pub fn entries(&self) -> Result<Entries> {
        self.entries_from(HEADER_LEN, self.entry_count)
    }

    pub fn typed_entries<K, V>(&self) -> Result<impl Iterator<Item = Result<(K, V)>> + '_>
    where
        K: MapKey,
        V: DeserializeOwned,
    {
        let entries = self.entries()?;
        Ok(entries.map(move |entry| {
            let (key, value) = entry?;
            self.decode(&key, &value)
        }))
    }

    /// Point lookup through the sparse index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = match self
            .index
            .binary_search_by(|(candidate, _)| candidate.as_slice().cmp(key))
        {
            Ok(slot) => slot,
            Err(0) => return Ok(None),
            Err(slot) => slot - 1,
        };
        let preceding = slot as u64 * INDEX_INTERVAL;
        let remaining = INDEX_INTERVAL.min(self.entry_count.saturating_sub(preceding));
        for entry in self.entries_from(self.index[slot].1, remaining)? {
            let (candidate, value) = entry?;
            match candidate.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(value)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    pub fn get_typed<K: MapKey, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        match self.get(&key.to_key_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn decode<K: MapKey, V: DeserializeOwned>(&self, key: &[u8], value: &[u8]) -> Result<(K, V)> {
        let key = K::from_key_bytes(key)
            .ok_or_else(|| BucketmapError::corrupt(&self.path, "undecodable key"))?;
        let value = bincode::deserialize(value)
            .map_err(|e| BucketmapError::corrupt(&self.path, e.to_string()))?;
        Ok((key, value))
    }

    fn entries_from(&self, offset: u64, remaining: u64) -> Result<Entries> {
        let mut file = File::open(&self.path).map_err(|e| BucketmapError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| BucketmapError::io(&self.path, e))?;
        Ok(Entries {
            reader: BufReader::new(file),
            path: self.path.clone(),
            position: offset,
            end: self.index_offset,
            remaining,
        })
    }
}

/// Sequential cursor over a sorted map.
pub struct Entries {
    reader: BufReader<File>,
    path: PathBuf,
    position: u64,
    end: u64,
    remaining: u64,
}

impl Entries {
    fn read_entry(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = read_frame(&mut self.reader, &self.path)?;
        let value = read_frame(&mut self.reader, &self.path)?;
        self.position += 8 + key.len() as u64 + value.len() as u64;
        if self.position > self.end {
            return Err(BucketmapError::corrupt(&self.path, "entry overruns index"));
        }
        Ok((key, value))
    }
}

impl Iterator for Entries {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let entry = self.read_entry();
        if entry.is_err() {
            self.remaining = 0;
        }
        Some(entry)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            BucketmapError::corrupt(path, "unexpected end of file")
        } else {
            BucketmapError::io(path, e)
        }
    })
}

fn read_frame(reader: &mut impl Read, path: &Path) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    read_exact(reader, &mut len, path)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(BucketmapError::corrupt(path, format!("frame length {len} too large")));
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf, path)?;
    Ok(buf)
}
