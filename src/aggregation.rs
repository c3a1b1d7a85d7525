//! # Bitmap Aggregation
//!
//! Merges every bit-position fragment that shares an aggregation key into one
//! canonical bitmap, then names the result for the table store.
//!
//! ```text
//!   AwaitGroup ──begin──▶ Accumulate ──flush──▶ AwaitGroup
//!                          │     ▲
//!                          └─────┘ accumulate
//! ```
//!
//! Fragments arrive unordered and may repeat positions. Positions are collected
//! into an ordered set and only then set into the bitmap, strictly ascending,
//! so the output bytes are identical regardless of arrival order.

use crate::error::{BucketmapError, Result};
use crate::lookup::IndexLookup;
use crate::model::BucketReference;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Visibility label attached to every stored cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Visibility(pub String);

impl Visibility {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Visibility {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grouping granularity: fragments merge iff all six fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey {
    pub bin_number: i32,
    pub datasource_index: u32,
    pub bucket_name: String,
    pub bucket_value: String,
    pub salt: i32,
    pub visibility: Visibility,
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bin={} ds={} {}={} salt={} vis={}",
            self.bin_number,
            self.datasource_index,
            self.bucket_name,
            self.bucket_value,
            self.salt,
            self.visibility
        )
    }
}

/// Producer-side key. Carries a [`BucketReference`] in place of the bucket
/// name; the registry turns it into an [`AggregationKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKey {
    pub bin_number: i32,
    pub datasource_index: u32,
    pub bucket: BucketReference,
    pub salt: i32,
    pub visibility: Visibility,
}

impl FragmentKey {
    pub fn to_aggregation_key(&self, bucket_name: &str) -> AggregationKey {
        AggregationKey {
            bin_number: self.bin_number,
            datasource_index: self.datasource_index,
            bucket_name: bucket_name.to_string(),
            bucket_value: self.bucket.value.clone(),
            salt: self.salt,
            visibility: self.visibility.clone(),
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bin={} ds={} {} salt={} vis={}",
            self.bin_number, self.datasource_index, self.bucket, self.salt, self.visibility
        )
    }
}

/// Unordered bit positions produced by one worker for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFragment {
    pub positions: Vec<u32>,
}

impl From<Vec<u32>> for BitFragment {
    fn from(positions: Vec<u32>) -> Self {
        Self { positions }
    }
}

impl FromIterator<u32> for BitFragment {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

/// One output cell for the table store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// `{bin}:{datasource}:{bucket_name}`
    pub storage_key: String,
    pub bucket_value: String,
    /// Decimal salt.
    pub salt: String,
    pub visibility: Visibility,
    /// Portable roaring serialization.
    pub bitmap: Vec<u8>,
}

impl TableEntry {
    pub fn decode_bitmap(&self) -> Result<RoaringBitmap> {
        RoaringBitmap::deserialize_from(&self.bitmap[..])
            .map_err(|e| BucketmapError::Codec(e.to_string()))
    }
}

pub fn storage_key(bin_number: i32, datasource: &str, bucket_name: &str) -> String {
    format!("{bin_number}:{datasource}:{bucket_name}")
}

#[derive(Debug)]
enum AggregatorState {
    AwaitGroup,
    Accumulate {
        key: AggregationKey,
        bits: BTreeSet<u32>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub groups_flushed: u64,
    pub groups_failed: u64,
    pub bits_set: u64,
}

/// Per-worker aggregator. Processes one group at a time.
#[derive(Debug)]
pub struct BitmapAggregator<L> {
    datasources: L,
    state: AggregatorState,
    stats: AggregatorStats,
}

impl<L: IndexLookup> BitmapAggregator<L> {
    pub fn new(datasources: L) -> Self {
        Self {
            datasources,
            state: AggregatorState::AwaitGroup,
            stats: AggregatorStats::default(),
        }
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, AggregatorState::Accumulate { .. })
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn begin(&mut self, key: AggregationKey) -> Result<()> {
        if let AggregatorState::Accumulate { key: open, .. } = &self.state {
            return Err(BucketmapError::Schema(format!(
                "cannot begin group {key} while group {open} is open"
            )));
        }
        self.state = AggregatorState::Accumulate {
            key,
            bits: BTreeSet::new(),
        };
        Ok(())
    }

    pub fn accumulate(&mut self, fragment: &BitFragment) -> Result<()> {
        match &mut self.state {
            AggregatorState::Accumulate { bits, .. } => {
                bits.extend(fragment.positions.iter().copied());
                Ok(())
            }
            AggregatorState::AwaitGroup => Err(BucketmapError::Schema(
                "fragment delivered with no open group".to_string(),
            )),
        }
    }

    /// Close the open group and produce its single output entry. On failure
    /// nothing is emitted; either way the aggregator is ready for the next
    /// group.
    pub fn flush(&mut self) -> Result<TableEntry> {
        let (key, bits) = match std::mem::replace(&mut self.state, AggregatorState::AwaitGroup) {
            AggregatorState::Accumulate { key, bits } => (key, bits),
            AggregatorState::AwaitGroup => {
                return Err(BucketmapError::Schema("flush with no open group".to_string()))
            }
        };
        match self.build_entry(&key, &bits) {
            Ok(entry) => {
                self.stats.groups_flushed += 1;
                self.stats.bits_set += bits.len() as u64;
                debug!(key = %key, bits = bits.len(), bytes = entry.bitmap.len(), "group flushed");
                Ok(entry)
            }
            Err(e) => {
                self.stats.groups_failed += 1;
                Err(e)
            }
        }
    }

    /// Drop a partially accumulated group without emitting anything.
    pub fn discard(&mut self) -> Option<AggregationKey> {
        match std::mem::replace(&mut self.state, AggregatorState::AwaitGroup) {
            AggregatorState::Accumulate { key, .. } => Some(key),
            AggregatorState::AwaitGroup => None,
        }
    }

    /// Run one full group through the state machine.
    pub fn aggregate<'a, I>(&mut self, key: AggregationKey, fragments: I) -> Result<TableEntry>
    where
        I: IntoIterator<Item = &'a BitFragment>,
    {
        self.begin(key)?;
        for fragment in fragments {
            self.accumulate(fragment)?;
        }
        self.flush()
    }

    fn build_entry(&self, key: &AggregationKey, bits: &BTreeSet<u32>) -> Result<TableEntry> {
        let datasource = self
            .datasources
            .get_item(key.datasource_index)
            .map_err(|e| BucketmapError::Resolution {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let bitmap = RoaringBitmap::from_sorted_iter(bits.iter().copied()).map_err(|e| {
            BucketmapError::Schema(format!(
                "bit positions not ascending after {} values",
                e.valid_until()
            ))
        })?;
        let mut bytes = Vec::with_capacity(bitmap.serialized_size());
        bitmap
            .serialize_into(&mut bytes)
            .map_err(|e| BucketmapError::Codec(e.to_string()))?;

        Ok(TableEntry {
            storage_key: storage_key(key.bin_number, datasource, &key.bucket_name),
            bucket_value: key.bucket_value.clone(),
            salt: key.salt.to_string(),
            visibility: key.visibility.clone(),
            bitmap: bytes,
        })
    }
}
