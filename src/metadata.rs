//! Metadata consolidation.
//!
//! Setup and aggregation runs emit JSON metadata documents tagged with a kind
//! prefix. Documents of one kind that share an `id` are folded into one before
//! they are stored. Field contents are opaque apart from the merge rules in
//! [`MetadataKind::combine`].

use crate::error::{BucketmapError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataKind {
    Bucket,
    Datasource,
    Domain,
    Feature,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 4] = [
        MetadataKind::Bucket,
        MetadataKind::Datasource,
        MetadataKind::Domain,
        MetadataKind::Feature,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            MetadataKind::Bucket => "bucket",
            MetadataKind::Datasource => "datasource",
            MetadataKind::Domain => "domain",
            MetadataKind::Feature => "feature",
        }
    }

    pub fn from_prefix(prefix: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
            .ok_or_else(|| BucketmapError::Schema(format!("unknown metadata kind {prefix:?}")))
    }

    /// Fold `other` into `doc`. Arrays are unioned and kept sorted; for any
    /// other field the value already in `doc` wins, except that feature
    /// documents add up count fields (`count`, `*_count`, `*Count`).
    pub fn combine(self, doc: &mut MetadataDocument, other: MetadataDocument) {
        for (name, incoming) in other.fields {
            let Some(current) = doc.fields.get_mut(&name) else {
                doc.fields.insert(name, incoming);
                continue;
            };
            match (self, current, incoming) {
                (_, Value::Array(values), Value::Array(more)) => {
                    values.extend(more);
                    sort_dedup(values);
                }
                (MetadataKind::Feature, Value::Number(total), Value::Number(more))
                    if is_count_field(&name) =>
                {
                    if let Some(sum) = add_numbers(total, &more) {
                        *total = sum;
                    }
                }
                (MetadataKind::Bucket, _, _)
                | (MetadataKind::Datasource, _, _)
                | (MetadataKind::Domain, _, _)
                | (MetadataKind::Feature, _, _) => {}
            }
        }
    }
}

impl FromStr for MetadataKind {
    type Err = BucketmapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_prefix(s)
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataDocument {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl MetadataDocument {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(BucketmapError::Schema(
                "metadata document is not a JSON object".to_string(),
            ));
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(other) => {
                return Err(BucketmapError::Schema(format!(
                    "metadata id must be a string, got {other}"
                )))
            }
            None => {
                return Err(BucketmapError::Schema(
                    "metadata document has no id".to_string(),
                ))
            }
        };
        Ok(Self { id, fields })
    }

    pub fn parse(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| BucketmapError::Schema(format!("invalid metadata JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 1);
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(object)
    }
}

/// Combine every document sharing an id. Output is ordered by id.
pub fn consolidate<I, S>(kind_prefix: &str, json_values: I) -> Result<Vec<MetadataDocument>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let kind = MetadataKind::from_prefix(kind_prefix)?;
    let mut combined: BTreeMap<String, MetadataDocument> = BTreeMap::new();
    let mut inputs = 0usize;
    for json in json_values {
        let doc = MetadataDocument::parse(json.as_ref())?;
        inputs += 1;
        match combined.get_mut(&doc.id) {
            Some(existing) => kind.combine(existing, doc),
            None => {
                combined.insert(doc.id.clone(), doc);
            }
        }
    }
    debug!(%kind, inputs, outputs = combined.len(), "metadata consolidated");
    Ok(combined.into_values().collect())
}

fn is_count_field(name: &str) -> bool {
    name == "count" || name.ends_with("_count") || name.ends_with("Count")
}

fn sort_dedup(values: &mut Vec<Value>) {
    values.sort_by_cached_key(Value::to_string);
    values.dedup();
}

fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<serde_json::Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    serde_json::Number::from_f64(a.as_f64()? + b.as_f64()?)
}
