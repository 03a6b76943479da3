//! Secondary indexes over blob buckets.
//!
//! An index is declared per bucket as an ordered list of typed fields. Each
//! field is populated either by a registered extractor function (the typed
//! path, see [`IndexField`]) or by resolving the field's slash path against
//! the stored JSON payload (the schema-less fallback). Indexes materialize
//! into one backing table per index, `_index_<bucket>_<name>`, with `key` as
//! primary key and one SQL index per field.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, db::format_time};

pub(crate) mod catalog;
pub(crate) mod query;
pub(crate) mod writer;

pub use query::{Comparator, Condition, LimitOffset, Query, Search, Sort, SortOrder};

/// The column type of an index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexFieldType {
    /// No declared type; the column falls back to `TEXT`.
    #[serde(rename = "")]
    #[default]
    Any,
    /// A `TEXT` column.
    #[serde(rename = "string")]
    Str,
    /// An `INTEGER` column.
    #[serde(rename = "int")]
    Int,
    /// A `REAL` column.
    #[serde(rename = "float")]
    Float,
}

impl IndexFieldType {
    pub(crate) fn column_type(self) -> &'static str {
        match self {
            Self::Int => "INTEGER",
            Self::Float => "REAL",
            Self::Str | Self::Any => "TEXT",
        }
    }
}

/// The persisted schema of one index field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFieldDescriptor {
    /// Column name in the backing table.
    pub name: String,
    /// Slash path resolved against the payload when no extractor is
    /// registered for the index.
    pub path: String,
    /// Declared column type.
    #[serde(rename = "type")]
    pub field_type: IndexFieldType,
}

/// The persisted schema of a secondary index.
///
/// Equality is structural over bucket, name, backing table and the ordered
/// field list; it decides whether an existing index must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// The bucket this index belongs to.
    pub bucket: String,
    /// The index name, unique per bucket.
    pub name: String,
    /// Name of the backing table, derived from `(bucket, name)`.
    pub table_name: String,
    /// Ordered field descriptors.
    pub fields: Vec<IndexFieldDescriptor>,
}

impl IndexDescriptor {
    /// Builds a descriptor with the derived backing-table name.
    pub fn new(bucket: &str, name: &str, fields: Vec<IndexFieldDescriptor>) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
            table_name: index_table_name(bucket, name),
            fields,
        }
    }

    /// Returns true if the descriptor carries a field with the given name.
    pub fn contains_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

pub(crate) fn index_table_name(bucket: &str, name: &str) -> String {
    format!("_index_{bucket}_{name}")
}

/// Validates a name that is interpolated into SQL (bucket, index, field).
pub(crate) fn ensure_ident(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::BadPath(format!("invalid identifier {name:?}")))
    }
}

/// A single cell value bound into an index column.
///
/// The `From` conversions below are the canonical-string capability of the
/// index layer: a type can be indexed or filtered on exactly when it converts
/// into an `IndexValue`. Times render as RFC3339 with nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// Absent value; binds SQL NULL.
    Null,
    /// Text cell.
    Text(String),
    /// Integer cell.
    Integer(i64),
    /// Float cell.
    Real(f64),
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for IndexValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for IndexValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for IndexValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<f32> for IndexValue {
    fn from(v: f32) -> Self {
        Self::Real(f64::from(v))
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<DateTime<Utc>> for IndexValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Text(format_time(v))
    }
}

impl<V: Into<IndexValue>> From<Option<V>> for IndexValue {
    fn from(v: Option<V>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One field of a typed bucket index: the persisted descriptor plus the
/// extractor producing the indexed value from the payload.
pub struct IndexField<T> {
    pub(crate) descriptor: IndexFieldDescriptor,
    pub(crate) extract: Arc<dyn Fn(&T) -> IndexValue + Send + Sync>,
}

impl<T: 'static> IndexField<T> {
    /// Declares a field whose path defaults to its name.
    pub fn new(
        name: &str,
        field_type: IndexFieldType,
        extract: impl Fn(&T) -> IndexValue + Send + Sync + 'static,
    ) -> Self {
        Self {
            descriptor: IndexFieldDescriptor {
                name: name.to_string(),
                path: name.to_string(),
                field_type,
            },
            extract: Arc::new(extract),
        }
    }

    /// Overrides the fallback path recorded in the descriptor.
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.descriptor.path = path.to_string();
        self
    }

    /// Re-roots the extractor through a projection, keeping the descriptor.
    pub(crate) fn map_source<U>(
        self,
        project: impl Fn(&U) -> &T + Send + Sync + 'static,
    ) -> IndexField<U> {
        let extract = self.extract;
        IndexField {
            descriptor: self.descriptor,
            extract: Arc::new(move |u| extract(project(u))),
        }
    }
}

impl<T> Clone for IndexField<T> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<T> fmt::Debug for IndexField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexField")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
