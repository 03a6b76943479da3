//! Row-level index maintenance inside a caller-supplied writer transaction.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::{Sqlite, sqlite::SqliteArguments};

use crate::{
    Error, Result,
    db::{Tx, sql_error},
    index::{IndexDescriptor, IndexValue},
    value,
};

impl IndexValue {
    pub(crate) fn bind<'q>(
        &'q self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Text(s) => query.bind(s),
            Self::Integer(i) => query.bind(*i),
            Self::Real(f) => query.bind(*f),
        }
    }
}

/// Upserts one index row. Fields missing from `values` bind NULL.
pub(crate) async fn upsert(
    tx: &mut Tx,
    descriptor: &IndexDescriptor,
    key: &str,
    values: &BTreeMap<String, IndexValue>,
) -> Result<()> {
    let mut columns = vec!["key".to_string()];
    let mut placeholders = vec!["?".to_string()];
    for field in &descriptor.fields {
        columns.push(field.name.clone());
        placeholders.push("?".to_string());
    }
    let statement = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({});",
        descriptor.table_name,
        columns.join(", "),
        placeholders.join(", ")
    );

    let mut query = sqlx::query(&statement).bind(key);
    for field in &descriptor.fields {
        query = match values.get(&field.name) {
            Some(v) => v.bind(query),
            None => query.bind(None::<String>),
        };
    }
    query
        .execute(&mut **tx)
        .await
        .map_err(sql_error(&statement))?;
    Ok(())
}

/// Resolves each descriptor path against a JSON payload.
///
/// This is the fallback for schema-less callers with no registered extractor:
/// a missing leaf indexes as NULL, scalars pass through, and a record or
/// sequence at the leaf has no canonical string form and is rejected.
pub(crate) fn resolve_values(
    descriptor: &IndexDescriptor,
    payload: &Value,
) -> Result<BTreeMap<String, IndexValue>> {
    let mut values = BTreeMap::new();
    for field in &descriptor.fields {
        let resolved = match value::resolve(payload, &field.path) {
            Ok(leaf) => leaf_value(leaf).ok_or_else(|| Error::UnencodableValue(field.name.clone()))?,
            Err(Error::NotFound) => IndexValue::Null,
            Err(e) => return Err(e),
        };
        values.insert(field.name.clone(), resolved);
    }
    Ok(values)
}

fn leaf_value(leaf: &Value) -> Option<IndexValue> {
    match leaf {
        Value::Null => Some(IndexValue::Null),
        Value::Bool(b) => Some((*b).into()),
        Value::Number(n) => Some(n.as_i64().map_or_else(
            || IndexValue::Real(n.as_f64().unwrap_or_default()),
            IndexValue::Integer,
        )),
        Value::String(s) => Some(s.as_str().into()),
        Value::Object(_) | Value::Array(_) => None,
    }
}

/// Deletes the given keys from one index table.
pub(crate) async fn delete_keys(
    tx: &mut Tx,
    descriptor: &IndexDescriptor,
    keys: &[String],
) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; keys.len()].join(", ");
    let statement = format!(
        "DELETE FROM {} WHERE key IN ({});",
        descriptor.table_name, placeholders
    );
    let mut query = sqlx::query(&statement);
    for key in keys {
        query = query.bind(key);
    }
    query
        .execute(&mut **tx)
        .await
        .map_err(sql_error(&statement))?;
    Ok(())
}

/// Empties one index table.
pub(crate) async fn clear(tx: &mut Tx, descriptor: &IndexDescriptor) -> Result<()> {
    let statement = format!("DELETE FROM {};", descriptor.table_name);
    sqlx::query(&statement)
        .execute(&mut **tx)
        .await
        .map_err(sql_error(&statement))?;
    Ok(())
}
