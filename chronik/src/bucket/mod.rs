//! Blob buckets: per-bucket key → opaque-value storage with atomic secondary
//! index fan-out.
//!
//! [`BlobStore`] is the raw layer over the shared `data` table; every write
//! runs in one writer transaction together with the index updates it entails.
//! [`Bucket`] composes typed access on top (see [`typed`]).

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    Error, Result,
    db::{Db, Tx, format_time, sql_error},
    index::{
        Condition, IndexDescriptor, IndexFieldDescriptor, IndexValue, Query, SortOrder,
        catalog::Catalog,
        query::{compile_distinct, compile_keys},
        writer,
    },
};

mod typed;

pub use typed::Bucket;

/// Multi-get statements chunk their `IN` lists at this many keys.
const FIND_MANY_CHUNK: usize = 500;

/// Typed index values for one record, keyed by index name.
pub(crate) type TypedIndexValues = HashMap<String, BTreeMap<String, IndexValue>>;

/// The raw blob store: bucketed key → value rows plus the index catalog.
#[derive(Debug)]
pub struct BlobStore {
    db: Arc<Db>,
    catalog: Catalog,
}

const INIT: &str = "
CREATE TABLE IF NOT EXISTS data (
    bucket      TEXT,
    key         TEXT,
    modified_on TEXT,
    meta        TEXT,
    value       TEXT,
    PRIMARY KEY (bucket, key)
);

CREATE TABLE IF NOT EXISTS index_data (
    bucket      TEXT,
    name        TEXT,
    meta        TEXT,
    PRIMARY KEY (bucket, name)
);
";

impl BlobStore {
    /// Opens the blob store over `db`, creating its tables and loading every
    /// persisted index descriptor.
    #[instrument(skip(db))]
    pub async fn open(db: Arc<Db>) -> Result<Self> {
        db.exec(INIT).await?;
        let catalog = Catalog::load(&db).await?;
        Ok(Self { db, catalog })
    }

    pub(crate) fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Stores `value` under `(bucket, key)` and updates every registered
    /// index from the JSON payload, atomically.
    #[instrument(skip(self, value))]
    pub async fn put_raw(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        self.put_raw_in(&mut tx, bucket, key, value, None).await?;
        self.update_indexes_in(&mut tx, bucket, key, value, None)
            .await?;
        tx.commit().await.map_err(sql_error("COMMIT"))
    }

    /// Like [`BlobStore::put_raw`], with an opaque metadata side channel.
    #[instrument(skip(self, value, meta))]
    pub async fn put_with_meta(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        meta: &[u8],
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        self.put_raw_in(&mut tx, bucket, key, value, Some(meta))
            .await?;
        self.update_indexes_in(&mut tx, bucket, key, value, None)
            .await?;
        tx.commit().await.map_err(sql_error("COMMIT"))
    }

    /// Stores many pairs and their index rows in one transaction.
    #[instrument(skip(self, pairs), fields(pairs = pairs.len()))]
    pub async fn put_raw_many(&self, bucket: &str, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for (key, value) in pairs {
            self.put_raw_in(&mut tx, bucket, key, value, None).await?;
            self.update_indexes_in(&mut tx, bucket, key, value, None)
                .await?;
        }
        tx.commit().await.map_err(sql_error("COMMIT"))
    }

    /// Upserts one data row inside the given transaction. No index fan-out.
    pub(crate) async fn put_raw_in(
        &self,
        tx: &mut Tx,
        bucket: &str,
        key: &str,
        value: &[u8],
        meta: Option<&[u8]>,
    ) -> Result<()> {
        const UPSERT: &str =
            "INSERT OR REPLACE INTO data (bucket, key, modified_on, meta, value) VALUES (?, ?, ?, ?, ?);";
        sqlx::query(UPSERT)
            .bind(bucket)
            .bind(key)
            .bind(format_time(Utc::now()))
            .bind(meta)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(sql_error(UPSERT))?;
        Ok(())
    }

    /// Fans the record out to every index registered on the bucket.
    ///
    /// `typed` carries extractor-produced values keyed by index name; indexes
    /// without an entry fall back to resolving their descriptor paths against
    /// the JSON payload.
    pub(crate) async fn update_indexes_in(
        &self,
        tx: &mut Tx,
        bucket: &str,
        key: &str,
        value: &[u8],
        typed: Option<&TypedIndexValues>,
    ) -> Result<()> {
        let descriptors = self.catalog.bucket_indexes(bucket);
        if descriptors.is_empty() {
            return Ok(());
        }

        let needs_payload = descriptors
            .iter()
            .any(|d| typed.is_none_or(|t| !t.contains_key(&d.name)));
        let payload: Option<Value> = if needs_payload {
            Some(
                serde_json::from_slice(value)
                    .map_err(|e| Error::Codec(format!("index payload for {bucket}/{key}: {e}")))?,
            )
        } else {
            None
        };

        for descriptor in descriptors {
            let values = match typed.and_then(|t| t.get(&descriptor.name)) {
                Some(values) => values.clone(),
                None => {
                    let payload = payload.as_ref().expect("payload parsed above");
                    writer::resolve_values(&descriptor, payload)?
                }
            };
            writer::upsert(tx, &descriptor, key, &values).await?;
        }
        Ok(())
    }

    /// Returns the stored value, or `None` if absent.
    pub async fn find_raw(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        const FIND: &str = "SELECT value FROM data WHERE bucket = ? AND key = ?;";
        let row = sqlx::query(FIND)
            .bind(bucket)
            .bind(key)
            .fetch_optional(self.db.reader())
            .await
            .map_err(sql_error(FIND))?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("value").map_err(sql_error(FIND))?)),
            None => Ok(None),
        }
    }

    /// Multi-get; absent keys are simply missing from the result map.
    pub async fn find_raw_many(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::new();
        for chunk in keys.chunks(FIND_MANY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let statement =
                format!("SELECT key, value FROM data WHERE bucket = ? AND key IN ({placeholders});");
            let mut query = sqlx::query(&statement).bind(bucket);
            for key in chunk {
                query = query.bind(key);
            }
            let rows = query
                .fetch_all(self.db.reader())
                .await
                .map_err(sql_error(&statement))?;
            for row in rows {
                let key: String = row.try_get("key").map_err(sql_error(&statement))?;
                let value: Vec<u8> = row.try_get("value").map_err(sql_error(&statement))?;
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Deletes the given keys and their index rows atomically.
    ///
    /// Deleting a key that is not present is an error; nothing is removed in
    /// that case.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let statement = format!("DELETE FROM data WHERE bucket = ? AND key IN ({placeholders});");

        let mut tx = self.db.begin().await?;
        let mut query = sqlx::query(&statement).bind(bucket);
        for key in keys {
            query = query.bind(key);
        }
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(sql_error(&statement))?;
        if result.rows_affected() != keys.len() as u64 {
            return Err(Error::NotFound);
        }

        for descriptor in self.catalog.bucket_indexes(bucket) {
            writer::delete_keys(&mut tx, &descriptor, keys).await?;
        }
        tx.commit().await.map_err(sql_error("COMMIT"))
    }

    /// Removes every record of the bucket and empties its index tables.
    /// Clearing an empty bucket succeeds.
    #[instrument(skip(self))]
    pub async fn clear(&self, bucket: &str) -> Result<()> {
        const CLEAR: &str = "DELETE FROM data WHERE bucket = ?;";
        let mut tx = self.db.begin().await?;
        sqlx::query(CLEAR)
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(sql_error(CLEAR))?;
        for descriptor in self.catalog.bucket_indexes(bucket) {
            writer::clear(&mut tx, &descriptor).await?;
        }
        tx.commit().await.map_err(sql_error("COMMIT"))
    }

    /// All keys of the bucket.
    pub async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        const KEYS: &str = "SELECT key FROM data WHERE bucket = ?;";
        self.fetch_keys(KEYS, |q| q.bind(bucket)).await
    }

    /// One page of keys in the given order.
    pub async fn keys_page(
        &self,
        bucket: &str,
        skip: u64,
        limit: u64,
        order: SortOrder,
    ) -> Result<Vec<String>> {
        let statement = format!(
            "SELECT key FROM data WHERE bucket = ? ORDER BY key {} LIMIT ? OFFSET ?;",
            order.sql()
        );
        self.fetch_keys(&statement, |q| {
            q.bind(bucket).bind(limit as i64).bind(skip as i64)
        })
        .await
    }

    /// All keys starting with `prefix`.
    pub async fn keys_with_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        const KEYS: &str = "SELECT key FROM data WHERE bucket = ? AND key LIKE ?;";
        self.fetch_keys(KEYS, |q| q.bind(bucket).bind(format!("{prefix}%")))
            .await
    }

    /// One page of keys starting with `prefix`, in the given order.
    pub async fn keys_with_prefix_page(
        &self,
        bucket: &str,
        prefix: &str,
        skip: u64,
        limit: u64,
        order: SortOrder,
    ) -> Result<Vec<String>> {
        let statement = format!(
            "SELECT key FROM data WHERE bucket = ? AND key LIKE ? ORDER BY key {} LIMIT ? OFFSET ?;",
            order.sql()
        );
        self.fetch_keys(&statement, |q| {
            q.bind(bucket)
                .bind(format!("{prefix}%"))
                .bind(limit as i64)
                .bind(skip as i64)
        })
        .await
    }

    async fn fetch_keys<'q, F>(&self, statement: &'q str, bind: F) -> Result<Vec<String>>
    where
        F: FnOnce(
            sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        )
            -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    {
        let rows = bind(sqlx::query(statement))
            .fetch_all(self.db.reader())
            .await
            .map_err(sql_error(statement))?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(sql_error(statement)))
            .collect()
    }

    /// Returns true if `(bucket, key)` is present.
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        const EXISTS: &str = "SELECT 1 FROM data WHERE bucket = ? AND key = ?;";
        let row = sqlx::query(EXISTS)
            .bind(bucket)
            .bind(key)
            .fetch_optional(self.db.reader())
            .await
            .map_err(sql_error(EXISTS))?;
        Ok(row.is_some())
    }

    /// Pull-based key scan in ascending key order: pages of `page_size` until
    /// a short page is observed. The producer checks `cancel` between pages.
    pub fn stream_keys(
        &self,
        bucket: &str,
        page_size: u64,
        cancel: CancellationToken,
    ) -> KeyPages<'_> {
        KeyPages {
            store: self,
            bucket: bucket.to_string(),
            page_size,
            skip: 0,
            done: false,
            cancel,
        }
    }

    // -- Index management -------------------------------------------------

    /// Looks up a registered index descriptor.
    pub fn index(&self, bucket: &str, name: &str) -> Option<Arc<IndexDescriptor>> {
        self.catalog.lookup(bucket, name)
    }

    /// Creates an index on the bucket. Identical re-creation is a no-op; a
    /// differing descriptor under the same name is rejected.
    pub async fn create_index(
        &self,
        bucket: &str,
        name: &str,
        fields: Vec<IndexFieldDescriptor>,
    ) -> Result<()> {
        self.catalog
            .create(&self.db, IndexDescriptor::new(bucket, name, fields))
            .await
    }

    /// Drops an index and its backing table.
    pub async fn drop_index(&self, bucket: &str, name: &str) -> Result<()> {
        self.catalog.drop_index(&self.db, bucket, name).await
    }

    /// Runs a compiled key query against an index.
    #[instrument(skip(self, query))]
    pub async fn query_keys(&self, bucket: &str, name: &str, query: &Query) -> Result<Vec<String>> {
        let descriptor = self.catalog.lookup(bucket, name).ok_or(Error::NotFound)?;
        let compiled = compile_keys(&descriptor, query)?;
        self.fetch_compiled(&compiled.sql, &compiled.args).await
    }

    /// Distinct values of one index field, ascending.
    pub async fn distinct(&self, bucket: &str, name: &str, field: &str) -> Result<Vec<String>> {
        self.distinct_with(bucket, name, field, &[]).await
    }

    /// Distinct values of one index field under the given conditions.
    pub async fn distinct_with(
        &self,
        bucket: &str,
        name: &str,
        field: &str,
        conditions: &[Condition],
    ) -> Result<Vec<String>> {
        let descriptor = self.catalog.lookup(bucket, name).ok_or(Error::NotFound)?;
        let compiled = compile_distinct(&descriptor, field, conditions)?;
        self.fetch_compiled(&compiled.sql, &compiled.args).await
    }

    async fn fetch_compiled(&self, sql: &str, args: &[IndexValue]) -> Result<Vec<String>> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = arg.bind(query);
        }
        let rows = query
            .fetch_all(self.db.reader())
            .await
            .map_err(sql_error(sql))?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<Option<String>, _>(0)
                    .map(Option::unwrap_or_default)
                    .map_err(sql_error(sql))
            })
            .collect()
    }
}

/// Pull-based page iterator over a bucket's keys.
#[derive(Debug)]
pub struct KeyPages<'a> {
    store: &'a BlobStore,
    bucket: String,
    page_size: u64,
    skip: u64,
    done: bool,
    cancel: CancellationToken,
}

impl KeyPages<'_> {
    /// Returns the next page, or `None` once the scan is exhausted or the
    /// cancellation token fired.
    pub async fn next_page(&mut self) -> Option<Result<Vec<String>>> {
        if self.done || self.cancel.is_cancelled() {
            return None;
        }
        let page = self
            .store
            .keys_page(&self.bucket, self.skip, self.page_size, SortOrder::Asc)
            .await;
        match page {
            Ok(keys) => {
                if (keys.len() as u64) < self.page_size {
                    self.done = true;
                }
                if keys.is_empty() {
                    return None;
                }
                self.skip += keys.len() as u64;
                Some(Ok(keys))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
