//! Typed access to a blob bucket.
//!
//! A [`Bucket`] serializes its payload type to canonical JSON and keeps the
//! extractor functions of every index it registered, so index rows are
//! projected from the typed value instead of re-traversing the stored JSON.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    Error, Result,
    bucket::{BlobStore, KeyPages, TypedIndexValues},
    db::Tx,
    index::{Condition, IndexDescriptor, IndexField, IndexValue, Query},
};

/// Page size used when rebuilding an index from existing records.
const REBUILD_PAGE: u64 = 500;

/// A typed view over one bucket of the blob store.
pub struct Bucket<T> {
    name: String,
    store: Arc<BlobStore>,
    indexes: RwLock<HashMap<String, Vec<IndexField<T>>>>,
}

impl<T> fmt::Debug for Bucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T> Bucket<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a typed view over the bucket `name`.
    pub fn new(store: Arc<BlobStore>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            store,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(format!("bucket {}: {e}", self.name)))
    }

    fn decode(&self, raw: &[u8]) -> Result<T> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(format!("bucket {}: {e}", self.name)))
    }

    /// Projects the registered extractor values for one record.
    fn index_values(&self, value: &T) -> TypedIndexValues {
        let indexes = self.indexes.read().expect("index registry poisoned");
        indexes
            .iter()
            .map(|(name, fields)| {
                let values: BTreeMap<String, IndexValue> = fields
                    .iter()
                    .map(|f| (f.descriptor.name.clone(), (f.extract)(value)))
                    .collect();
                (name.clone(), values)
            })
            .collect()
    }

    /// Stores `value` under `key`, updating every registered index
    /// atomically.
    #[instrument(skip(self, value), fields(bucket = %self.name))]
    pub async fn save(&self, key: &str, value: &T) -> Result<()> {
        let mut tx = self.store.db().begin().await?;
        self.save_in(&mut tx, key, value).await?;
        tx.commit()
            .await
            .map_err(crate::db::sql_error("COMMIT"))
    }

    /// Stores many pairs and their index rows in one transaction.
    #[instrument(skip(self, pairs), fields(bucket = %self.name, pairs = pairs.len()))]
    pub async fn save_many(&self, pairs: &[(String, T)]) -> Result<()> {
        let mut tx = self.store.db().begin().await?;
        for (key, value) in pairs {
            self.save_in(&mut tx, key, value).await?;
        }
        tx.commit()
            .await
            .map_err(crate::db::sql_error("COMMIT"))
    }

    /// Writes one record and its index rows inside the given transaction.
    pub(crate) async fn save_in(&self, tx: &mut Tx, key: &str, value: &T) -> Result<()> {
        let raw = self.encode(value)?;
        self.store
            .put_raw_in(tx, &self.name, key, &raw, None)
            .await?;
        let typed = self.index_values(value);
        self.store
            .update_indexes_in(tx, &self.name, key, &raw, Some(&typed))
            .await
    }

    /// Returns the decoded record, or `None` if absent.
    pub async fn find(&self, key: &str) -> Result<Option<T>> {
        match self.store.find_raw(&self.name, key).await? {
            Some(raw) => Ok(Some(self.decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Decoded records for the given keys, in key order; absent keys are
    /// skipped.
    pub async fn find_many(&self, keys: &[String]) -> Result<Vec<T>> {
        let raw = self.store.find_raw_many(&self.name, keys).await?;
        let mut values = Vec::with_capacity(raw.len());
        for key in keys {
            if let Some(bytes) = raw.get(key) {
                values.push(self.decode(bytes)?);
            }
        }
        Ok(values)
    }

    /// Decoded records keyed by their key; absent keys are skipped.
    pub async fn key_values(&self, keys: &[String]) -> Result<HashMap<String, T>> {
        let raw = self.store.find_raw_many(&self.name, keys).await?;
        let mut values = HashMap::with_capacity(raw.len());
        for (key, bytes) in &raw {
            values.insert(key.clone(), self.decode(bytes)?);
        }
        Ok(values)
    }

    /// Deletes the given keys and their index rows atomically.
    pub async fn delete(&self, keys: &[String]) -> Result<()> {
        self.store.delete(&self.name, keys).await
    }

    /// Removes every record of the bucket and empties its index tables.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.name).await
    }

    /// Returns true if `key` is present.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.name, key).await
    }

    /// All keys of the bucket.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.keys(&self.name).await
    }

    /// Pull-based key scan; see [`BlobStore::stream_keys`].
    pub fn stream_keys(&self, page_size: u64, cancel: CancellationToken) -> KeyPages<'_> {
        self.store.stream_keys(&self.name, page_size, cancel)
    }

    /// Keys matching the query, straight from the index.
    pub async fn query_keys(&self, index: &str, query: &Query) -> Result<Vec<String>> {
        self.store.query_keys(&self.name, index, query).await
    }

    /// Records matching the query, decoded in index result order.
    #[instrument(skip(self, query), fields(bucket = %self.name))]
    pub async fn query(&self, index: &str, query: &Query) -> Result<Vec<T>> {
        let keys = self.store.query_keys(&self.name, index, query).await?;
        self.find_many(&keys).await
    }

    /// Distinct values of one index field, ascending.
    pub async fn distinct(&self, index: &str, field: &str) -> Result<Vec<String>> {
        self.store.distinct(&self.name, index, field).await
    }

    /// Distinct values of one index field under the given conditions.
    pub async fn distinct_with(
        &self,
        index: &str,
        field: &str,
        conditions: &[Condition],
    ) -> Result<Vec<String>> {
        self.store
            .distinct_with(&self.name, index, field, conditions)
            .await
    }

    /// Declares (or evolves) an index over this bucket.
    ///
    /// A new index is created and rebuilt from all existing records. An index
    /// whose persisted descriptor equals the declaration is left untouched
    /// (the extractors are still installed for subsequent saves). A differing
    /// descriptor is dropped, re-created and rebuilt from scratch.
    #[instrument(skip(self, fields), fields(bucket = %self.name, index = name))]
    pub async fn add_or_update_index(&self, name: &str, fields: Vec<IndexField<T>>) -> Result<()> {
        let descriptor = IndexDescriptor::new(
            &self.name,
            name,
            fields.iter().map(|f| f.descriptor.clone()).collect(),
        );

        let existing = self.store.catalog().lookup(&self.name, name);
        match existing {
            None => {
                self.store
                    .catalog()
                    .create(self.store.db(), descriptor.clone())
                    .await?;
            }
            Some(current) if *current == descriptor => {
                self.register(name, fields);
                return Ok(());
            }
            Some(_) => {
                debug!(index = name, "descriptor changed, rebuilding");
                self.store.catalog().drop_index(self.store.db(), &self.name, name).await?;
                self.store
                    .catalog()
                    .create(self.store.db(), descriptor.clone())
                    .await?;
            }
        }

        self.register(name, fields.clone());
        self.rebuild(&descriptor, &fields).await
    }

    fn register(&self, name: &str, fields: Vec<IndexField<T>>) {
        self.indexes
            .write()
            .expect("index registry poisoned")
            .insert(name.to_string(), fields);
    }

    /// Re-derives every index row from the stored records, in one writer
    /// transaction: a rebuild either completes or leaves the table empty.
    async fn rebuild(&self, descriptor: &IndexDescriptor, fields: &[IndexField<T>]) -> Result<()> {
        let mut tx = self.store.db().begin().await?;
        let mut pages = self
            .store
            .stream_keys(&self.name, REBUILD_PAGE, CancellationToken::new());
        let mut page_no = 0usize;
        while let Some(page) = pages.next_page().await {
            let keys = page?;
            page_no += 1;
            debug!(page = page_no, keys = keys.len(), "rebuild index page");
            let values = self.key_values(&keys).await?;
            for (key, value) in &values {
                let projected: BTreeMap<String, IndexValue> = fields
                    .iter()
                    .map(|f| (f.descriptor.name.clone(), (f.extract)(value)))
                    .collect();
                crate::index::writer::upsert(&mut tx, descriptor, key, &projected).await?;
            }
        }
        tx.commit()
            .await
            .map_err(crate::db::sql_error("COMMIT"))
    }
}
