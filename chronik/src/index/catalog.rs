//! Persisted registry of the indexes declared per bucket.
//!
//! Descriptors live as JSON in the `index_data` table and are cached in
//! memory. The cache hands out `Arc` snapshots so readers are unaffected by a
//! concurrent create or drop; the cache itself is only mutated after the
//! owning writer transaction committed.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::Row;
use tracing::instrument;

use crate::{
    Error, Result,
    db::{Db, sql_error},
    index::{IndexDescriptor, ensure_ident},
};

type CatalogKey = (String, String);

#[derive(Debug)]
pub(crate) struct Catalog {
    indexes: DashMap<CatalogKey, Arc<IndexDescriptor>>,
}

impl Catalog {
    /// Loads every persisted descriptor into memory.
    pub(crate) async fn load(db: &Db) -> Result<Self> {
        const LOAD: &str = "SELECT bucket, name, meta FROM index_data;";
        let rows = sqlx::query(LOAD)
            .fetch_all(db.reader())
            .await
            .map_err(sql_error(LOAD))?;

        let indexes = DashMap::new();
        for row in rows {
            let bucket: String = row.try_get("bucket").map_err(sql_error(LOAD))?;
            let name: String = row.try_get("name").map_err(sql_error(LOAD))?;
            let meta: String = row.try_get("meta").map_err(sql_error(LOAD))?;
            let descriptor: IndexDescriptor = serde_json::from_str(&meta)
                .map_err(|e| Error::Codec(format!("index meta for {bucket}.{name}: {e}")))?;
            indexes.insert((bucket, name), Arc::new(descriptor));
        }
        Ok(Self { indexes })
    }

    pub(crate) fn lookup(&self, bucket: &str, name: &str) -> Option<Arc<IndexDescriptor>> {
        self.indexes
            .get(&(bucket.to_string(), name.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// All descriptors registered for a bucket, as a point-in-time snapshot.
    pub(crate) fn bucket_indexes(&self, bucket: &str) -> Vec<Arc<IndexDescriptor>> {
        self.indexes
            .iter()
            .filter(|e| e.key().0 == bucket)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Creates the backing table, its per-field SQL indexes and the
    /// descriptor row in one writer transaction, then installs the
    /// descriptor in memory.
    ///
    /// Re-creating an identical index is a no-op; a differing descriptor
    /// under the same name is rejected (drop first, or use the bucket-level
    /// add-or-update which rebuilds).
    #[instrument(skip(self, db, descriptor), fields(bucket = %descriptor.bucket, name = %descriptor.name))]
    pub(crate) async fn create(&self, db: &Db, descriptor: IndexDescriptor) -> Result<()> {
        if let Some(existing) = self.lookup(&descriptor.bucket, &descriptor.name) {
            if *existing == descriptor {
                return Ok(());
            }
            return Err(Error::BadPath(format!(
                "index {}.{} already exists with a different descriptor",
                descriptor.bucket, descriptor.name
            )));
        }

        ensure_ident(&descriptor.bucket)?;
        ensure_ident(&descriptor.name)?;
        for field in &descriptor.fields {
            ensure_ident(&field.name)?;
        }

        let columns = descriptor
            .fields
            .iter()
            .map(|f| format!("{} {}", f.name, f.field_type.column_type()))
            .collect::<Vec<_>>()
            .join(",\n    ");
        let create_table = format!(
            "CREATE TABLE {} (\n    key TEXT,\n    {columns},\n    PRIMARY KEY (key)\n);",
            descriptor.table_name
        );

        let mut tx = db.begin().await?;
        sqlx::query(&create_table)
            .execute(&mut *tx)
            .await
            .map_err(sql_error(&create_table))?;

        for field in &descriptor.fields {
            let create_field_index = format!(
                "CREATE INDEX IF NOT EXISTS ix_index_{}_{}_{} ON {} ({});",
                descriptor.bucket, descriptor.name, field.name, descriptor.table_name, field.name
            );
            sqlx::query(&create_field_index)
                .execute(&mut *tx)
                .await
                .map_err(sql_error(&create_field_index))?;
        }

        const INSERT_META: &str = "INSERT INTO index_data (bucket, name, meta) VALUES (?, ?, ?);";
        let meta = serde_json::to_string(&descriptor)
            .map_err(|e| Error::Codec(format!("index meta: {e}")))?;
        sqlx::query(INSERT_META)
            .bind(&descriptor.bucket)
            .bind(&descriptor.name)
            .bind(&meta)
            .execute(&mut *tx)
            .await
            .map_err(sql_error(INSERT_META))?;

        tx.commit().await.map_err(sql_error("COMMIT"))?;

        let key = (descriptor.bucket.clone(), descriptor.name.clone());
        self.indexes.insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Drops the backing table and descriptor row, then evicts the cache.
    #[instrument(skip(self, db))]
    pub(crate) async fn drop_index(&self, db: &Db, bucket: &str, name: &str) -> Result<()> {
        ensure_ident(bucket)?;
        ensure_ident(name)?;
        let drop_table = format!(
            "DROP TABLE IF EXISTS {};",
            super::index_table_name(bucket, name)
        );

        let mut tx = db.begin().await?;
        sqlx::query(&drop_table)
            .execute(&mut *tx)
            .await
            .map_err(sql_error(&drop_table))?;

        const DELETE_META: &str = "DELETE FROM index_data WHERE bucket = ? AND name = ?;";
        sqlx::query(DELETE_META)
            .bind(bucket)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(sql_error(DELETE_META))?;
        tx.commit().await.map_err(sql_error("COMMIT"))?;

        self.indexes
            .remove(&(bucket.to_string(), name.to_string()));
        Ok(())
    }
}
