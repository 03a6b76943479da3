//! The typed entity store.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    BlobStore, Bucket, Entity, Error, Result,
    bucket::KeyPages,
    db::{Tx, sql_error},
    entity::{
        EntityBlob, EntityEvent, UpdateAction, UpdateResult,
        diff::{Changelog, diff},
    },
    event::{Codec, EventLog, QueryParams, RawEvent, StreamId, StreamUpdateSubscription},
    index::{IndexField, LimitOffset, Query},
};

/// A typed entity store over one prefix.
///
/// The store records the history of every entity instance as a dedicated
/// event stream and keeps its latest value as a snapshot blob in the bucket
/// named after the prefix. Event log and blob store must share one [`crate::Db`]:
/// every mutation appends the event and writes the snapshot (with its index
/// fan-out) in one writer transaction.
pub struct EntityStore<T: Entity> {
    prefix: String,
    log: Arc<EventLog>,
    bucket: Bucket<EntityBlob<T>>,
    codec: Codec<EntityEvent<T>>,
}

impl<T: Entity> EntityStore<T> {
    /// Creates the store for `prefix`, registering the four entity event
    /// kinds and binding the snapshot bucket of the same name.
    ///
    /// Fails if `log` and `store` were built over different databases; the
    /// shared-transaction coupling requires one.
    pub fn new(prefix: &str, log: Arc<EventLog>, store: Arc<BlobStore>) -> Result<Self> {
        if !Arc::ptr_eq(log.db(), store.db()) {
            return Err(Error::BadPath(
                "event log and blob store must share one database".to_string(),
            ));
        }
        crate::index::ensure_ident(prefix)?;
        Ok(Self {
            prefix: prefix.to_string(),
            log,
            bucket: Bucket::new(store, prefix),
            codec: Codec::new(prefix),
        })
    }

    /// The store's type-name prefix (also its bucket name).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The codec translating this store's events.
    pub fn codec(&self) -> &Codec<EntityEvent<T>> {
        &self.codec
    }

    /// The id of the stream recording the history of `entity_id`.
    pub fn stream_id(&self, entity_id: &str) -> StreamId {
        StreamId::from(format!("{}:{entity_id}", self.prefix))
    }

    /// The entity id addressed by one of this store's stream ids.
    pub fn entity_id(&self, stream_id: &StreamId) -> String {
        stream_id
            .as_str()
            .strip_prefix(&format!("{}:", self.prefix))
            .unwrap_or(stream_id.as_str())
            .to_string()
    }

    /// The version of the whole event log.
    pub async fn store_version(&self) -> Result<u64> {
        self.log.store_version().await
    }

    /// Subscribes to committed updates on the `"$all"` stream. For
    /// per-entity updates, subscribe on the log with a concrete stream id.
    pub fn subscribe(&self) -> StreamUpdateSubscription {
        self.log.subscribe(StreamId::all())
    }

    /// Loads the live value and stream version of an entity. Tombstoned
    /// snapshots read as absent.
    pub async fn load(&self, entity_id: &str) -> Result<Option<(T, u64)>> {
        Ok(self
            .bucket
            .find(entity_id)
            .await?
            .filter(|blob| !blob.deleted)
            .map(|blob| (blob.data, blob.stream_version)))
    }

    /// Loads the raw snapshot of an entity, tombstones included. The save
    /// dispatch relies on seeing tombstones to resurrect via replace.
    pub async fn load_blob(&self, entity_id: &str) -> Result<Option<EntityBlob<T>>> {
        self.bucket.find(entity_id).await
    }

    /// Live values for the given ids; absent and tombstoned ids are skipped.
    pub async fn load_many(&self, entity_ids: &[String]) -> Result<Vec<T>> {
        let blobs = self.bucket.find_many(entity_ids).await?;
        Ok(blobs
            .into_iter()
            .filter(|blob| !blob.deleted)
            .map(|blob| blob.data)
            .collect())
    }

    /// Saves an entity, dispatching on its snapshot state: no snapshot means
    /// create, a tombstone means resurrect-by-replace, otherwise a diffed
    /// update.
    #[instrument(skip(self, entity), fields(prefix = %self.prefix))]
    pub async fn save(&self, entity: &T) -> Result<UpdateResult> {
        let entity_id = entity.entity_id();
        match self.load_blob(&entity_id).await? {
            Some(blob) if blob.deleted => self.replace(entity, blob.stream_version).await,
            Some(blob) if blob.stream_version > 0 => {
                self.update(entity, &blob.data, blob.stream_version).await
            }
            _ => self.create(entity).await,
        }
    }

    /// Records a `created` event for a new entity and writes its first
    /// snapshot.
    #[instrument(skip(self, entity), fields(prefix = %self.prefix))]
    pub async fn create(&self, entity: &T) -> Result<UpdateResult> {
        let entity_id = entity.entity_id();
        let event = self.codec.encode(&EntityEvent::Created {
            entity: entity.clone(),
        })?;
        self.commit(&entity_id, 0, event, self.blob(entity, 1, false))
            .await?;
        self.result(entity_id, UpdateAction::Create, Changelog::new(), 1)
            .await
    }

    /// Records a `changed` event carrying the diff from `old` to `new`.
    ///
    /// A failing diff (structural incompatibility) falls back to replace; an
    /// empty diff is a no-op reported as [`UpdateAction::None`].
    #[instrument(skip(self, new, old), fields(prefix = %self.prefix, version))]
    pub async fn update(&self, new: &T, old: &T, version: u64) -> Result<UpdateResult> {
        let old_id = old.entity_id();
        let new_id = new.entity_id();
        if old_id != new_id {
            return Err(Error::IdentityMismatch {
                old: old_id,
                new: new_id,
            });
        }

        let old_value = serde_json::to_value(old).map_err(|e| Error::Codec(e.to_string()))?;
        let new_value = serde_json::to_value(new).map_err(|e| Error::Codec(e.to_string()))?;
        let changelog = match diff(&old_value, &new_value) {
            // The entity model changed shape; patching is not applicable.
            Err(_) => return self.replace(new, version).await,
            Ok(changelog) => changelog,
        };
        if changelog.is_empty() {
            return self
                .result(new_id, UpdateAction::None, changelog, version)
                .await;
        }

        let event = self.codec.encode(&EntityEvent::Changed {
            entity_id: new_id.clone(),
            changelog: changelog.clone(),
        })?;
        self.commit(&new_id, version, event, self.blob(new, version + 1, false))
            .await?;
        self.result(new_id, UpdateAction::Change, changelog, version + 1)
            .await
    }

    /// Tombstones a live entity. Deleting an absent or already-deleted
    /// entity is an error.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn delete(&self, entity_id: &str) -> Result<UpdateResult> {
        let blob = self
            .load_blob(entity_id)
            .await?
            .filter(|blob| !blob.deleted)
            .ok_or(Error::NotFound)?;

        let event = self.codec.encode(&EntityEvent::Deleted {
            entity_id: entity_id.to_string(),
        })?;
        let version = blob.stream_version;
        self.commit(
            entity_id,
            version,
            event,
            self.blob(&blob.data, version + 1, true),
        )
        .await?;
        self.result(
            entity_id.to_string(),
            UpdateAction::Delete,
            Changelog::new(),
            version + 1,
        )
        .await
    }

    /// Records a `replaced` event carrying the whole entity.
    async fn replace(&self, entity: &T, version: u64) -> Result<UpdateResult> {
        let entity_id = entity.entity_id();
        let event = self.codec.encode(&EntityEvent::Replaced {
            entity: entity.clone(),
        })?;
        self.commit(&entity_id, version, event, self.blob(entity, version + 1, false))
            .await?;
        self.result(entity_id, UpdateAction::Replace, Changelog::new(), version + 1)
            .await
    }

    fn blob(&self, entity: &T, stream_version: u64, deleted: bool) -> EntityBlob<T> {
        let entity_id = entity.entity_id();
        EntityBlob {
            stream_id: self.stream_id(&entity_id).as_str().to_string(),
            entity_id,
            stream_version,
            deleted,
            data: entity.clone(),
        }
    }

    /// Appends one event and writes the snapshot in a single writer
    /// transaction, then notifies subscribers of the entity's stream.
    async fn commit(
        &self,
        entity_id: &str,
        expected_version: u64,
        event: RawEvent,
        blob: EntityBlob<T>,
    ) -> Result<()> {
        let stream_id = self.stream_id(entity_id);
        let mut tx = self.log.db().begin().await?;
        self.log
            .append_in(&mut tx, &stream_id, expected_version, std::slice::from_ref(&event))
            .await?;
        self.bucket.save_in(&mut tx, entity_id, &blob).await?;
        tx.commit().await.map_err(sql_error("COMMIT"))?;
        self.log.publish(&stream_id);
        Ok(())
    }

    pub(crate) async fn commit_batch_in(
        &self,
        tx: &mut Tx,
        events: &[RawEvent],
        blobs: &[(String, EntityBlob<T>)],
    ) -> Result<()> {
        self.log.create_in(tx, events).await?;
        for (key, blob) in blobs {
            self.bucket.save_in(tx, key, blob).await?;
        }
        Ok(())
    }

    async fn result(
        &self,
        id: String,
        action: UpdateAction,
        changelog: Changelog,
        version: u64,
    ) -> Result<UpdateResult> {
        Ok(UpdateResult {
            id,
            action,
            changelog,
            version,
            store_version: self.log.store_version().await?,
        })
    }

    /// Pull-based pages of live entities, in ascending key order. Tombstoned
    /// snapshots are skipped.
    pub fn stream_entities(
        &self,
        page_size: u64,
        cancel: CancellationToken,
    ) -> EntityPages<'_, T> {
        EntityPages {
            store: self,
            pages: self.bucket.stream_keys(page_size, cancel),
        }
    }

    /// Raw events of the whole log at `store_index >= version`, capped at
    /// `limit`. Store indexes may carry gaps after a purge; treat them as
    /// opaque cursors.
    pub async fn events_since(&self, version: u64, limit: u64) -> Result<Vec<RawEvent>> {
        self.log
            .load_slice_from_version(&StreamId::all(), version, LimitOffset::new(limit, 0))
            .await
    }

    /// Queries the event log; an absent type filter defaults to this store's
    /// prefix.
    pub async fn query(&self, params: &QueryParams, lo: LimitOffset) -> Result<Vec<RawEvent>> {
        self.log
            .query_with_type_prefix(&self.prefix, params, lo)
            .await
    }

    /// Declares (or evolves) an index over the entity fields; see
    /// [`Bucket::add_or_update_index`]. Extractors receive the entity value;
    /// tombstoned snapshots keep their index rows until resurrected or
    /// cleared.
    pub async fn add_or_update_index(&self, name: &str, fields: Vec<IndexField<T>>) -> Result<()> {
        let wrapped = fields
            .into_iter()
            .map(|field| field.map_source(|blob: &EntityBlob<T>| &blob.data))
            .collect();
        self.bucket.add_or_update_index(name, wrapped).await
    }

    /// Live entities matching an index query, in index result order.
    pub async fn query_index(&self, index: &str, query: &Query) -> Result<Vec<T>> {
        let blobs = self.bucket.query(index, query).await?;
        Ok(blobs
            .into_iter()
            .filter(|blob| !blob.deleted)
            .map(|blob| blob.data)
            .collect())
    }

    pub(crate) fn bucket(&self) -> &Bucket<EntityBlob<T>> {
        &self.bucket
    }

    pub(crate) fn log(&self) -> &Arc<EventLog> {
        &self.log
    }
}

impl<T: Entity> std::fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Pull-based pages of live entities.
#[derive(Debug)]
pub struct EntityPages<'a, T: Entity> {
    store: &'a EntityStore<T>,
    pages: KeyPages<'a>,
}

impl<T: Entity> EntityPages<'_, T> {
    /// Returns the next page of live entities, or `None` once the scan is
    /// exhausted or cancelled. A page may come back empty when it contained
    /// only tombstones.
    pub async fn next_page(&mut self) -> Option<Result<Vec<T>>> {
        let keys = match self.pages.next_page().await? {
            Ok(keys) => keys,
            Err(e) => return Some(Err(e)),
        };
        let blobs = match self.store.bucket.find_many(&keys).await {
            Ok(blobs) => blobs,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(blobs
            .into_iter()
            .filter(|blob| !blob.deleted)
            .map(|blob| blob.data)
            .collect()))
    }
}
