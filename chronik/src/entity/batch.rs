//! Batched saves.
//!
//! `save_many` classifies every entity against its snapshot, turns the
//! classifications into events and new snapshots, and commits them all in a
//! single writer transaction. The events travel through the unchecked
//! `create` path (each carries its own stream id), so no per-stream
//! optimistic check applies; callers that need strict optimistic concurrency
//! use the single-entity save.

use tracing::instrument;

use crate::{
    Entity, Error, Result,
    db::sql_error,
    entity::{
        EntityBlob, EntityEvent, EntityStore, UpdateAction, UpdateResult,
        diff::{Changelog, diff},
    },
    event::{RawEvent, StreamId},
};

impl<T: Entity> EntityStore<T> {
    /// Saves a batch of entities: creates the new ones, diffs the known
    /// ones, resurrects tombstones, and skips unchanged values. All
    /// resulting events and snapshots commit atomically; subscribers observe
    /// one `"$all"` update.
    #[instrument(skip(self, entities), fields(prefix = %self.prefix(), entities = entities.len()))]
    pub async fn save_many(&self, entities: &[T]) -> Result<Vec<UpdateResult>> {
        let keys: Vec<String> = entities.iter().map(Entity::entity_id).collect();
        let snapshots = self.bucket().key_values(&keys).await?;

        let mut results = Vec::with_capacity(entities.len());
        let mut events: Vec<RawEvent> = Vec::new();
        let mut blobs: Vec<(String, EntityBlob<T>)> = Vec::new();

        for entity in entities {
            let entity_id = entity.entity_id();
            let stream_id = self.stream_id(&entity_id);

            let (action, changelog, version) = match snapshots.get(&entity_id) {
                None => {
                    events.push(self.batch_event(
                        &stream_id,
                        EntityEvent::Created {
                            entity: entity.clone(),
                        },
                    )?);
                    blobs.push((entity_id.clone(), self.batch_blob(entity, &stream_id, 1, false)));
                    (UpdateAction::Create, Changelog::new(), 1)
                }
                Some(snapshot) if snapshot.deleted => {
                    let version = snapshot.stream_version + 1;
                    events.push(self.batch_event(
                        &stream_id,
                        EntityEvent::Replaced {
                            entity: entity.clone(),
                        },
                    )?);
                    blobs.push((
                        entity_id.clone(),
                        self.batch_blob(entity, &stream_id, version, false),
                    ));
                    (UpdateAction::Replace, Changelog::new(), version)
                }
                Some(snapshot) => {
                    let old = serde_json::to_value(&snapshot.data)
                        .map_err(|e| Error::Codec(e.to_string()))?;
                    let new =
                        serde_json::to_value(entity).map_err(|e| Error::Codec(e.to_string()))?;
                    match diff(&old, &new) {
                        Err(_) => {
                            let version = snapshot.stream_version + 1;
                            events.push(self.batch_event(
                                &stream_id,
                                EntityEvent::Replaced {
                                    entity: entity.clone(),
                                },
                            )?);
                            blobs.push((
                                entity_id.clone(),
                                self.batch_blob(entity, &stream_id, version, false),
                            ));
                            (UpdateAction::Replace, Changelog::new(), version)
                        }
                        Ok(changelog) if changelog.is_empty() => {
                            (UpdateAction::None, changelog, snapshot.stream_version)
                        }
                        Ok(changelog) => {
                            let version = snapshot.stream_version + 1;
                            events.push(self.batch_event(
                                &stream_id,
                                EntityEvent::Changed {
                                    entity_id: entity_id.clone(),
                                    changelog: changelog.clone(),
                                },
                            )?);
                            blobs.push((
                                entity_id.clone(),
                                self.batch_blob(entity, &stream_id, version, false),
                            ));
                            (UpdateAction::Change, changelog, version)
                        }
                    }
                }
            };
            results.push(UpdateResult {
                id: entity_id,
                action,
                changelog,
                version,
                store_version: 0,
            });
        }

        if !events.is_empty() {
            let mut tx = self.log().db().begin().await?;
            self.commit_batch_in(&mut tx, &events, &blobs).await?;
            tx.commit().await.map_err(sql_error("COMMIT"))?;
            self.log().publish(&StreamId::all());
        }

        let store_version = self.store_version().await?;
        for result in &mut results {
            result.store_version = store_version;
        }
        Ok(results)
    }

    fn batch_event(&self, stream_id: &StreamId, event: EntityEvent<T>) -> Result<RawEvent> {
        let mut raw = self.codec().encode(&event)?;
        raw.stream_id = stream_id.clone();
        Ok(raw)
    }

    fn batch_blob(
        &self,
        entity: &T,
        stream_id: &StreamId,
        stream_version: u64,
        deleted: bool,
    ) -> EntityBlob<T> {
        EntityBlob {
            entity_id: entity.entity_id(),
            stream_id: stream_id.as_str().to_string(),
            stream_version,
            deleted,
            data: entity.clone(),
        }
    }
}
