//! The typed entity store and its event and snapshot types.
//!
//! Every entity type gets a dedicated event stream per entity instance
//! (`<prefix>:<entity_id>`) and one snapshot blob per instance in the bucket
//! named after the prefix. The history of an instance is a sequence of
//! [`EntityEvent`]s; the snapshot carries the latest value and the stream
//! version it corresponds to.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{Entity, Error, Result, event::EventBody};

mod batch;
pub mod diff;
mod store;

pub use diff::{Change, ChangeOp, Changelog, DiffError};
pub use store::{EntityPages, EntityStore};

/// The action a save or delete resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    /// Nothing changed; no event was appended.
    None,
    /// A first event created the stream.
    Create,
    /// A changelog event was appended.
    Change,
    /// The entity was tombstoned.
    Delete,
    /// The entity value was replaced wholesale.
    Replace,
}

/// The outcome of a save, delete or batched save.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// The entity id.
    pub id: String,
    /// The resolved action.
    pub action: UpdateAction,
    /// The changelog of a [`UpdateAction::Change`]; empty otherwise.
    pub changelog: Changelog,
    /// The stream version after the action.
    pub version: u64,
    /// The store version after the action.
    pub store_version: u64,
}

/// The snapshot payload persisted per entity instance.
///
/// A tombstoned snapshot (`deleted = true`) may still carry the last-known
/// value, but reads never return it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: serde::de::DeserializeOwned"
))]
pub struct EntityBlob<T> {
    /// The entity id.
    #[serde(rename = "entity-id")]
    pub entity_id: String,
    /// The entity's stream id.
    #[serde(rename = "stream-id")]
    pub stream_id: String,
    /// The stream version this snapshot corresponds to.
    #[serde(rename = "stream-version")]
    pub stream_version: u64,
    /// True once the entity was deleted (and not yet resurrected).
    pub deleted: bool,
    /// The entity value.
    pub data: T,
}

/// The domain events an entity store records, discriminated as
/// `<prefix>:created|changed|deleted|replaced`.
#[derive(Debug, Clone)]
pub enum EntityEvent<T> {
    /// The entity came into existence; carries the whole value.
    Created {
        /// The created entity.
        entity: T,
    },
    /// The entity changed; carries the diff changelog.
    Changed {
        /// The entity id.
        entity_id: String,
        /// The path-by-path changes.
        changelog: Changelog,
    },
    /// The entity was deleted.
    Deleted {
        /// The entity id.
        entity_id: String,
    },
    /// The entity value was replaced wholesale, either because a diff was
    /// inapplicable or because a deleted entity was re-introduced.
    Replaced {
        /// The new entity value.
        entity: T,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: DeserializeOwned"
))]
struct EntityCarrier<T> {
    entity: T,
}

#[derive(Serialize, Deserialize)]
struct ChangedCarrier {
    #[serde(rename = "entity-id")]
    entity_id: String,
    changelog: Changelog,
}

#[derive(Serialize, Deserialize)]
struct DeletedCarrier {
    #[serde(rename = "entity-id")]
    entity_id: String,
}

fn codec_error(e: serde_json::Error) -> Error {
    Error::Codec(e.to_string())
}

impl<T: Entity> EventBody for EntityEvent<T> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Changed { .. } => "changed",
            Self::Deleted { .. } => "deleted",
            Self::Replaced { .. } => "replaced",
        }
    }

    fn kinds() -> &'static [&'static str] {
        &["created", "changed", "deleted", "replaced"]
    }

    fn to_data(&self) -> Result<Value> {
        match self {
            Self::Created { entity } | Self::Replaced { entity } => {
                serde_json::to_value(EntityCarrier {
                    entity: entity.clone(),
                })
                .map_err(codec_error)
            }
            Self::Changed {
                entity_id,
                changelog,
            } => serde_json::to_value(ChangedCarrier {
                entity_id: entity_id.clone(),
                changelog: changelog.clone(),
            })
            .map_err(codec_error),
            Self::Deleted { entity_id } => serde_json::to_value(DeletedCarrier {
                entity_id: entity_id.clone(),
            })
            .map_err(codec_error),
        }
    }

    fn from_data(kind: &str, data: Value) -> Result<Self> {
        match kind {
            "created" => {
                let carrier: EntityCarrier<T> =
                    serde_json::from_value(data).map_err(codec_error)?;
                Ok(Self::Created {
                    entity: carrier.entity,
                })
            }
            "changed" => {
                let carrier: ChangedCarrier = serde_json::from_value(data).map_err(codec_error)?;
                Ok(Self::Changed {
                    entity_id: carrier.entity_id,
                    changelog: carrier.changelog,
                })
            }
            "deleted" => {
                let carrier: DeletedCarrier = serde_json::from_value(data).map_err(codec_error)?;
                Ok(Self::Deleted {
                    entity_id: carrier.entity_id,
                })
            }
            "replaced" => {
                let carrier: EntityCarrier<T> =
                    serde_json::from_value(data).map_err(codec_error)?;
                Ok(Self::Replaced {
                    entity: carrier.entity,
                })
            }
            other => Err(Error::Codec(format!("unknown entity event kind {other:?}"))),
        }
    }
}
