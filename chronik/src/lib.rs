//! # Chronik
//!
//! `chronik` is an embedded, single-process document store built from three
//! tightly coupled parts:
//!
//! - **[`EventLog`]**: an append-only event log with per-stream monotonic
//!   versioning and optimistic concurrency control.
//! - **[`EntityStore`]**: a typed store layered on the event log, persisting
//!   snapshots of user-defined entities and recording their history as
//!   created / changed / deleted / replaced events.
//! - **[`Bucket`]**: a key → value blob bucket with user-defined secondary
//!   indexes, queryable with filters, sort and substring search.
//!
//! All persistence goes through SQLite. A single [`Db`] handle carries a
//! serialized writer connection and a read-only pool; every mutation runs in
//! one writer transaction, so an entity save commits its event, its snapshot
//! and all index rows atomically, or none of them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use chronik::{Db, BlobStore, EventLog, EntityStore, Entity};
//! use chronik::index::{Condition, Comparator, IndexField, IndexFieldType, LimitOffset, Query};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Customer {
//!     id: String,
//!     name: String,
//!     balance: i64,
//! }
//!
//! impl Entity for Customer {
//!     fn entity_id(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! async fn example() -> chronik::Result<()> {
//!     let db = Arc::new(Db::open("customers.db").await?);
//!     let log = Arc::new(EventLog::open(db.clone()).await?);
//!     let blobs = Arc::new(BlobStore::open(db).await?);
//!
//!     let customers = EntityStore::<Customer>::new("customer", log, blobs)?;
//!     customers
//!         .add_or_update_index(
//!             "by_name",
//!             vec![
//!                 IndexField::new("name", IndexFieldType::Str, |c: &Customer| c.name.clone().into()),
//!                 IndexField::new("balance", IndexFieldType::Int, |c: &Customer| c.balance.into()),
//!             ],
//!         )
//!         .await?;
//!
//!     customers
//!         .save(&Customer {
//!             id: "c1".into(),
//!             name: "acme".into(),
//!             balance: 100,
//!         })
//!         .await?;
//!
//!     let rich = customers
//!         .query_index(
//!             "by_name",
//!             &Query::new(LimitOffset::new(10, 0))
//!                 .condition(Condition::new("balance", Comparator::Gte, 100)),
//!         )
//!         .await?;
//!     assert_eq!(rich.len(), 1);
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};

pub mod bucket;
pub mod db;
pub mod entity;
pub mod event;
pub mod index;
pub mod value;

pub use bucket::{BlobStore, Bucket};
pub use db::Db;
pub use entity::{EntityBlob, EntityEvent, EntityStore, UpdateAction, UpdateResult};
pub use event::{EventLog, RawEvent, StreamId};

/// The error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An addressable record is absent or tombstoned.
    #[error("not found")]
    NotFound,
    /// A traversal path (or a derived identifier) is structurally invalid.
    #[error("bad path: {0}")]
    BadPath(String),
    /// An append's expected stream version did not match the committed one,
    /// indicating a concurrency conflict. Callers reload and retry.
    #[error("expected-version-error: expected {expected}, actual {actual}")]
    ExpectedVersion {
        /// The version the caller expected the stream to be at.
        expected: u64,
        /// The version the stream was actually at.
        actual: u64,
    },
    /// A query referred to a field that is not part of the index descriptor.
    #[error("index has no field {0:?}")]
    UnknownField(String),
    /// A record or sequence value without a canonical string form was offered
    /// to the indexer or to a query filter.
    #[error("unencodable value for {0:?}")]
    UnencodableValue(String),
    /// An update was called with entities carrying different ids.
    #[error("identity mismatch: old {old:?}, new {new:?}")]
    IdentityMismatch {
        /// Id of the stored entity.
        old: String,
        /// Id of the entity passed in.
        new: String,
    },
    /// Wraps an error from the SQL engine, carrying the failing statement.
    #[error("sql failure in {statement:?}: {source}")]
    Sql {
        /// The statement (or operation) that failed.
        statement: String,
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },
    /// A type discriminator was not registered, or a payload failed to
    /// (de)serialize.
    #[error("codec failure: {0}")]
    Codec(String),
    /// A subscription fell behind the publisher and dropped updates.
    #[error("subscription lagged by {0} updates")]
    Lagged(u64),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A persistable domain entity.
///
/// Entities must be serializable, deserializable, clonable, and debuggable.
/// The `Entity` derive macro from `chronik-derive` can be used to implement
/// this trait from a struct's `id` field.
pub trait Entity: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Returns the unique identifier of the entity.
    fn entity_id(&self) -> String;
}
