//! The SQLite-backed event log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;

use crate::{
    Error, Result,
    db::{Db, Tx, format_time, parse_time, sql_error},
    event::{
        EventId, QueryParams, RawEvent, StreamId,
        publish::{StreamUpdatePublisher, StreamUpdateSubscription},
    },
    index::LimitOffset,
};

const INIT: &str = "
CREATE TABLE IF NOT EXISTS events (
    id              TEXT,
    store_index     INTEGER,
    stream_id       TEXT,
    stream_index    INTEGER,
    occurred_on     TEXT,
    recorded_on     TEXT,
    type            TEXT,
    data            TEXT,
    PRIMARY KEY (store_index)
);

CREATE INDEX IF NOT EXISTS idx_events_stream
ON events (stream_id, stream_index);
";

const EVENT_COLUMNS: &str =
    "id, store_index, stream_id, stream_index, occurred_on, recorded_on, type, data";

const INSERT_EVENT: &str = "INSERT INTO events \
    (id, store_index, stream_id, stream_index, occurred_on, recorded_on, type, data) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?);";

/// The append-only, per-stream versioned event store.
#[derive(Debug)]
pub struct EventLog {
    db: Arc<Db>,
    publisher: StreamUpdatePublisher,
}

impl EventLog {
    /// Opens the event log over `db`, creating its tables.
    #[instrument(skip(db))]
    pub async fn open(db: Arc<Db>) -> Result<Self> {
        db.exec(INIT).await?;
        Ok(Self {
            db,
            publisher: StreamUpdatePublisher::new(),
        })
    }

    pub(crate) fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Subscribes to committed updates on `stream_id` (or all streams).
    pub fn subscribe(&self, stream_id: StreamId) -> StreamUpdateSubscription {
        self.publisher.subscribe(stream_id)
    }

    /// Closes every outstanding subscription.
    pub fn close_publisher(&self) {
        self.publisher.close();
    }

    pub(crate) fn publish(&self, stream_id: &StreamId) {
        self.publisher.publish(stream_id);
    }

    /// The version of a stream: `max(stream_index) + 1`, or 0 if the stream
    /// has no events.
    pub async fn stream_version(&self, stream_id: &StreamId) -> Result<u64> {
        const VERSION: &str = "SELECT MAX(stream_index) + 1 FROM events WHERE stream_id = ?;";
        let version: Option<i64> = sqlx::query_scalar(VERSION)
            .bind(stream_id.as_str())
            .fetch_one(self.db.reader())
            .await
            .map_err(sql_error(VERSION))?;
        Ok(version.unwrap_or(0) as u64)
    }

    /// The version of the whole log: `max(store_index) + 1`, or 0.
    pub async fn store_version(&self) -> Result<u64> {
        const VERSION: &str = "SELECT MAX(store_index) + 1 FROM events;";
        let version: Option<i64> = sqlx::query_scalar(VERSION)
            .fetch_one(self.db.reader())
            .await
            .map_err(sql_error(VERSION))?;
        Ok(version.unwrap_or(0) as u64)
    }

    async fn stream_version_in(tx: &mut Tx, stream_id: &StreamId) -> Result<u64> {
        const VERSION: &str = "SELECT MAX(stream_index) + 1 FROM events WHERE stream_id = ?;";
        let version: Option<i64> = sqlx::query_scalar(VERSION)
            .bind(stream_id.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(sql_error(VERSION))?;
        Ok(version.unwrap_or(0) as u64)
    }

    async fn store_version_in(tx: &mut Tx) -> Result<u64> {
        const VERSION: &str = "SELECT MAX(store_index) + 1 FROM events;";
        let version: Option<i64> = sqlx::query_scalar(VERSION)
            .fetch_one(&mut **tx)
            .await
            .map_err(sql_error(VERSION))?;
        Ok(version.unwrap_or(0) as u64)
    }

    /// Appends events to one stream under optimistic concurrency.
    ///
    /// The stream version is re-read inside the transaction; if it differs
    /// from `expected_version` nothing is written and
    /// [`Error::ExpectedVersion`] reports both values so the caller can
    /// reload and retry. Subscribers are notified after the commit.
    #[instrument(skip(self, events), fields(stream = %stream_id, expected_version, events = events.len()))]
    pub async fn append(
        &self,
        stream_id: &StreamId,
        expected_version: u64,
        events: Vec<RawEvent>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        self.append_in(&mut tx, stream_id, expected_version, &events)
            .await?;
        tx.commit().await.map_err(sql_error("COMMIT"))?;
        self.publisher.publish(stream_id);
        Ok(())
    }

    /// The transactional body of [`EventLog::append`]. Does not publish; the
    /// caller publishes after its commit.
    pub(crate) async fn append_in(
        &self,
        tx: &mut Tx,
        stream_id: &StreamId,
        expected_version: u64,
        events: &[RawEvent],
    ) -> Result<()> {
        let mut stream_version = Self::stream_version_in(tx, stream_id).await?;
        if stream_version != expected_version {
            return Err(Error::ExpectedVersion {
                expected: expected_version,
                actual: stream_version,
            });
        }
        let mut store_version = Self::store_version_in(tx).await?;

        for event in events {
            Self::insert_event_in(tx, event, stream_id, store_version, stream_version).await?;
            store_version += 1;
            stream_version += 1;
        }
        Ok(())
    }

    /// Appends events carrying their own stream ids, with no optimistic
    /// check. Stream indexes are re-derived per stream inside the
    /// transaction, so a batch with several events for one stream stays
    /// dense. Publishes one update on the `"$all"` stream.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn create(&self, events: Vec<RawEvent>) -> Result<()> {
        let mut tx = self.db.begin().await?;
        self.create_in(&mut tx, &events).await?;
        tx.commit().await.map_err(sql_error("COMMIT"))?;
        self.publisher.publish(&StreamId::all());
        Ok(())
    }

    /// The transactional body of [`EventLog::create`]. Does not publish.
    pub(crate) async fn create_in(&self, tx: &mut Tx, events: &[RawEvent]) -> Result<()> {
        let mut store_version = Self::store_version_in(tx).await?;
        let mut stream_versions: std::collections::HashMap<StreamId, u64> =
            std::collections::HashMap::new();

        for event in events {
            let stream_id = event.stream_id.clone();
            let stream_version = match stream_versions.get(&stream_id) {
                Some(version) => *version,
                None => Self::stream_version_in(tx, &stream_id).await?,
            };
            Self::insert_event_in(tx, event, &stream_id, store_version, stream_version).await?;
            stream_versions.insert(stream_id, stream_version + 1);
            store_version += 1;
        }
        Ok(())
    }

    async fn insert_event_in(
        tx: &mut Tx,
        event: &RawEvent,
        stream_id: &StreamId,
        store_index: u64,
        stream_index: u64,
    ) -> Result<()> {
        let data = serde_json::to_string(&event.data)
            .map_err(|e| Error::Codec(format!("event data: {e}")))?;
        sqlx::query(INSERT_EVENT)
            .bind(event.id.as_str())
            .bind(store_index as i64)
            .bind(stream_id.as_str())
            .bind(stream_index as i64)
            .bind(format_time(event.occurred_on))
            .bind(format_time(Utc::now()))
            .bind(&event.event_type)
            .bind(data)
            .execute(&mut **tx)
            .await
            .map_err(sql_error(INSERT_EVENT))?;
        Ok(())
    }

    /// Looks an event up by its id.
    pub async fn find(&self, id: &EventId) -> Result<Option<RawEvent>> {
        let statement = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?;");
        let row = sqlx::query(&statement)
            .bind(id.as_str())
            .fetch_optional(self.db.reader())
            .await
            .map_err(sql_error(&statement))?;
        row.map(|row| scan_event(&row)).transpose()
    }

    /// Loads a slice of a stream in ascending order: by `store_index` for
    /// `"$all"`, by `stream_index` otherwise.
    pub async fn load_slice(&self, stream_id: &StreamId, lo: LimitOffset) -> Result<Vec<RawEvent>> {
        if stream_id.is_all() {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events ORDER BY store_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(lo.limit as i64).bind(lo.offset as i64)
            })
            .await
        } else {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = ? ORDER BY stream_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(stream_id.as_str())
                    .bind(lo.limit as i64)
                    .bind(lo.offset as i64)
            })
            .await
        }
    }

    /// Like [`EventLog::load_slice`], filtered to indexes at or above
    /// `version` (store index for `"$all"`, stream index otherwise).
    pub async fn load_slice_from_version(
        &self,
        stream_id: &StreamId,
        version: u64,
        lo: LimitOffset,
    ) -> Result<Vec<RawEvent>> {
        if stream_id.is_all() {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE store_index >= ? ORDER BY store_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(version as i64)
                    .bind(lo.limit as i64)
                    .bind(lo.offset as i64)
            })
            .await
        } else {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE stream_index >= ? AND stream_id = ? ORDER BY stream_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(version as i64)
                    .bind(stream_id.as_str())
                    .bind(lo.limit as i64)
                    .bind(lo.offset as i64)
            })
            .await
        }
    }

    /// Loads a slice of a stream in descending order.
    pub async fn load_slice_descending(
        &self,
        stream_id: &StreamId,
        lo: LimitOffset,
    ) -> Result<Vec<RawEvent>> {
        if stream_id.is_all() {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events ORDER BY store_index DESC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(lo.limit as i64).bind(lo.offset as i64)
            })
            .await
        } else {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = ? ORDER BY stream_index DESC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(stream_id.as_str())
                    .bind(lo.limit as i64)
                    .bind(lo.offset as i64)
            })
            .await
        }
    }

    /// Loads a slice restricted to events whose domain time is at or before
    /// `until`.
    pub async fn load_slice_until(
        &self,
        stream_id: &StreamId,
        lo: LimitOffset,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        let until = format_time(until);
        if stream_id.is_all() {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE occurred_on <= ? ORDER BY store_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(until).bind(lo.limit as i64).bind(lo.offset as i64)
            })
            .await
        } else {
            let statement = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = ? AND occurred_on <= ? ORDER BY stream_index ASC LIMIT ? OFFSET ?;"
            );
            self.fetch_events(&statement, |q| {
                q.bind(stream_id.as_str())
                    .bind(until)
                    .bind(lo.limit as i64)
                    .bind(lo.offset as i64)
            })
            .await
        }
    }

    /// Queries the log with stream, time and type filters.
    pub async fn query(&self, params: &QueryParams, lo: LimitOffset) -> Result<Vec<RawEvent>> {
        self.query_filtered(params, None, lo).await
    }

    /// Like [`EventLog::query`], but an absent type filter defaults to
    /// `type LIKE '<prefix>:%'`.
    pub async fn query_with_type_prefix(
        &self,
        prefix: &str,
        params: &QueryParams,
        lo: LimitOffset,
    ) -> Result<Vec<RawEvent>> {
        self.query_filtered(params, Some(prefix), lo).await
    }

    async fn query_filtered(
        &self,
        params: &QueryParams,
        type_prefix: Option<&str>,
        lo: LimitOffset,
    ) -> Result<Vec<RawEvent>> {
        let mut wheres = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(stream_id) = &params.stream_id {
            if !stream_id.is_all() && !stream_id.is_empty() {
                wheres.push("stream_id = ?");
                args.push(stream_id.as_str().to_string());
            }
        }
        if let Some(to_date) = params.to_date {
            wheres.push("occurred_on <= ?");
            args.push(format_time(to_date));
        }
        match (&params.event_type, type_prefix) {
            (Some(event_type), _) => {
                wheres.push("type = ?");
                args.push(event_type.clone());
            }
            (None, Some(prefix)) => {
                wheres.push("type LIKE ?");
                args.push(format!("{prefix}:%"));
            }
            (None, None) => {}
        }

        let where_clause = if wheres.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", wheres.join(" AND "))
        };
        let sort = if params.sort_asc { "ASC" } else { "DESC" };
        let statement = format!(
            "SELECT {EVENT_COLUMNS} FROM events{where_clause} ORDER BY store_index {sort} LIMIT ? OFFSET ?;"
        );

        self.fetch_events(&statement, move |mut q| {
            for arg in args {
                q = q.bind(arg);
            }
            q.bind(lo.limit as i64).bind(lo.offset as i64)
        })
        .await
    }

    /// The latest event of every stream.
    pub async fn load_latest_from_all(&self) -> Result<Vec<RawEvent>> {
        let statement = format!(
            "WITH msi AS (SELECT stream_id, MAX(stream_index) AS max_stream_index FROM events GROUP BY stream_id) \
             SELECT {EVENT_COLUMNS} FROM events \
             INNER JOIN msi ON (events.stream_id = msi.stream_id AND events.stream_index = msi.max_stream_index);"
        );
        self.fetch_events(&statement, |q| q).await
    }

    /// The latest event of each of the given streams.
    pub async fn load_latest_from(&self, stream_ids: &[StreamId]) -> Result<Vec<RawEvent>> {
        if stream_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; stream_ids.len()].join(", ");
        let statement = format!(
            "WITH msi AS (SELECT stream_id, MAX(stream_index) AS max_stream_index FROM events \
             WHERE stream_id IN ({placeholders}) GROUP BY stream_id) \
             SELECT {EVENT_COLUMNS} FROM events \
             INNER JOIN msi ON (events.stream_id = msi.stream_id AND events.stream_index = msi.max_stream_index);"
        );
        self.fetch_events(&statement, move |mut q| {
            for stream_id in stream_ids {
                q = q.bind(stream_id.as_str());
            }
            q
        })
        .await
    }

    /// Deletes whole events recorded before `t`; returns the number removed.
    ///
    /// `store_index` density is not repaired afterwards; readers must treat
    /// store indexes as opaque cursors.
    #[instrument(skip(self))]
    pub async fn purge_before(&self, t: DateTime<Utc>) -> Result<u64> {
        const PURGE: &str = "DELETE FROM events WHERE recorded_on < ?;";
        let result = sqlx::query(PURGE)
            .bind(format_time(t))
            .execute(self.db.writer())
            .await
            .map_err(sql_error(PURGE))?;
        Ok(result.rows_affected())
    }

    /// Every distinct stream id in the log.
    pub async fn all_stream_ids(&self) -> Result<Vec<StreamId>> {
        const STREAMS: &str = "SELECT DISTINCT stream_id FROM events;";
        let rows = sqlx::query(STREAMS)
            .fetch_all(self.db.reader())
            .await
            .map_err(sql_error(STREAMS))?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("stream_id")
                    .map(StreamId::from)
                    .map_err(sql_error(STREAMS))
            })
            .collect()
    }

    async fn fetch_events<'q, F>(&self, statement: &'q str, bind: F) -> Result<Vec<RawEvent>>
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
        rows.iter().map(scan_event).collect()
    }
}

fn scan_event(row: &SqliteRow) -> Result<RawEvent> {
    let read = sql_error("scan event row");
    let occurred_on: String = row.try_get("occurred_on").map_err(sql_error("occurred_on"))?;
    let recorded_on: String = row.try_get("recorded_on").map_err(sql_error("recorded_on"))?;
    let data: String = row.try_get("data").map_err(sql_error("data"))?;
    Ok(RawEvent {
        id: EventId::from(row.try_get::<String, _>("id").map_err(sql_error("id"))?),
        store_index: row.try_get::<i64, _>("store_index").map_err(read)? as u64,
        stream_id: StreamId::from(
            row.try_get::<String, _>("stream_id")
                .map_err(sql_error("stream_id"))?,
        ),
        stream_index: row
            .try_get::<i64, _>("stream_index")
            .map_err(sql_error("stream_index"))? as u64,
        occurred_on: parse_time(&occurred_on),
        recorded_on: parse_time(&recorded_on),
        event_type: row.try_get("type").map_err(sql_error("type"))?,
        data: serde_json::from_str(&data).map_err(|e| Error::Codec(format!("event data: {e}")))?,
    })
}
