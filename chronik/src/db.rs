//! Split read/write handles to the embedded SQLite engine.
//!
//! All mutations in the crate run on the writer side, which holds exactly one
//! connection: concurrent writers serialize on the pool instead of racing the
//! SQLite write lock. Reads go through a small read-only pool and may run in
//! parallel with a writer transaction (WAL mode).

use std::{path::Path, time::Duration};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::{
    Sqlite, Transaction,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use tracing::instrument;

use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const READER_CONNECTIONS: u32 = 8;

/// Maps a driver error into this crate's [`Error`], keeping the statement.
pub(crate) fn sql_error(statement: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Error {
    move |source| Error::Sql {
        statement: statement.into(),
        source,
    }
}

/// A writer transaction. All mutations of the store run inside one of these.
pub type Tx = Transaction<'static, Sqlite>;

/// Formats a time column value: UTC, microsecond-rounded, RFC3339 with
/// nanosecond digits. Fixed-width, so lexicographic order is chronological.
pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.round_subsecs(6).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses a persisted time column value; unparsable input reads as epoch.
pub(crate) fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Split writer/reader handles over a single SQLite database file.
#[derive(Debug, Clone)]
pub struct Db {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Db {
    /// Opens (and creates, if missing) the database at `file`.
    ///
    /// The writer runs WAL with `synchronous=NORMAL` and a 5s busy timeout on
    /// a single connection; the reader pool is read-only with the same busy
    /// timeout.
    #[instrument(skip(file))]
    pub async fn open(file: impl AsRef<Path>) -> Result<Self> {
        let file = file.as_ref();
        let writer_options = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(writer_options)
            .await
            .map_err(sql_error("connect writer"))?;

        let reader_options = SqliteConnectOptions::new()
            .filename(file)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT);
        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(reader_options)
            .await
            .map_err(sql_error("connect reader"))?;

        Ok(Self { writer, reader })
    }

    /// Begins a writer transaction.
    pub async fn begin(&self) -> Result<Tx> {
        self.writer.begin().await.map_err(sql_error("BEGIN"))
    }

    /// Executes a statement script (possibly several statements) on the
    /// writer outside any transaction.
    pub(crate) async fn exec(&self, statements: &str) -> Result<()> {
        sqlx::raw_sql(statements)
            .execute(&self.writer)
            .await
            .map_err(sql_error(statements))?;
        Ok(())
    }

    /// The serialized writer pool.
    pub(crate) fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// The read-only pool.
    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Closes both handles, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}
