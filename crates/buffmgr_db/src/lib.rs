//! Event store for buffmgr.
//!
//! Files are registered once and never modified; their lifecycle is an
//! append-only list of events. The current status of a file is the status of
//! its latest event, ordered by `(start_time, id)`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use buffmgr_db::{EventStore, FileStatus, NewEvent, NewFile, StoreOptions};
//!
//! let store = EventStore::open(StoreOptions::new("sqlite:buffmgr.db")).await?;
//!
//! let registration = store
//!     .register_file(NewFile::new("2024/a.fits", "ab12..", 2880), NewEvent::now(FileStatus::Untried))
//!     .await?;
//!
//! // Only one caller wins the claim for a given file.
//! let claimed = store.claim(file_id, FileStatus::Untried, NewEvent::now(FileStatus::Pending)).await?;
//! ```

mod error;
mod events;
mod files;
mod schema;
mod tables;
mod types;

pub use error::{Result, StoreError};
pub use tables::{TableNames, TableRef};
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Connection settings for [`EventStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// `sqlite:` URL or a plain filesystem path.
    pub url: String,
    pub tables: TableNames,
    pub max_connections: u32,
    /// Extra database files attached under a schema name on every connection.
    pub attach: BTreeMap<String, PathBuf>,
}

impl StoreOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tables: TableNames::default(),
            max_connections: 5,
            attach: BTreeMap::new(),
        }
    }

    pub fn with_tables(mut self, tables: TableNames) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn attach(mut self, schema: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.attach.insert(schema.into(), path.into());
        self
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Durable record of tracked files and their event history.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
    tables: TableNames,
}

impl EventStore {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        options.tables.validate()?;
        for schema in options.attach.keys() {
            TableRef::new(schema.as_str()).validate()?;
        }
        if options.max_connections == 0 {
            return Err(StoreError::invalid_config("max_connections must be at least 1"));
        }

        let connect = Self::connect_options(&options)?;

        // An in-memory database lives only as long as its single connection.
        let pool_options = if options.is_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.max_connections)
        };

        let attach: Vec<(String, String)> = options
            .attach
            .iter()
            .map(|(schema, path)| (schema.clone(), path.display().to_string()))
            .collect();

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                let attach = attach.clone();
                Box::pin(async move {
                    for (schema, path) in attach {
                        sqlx::query(&format!("ATTACH DATABASE ? AS {}", schema))
                            .bind(path)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(connect)
            .await?;

        let store = Self {
            pool,
            tables: options.tables,
        };
        store.ensure_schema().await?;

        info!(
            url = %options.url,
            files = %store.tables.file,
            events = %store.tables.event,
            "Event store opened"
        );
        Ok(store)
    }

    /// Open an on-disk database file, creating parent directories.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::open(StoreOptions::new(path.display().to_string())).await
    }

    /// Private in-memory database, mostly for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreOptions::new("sqlite::memory:")).await
    }

    fn connect_options(options: &StoreOptions) -> Result<SqliteConnectOptions> {
        let base = if options.url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(&options.url)?
        } else {
            SqliteConnectOptions::new().filename(&options.url)
        };

        let base = base.create_if_missing(true).foreign_keys(true);
        if options.is_memory() {
            Ok(base)
        } else {
            Ok(base
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal))
        }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Underlying pool, for ad-hoc queries in tests and tooling.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl EventStore {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}
