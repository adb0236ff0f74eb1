//! Table creation. The statements are idempotent and run on every open.

use crate::error::Result;
use crate::EventStore;
use tracing::debug;

impl EventStore {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        let files = &self.tables.file;
        let events = &self.tables.event;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {files} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                checksum TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (path, checksum)
            )"#,
            files = files.qualified(),
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {events} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES {files_bare}(id),
                status TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                detail TEXT,
                version TEXT
            )"#,
            events = events.qualified(),
            files_bare = files.bare(),
        ))
        .execute(&self.pool)
        .await?;

        // Serves both the latest-event reduction and per-file history reads.
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {events_bare}(file_id, start_time, id)",
            index = events.index_name("file_time"),
            events_bare = events.bare(),
        ))
        .execute(&self.pool)
        .await?;

        debug!(files = %files, events = %events, "Schema verified");
        Ok(())
    }
}
