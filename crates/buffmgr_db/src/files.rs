//! File registration and lookup.

use crate::error::{Result, StoreError};
use crate::types::{NewEvent, NewFile, Registration, TrackedFile};
use crate::EventStore;
use sqlx::Row;
use tracing::debug;

impl EventStore {
    /// Insert a file and its first event atomically.
    ///
    /// A file with the same `(path, checksum)` is a duplicate: nothing is
    /// written and the existing id is returned.
    pub async fn register_file(&self, file: NewFile, first: NewEvent) -> Result<Registration> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        // Insert first so the write lock is taken up front.
        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (path, checksum, size, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (path, checksum) DO NOTHING",
            self.tables.file.qualified()
        ))
        .bind(&file.path)
        .bind(&file.checksum)
        .bind(file.size as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            let existing = self
                .find_file(&file.path, &file.checksum)
                .await?
                .ok_or_else(|| {
                    StoreError::invalid_state(format!(
                        "conflicting row for '{}' vanished",
                        file.path
                    ))
                })?;
            debug!(file_id = existing.id, path = %file.path, "File already tracked");
            return Ok(Registration::AlreadyTracked(existing.id));
        }

        let file_id = inserted.last_insert_rowid();
        sqlx::query(&format!(
            "INSERT INTO {} (file_id, status, start_time, end_time, detail, version)
             VALUES (?, ?, ?, ?, ?, ?)",
            self.tables.event.qualified()
        ))
        .bind(file_id)
        .bind(first.status.as_str())
        .bind(first.start_time.timestamp_millis())
        .bind(first.end_time.map(|t| t.timestamp_millis()))
        .bind(&first.detail)
        .bind(&first.version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(file_id, path = %file.path, status = %first.status, "File registered");
        Ok(Registration::Created(TrackedFile {
            id: file_id,
            path: file.path,
            checksum: file.checksum,
            size: file.size,
            created_at: Self::millis_to_datetime(now),
        }))
    }

    /// Look up a file by its identity.
    pub async fn find_file(&self, path: &str, checksum: &str) -> Result<Option<TrackedFile>> {
        let row = sqlx::query(&format!(
            "SELECT id, path, checksum, size, created_at FROM {} WHERE path = ? AND checksum = ?",
            self.tables.file.qualified()
        ))
        .bind(path)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_file))
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<TrackedFile>> {
        let row = sqlx::query(&format!(
            "SELECT id, path, checksum, size, created_at FROM {} WHERE id = ?",
            self.tables.file.qualified()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_file))
    }

    /// Every file record, oldest first.
    pub async fn all_files(&self) -> Result<Vec<TrackedFile>> {
        let rows = sqlx::query(&format!(
            "SELECT id, path, checksum, size, created_at FROM {} ORDER BY id",
            self.tables.file.qualified()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_file).collect())
    }

    pub async fn count_files(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            self.tables.file.qualified()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

pub(crate) fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> TrackedFile {
    TrackedFile {
        id: row.get("id"),
        path: row.get("path"),
        checksum: row.get("checksum"),
        size: row.get::<i64, _>("size") as u64,
        created_at: EventStore::millis_to_datetime(row.get("created_at")),
    }
}
