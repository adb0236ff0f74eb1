//! Event history, status selection and compare-and-set transitions.
//!
//! Every write here is a single `INSERT ... SELECT` statement, so the status
//! check and the append happen atomically even across processes.

use crate::error::{Result, StoreError};
use crate::files::row_to_file;
use crate::types::{FileEvent, FileStatus, NewEvent, StatusReport, TrackedFile};
use crate::EventStore;
use sqlx::Row;
use tracing::{debug, info, warn};

impl EventStore {
    /// `latest` CTE body: one row per file holding its most recent event.
    ///
    /// Ties on `start_time` go to the higher event id.
    fn latest_events_cte(&self) -> String {
        format!(
            r#"latest AS (
                SELECT file_id, status, start_time FROM (
                    SELECT e.file_id, e.status, e.start_time,
                           ROW_NUMBER() OVER (
                               PARTITION BY e.file_id ORDER BY e.start_time DESC, e.id DESC
                           ) AS rn
                    FROM {events} e
                ) WHERE rn = 1
            )"#,
            events = self.tables.event.qualified()
        )
    }

    /// Append an event unconditionally.
    ///
    /// The start time is clamped to the file's latest start time so per-file
    /// history stays ordered even if the wall clock steps backwards; a present
    /// end time is clamped to the resulting start.
    pub async fn append_event(&self, file_id: i64, event: NewEvent) -> Result<i64> {
        let events = self.tables.event.qualified();
        let result = sqlx::query(&format!(
            r#"INSERT INTO {events} (file_id, status, start_time, end_time, detail, version)
               SELECT ?1, ?2, MAX(?3, p.floor),
                      CASE WHEN ?4 IS NULL THEN NULL ELSE MAX(?4, ?3, p.floor) END,
                      ?5, ?6
               FROM (SELECT COALESCE(MAX(start_time), ?3) AS floor FROM {events} WHERE file_id = ?1) p"#
        ))
        .bind(file_id)
        .bind(event.status.as_str())
        .bind(event.start_time.timestamp_millis())
        .bind(event.end_time.map(|t| t.timestamp_millis()))
        .bind(&event.detail)
        .bind(&event.version)
        .execute(&self.pool)
        .await?;

        let event_id = result.last_insert_rowid();
        debug!(file_id, event_id, status = %event.status, "Event appended");
        Ok(event_id)
    }

    /// Append `event` only if the file's current status is still `expected`.
    ///
    /// Returns the new event id, or `None` when another writer got there first
    /// (or the file has no events). Used for the PENDING claim.
    pub async fn transition(
        &self,
        file_id: i64,
        expected: FileStatus,
        event: NewEvent,
    ) -> Result<Option<i64>> {
        let events = self.tables.event.qualified();
        let result = sqlx::query(&format!(
            r#"INSERT INTO {events} (file_id, status, start_time, end_time, detail, version)
               SELECT ?1, ?2, MAX(?3, l.start_time),
                      CASE WHEN ?4 IS NULL THEN NULL ELSE MAX(?4, ?3, l.start_time) END,
                      ?5, ?6
               FROM (
                   SELECT status, start_time FROM {events}
                   WHERE file_id = ?1
                   ORDER BY start_time DESC, id DESC
                   LIMIT 1
               ) l
               WHERE l.status IN (?7, ?8)"#
        ))
        .bind(file_id)
        .bind(event.status.as_str())
        .bind(event.start_time.timestamp_millis())
        .bind(event.end_time.map(|t| t.timestamp_millis()))
        .bind(&event.detail)
        .bind(&event.version)
        .bind(expected.as_str())
        .bind(expected.legacy_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(file_id, expected = %expected, to = %event.status, "Transition lost");
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// Claim a file for an attempt: `expected -> PENDING`.
    pub async fn claim(&self, file_id: i64, expected: FileStatus) -> Result<Option<i64>> {
        self.transition(file_id, expected, NewEvent::now(FileStatus::Pending))
            .await
    }

    pub async fn current_status(&self, file_id: i64) -> Result<Option<FileStatus>> {
        Ok(self.latest_event(file_id).await?.map(|e| e.status))
    }

    pub async fn latest_event(&self, file_id: i64) -> Result<Option<FileEvent>> {
        let row = sqlx::query(&format!(
            "SELECT id, file_id, status, start_time, end_time, detail, version FROM {}
             WHERE file_id = ? ORDER BY start_time DESC, id DESC LIMIT 1",
            self.tables.event.qualified()
        ))
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    /// Full history of a file, oldest first.
    pub async fn events_for_file(&self, file_id: i64) -> Result<Vec<FileEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT id, file_id, status, start_time, end_time, detail, version FROM {}
             WHERE file_id = ? ORDER BY start_time ASC, id ASC",
            self.tables.event.qualified()
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Files whose current status is `status`, ordered by id.
    pub async fn files_with_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>> {
        let rows = sqlx::query(&format!(
            r#"WITH {latest}
               SELECT f.id, f.path, f.checksum, f.size, f.created_at
               FROM {files} f JOIN latest l ON l.file_id = f.id
               WHERE l.status IN (?, ?)
               ORDER BY f.id"#,
            latest = self.latest_events_cte(),
            files = self.tables.file.qualified(),
        ))
        .bind(status.as_str())
        .bind(status.legacy_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_file).collect())
    }

    /// Give every tracked file without any event an UNTRIED event.
    pub async fn adopt_untracked(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"INSERT INTO {events} (file_id, status, start_time)
               SELECT f.id, ?, ? FROM {files} f
               WHERE NOT EXISTS (SELECT 1 FROM {events} e WHERE e.file_id = f.id)"#,
            events = self.tables.event.qualified(),
            files = self.tables.file.qualified(),
        ))
        .bind(FileStatus::Untried.as_str())
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        let adopted = result.rows_affected();
        if adopted > 0 {
            info!(adopted, "Adopted files without events");
        }
        Ok(adopted)
    }

    /// Close every stale PENDING attempt with exactly one UNKNOWN event.
    pub async fn recover_pending(&self, detail: &str) -> Result<u64> {
        let now = Self::now_millis();
        let result = sqlx::query(&format!(
            r#"WITH {latest}
               INSERT INTO {events} (file_id, status, start_time, end_time, detail)
               SELECT l.file_id, ?1, MAX(?2, l.start_time), MAX(?2, l.start_time), ?3
               FROM latest l
               WHERE l.status = ?4"#,
            latest = self.latest_events_cte(),
            events = self.tables.event.qualified(),
        ))
        .bind(FileStatus::Unknown.as_str())
        .bind(now)
        .bind(detail)
        .bind(FileStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Marked stale PENDING attempts as UNKNOWN");
        }
        Ok(recovered)
    }

    /// Count files per current status.
    pub async fn status_report(&self) -> Result<StatusReport> {
        let rows = sqlx::query(&format!(
            "WITH {latest} SELECT status, COUNT(*) AS n FROM latest GROUP BY status",
            latest = self.latest_events_cte(),
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut report = StatusReport::default();
        for row in &rows {
            let raw: String = row.get("status");
            let n: i64 = row.get("n");
            match FileStatus::parse(&raw) {
                Some(status) => *report.by_status.entry(status).or_insert(0) += n as u64,
                None => warn!(status = %raw, count = n, "Ignoring unrecognised status"),
            }
        }

        let without: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {files} f
             WHERE NOT EXISTS (SELECT 1 FROM {events} e WHERE e.file_id = f.id)",
            files = self.tables.file.qualified(),
            events = self.tables.event.qualified(),
        ))
        .fetch_one(&self.pool)
        .await?;
        report.without_events = without as u64;

        Ok(report)
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<FileEvent> {
    let raw: String = row.get("status");
    let status = FileStatus::parse(&raw)
        .ok_or_else(|| StoreError::invalid_state(format!("unknown status '{}'", raw)))?;

    Ok(FileEvent {
        id: row.get("id"),
        file_id: row.get("file_id"),
        status,
        start_time: EventStore::millis_to_datetime(row.get("start_time")),
        end_time: row
            .get::<Option<i64>, _>("end_time")
            .map(EventStore::millis_to_datetime),
        detail: row.get("detail"),
        version: row.get("version"),
    })
}
