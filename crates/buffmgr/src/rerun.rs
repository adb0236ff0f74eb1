//! Operator helper: request another attempt by appending RERUN events.

use crate::error::Result;
use buffmgr_db::{EventStore, FileStatus, NewEvent};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RerunSummary {
    pub marked: usize,
    pub not_found: usize,
    /// Files with an attempt in progress, left alone.
    pub in_flight: usize,
}

const DETAIL: &str = "rerun requested by operator";

/// Mark the given files for rerun.
pub async fn rerun_files(store: &EventStore, ids: &[i64]) -> Result<RerunSummary> {
    let mut summary = RerunSummary::default();
    for &id in ids {
        if store.get_file(id).await?.is_none() {
            warn!(file_id = id, "No such file");
            summary.not_found += 1;
            continue;
        }
        if store.current_status(id).await? == Some(FileStatus::Pending) {
            warn!(file_id = id, "Attempt in progress, not marking for rerun");
            summary.in_flight += 1;
            continue;
        }
        store
            .append_event(id, NewEvent::now(FileStatus::Rerun).with_detail(DETAIL))
            .await?;
        summary.marked += 1;
    }
    info!(marked = summary.marked, "Rerun requested");
    Ok(summary)
}

/// Mark every file currently in `status` for rerun.
pub async fn rerun_status(store: &EventStore, status: FileStatus) -> Result<RerunSummary> {
    let mut summary = RerunSummary::default();
    if status == FileStatus::Pending {
        warn!("Refusing to rerun files with an attempt in progress");
        return Ok(summary);
    }
    for file in store.files_with_status(status).await? {
        // Compare-and-set so a concurrent claim is not overwritten.
        let event = NewEvent::now(FileStatus::Rerun).with_detail(DETAIL);
        match store.transition(file.id, status, event).await? {
            Some(_) => summary.marked += 1,
            None => summary.in_flight += 1,
        }
    }
    info!(from = %status, marked = summary.marked, "Rerun requested");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffmgr_db::{NewFile, Registration};

    async fn file_in(store: &EventStore, name: &str, status: FileStatus) -> i64 {
        let id = match store
            .register_file(NewFile::new(name, "sum", 1), NewEvent::now(FileStatus::Untried))
            .await
            .unwrap()
        {
            Registration::Created(file) => file.id,
            Registration::AlreadyTracked(id) => id,
        };
        if status != FileStatus::Untried {
            store.append_event(id, NewEvent::now(status)).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_rerun_by_id() {
        let store = EventStore::open_in_memory().await.unwrap();
        let failed = file_in(&store, "a.fits", FileStatus::Failure).await;
        let pending = file_in(&store, "b.fits", FileStatus::Pending).await;

        let summary = rerun_files(&store, &[failed, pending, 999]).await.unwrap();
        assert_eq!(
            summary,
            RerunSummary {
                marked: 1,
                not_found: 1,
                in_flight: 1
            }
        );
        assert_eq!(
            store.current_status(failed).await.unwrap(),
            Some(FileStatus::Rerun)
        );
    }

    #[tokio::test]
    async fn test_rerun_by_status() {
        let store = EventStore::open_in_memory().await.unwrap();
        file_in(&store, "a.fits", FileStatus::Unknown).await;
        file_in(&store, "b.fits", FileStatus::Unknown).await;
        file_in(&store, "c.fits", FileStatus::Success).await;

        let summary = rerun_status(&store, FileStatus::Unknown).await.unwrap();
        assert_eq!(summary.marked, 2);
        assert_eq!(
            store.files_with_status(FileStatus::Rerun).await.unwrap().len(),
            2
        );
        assert_eq!(
            rerun_status(&store, FileStatus::Pending).await.unwrap(),
            RerunSummary::default()
        );
    }
}
