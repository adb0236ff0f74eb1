//! Eligibility: which tracked files the ingester should attempt next.

use crate::error::{EndpointError, Result};
use crate::patterns::PathPatterns;
use buffmgr_db::{EventStore, FileStatus, TrackedFile};
use tracing::debug;

/// Reject target statuses that would re-ingest finished or in-flight files.
pub fn check_target_status(status: FileStatus) -> Result<()> {
    match status {
        FileStatus::Success | FileStatus::Pending => Err(EndpointError::config(format!(
            "file status {} cannot be selected for ingestion",
            status
        ))),
        _ => Ok(()),
    }
}

/// Files in a target status whose paths pass the include/exclude patterns.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    target: FileStatus,
    patterns: PathPatterns,
}

impl EligibilityFilter {
    pub fn new(target: FileStatus, patterns: PathPatterns) -> Result<Self> {
        check_target_status(target)?;
        Ok(Self { target, patterns })
    }

    pub fn target(&self) -> FileStatus {
        self.target
    }

    pub fn accepts(&self, file: &TrackedFile) -> bool {
        self.patterns.accepts(&file.path)
    }

    /// Eligible files in id order, at most `limit` of them.
    pub async fn select(&self, store: &EventStore, limit: Option<usize>) -> Result<Vec<TrackedFile>> {
        let candidates = store.files_with_status(self.target).await?;
        let total = candidates.len();
        let selected: Vec<TrackedFile> = candidates
            .into_iter()
            .filter(|file| self.accepts(file))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        debug!(
            status = %self.target,
            candidates = total,
            selected = selected.len(),
            "Eligible files selected"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffmgr_db::{NewEvent, NewFile};

    async fn seed(store: &EventStore, paths: &[&str]) {
        for path in paths {
            store
                .register_file(
                    NewFile::new(*path, format!("sum-{}", path), 1),
                    NewEvent::now(FileStatus::Untried),
                )
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_target_status_guard() {
        assert!(check_target_status(FileStatus::Untried).is_ok());
        assert!(check_target_status(FileStatus::Backfill).is_ok());
        assert!(check_target_status(FileStatus::Success).is_err());
        assert!(check_target_status(FileStatus::Pending).is_err());
    }

    #[tokio::test]
    async fn test_patterns_then_limit() {
        let store = EventStore::open_in_memory().await.unwrap();
        seed(&store, &["a.fits", "b.json", "c.fits", "tmp/d.fits", "e.fits"]).await;

        let patterns = PathPatterns::new([r"\.fits$"], ["^tmp/"]).unwrap();
        let filter = EligibilityFilter::new(FileStatus::Untried, patterns).unwrap();

        let all: Vec<String> = filter
            .select(&store, None)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(all, vec!["a.fits", "c.fits", "e.fits"]);

        let capped = filter.select(&store, Some(2)).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].path, "c.fits");
    }

    #[tokio::test]
    async fn test_other_statuses_not_selected() {
        let store = EventStore::open_in_memory().await.unwrap();
        seed(&store, &["a.fits"]).await;

        let filter = EligibilityFilter::new(FileStatus::Failure, PathPatterns::default()).unwrap();
        assert!(filter.select(&store, None).await.unwrap().is_empty());
    }
}
