//! Consistency check between the file records and the storage area.
//!
//! Two kinds of discrepancy are reported: records whose file is gone from
//! storage, and storage files no record knows about. Nothing is modified.

use crate::config::CheckConfig;
use crate::discovery::relative_path;
use crate::error::Result;
use crate::patterns::PathPatterns;
use buffmgr_db::{EventStore, TrackedFile};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    /// File records examined.
    pub records: usize,
    /// Files found in storage, excluded ones not counted.
    pub stored: usize,
    /// Records whose path does not exist in storage.
    pub missing: Vec<TrackedFile>,
    /// Storage-relative paths with no record.
    pub untracked: Vec<String>,
    /// Entries that could not be read during the walk.
    pub errors: usize,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.untracked.is_empty() && self.errors == 0
    }
}

/// What the walk of the storage area found.
#[derive(Debug, Default)]
struct StorageListing {
    paths: BTreeSet<String>,
    errors: usize,
}

pub struct ConsistencyCheck {
    store: EventStore,
    storage: PathBuf,
    exclude: PathPatterns,
}

impl ConsistencyCheck {
    pub fn new(store: EventStore, storage: &Path, exclude: PathPatterns) -> Self {
        Self {
            store,
            storage: storage.to_path_buf(),
            exclude,
        }
    }

    pub fn from_config(config: &CheckConfig, store: EventStore) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            store,
            &config.storage,
            PathPatterns::exclude_only(&config.exclude_list)?,
        ))
    }

    /// Walk the storage area. Blocking; unreadable entries are counted.
    fn list_storage(storage: &Path, exclude: &PathPatterns) -> StorageListing {
        let mut listing = StorageListing::default();
        for entry in WalkDir::new(storage).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!(root = %storage.display(), error = %e, "Cannot read entry");
                    listing.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_path(entry.path(), storage) else {
                continue;
            };
            if exclude.is_excluded(&relative) {
                debug!(path = %relative, "Excluded");
                continue;
            }
            listing.paths.insert(relative);
        }
        listing
    }

    /// Compare every record with the storage area.
    ///
    /// A path recorded several times (new content under the same name) is
    /// satisfied by the single file in storage.
    pub async fn run(&self) -> Result<ConsistencyReport> {
        let records = self.store.all_files().await?;

        let storage = self.storage.clone();
        let exclude = self.exclude.clone();
        let listing =
            tokio::task::spawn_blocking(move || Self::list_storage(&storage, &exclude)).await?;

        let recorded: BTreeSet<&str> = records.iter().map(|f| f.path.as_str()).collect();
        let untracked: Vec<String> = listing
            .paths
            .iter()
            .filter(|path| !recorded.contains(path.as_str()))
            .cloned()
            .collect();

        let report = ConsistencyReport {
            records: records.len(),
            stored: listing.paths.len(),
            missing: records
                .iter()
                .filter(|f| !listing.paths.contains(&f.path))
                .cloned()
                .collect(),
            untracked,
            errors: listing.errors,
        };

        if report.is_consistent() {
            info!(records = report.records, stored = report.stored, "Storage consistent");
        } else {
            warn!(
                records = report.records,
                stored = report.stored,
                missing = report.missing.len(),
                untracked = report.untracked.len(),
                errors = report.errors,
                "Storage inconsistent"
            );
        }
        Ok(report)
    }
}
