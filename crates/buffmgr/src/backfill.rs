//! Backfill: register files already sitting in storage without ingesting them.

use crate::checksum::ChecksumAlgorithm;
use crate::config::BackfillConfig;
use crate::discovery::relative_path;
use crate::error::Result;
use crate::patterns::PathPatterns;
use buffmgr_db::{EventStore, FileStatus, NewEvent, NewFile, Registration};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub registered: usize,
    pub already_tracked: usize,
    pub excluded: usize,
    /// Unmatched sources and unreadable files.
    pub failed: usize,
}

impl BackfillSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct Backfill {
    store: EventStore,
    storage: PathBuf,
    sources: Vec<String>,
    exclude: PathPatterns,
    checksum: ChecksumAlgorithm,
}

/// A file found under a source, with its storage-relative path.
struct Candidate {
    absolute: PathBuf,
    relative: String,
}

impl Backfill {
    pub fn from_config(config: &BackfillConfig, store: EventStore) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            storage: config.storage.clone(),
            sources: config.sources.clone(),
            exclude: PathPatterns::exclude_only(&config.exclude_list)?,
            checksum: config.checksum,
        })
    }

    /// Glob pattern for `source`. Only `source` carries wildcards; the
    /// storage prefix matches literally.
    fn pattern_for(storage: &Path, source: &str) -> String {
        if Path::new(source).is_absolute() {
            return source.to_string();
        }
        let prefix = storage.to_string_lossy();
        format!(
            "{}/{}",
            glob::Pattern::escape(prefix.trim_end_matches('/')),
            source.trim_start_matches("./")
        )
    }

    /// Expand one source (glob, directory or file) into candidate files. Blocking.
    fn expand(storage: &Path, source: &str) -> Result<Vec<Candidate>> {
        let pattern = Self::pattern_for(storage, source);
        let mut found = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable path");
                    continue;
                }
            };
            for file in WalkDir::new(&path).sort_by_file_name() {
                let file = match file {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                if !file.file_type().is_file() {
                    continue;
                }
                match relative_path(file.path(), storage) {
                    Some(relative) => found.push(Candidate {
                        absolute: file.path().to_path_buf(),
                        relative,
                    }),
                    None => warn!(path = %file.path().display(), "Outside the storage area"),
                }
            }
        }
        Ok(found)
    }

    /// Register every matching file with a single BACKFILL event.
    ///
    /// Per-file failures are counted and skipped; database errors abort.
    pub async fn run(&self) -> Result<BackfillSummary> {
        let mut summary = BackfillSummary::default();

        for source in &self.sources {
            let storage = self.storage.clone();
            let pattern = source.clone();
            let candidates =
                tokio::task::spawn_blocking(move || Self::expand(&storage, &pattern)).await??;
            if candidates.is_empty() {
                error!(source = %source, "Source matched no files");
                summary.failed += 1;
                continue;
            }

            for candidate in candidates {
                if self.exclude.is_excluded(&candidate.relative) {
                    debug!(path = %candidate.relative, "Excluded");
                    summary.excluded += 1;
                    continue;
                }
                self.register(candidate, &mut summary).await?;
            }
        }

        info!(
            registered = summary.registered,
            already_tracked = summary.already_tracked,
            excluded = summary.excluded,
            failed = summary.failed,
            "Backfill complete"
        );
        Ok(summary)
    }

    async fn register(&self, candidate: Candidate, summary: &mut BackfillSummary) -> Result<()> {
        let algorithm = self.checksum;
        let absolute = candidate.absolute.clone();
        let identity = tokio::task::spawn_blocking(move || -> std::io::Result<(String, u64)> {
            let size = std::fs::metadata(&absolute)?.len();
            Ok((algorithm.file_digest(&absolute)?, size))
        })
        .await?;

        let (checksum, size) = match identity {
            Ok(identity) => identity,
            Err(e) => {
                error!(path = %candidate.relative, error = %e, "Cannot read file");
                summary.failed += 1;
                return Ok(());
            }
        };

        match self
            .store
            .register_file(
                NewFile::new(candidate.relative.clone(), checksum, size),
                NewEvent::now(FileStatus::Backfill),
            )
            .await?
        {
            Registration::Created(file) => {
                debug!(file_id = file.id, path = %file.path, "Backfilled");
                summary.registered += 1;
            }
            Registration::AlreadyTracked(file_id) => {
                debug!(file_id, path = %candidate.relative, "Already tracked");
                summary.already_tracked += 1;
            }
        }
        Ok(())
    }
}
