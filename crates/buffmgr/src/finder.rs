//! Finder: registers newly discovered files.
//!
//! For every discovered path the finder computes the checksum, checks the
//! event store for a file with the same `(path, checksum)` and then either
//! applies the standard action and records the file as UNTRIED, or applies
//! the alternative action to the duplicate.
//!
//! A discovered batch is completed only when none of its paths was skipped,
//! so a transfer log keeps being read until all of its files are tracked.

use crate::actions::Action;
use crate::cancel::CancellationToken;
use crate::checksum::ChecksumAlgorithm;
use crate::config::FinderConfig;
use crate::discovery::{self, Discovered, DiscoverySource};
use crate::error::{EndpointError, Result};
use crate::patterns::PathPatterns;
use buffmgr_db::{EventStore, FileStatus, NewEvent, NewFile, Registration};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters for one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderStats {
    pub discovered: usize,
    pub excluded: usize,
    pub registered: usize,
    pub duplicates: usize,
    /// Per-file I/O or action failures; retried next pass.
    pub skipped: usize,
}

pub struct Finder {
    store: EventStore,
    source: Arc<dyn DiscoverySource>,
    standard: Arc<Action>,
    alternative: Arc<Action>,
    exclude: PathPatterns,
    checksum: ChecksumAlgorithm,
    pause: Duration,
}

/// Identity of a discovered file, computed off the async runtime.
struct Identity {
    absolute: PathBuf,
    checksum: String,
    size: u64,
}

impl Finder {
    pub fn from_config(config: &FinderConfig, store: EventStore) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn DiscoverySource> = Arc::from(discovery::from_config(config)?);
        Ok(Self {
            store,
            source,
            standard: Arc::new(Action::new(
                config.actions.standard,
                &config.source,
                &config.storage,
            )),
            alternative: Arc::new(Action::new(
                config.actions.alternative,
                &config.source,
                &config.storage,
            )),
            exclude: PathPatterns::exclude_only(&config.search.exclude_list)?,
            checksum: config.checksum,
            pause: config.pause_duration(),
        })
    }

    /// One discovery pass. Database errors abort the pass and leave the
    /// current batch incomplete.
    pub async fn run_once(&self) -> Result<FinderStats> {
        let source = Arc::clone(&self.source);
        let batches = tokio::task::spawn_blocking(move || source.discover()).await??;

        let mut stats = FinderStats {
            discovered: batches.iter().map(|b| b.paths.len()).sum(),
            ..Default::default()
        };

        for batch in batches {
            let skipped = stats.skipped;
            for relative in batch.paths.iter().cloned() {
                let matched = self.exclude.excluded_by(&relative);
                if !matched.is_empty() {
                    debug!(path = %relative, patterns = ?matched, "Excluded");
                    stats.excluded += 1;
                    continue;
                }
                self.process(relative, &mut stats).await?;
            }
            if stats.skipped == skipped {
                self.complete(batch).await?;
            } else if let Some(sentinel) = batch.sentinel() {
                warn!(
                    sentinel = %sentinel.display(),
                    skipped = stats.skipped - skipped,
                    "Batch incomplete, will read it again"
                );
            }
        }

        if stats.registered > 0 || stats.duplicates > 0 || stats.skipped > 0 {
            info!(
                discovered = stats.discovered,
                registered = stats.registered,
                duplicates = stats.duplicates,
                skipped = stats.skipped,
                "Finder pass complete"
            );
        }
        Ok(stats)
    }

    /// Failing to write the sentinel only means the batch is read again.
    async fn complete(&self, batch: Discovered) -> Result<()> {
        let Some(sentinel) = batch.sentinel().map(PathBuf::from) else {
            return Ok(());
        };
        if let Err(e) = tokio::task::spawn_blocking(move || batch.complete()).await? {
            error!(sentinel = %sentinel.display(), error = %e, "Cannot mark batch complete");
        }
        Ok(())
    }

    async fn process(&self, relative: String, stats: &mut FinderStats) -> Result<()> {
        let absolute = self.source.location().join(&relative);
        let algorithm = self.checksum;
        let identity = tokio::task::spawn_blocking(move || -> std::io::Result<Identity> {
            let size = std::fs::metadata(&absolute)?.len();
            let checksum = algorithm.file_digest(&absolute)?;
            Ok(Identity {
                absolute,
                checksum,
                size,
            })
        })
        .await?;
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                error!(path = %relative, error = %e, "Cannot read file, will retry");
                stats.skipped += 1;
                return Ok(());
            }
        };

        if let Some(existing) = self.store.find_file(&relative, &identity.checksum).await? {
            warn!(
                path = %relative,
                file_id = existing.id,
                action = ?self.alternative.kind(),
                "File already in storage"
            );
            let action = Arc::clone(&self.alternative);
            let absolute = identity.absolute.clone();
            match tokio::task::spawn_blocking(move || action.execute(&absolute)).await? {
                Ok(_) => stats.duplicates += 1,
                Err(e) => {
                    error!(path = %relative, error = %e, "Alternative action failed");
                    stats.skipped += 1;
                }
            }
            return Ok(());
        }

        let action = Arc::clone(&self.standard);
        let absolute = identity.absolute.clone();
        let executed = match tokio::task::spawn_blocking(move || action.execute(&absolute)).await? {
            Ok(executed) => executed,
            Err(e) => {
                error!(path = %relative, error = %e, "Standard action failed, will retry");
                stats.skipped += 1;
                return Ok(());
            }
        };

        let registration = self
            .store
            .register_file(
                NewFile::new(relative.clone(), identity.checksum, identity.size),
                NewEvent::now(FileStatus::Untried),
            )
            .await;

        match registration {
            Ok(Registration::Created(file)) => {
                info!(file_id = file.id, path = %relative, "New file registered");
                stats.registered += 1;
                Ok(())
            }
            Ok(Registration::AlreadyTracked(file_id)) => {
                debug!(file_id, path = %relative, "Registered concurrently by another finder");
                stats.duplicates += 1;
                Ok(())
            }
            Err(e) => {
                error!(path = %relative, error = %e, "Cannot record file, rolling back");
                let undo = tokio::task::spawn_blocking(move || executed.undo()).await?;
                if let Err(undo_err) = undo {
                    error!(path = %relative, error = %undo_err, "Cannot undo action");
                }
                Err(EndpointError::from(e))
            }
        }
    }

    /// Discovery passes until cancelled. Database errors back off for `pause`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!(source = self.source.name(), location = %self.source.location().display(), "Finder started");
        let mut pass: u64 = 0;
        while !cancel.is_cancelled() {
            pass += 1;
            match self.run_once().await {
                Ok(stats) => debug!(pass, ?stats, "Finder pass"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(pass, error = %e, "Finder pass failed, backing off"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.pause) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!(passes = pass, "Finder stopped");
        Ok(())
    }
}
