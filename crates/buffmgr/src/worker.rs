//! Ingest worker pool
//!
//! Design principles:
//! - A file is only attempted after winning the PENDING claim, so concurrent
//!   pools (in this or other processes) never attempt the same file twice
//! - Concurrency bounded by a semaphore of `num_threads` permits
//! - Backend calls run on the blocking pool and are not cancellable
//! - A panicking backend is recorded as FAILURE, siblings finish, then the
//!   panic is reported to the caller as fatal

use crate::backend::{IngestBackend, IngestOutcome};
use crate::cancel::CancellationToken;
use crate::error::{EndpointError, Result};
use buffmgr_db::{EventStore, FileStatus, NewEvent, TrackedFile};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What happened to one file handed to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Succeeded,
    Failed(String),
    /// Claim lost to another worker or shutdown requested before the claim.
    Skipped,
}

/// Tally of a dispatched chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ChunkStats {
    fn record(&mut self, attempt: &Attempt) {
        match attempt {
            Attempt::Succeeded => self.succeeded += 1,
            Attempt::Failed(_) => self.failed += 1,
            Attempt::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &ChunkStats) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: EventStore,
    backend: Arc<dyn IngestBackend>,
    storage: PathBuf,
    target: FileStatus,
    num_threads: usize,
}

impl WorkerPool {
    pub fn new(
        store: EventStore,
        backend: Arc<dyn IngestBackend>,
        storage: PathBuf,
        target: FileStatus,
        num_threads: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                backend,
                storage,
                target,
                num_threads: num_threads.max(1),
            }),
        }
    }

    /// Attempt every file in `files`, at most `num_threads` at a time.
    ///
    /// Store errors in one attempt do not stop its siblings; the first one is
    /// returned after all attempts finish. A backend panic takes precedence.
    pub async fn process(
        &self,
        files: Vec<TrackedFile>,
        cancel: &CancellationToken,
    ) -> Result<ChunkStats> {
        let semaphore = Arc::new(Semaphore::new(self.inner.num_threads));
        let mut tasks = JoinSet::new();
        let mut stats = ChunkStats {
            dispatched: files.len(),
            ..Default::default()
        };

        for file in files {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| EndpointError::config("worker semaphore closed"))?;
                if cancel.is_cancelled() {
                    return Ok(Attempt::Skipped);
                }
                inner.attempt(file).await
            });
        }

        let mut first_error: Option<EndpointError> = None;
        let mut panic: Option<EndpointError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(attempt)) => stats.record(&attempt),
                Ok(Err(e @ EndpointError::BackendPanic { .. })) => {
                    stats.failed += 1;
                    panic.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Attempt aborted");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Worker task failed");
                    first_error.get_or_insert(EndpointError::from(e));
                }
            }
        }

        if let Some(e) = panic.or(first_error) {
            return Err(e);
        }
        Ok(stats)
    }
}

impl PoolInner {
    async fn attempt(&self, file: TrackedFile) -> Result<Attempt> {
        if self.store.claim(file.id, self.target).await?.is_none() {
            debug!(file_id = file.id, path = %file.path, "Claim lost");
            return Ok(Attempt::Skipped);
        }
        let started = Utc::now();
        let version = self.backend.version();
        let absolute = self.storage.join(&file.path);

        if let Some(reason) = preflight(&absolute) {
            warn!(file_id = file.id, path = %file.path, reason = %reason, "Pre-flight check failed");
            self.finish(file.id, started, &version, IngestOutcome::failure(reason.clone()))
                .await?;
            return Ok(Attempt::Failed(reason));
        }

        debug!(file_id = file.id, path = %file.path, "Ingesting");
        let backend = Arc::clone(&self.backend);
        let path = absolute.clone();
        let outcome = match tokio::task::spawn_blocking(move || backend.ingest(&path)).await {
            Ok(outcome) => outcome,
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(file_id = file.id, path = %file.path, panic = %message, "Backend panicked");
                self.finish(
                    file.id,
                    started,
                    &version,
                    IngestOutcome::failure(format!("backend panicked: {}", message)),
                )
                .await?;
                return Err(EndpointError::BackendPanic {
                    path: file.path,
                    message,
                });
            }
            Err(join_error) => return Err(join_error.into()),
        };

        let attempt = match &outcome {
            IngestOutcome::Success => {
                info!(file_id = file.id, path = %file.path, "Ingested");
                Attempt::Succeeded
            }
            IngestOutcome::Failure(detail) => {
                warn!(file_id = file.id, path = %file.path, detail = %detail, "Ingestion failed");
                Attempt::Failed(detail.clone())
            }
        };
        self.finish(file.id, started, &version, outcome).await?;
        Ok(attempt)
    }

    /// Record the terminal event of an attempt.
    async fn finish(
        &self,
        file_id: i64,
        started: chrono::DateTime<Utc>,
        version: &str,
        outcome: IngestOutcome,
    ) -> Result<()> {
        let event = match outcome {
            IngestOutcome::Success => NewEvent::at(FileStatus::Success, started),
            IngestOutcome::Failure(detail) => {
                NewEvent::at(FileStatus::Failure, started).with_detail(detail)
            }
        };
        self.store
            .append_event(file_id, event.ended(Utc::now()).with_version(version))
            .await?;
        Ok(())
    }
}

fn preflight(path: &std::path::Path) -> Option<String> {
    match std::fs::metadata(path) {
        Err(e) => Some(format!("{}: {}", path.display(), e)),
        Ok(meta) if !meta.is_file() => Some(format!("{}: not a regular file", path.display())),
        Ok(meta) if meta.len() == 0 => Some(format!("{}: file is empty", path.display())),
        Ok(_) => None,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
