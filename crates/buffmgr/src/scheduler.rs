//! Ingester control loop.
//!
//! Each cycle optionally runs a finder pass, selects eligible files and hands
//! them to the worker pool. Before the first cycle, attempts left PENDING by
//! a previous process are closed as UNKNOWN.

use crate::backend::BackendRegistry;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::Result;
use crate::filter::EligibilityFilter;
use crate::finder::Finder;
use crate::patterns::PathPatterns;
use crate::worker::{ChunkStats, WorkerPool};
use buffmgr_db::{EventStore, FileStatus};
use std::time::Duration;
use tracing::{debug, error, info, info_span, Instrument};

pub const RECOVERY_DETAIL: &str = "attempt interrupted: process exited while PENDING";

/// Settings for the control loop itself.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// `None` dispatches every eligible file.
    pub batch_size: Option<usize>,
    pub daemon: bool,
    pub pause: Duration,
}

/// Totals over the lifetime of one [`Ingester::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub recovered: u64,
    pub adopted: u64,
    pub registered: usize,
    pub ingest: ChunkStats,
}

pub struct Ingester {
    store: EventStore,
    filter: EligibilityFilter,
    pool: WorkerPool,
    finder: Option<Finder>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    cycle: u64,
}

impl Ingester {
    pub fn new(
        store: EventStore,
        filter: EligibilityFilter,
        pool: WorkerPool,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            filter,
            pool,
            finder: None,
            settings,
            cancel,
            cycle: 0,
        }
    }

    /// Run a finder pass at the start of each cycle (only for UNTRIED targets).
    pub fn with_finder(mut self, finder: Finder) -> Self {
        self.finder = Some(finder);
        self
    }

    /// Assemble an ingester from the `ingester` (and optionally `finder`) sections.
    pub fn from_config(
        config: &Config,
        store: EventStore,
        backends: &BackendRegistry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let section = config.ingester()?;
        section.validate(backends)?;

        let backend = backends.create(&section.plugin.name, &section.plugin.config)?;
        info!(backend = backend.name(), version = %backend.version(), "Ingestion backend ready");

        let filter = EligibilityFilter::new(
            section.file_status,
            PathPatterns::new(&section.include_list, &section.exclude_list)?,
        )?;
        let pool = WorkerPool::new(
            store.clone(),
            backend,
            section.storage.clone(),
            section.file_status,
            section.num_threads,
        );
        let settings = SchedulerSettings {
            batch_size: section.batch_limit(),
            daemon: section.daemon,
            pause: section.pause_duration(),
        };

        let mut ingester = Self::new(store.clone(), filter, pool, settings, cancel);
        if section.run_finder {
            ingester = ingester.with_finder(Finder::from_config(config.finder()?, store)?);
        }
        Ok(ingester)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Recover, then cycle until cancelled (daemon) or once (one-shot).
    ///
    /// In daemon mode a failed cycle is logged and retried after `pause`
    /// unless the error is fatal. In one-shot mode any error is returned.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary {
            recovered: self.store.recover_pending(RECOVERY_DETAIL).await?,
            ..Default::default()
        };

        info!(
            status = %self.filter.target(),
            daemon = self.settings.daemon,
            batch_size = ?self.settings.batch_size,
            "Ingester started"
        );

        while !self.cancel.is_cancelled() {
            self.cycle += 1;
            let span = info_span!("cycle", cycle = self.cycle);
            match self.run_cycle(&mut summary).instrument(span).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() || !self.settings.daemon => return Err(e),
                Err(e) => error!(cycle = self.cycle, error = %e, "Cycle failed, backing off"),
            }
            summary.cycles = self.cycle;

            if !self.settings.daemon {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.pause) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        info!(
            cycles = summary.cycles,
            succeeded = summary.ingest.succeeded,
            failed = summary.ingest.failed,
            "Ingester stopped"
        );
        Ok(summary)
    }

    async fn run_cycle(&mut self, summary: &mut RunSummary) -> Result<()> {
        let untried = self.filter.target() == FileStatus::Untried;
        if untried {
            if let Some(finder) = &self.finder {
                summary.registered += finder.run_once().await?.registered;
            }
            summary.adopted += self.store.adopt_untracked().await?;
        }

        let limit = if self.settings.daemon {
            self.settings.batch_size
        } else {
            None
        };
        let eligible = self.filter.select(&self.store, limit).await?;
        if eligible.is_empty() {
            debug!("No eligible files");
            return Ok(());
        }

        let chunk_size = match (self.settings.daemon, self.settings.batch_size) {
            (false, Some(size)) => size.max(1),
            _ => eligible.len(),
        };
        let chunks: Vec<Vec<_>> = eligible.chunks(chunk_size).map(|c| c.to_vec()).collect();
        info!(files = eligible.len(), chunks = chunks.len(), "Dispatching");

        for chunk in chunks {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested, not dispatching remaining chunks");
                break;
            }
            let stats = self.pool.process(chunk, &self.cancel).await?;
            debug!(?stats, "Chunk done");
            summary.ingest.merge(&stats);
        }
        Ok(())
    }
}
