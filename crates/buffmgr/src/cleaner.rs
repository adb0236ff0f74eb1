//! Cache cleaner: ages out old files and long-empty directories.
//!
//! The configured roots themselves are never removed.

use crate::cancel::CancellationToken;
use crate::config::CleanerConfig;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct Cleaner {
    directories: Vec<PathBuf>,
    files_older_than: Duration,
    dirs_empty_for: Duration,
    daemon: bool,
    pause: Duration,
}

impl Cleaner {
    pub fn new(directories: Vec<PathBuf>, files_older_than: Duration, dirs_empty_for: Duration) -> Self {
        Self {
            directories,
            files_older_than,
            dirs_empty_for,
            daemon: false,
            pause: Duration::from_secs(3600),
        }
    }

    pub fn from_config(config: &CleanerConfig) -> Result<Self> {
        config.validate()?;
        let mut cleaner = Self::new(
            config.directories.clone(),
            config.files_older_than.as_duration(),
            config.directories_empty_for_more_than.as_duration(),
        );
        cleaner.daemon = config.daemon;
        cleaner.pause = config.pause_duration();
        Ok(cleaner)
    }

    /// One pass over every root. Blocking; per-entry errors are counted.
    pub fn sweep(&self) -> SweepStats {
        let now = SystemTime::now();
        let mut stats = SweepStats::default();
        for root in &self.directories {
            self.sweep_root(root, now, &mut stats);
        }
        stats
    }

    fn sweep_root(&self, root: &Path, now: SystemTime, stats: &mut SweepStats) {
        // Children before parents, so directories emptied in this pass are
        // seen with their updated mtime.
        for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!(root = %root.display(), error = %e, "Cannot read entry");
                    stats.errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            let age = match entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Cannot stat");
                    stats.errors += 1;
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if age > self.dirs_empty_for && is_empty_dir(path) {
                    match fs::remove_dir(path) {
                        Ok(()) => {
                            debug!(path = %path.display(), "Removed empty directory");
                            stats.dirs_removed += 1;
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "Cannot remove directory");
                            stats.errors += 1;
                        }
                    }
                }
            } else if age > self.files_older_than {
                match fs::remove_file(path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "Removed file");
                        stats.files_removed += 1;
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Cannot remove file");
                        stats.errors += 1;
                    }
                }
            }
        }
    }

    /// Sweep once, or repeatedly every `pause` until cancelled in daemon mode.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SweepStats> {
        let mut total = SweepStats::default();
        loop {
            let cleaner = self.clone();
            let stats = tokio::task::spawn_blocking(move || cleaner.sweep()).await?;
            info!(
                files_removed = stats.files_removed,
                dirs_removed = stats.dirs_removed,
                errors = stats.errors,
                "Sweep complete"
            );
            total.files_removed += stats.files_removed;
            total.dirs_removed += stats.dirs_removed;
            total.errors += stats.errors;

            if !self.daemon {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.pause) => {}
                _ = cancel.cancelled() => break,
            }
        }
        Ok(total)
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
