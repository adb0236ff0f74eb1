//! Discovery sources: produce candidate files from the staging area.
//!
//! Sources return paths relative to their [`location`](DiscoverySource::location),
//! always with `/` separators, grouped in [`Discovered`] batches. Exclude
//! patterns are applied by the finder.

use crate::config::{FinderConfig, SearchMethod};
use crate::error::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Paths found together, plus the marker that retires their origin.
///
/// A batch read from a transfer log carries the log's sentinel. The finder
/// calls [`complete`](Discovered::complete) once every path has been handled;
/// an incomplete batch is found again on the next pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub paths: Vec<String>,
    sentinel: Option<PathBuf>,
}

impl Discovered {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            paths,
            sentinel: None,
        }
    }

    fn from_log(log: &Path, paths: Vec<String>) -> Self {
        Self {
            paths,
            sentinel: Some(RsyncLogs::sentinel_for(log)),
        }
    }

    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel.as_deref()
    }

    /// Mark the origin as fully handled. Blocking.
    pub fn complete(&self) -> std::io::Result<()> {
        if let Some(sentinel) = &self.sentinel {
            File::create(sentinel)?;
        }
        Ok(())
    }
}

/// Strategy producing candidate paths. Blocking.
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Directory the discovered relative paths resolve against.
    fn location(&self) -> &Path;

    fn discover(&self) -> Result<Vec<Discovered>>;
}

/// Build the source selected by `search.method`.
pub fn from_config(config: &FinderConfig) -> Result<Box<dyn DiscoverySource>> {
    match config.search.method {
        SearchMethod::Scan => Ok(Box::new(DirectoryScan::new(&config.source))),
        SearchMethod::Parse => {
            let mut logs = RsyncLogs::new(&config.source, &config.storage)?;
            logs.date = config.search.date;
            logs.past_days = config.search.past_days;
            logs.future_days = config.search.future_days;
            logs.delay = Duration::from_secs(config.search.delay);
            Ok(Box::new(logs))
        }
    }
}

/// `root`-relative path with `/` separators.
pub fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Walk the staging directory tree.
pub struct DirectoryScan {
    root: PathBuf,
}

impl DirectoryScan {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl DiscoverySource for DirectoryScan {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn discover(&self) -> Result<Vec<Discovered>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(relative) = relative_path(entry.path(), &self.root) {
                found.push(relative);
            }
        }
        debug!(root = %self.root.display(), count = found.len(), "Scan complete");
        Ok(vec![Discovered::new(found)])
    }
}

/// Read file names from rsync transfer logs.
///
/// Logs live under `<logs>/<YYYYMMDD>/**/rsync*log`. Transferred files appear
/// as `<f+++++++++ SIZE PATH` lines, PATH relative to the storage area.
/// A log is parsed once it has been quiet for `delay`. Each log becomes one
/// [`Discovered`] batch; the `<log>.done` sentinel is written when the finder
/// completes the batch. A log modified after its sentinel is parsed again.
pub struct RsyncLogs {
    logs: PathBuf,
    storage: PathBuf,
    pub date: Option<NaiveDate>,
    pub past_days: u32,
    pub future_days: u32,
    pub delay: Duration,
    log_name: Regex,
}

const SENTINEL_EXTENSION: &str = "done";
const NEW_FILE_MARKER: &str = "<f+++++++++";

impl RsyncLogs {
    pub fn new(logs: &Path, storage: &Path) -> Result<Self> {
        Ok(Self {
            logs: logs.to_path_buf(),
            storage: storage.to_path_buf(),
            date: None,
            past_days: 1,
            future_days: 1,
            delay: Duration::from_secs(60),
            log_name: Regex::new(r"^rsync.*log$")?,
        })
    }

    fn day_dirs(&self) -> Vec<PathBuf> {
        let origin = self.date.unwrap_or_else(|| Local::now().date_naive());
        let start = origin - ChronoDuration::days(i64::from(self.past_days));
        (0..=i64::from(self.past_days) + i64::from(self.future_days))
            .map(|offset| start + ChronoDuration::days(offset))
            .map(|day| self.logs.join(day.format("%Y%m%d").to_string()))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    fn sentinel_for(log: &Path) -> PathBuf {
        let mut name = log.as_os_str().to_owned();
        name.push(".");
        name.push(SENTINEL_EXTENSION);
        PathBuf::from(name)
    }

    /// Whether `log` should be parsed now.
    fn is_ready(&self, log: &Path, now: SystemTime) -> bool {
        let modified = match fs::metadata(log).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                error!(log = %log.display(), error = %e, "Cannot stat log");
                return false;
            }
        };
        if now.duration_since(modified).unwrap_or_default() < self.delay {
            return false;
        }

        let sentinel = Self::sentinel_for(log);
        match fs::metadata(&sentinel).and_then(|m| m.modified()) {
            Err(_) => true,
            Ok(marked) if marked < modified => {
                error!(log = %log.display(), "Log changed since it was parsed, parsing again");
                if let Err(e) = fs::remove_file(&sentinel) {
                    error!(sentinel = %sentinel.display(), error = %e, "Cannot remove sentinel");
                    return false;
                }
                true
            }
            Ok(_) => false,
        }
    }

    fn parse_log(log: &Path) -> std::io::Result<Vec<String>> {
        let reader = BufReader::new(File::open(log)?);
        let mut paths = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.contains(NEW_FILE_MARKER) {
                continue;
            }
            match line.split_whitespace().nth(2) {
                Some(path) => paths.push(path.trim_start_matches("./").to_string()),
                None => warn!(log = %log.display(), line = %line, "Malformed transfer line"),
            }
        }
        Ok(paths)
    }
}

impl DiscoverySource for RsyncLogs {
    fn name(&self) -> &'static str {
        "parse"
    }

    fn location(&self) -> &Path {
        &self.storage
    }

    fn discover(&self) -> Result<Vec<Discovered>> {
        let now = SystemTime::now();
        let mut batches = Vec::new();

        for day in self.day_dirs() {
            for entry in WalkDir::new(&day).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                let is_log = entry.file_type().is_file()
                    && self.log_name.is_match(&entry.file_name().to_string_lossy());
                if !is_log || !self.is_ready(entry.path(), now) {
                    continue;
                }

                match Self::parse_log(entry.path()) {
                    Ok(paths) => {
                        debug!(log = %entry.path().display(), count = paths.len(), "Parsed log");
                        batches.push(Discovered::from_log(entry.path(), paths));
                    }
                    Err(e) => error!(log = %entry.path().display(), error = %e, "Cannot read log"),
                }
            }
        }
        Ok(batches)
    }
}
