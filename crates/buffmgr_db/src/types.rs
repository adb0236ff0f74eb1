//! Entities persisted by the event store.
//!
//! A [`TrackedFile`] is immutable once written. Everything that happens to it
//! afterwards is an appended [`FileEvent`]; the most recent event defines the
//! file's current [`FileStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
    /// Never attempted.
    #[serde(alias = "NEW")]
    Untried,
    /// Claimed by a worker, attempt in progress.
    Pending,
    /// Ingestion completed.
    Success,
    /// Ingestion attempted and failed.
    Failure,
    /// Attempt outcome could not be determined (process died while pending).
    Unknown,
    /// Operator asked for another attempt.
    Rerun,
    /// Registered retroactively, never ingested by the normal path.
    Backfill,
}

impl FileStatus {
    pub const ALL: [FileStatus; 7] = [
        Self::Untried,
        Self::Pending,
        Self::Success,
        Self::Failure,
        Self::Unknown,
        Self::Rerun,
        Self::Backfill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untried => "UNTRIED",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Unknown => "UNKNOWN",
            Self::Rerun => "RERUN",
            Self::Backfill => "BACKFILL",
        }
    }

    /// Legacy spelling still found in databases written by older tooling.
    pub(crate) fn legacy_str(&self) -> &'static str {
        match self {
            Self::Untried => "NEW",
            other => other.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "UNTRIED" | "NEW" => Some(Self::Untried),
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "UNKNOWN" => Some(Self::Unknown),
            "RERUN" => Some(Self::Rerun),
            "BACKFILL" => Some(Self::Backfill),
            _ => None,
        }
    }

    /// Statuses that close an attempt opened by `Pending`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Unknown)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown file status: '{}'", s))
    }
}

/// A file tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub id: i64,
    /// Path relative to the storage area, always with forward slashes.
    pub path: String,
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity of a file about to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

impl NewFile {
    pub fn new(path: impl Into<String>, checksum: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            checksum: checksum.into(),
            size,
        }
    }
}

/// An immutable entry in a file's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub id: i64,
    pub file_id: i64,
    pub status: FileStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    /// Version reported by the ingestion backend that made the attempt.
    pub version: Option<String>,
}

/// Event contents prior to insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub status: FileStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub version: Option<String>,
}

impl NewEvent {
    /// Event starting now with no end time, detail or version.
    pub fn now(status: FileStatus) -> Self {
        Self::at(status, Utc::now())
    }

    pub fn at(status: FileStatus, start_time: DateTime<Utc>) -> Self {
        Self {
            status,
            start_time,
            end_time: None,
            detail: None,
            version: None,
        }
    }

    pub fn ended(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.version = (!version.is_empty()).then_some(version);
        self
    }
}

/// Result of registering a file together with its first event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// File and first event were inserted.
    Created(TrackedFile),
    /// A file with the same (path, checksum) is already tracked; nothing was written.
    AlreadyTracked(i64),
}

impl Registration {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Per-status counts of current file states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub by_status: BTreeMap<FileStatus, u64>,
    /// Tracked files that have no event at all.
    pub without_events: u64,
}

impl StatusReport {
    pub fn count(&self, status: FileStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.by_status.values().sum::<u64>() + self.without_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_and_legacy_alias() {
        for status in FileStatus::ALL {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("NEW"), Some(FileStatus::Untried));
        assert_eq!(FileStatus::parse("rerun"), Some(FileStatus::Rerun));
        assert_eq!(FileStatus::parse("IGNORED"), None);
        assert!("bogus".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(FileStatus::Success.is_terminal());
        assert!(FileStatus::Failure.is_terminal());
        assert!(FileStatus::Unknown.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
        assert!(!FileStatus::Rerun.is_terminal());
    }

    #[test]
    fn test_empty_version_is_dropped() {
        let event = NewEvent::now(FileStatus::Success).with_version("");
        assert!(event.version.is_none());
        let event = NewEvent::now(FileStatus::Success).with_version("1.2.0");
        assert_eq!(event.version.as_deref(), Some("1.2.0"));
    }
}
