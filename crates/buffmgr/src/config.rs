//! Configuration for the buffmgr components
//!
//! One file per process, TOML or YAML. Every section has defaults except the
//! settings that have no sensible default (database URL, directories).

use crate::actions::ActionKind;
use crate::backend::BackendRegistry;
use crate::checksum::ChecksumAlgorithm;
use crate::error::{EndpointError, Result};
use crate::filter::check_target_status;
use crate::patterns::PathPatterns;
use buffmgr_db::{FileStatus, StoreOptions, TableNames};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub finder: Option<FinderConfig>,
    #[serde(default)]
    pub ingester: Option<IngesterConfig>,
    #[serde(default)]
    pub backfill: Option<BackfillConfig>,
    #[serde(default)]
    pub cleaner: Option<CleanerConfig>,
    #[serde(default)]
    pub check: Option<CheckConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite:` URL or path to the database file
    pub url: String,
    #[serde(default)]
    pub tablenames: TableNames,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Additional database files attached under a schema name
    #[serde(default)]
    pub attach: BTreeMap<String, PathBuf>,
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseConfig {
    pub fn store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::new(self.url.clone())
            .with_tables(self.tablenames.clone())
            .with_max_connections(self.max_connections);
        for (schema, path) in &self.attach {
            options = options.attach(schema.clone(), path.clone());
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderConfig {
    /// Staging area
    pub source: PathBuf,
    /// Storage area
    pub storage: PathBuf,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
    /// Seconds between discovery passes when running standalone
    #[serde(default = "default_pause")]
    pub pause: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_standard_action")]
    pub standard: ActionKind,
    #[serde(default = "default_alternative_action")]
    pub alternative: ActionKind,
}

fn default_standard_action() -> ActionKind {
    ActionKind::Move
}

fn default_alternative_action() -> ActionKind {
    ActionKind::Noop
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            standard: default_standard_action(),
            alternative: default_alternative_action(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// Walk the staging directory tree
    #[default]
    Scan,
    /// Read transferred file names from rsync logs
    #[serde(alias = "parse_rsync_logs")]
    Parse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub method: SearchMethod,
    #[serde(default)]
    pub exclude_list: Vec<String>,
    /// Day whose log directory is monitored; today when absent
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default = "default_days")]
    pub past_days: u32,
    #[serde(default = "default_days")]
    pub future_days: u32,
    /// Seconds a log must stay unmodified before it is parsed
    #[serde(default = "default_delay")]
    pub delay: u64,
}

fn default_days() -> u32 {
    1
}

fn default_delay() -> u64 {
    60
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            method: SearchMethod::default(),
            exclude_list: Vec::new(),
            date: None,
            past_days: default_days(),
            future_days: default_days(),
            delay: default_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    /// Storage area; files are ingested from `<storage>/<path>`
    pub storage: PathBuf,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default = "default_file_status")]
    pub file_status: FileStatus,
    #[serde(default)]
    pub include_list: Vec<String>,
    #[serde(default)]
    pub exclude_list: Vec<String>,
    /// Files per dispatch; negative means unlimited
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default = "default_daemon")]
    pub daemon: bool,
    #[serde(default = "default_pause")]
    pub pause: f64,
    /// Run a finder pass (from the `finder` section) at the start of each cycle
    #[serde(default)]
    pub run_finder: bool,
}

fn default_file_status() -> FileStatus {
    FileStatus::Untried
}

fn default_batch_size() -> i64 {
    10
}

fn default_num_threads() -> usize {
    1
}

fn default_daemon() -> bool {
    true
}

fn default_pause() -> f64 {
    1.0
}

impl IngesterConfig {
    /// `None` means no cap.
    pub fn batch_limit(&self) -> Option<usize> {
        usize::try_from(self.batch_size).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_plugin_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

fn default_plugin_name() -> String {
    "null".to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: default_plugin_name(),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub storage: PathBuf,
    /// Files, directories or glob patterns relative to `storage`
    pub sources: Vec<String>,
    #[serde(default)]
    pub exclude_list: Vec<String>,
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
}

/// Storage area compared against the file records by `buffmgr check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub storage: PathBuf,
    /// Storage files never expected in the store, such as transfer logs
    #[serde(default)]
    pub exclude_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    pub directories: Vec<PathBuf>,
    #[serde(default)]
    pub files_older_than: Interval,
    #[serde(default)]
    pub directories_empty_for_more_than: Interval,
    #[serde(default = "default_daemon")]
    pub daemon: bool,
    #[serde(default = "default_cleaner_pause")]
    pub pause: f64,
}

fn default_cleaner_pause() -> f64 {
    3600.0
}

/// Time span given as days/hours/minutes/seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl Interval {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(
            self.days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<String>,
}

impl Config {
    /// Load from a `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EndpointError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("toml") => Self::from_toml(&content),
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Err(EndpointError::config(format!(
                "{}: unsupported configuration format (expected .toml, .yaml or .yml)",
                path.display()
            ))),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EndpointError::config(e.to_string()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| EndpointError::config(e.to_string()))
    }

    /// Effective configuration rendered as TOML, for `--dump` and startup logs.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EndpointError::config(e.to_string()))
    }

    pub fn finder(&self) -> Result<&FinderConfig> {
        self.finder
            .as_ref()
            .ok_or_else(|| EndpointError::config("missing 'finder' section"))
    }

    pub fn ingester(&self) -> Result<&IngesterConfig> {
        self.ingester
            .as_ref()
            .ok_or_else(|| EndpointError::config("missing 'ingester' section"))
    }

    pub fn backfill(&self) -> Result<&BackfillConfig> {
        self.backfill
            .as_ref()
            .ok_or_else(|| EndpointError::config("missing 'backfill' section"))
    }

    pub fn cleaner(&self) -> Result<&CleanerConfig> {
        self.cleaner
            .as_ref()
            .ok_or_else(|| EndpointError::config("missing 'cleaner' section"))
    }

    pub fn check(&self) -> Result<&CheckConfig> {
        self.check
            .as_ref()
            .ok_or_else(|| EndpointError::config("missing 'check' section"))
    }

    /// Check every section that is present. Nothing is touched on disk.
    pub fn validate(&self, backends: &BackendRegistry) -> Result<()> {
        self.validate_database()?;
        if let Some(finder) = &self.finder {
            finder.validate()?;
        }
        if let Some(ingester) = &self.ingester {
            ingester.validate(backends)?;
            if ingester.run_finder && self.finder.is_none() {
                return Err(EndpointError::config(
                    "ingester.run_finder requires a 'finder' section",
                ));
            }
        }
        if let Some(backfill) = &self.backfill {
            backfill.validate()?;
        }
        if let Some(cleaner) = &self.cleaner {
            cleaner.validate()?;
        }
        if let Some(check) = &self.check {
            check.validate()?;
        }
        Ok(())
    }

    pub fn validate_database(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(EndpointError::config("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(EndpointError::config(
                "database.max_connections must be at least 1",
            ));
        }
        self.database.tablenames.validate()?;
        Ok(())
    }
}

impl FinderConfig {
    pub fn validate(&self) -> Result<()> {
        require_dir("finder.source", &self.source)?;
        require_dir("finder.storage", &self.storage)?;
        PathPatterns::exclude_only(&self.search.exclude_list)?;
        require_pause("finder.pause", self.pause)?;
        if self.actions.standard == ActionKind::Delete {
            return Err(EndpointError::config(
                "finder.actions.standard cannot be Delete",
            ));
        }
        // Parsed logs name files that are already in storage.
        if self.search.method == SearchMethod::Parse && self.actions.standard == ActionKind::Move {
            return Err(EndpointError::config(
                "finder.actions.standard must be Noop when search.method is parse",
            ));
        }
        Ok(())
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pause)
    }
}

impl IngesterConfig {
    pub fn validate(&self, backends: &BackendRegistry) -> Result<()> {
        require_dir("ingester.storage", &self.storage)?;
        check_target_status(self.file_status)?;
        PathPatterns::new(&self.include_list, &self.exclude_list)?;
        if self.num_threads == 0 {
            return Err(EndpointError::config(
                "ingester.num_threads must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(EndpointError::config(
                "ingester.batch_size must be positive, or negative for no limit",
            ));
        }
        require_pause("ingester.pause", self.pause)?;
        if !backends.contains(&self.plugin.name) {
            return Err(EndpointError::UnknownBackend(self.plugin.name.clone()));
        }
        Ok(())
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pause)
    }
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<()> {
        require_dir("backfill.storage", &self.storage)?;
        if self.sources.is_empty() {
            return Err(EndpointError::config("backfill.sources must not be empty"));
        }
        for source in &self.sources {
            glob::Pattern::new(source)?;
        }
        PathPatterns::exclude_only(&self.exclude_list)?;
        Ok(())
    }
}

impl CheckConfig {
    pub fn validate(&self) -> Result<()> {
        require_dir("check.storage", &self.storage)?;
        PathPatterns::exclude_only(&self.exclude_list)?;
        Ok(())
    }
}

impl CleanerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.directories.is_empty() {
            return Err(EndpointError::config("cleaner.directories must not be empty"));
        }
        for dir in &self.directories {
            require_dir("cleaner.directories", dir)?;
        }
        require_pause("cleaner.pause", self.pause)
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pause)
    }
}

fn require_dir(key: &str, path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(EndpointError::config(format!(
            "{}: directory '{}' not found",
            key,
            path.display()
        )))
    }
}

fn require_pause(key: &str, pause: f64) -> Result<()> {
    if pause.is_finite() && pause >= 0.0 {
        Ok(())
    } else {
        Err(EndpointError::config(format!(
            "{} must be a non-negative number of seconds",
            key
        )))
    }
}
