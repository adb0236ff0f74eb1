//! Ingestion backends.
//!
//! A backend registers one file with the downstream system. Calls are
//! blocking and run on the blocking thread pool; a panic inside a backend is
//! treated as process-fatal by the worker pool.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{EndpointError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// Longest backend error detail stored in an event.
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Success,
    Failure(String),
}

impl IngestOutcome {
    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure(truncate_detail(&detail.into()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

pub trait IngestBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Version recorded on every event this backend produces.
    fn version(&self) -> String {
        String::new()
    }

    /// Ingest the file at the absolute path `path`.
    fn ingest(&self, path: &Path) -> IngestOutcome;
}

pub type BackendFactory = fn(&serde_json::Value) -> Result<Arc<dyn IngestBackend>>;

/// Name-keyed backend constructors.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("null", NullBackend::from_config);
        registry.register("command", CommandBackend::from_config);
        registry.register("link", LinkBackend::from_config);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, config: &serde_json::Value) -> Result<Arc<dyn IngestBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EndpointError::UnknownBackend(name.to_string()))?;
        factory(config)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Deserialize a backend section, treating a missing section as `{}`.
fn parse_config<T: for<'de> Deserialize<'de>>(config: &serde_json::Value) -> Result<T> {
    let config = if config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        config.clone()
    };
    Ok(serde_json::from_value(config)?)
}

fn truncate_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.chars().count() > MAX_DETAIL_CHARS {
        let head: String = trimmed.chars().take(MAX_DETAIL_CHARS).collect();
        format!("{}... (truncated)", head)
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// null
// ============================================================================

/// Accepts every file without doing anything.
pub struct NullBackend;

impl NullBackend {
    fn from_config(_: &serde_json::Value) -> Result<Arc<dyn IngestBackend>> {
        Ok(Arc::new(NullBackend))
    }
}

impl IngestBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn ingest(&self, path: &Path) -> IngestOutcome {
        debug!(path = %path.display(), "Null ingest");
        IngestOutcome::Success
    }
}

// ============================================================================
// command
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandConfig {
    /// Program followed by its arguments; `{path}` is replaced by the file path.
    command: Vec<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Runs an external program per file. Exit status 0 is success.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    version: String,
    env: BTreeMap<String, String>,
}

const PATH_PLACEHOLDER: &str = "{path}";

impl CommandBackend {
    fn from_config(config: &serde_json::Value) -> Result<Arc<dyn IngestBackend>> {
        let config: CommandConfig = parse_config(config)?;
        let mut parts = config.command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| EndpointError::config("command backend: 'command' must not be empty"))?;
        let mut args: Vec<String> = parts.collect();
        if !args.iter().any(|arg| arg.contains(PATH_PLACEHOLDER)) {
            args.push(PATH_PLACEHOLDER.to_string());
        }
        Ok(Arc::new(CommandBackend {
            program,
            args,
            version: config.version.unwrap_or_default(),
            env: config.env,
        }))
    }

    fn command_for(&self, path: &Path) -> Command {
        let path = path.to_string_lossy();
        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|arg| arg.replace(PATH_PLACEHOLDER, &path)))
            .envs(&self.env);
        command
    }
}

impl IngestBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn ingest(&self, path: &Path) -> IngestOutcome {
        let output = match self.command_for(path).output() {
            Ok(output) => output,
            Err(e) => return IngestOutcome::failure(format!("cannot run {}: {}", self.program, e)),
        };
        if output.status.success() {
            return IngestOutcome::Success;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = match output.status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        };
        if stderr.trim().is_empty() {
            IngestOutcome::failure(format!("{} {}", self.program, status))
        } else {
            IngestOutcome::failure(format!("{} {}: {}", self.program, status, stderr.trim()))
        }
    }
}

// ============================================================================
// link
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    Hardlink,
    Symlink,
    Copy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkConfig {
    root: PathBuf,
    #[serde(default)]
    storage: Option<PathBuf>,
    #[serde(default)]
    mode: LinkMode,
    #[serde(default)]
    version: Option<String>,
}

/// Places files into a repository directory.
///
/// Re-ingesting a file whose identical copy is already in place succeeds.
pub struct LinkBackend {
    root: PathBuf,
    storage: Option<PathBuf>,
    mode: LinkMode,
    version: String,
}

impl LinkBackend {
    pub fn new(root: impl Into<PathBuf>, storage: Option<PathBuf>, mode: LinkMode) -> Self {
        Self {
            root: root.into(),
            storage,
            mode,
            version: String::new(),
        }
    }

    fn from_config(config: &serde_json::Value) -> Result<Arc<dyn IngestBackend>> {
        let config: LinkConfig = parse_config(config)?;
        if !config.root.is_dir() {
            return Err(EndpointError::config(format!(
                "link backend: repository '{}' not found",
                config.root.display()
            )));
        }
        let mut backend = Self::new(config.root, config.storage, config.mode);
        backend.version = config.version.unwrap_or_default();
        Ok(Arc::new(backend))
    }

    fn target_for(&self, path: &Path) -> Option<PathBuf> {
        let relative = match &self.storage {
            Some(storage) => path.strip_prefix(storage).ok()?.to_path_buf(),
            None => PathBuf::from(path.file_name()?),
        };
        Some(self.root.join(relative))
    }

    fn same_content(a: &Path, b: &Path) -> std::io::Result<bool> {
        if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
            return Ok(false);
        }
        let algorithm = ChecksumAlgorithm::Blake3;
        Ok(algorithm.file_digest(a)? == algorithm.file_digest(b)?)
    }

    fn place(&self, path: &Path, target: &Path) -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.mode {
            LinkMode::Hardlink => fs::hard_link(path, target),
            LinkMode::Copy => fs::copy(path, target).map(|_| ()),
            #[cfg(unix)]
            LinkMode::Symlink => std::os::unix::fs::symlink(path, target),
            #[cfg(windows)]
            LinkMode::Symlink => std::os::windows::fs::symlink_file(path, target),
        }
    }
}

impl IngestBackend for LinkBackend {
    fn name(&self) -> &str {
        "link"
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn ingest(&self, path: &Path) -> IngestOutcome {
        let Some(target) = self.target_for(path) else {
            return IngestOutcome::failure(format!(
                "{} is outside the storage area",
                path.display()
            ));
        };

        if target.exists() {
            return match Self::same_content(path, &target) {
                Ok(true) => {
                    debug!(target = %target.display(), "Already in repository");
                    IngestOutcome::Success
                }
                Ok(false) => IngestOutcome::failure(format!(
                    "a different file already exists at {}",
                    target.display()
                )),
                Err(e) => IngestOutcome::failure(format!(
                    "cannot compare with {}: {}",
                    target.display(),
                    e
                )),
            };
        }

        match self.place(path, &target) {
            Ok(()) => IngestOutcome::Success,
            Err(e) => IngestOutcome::failure(format!(
                "cannot place {} at {}: {}",
                path.display(),
                target.display(),
                e
            )),
        }
    }
}
