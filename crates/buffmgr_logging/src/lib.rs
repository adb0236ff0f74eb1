//! Logging setup shared by the buffmgr components.
//!
//! Every component logs to stderr and to its own size-rotated file
//! (`~/.buffmgr/logs/<component>.log` unless configured otherwise).
//! `RUST_LOG` always takes precedence over the configured level.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const CRATES: [&str; 2] = ["buffmgr", "buffmgr_db"];
const DEFAULT_LEVEL: &str = "info";
pub const DEFAULT_MAX_FILES: usize = 5;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging settings for one process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Component name; also the default log file stem.
    pub component: String,
    /// Mirror debug output to stderr.
    pub verbose: bool,
    /// Explicit log file, overriding the home-directory default.
    pub file: Option<PathBuf>,
    /// Level (`debug`) or full filter directive (`buffmgr=debug,sqlx=warn`).
    pub level: Option<String>,
    pub max_file_size: u64,
    pub max_files: usize,
}

impl LogConfig {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            verbose: false,
            file: None,
            level: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_files: DEFAULT_MAX_FILES,
        }
    }

    /// Where this configuration writes its log file.
    pub fn log_path(&self) -> Result<PathBuf> {
        match &self.file {
            Some(path) => Ok(path.clone()),
            None => Ok(logs_dir()?.join(format!("{}.log", sanitize_name(&self.component)))),
        }
    }

    fn filter_directive(&self) -> String {
        let level = self.level.as_deref().unwrap_or(DEFAULT_LEVEL).trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            CRATES
                .iter()
                .map(|krate| format!("{}={}", krate, level))
                .collect::<Vec<_>>()
                .join(",")
        }
    }
}

/// Install the global subscriber. Returns the log file in use.
pub fn init_logging(config: &LogConfig) -> Result<PathBuf> {
    let path = config.log_path()?;
    let writer = SharedRotatingWriter::open(&path, config.max_file_size, config.max_files)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let directive = config.filter_directive();
    let file_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directive))
        .with_context(|| format!("Invalid log level '{}'", directive))?;
    let console_filter = if config.verbose {
        EnvFilter::new(CRATES.map(|krate| format!("{}=debug", krate)).join(","))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(path)
}

/// The buffmgr home directory: `$BUFFMGR_HOME` or `~/.buffmgr`.
pub fn buffmgr_home() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("BUFFMGR_HOME") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".buffmgr"))
        .ok_or_else(|| anyhow!("Could not determine home directory; set BUFFMGR_HOME"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(buffmgr_home()?.join("logs"))
}

/// Append-only log file that rolls to `<name>.1 .. <name>.<keep-1>` once it
/// would exceed `max_size`.
struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    keep: usize,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(path: &Path, max_size: u64, keep: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut rotating = Self {
            path: path.to_path_buf(),
            max_size,
            keep: keep.max(1),
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.max_size {
            rotating.roll()?;
        }
        Ok(rotating)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        // keep == 1 means truncate in place.
        if self.keep == 1 {
            File::create(&self.path)?;
            return self.reopen();
        }

        let last = self.backup(self.keep - 1);
        if last.exists() {
            fs::remove_file(&last)?;
        }
        for n in (1..self.keep - 1).rev() {
            let from = self.backup(n);
            if from.exists() {
                fs::rename(&from, self.backup(n + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, self.backup(1))?;
        }
        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file closed"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` handing every event the same rotating file.
#[derive(Clone)]
struct SharedRotatingWriter(Arc<Mutex<RotatingFile>>);

impl SharedRotatingWriter {
    fn open(path: &Path, max_size: u64, keep: usize) -> io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(RotatingFile::open(
            path, max_size, keep,
        )?))))
    }

    fn with<T>(&self, f: impl FnOnce(&mut RotatingFile) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut guard)
    }
}

impl Write for SharedRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRotatingWriter {
    type Writer = SharedRotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
