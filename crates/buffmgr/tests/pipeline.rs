//! End-to-end tests: staging area -> finder -> event store -> ingester.

use buffmgr::actions::ActionKind;
use buffmgr::backfill::Backfill;
use buffmgr::check::ConsistencyCheck;
use buffmgr::config::SearchMethod;
use buffmgr::db::{EventStore, FileStatus, NewEvent, NewFile, Registration};
use buffmgr::filter::EligibilityFilter;
use buffmgr::patterns::PathPatterns;
use buffmgr::scheduler::{SchedulerSettings, RECOVERY_DETAIL};
use buffmgr::worker::WorkerPool;
use buffmgr::{
    BackendRegistry, CancellationToken, Config, Finder, IngestBackend, IngestOutcome, Ingester,
};
use chrono::NaiveDate;
use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Site {
    _tmp: TempDir,
    staging: PathBuf,
    storage: PathBuf,
    db: PathBuf,
}

impl Site {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        let storage = tmp.path().join("storage");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&storage).unwrap();
        let db = tmp.path().join("buffmgr.db");
        Self {
            _tmp: tmp,
            staging,
            storage,
            db,
        }
    }

    /// Configuration with finder and one-shot ingester sections; `extra` is
    /// appended inside the `[ingester]` table.
    fn config(&self, extra: &str) -> Config {
        Config::from_toml(&format!(
            r#"
[database]
url = "{db}"

[finder]
source = "{staging}"
storage = "{storage}"

[finder.actions]
standard = "Move"
alternative = "Delete"

[ingester]
storage = "{storage}"
daemon = false
pause = 0.01
{extra}
"#,
            db = self.db.display(),
            staging = self.staging.display(),
            storage = self.storage.display(),
            extra = extra,
        ))
        .unwrap()
    }

    fn stage(&self, relative: &str, content: &[u8]) -> PathBuf {
        write(&self.staging, relative, content)
    }

    fn shelve(&self, relative: &str, content: &[u8]) -> PathBuf {
        write(&self.storage, relative, content)
    }

    /// Transfer log under `<staging>/<day>/`, old enough to be parsed.
    fn rsync_log(&self, day: &str, body: &str) -> PathBuf {
        let log = write(&self.staging, &format!("{}/rsync.{}.log", day, day), body.as_bytes());
        let past = FileTime::from_unix_time(FileTime::now().unix_seconds() - 600, 0);
        set_file_mtime(&log, past).unwrap();
        log
    }

    async fn open(&self, config: &Config) -> EventStore {
        EventStore::open(config.database.store_options()).await.unwrap()
    }
}

fn write(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

fn sentinel(log: &Path) -> PathBuf {
    PathBuf::from(format!("{}.done", log.display()))
}

/// Finder reading transfer logs for 2024-06-01, leaving files where they are.
fn parse_config(site: &Site) -> Config {
    let mut config = site.config("");
    let finder = config.finder.as_mut().unwrap();
    finder.search.method = SearchMethod::Parse;
    finder.search.date = NaiveDate::from_ymd_opt(2024, 6, 1);
    finder.actions.standard = ActionKind::Noop;
    finder.actions.alternative = ActionKind::Noop;
    config
}

async fn track(store: &EventStore, path: &str, statuses: &[FileStatus]) -> i64 {
    let id = match store
        .register_file(
            NewFile::new(path, format!("sum-{}", path), 4),
            NewEvent::now(FileStatus::Untried),
        )
        .await
        .unwrap()
    {
        Registration::Created(file) => file.id,
        Registration::AlreadyTracked(id) => id,
    };
    for status in statuses {
        store.append_event(id, NewEvent::now(*status)).await.unwrap();
    }
    id
}

/// Counts calls and cancels the shared token after `cancel_after` of them.
struct Counting {
    calls: AtomicUsize,
    cancel_after: usize,
    cancel: CancellationToken,
}

impl Counting {
    fn new(cancel_after: usize, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            cancel_after,
            cancel,
        })
    }
}

impl IngestBackend for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn ingest(&self, _path: &Path) -> IngestOutcome {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls >= self.cancel_after {
            self.cancel.cancel();
        }
        IngestOutcome::Success
    }
}

fn ingester_with(
    store: &EventStore,
    storage: &Path,
    backend: Arc<Counting>,
    target: FileStatus,
    settings: SchedulerSettings,
) -> Ingester {
    let cancel = backend.cancel.clone();
    let filter = EligibilityFilter::new(target, PathPatterns::default()).unwrap();
    let pool = WorkerPool::new(store.clone(), backend, storage.to_path_buf(), target, 1);
    Ingester::new(store.clone(), filter, pool, settings, cancel)
}

#[tokio::test]
async fn test_new_file_is_moved_registered_and_ingested() {
    let site = Site::new();
    let staged = site.stage("2024/01/a.fits", b"data");
    let config = site.config("");
    let store = site.open(&config).await;

    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();
    let stats = finder.run_once().await.unwrap();
    assert_eq!(stats.registered, 1);
    assert!(!staged.exists());
    assert!(site.storage.join("2024/01/a.fits").exists());

    let untried = store.files_with_status(FileStatus::Untried).await.unwrap();
    assert_eq!(untried.len(), 1);
    assert_eq!(untried[0].path, "2024/01/a.fits");
    assert_eq!(untried[0].size, 4);
    let id = untried[0].id;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.ingest.succeeded, 1);
    assert_eq!(summary.cycles, 1);

    let history: Vec<FileStatus> = store
        .events_for_file(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(
        history,
        vec![FileStatus::Untried, FileStatus::Pending, FileStatus::Success]
    );

    // Same name and content arriving again is a duplicate: deleted, not re-registered.
    let again = site.stage("2024/01/a.fits", b"data");
    let stats = finder.run_once().await.unwrap();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.registered, 0);
    assert!(!again.exists());
    assert_eq!(store.count_files().await.unwrap(), 1);
}

#[tokio::test]
async fn test_changed_content_registers_new_file() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    site.stage("night/b.fits", b"first");
    finder.run_once().await.unwrap();
    site.stage("night/b.fits", b"second");
    let stats = finder.run_once().await.unwrap();

    assert_eq!(stats.registered, 1);
    assert_eq!(store.count_files().await.unwrap(), 2);
    assert_eq!(fs::read(site.storage.join("night/b.fits")).unwrap(), b"second");
}

#[tokio::test]
async fn test_repeated_discovery_registers_once() {
    let site = Site::new();
    site.stage("a.fits", b"aaaa");
    site.stage("sub/b.fits", b"bbbb");
    site.stage("sub/c.tmp", b"cccc");

    let mut config = site.config("");
    {
        let finder = config.finder.as_mut().unwrap();
        finder.actions.standard = ActionKind::Noop;
        finder.actions.alternative = ActionKind::Noop;
        finder.search.exclude_list = vec![r"\.tmp$".to_string()];
    }
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    let first = finder.run_once().await.unwrap();
    assert_eq!(first.discovered, 3);
    assert_eq!(first.excluded, 1);
    assert_eq!(first.registered, 2);

    let second = finder.run_once().await.unwrap();
    assert_eq!(second.registered, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(store.count_files().await.unwrap(), 2);
    assert!(site.staging.join("a.fits").exists());
}

#[tokio::test]
async fn test_interrupted_attempt_is_closed_as_unknown() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    site.shelve("a.fits", b"data");
    let id = track(&store, "a.fits", &[FileStatus::Pending]).await;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.ingest.dispatched, 0);

    let latest = store.latest_event(id).await.unwrap().unwrap();
    assert_eq!(latest.status, FileStatus::Unknown);
    assert_eq!(latest.detail.as_deref(), Some(RECOVERY_DETAIL));

    // Nothing left to recover on the next start.
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.recovered, 0);
}

#[tokio::test]
async fn test_daemon_cycle_respects_batch_cap() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    for name in ["a", "b", "c", "d", "e"] {
        let path = format!("{}.fits", name);
        site.shelve(&path, b"data");
        track(&store, &path, &[]).await;
    }

    let backend = Counting::new(2, CancellationToken::new());
    let mut ingester = ingester_with(
        &store,
        &site.storage,
        Arc::clone(&backend),
        FileStatus::Untried,
        SchedulerSettings {
            batch_size: Some(2),
            daemon: true,
            pause: Duration::from_secs(60),
        },
    );

    let summary = tokio::time::timeout(Duration::from_secs(10), ingester.run())
        .await
        .expect("daemon did not stop after cancellation")
        .unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.ingest.dispatched, 2);
    assert_eq!(summary.ingest.succeeded, 2);
    assert_eq!(
        store.files_with_status(FileStatus::Untried).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_daemon_without_cap_takes_everything() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    for name in ["a", "b", "c", "d", "e"] {
        let path = format!("{}.fits", name);
        site.shelve(&path, b"data");
        track(&store, &path, &[]).await;
    }

    let backend = Counting::new(5, CancellationToken::new());
    let mut ingester = ingester_with(
        &store,
        &site.storage,
        Arc::clone(&backend),
        FileStatus::Untried,
        SchedulerSettings {
            batch_size: None,
            daemon: true,
            pause: Duration::from_secs(60),
        },
    );

    let summary = tokio::time::timeout(Duration::from_secs(10), ingester.run())
        .await
        .expect("daemon did not stop after cancellation")
        .unwrap();
    assert_eq!(summary.ingest.dispatched, 5);
    assert_eq!(
        store.files_with_status(FileStatus::Success).await.unwrap().len(),
        5
    );
}

#[tokio::test]
async fn test_one_shot_drains_in_chunks() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    for name in ["a", "b", "c", "d", "e"] {
        let path = format!("{}.fits", name);
        site.shelve(&path, b"data");
        track(&store, &path, &[]).await;
    }

    let backend = Counting::new(usize::MAX, CancellationToken::new());
    let mut ingester = ingester_with(
        &store,
        &site.storage,
        Arc::clone(&backend),
        FileStatus::Untried,
        SchedulerSettings {
            batch_size: Some(2),
            daemon: false,
            pause: Duration::from_millis(10),
        },
    );

    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.ingest.dispatched, 5);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
    assert!(store
        .files_with_status(FileStatus::Untried)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start_dispatches_nothing() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    site.shelve("a.fits", b"data");
    track(&store, "a.fits", &[]).await;

    let backend = Counting::new(usize::MAX, CancellationToken::new());
    backend.cancel.cancel();
    let mut ingester = ingester_with(
        &store,
        &site.storage,
        Arc::clone(&backend),
        FileStatus::Untried,
        SchedulerSettings {
            batch_size: Some(10),
            daemon: true,
            pause: Duration::from_secs(60),
        },
    );

    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rerun_target_selects_only_rerun_files() {
    let site = Site::new();
    let config = site.config(r#"file_status = "RERUN""#);
    let store = site.open(&config).await;
    for name in ["a.fits", "b.fits", "c.fits"] {
        site.shelve(name, b"data");
    }
    let rerun = track(&store, "a.fits", &[FileStatus::Success, FileStatus::Rerun]).await;
    let failed = track(&store, "b.fits", &[FileStatus::Failure]).await;
    let untried = track(&store, "c.fits", &[]).await;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.ingest.dispatched, 1);

    assert_eq!(store.current_status(rerun).await.unwrap(), Some(FileStatus::Success));
    assert_eq!(store.current_status(failed).await.unwrap(), Some(FileStatus::Failure));
    assert_eq!(store.current_status(untried).await.unwrap(), Some(FileStatus::Untried));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_failure_is_recorded() {
    let site = Site::new();
    let config = site.config(
        r#"
[ingester.plugin]
name = "command"
config = { command = ["sh", "-c", "exit 3"], version = "2.1" }
"#,
    );
    let store = site.open(&config).await;
    site.shelve("a.fits", b"data");
    let id = track(&store, "a.fits", &[]).await;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.ingest.failed, 1);

    let latest = store.latest_event(id).await.unwrap().unwrap();
    assert_eq!(latest.status, FileStatus::Failure);
    assert!(latest.detail.unwrap().contains("code 3"));
    assert_eq!(latest.version.as_deref(), Some("2.1"));
    assert!(latest.end_time.is_some());
}

#[tokio::test]
async fn test_missing_file_fails_preflight() {
    let site = Site::new();
    let config = site.config("");
    let store = site.open(&config).await;
    let id = track(&store, "gone.fits", &[]).await;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.ingest.failed, 1);
    assert_eq!(store.current_status(id).await.unwrap(), Some(FileStatus::Failure));
}

#[tokio::test]
async fn test_backfill_registers_existing_storage() {
    let site = Site::new();
    site.shelve("2023/x.fits", b"xxxx");
    site.shelve("2023/y.fits", b"yyyy");
    site.shelve("2023/skip.tmp", b"tttt");

    let mut config = site.config("");
    config.backfill = Some(
        toml::from_str(&format!(
            r#"
storage = "{storage}"
sources = ["2023", "missing/*"]
exclude_list = ['\.tmp$']
"#,
            storage = site.storage.display()
        ))
        .unwrap(),
    );
    let store = site.open(&config).await;
    let backfill = Backfill::from_config(config.backfill().unwrap(), store.clone()).unwrap();

    let summary = backfill.run().await.unwrap();
    assert_eq!(summary.registered, 2);
    assert_eq!(summary.excluded, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.is_clean());

    let backfilled = store.files_with_status(FileStatus::Backfill).await.unwrap();
    let paths: Vec<&str> = backfilled.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["2023/x.fits", "2023/y.fits"]);

    let again = backfill.run().await.unwrap();
    assert_eq!(again.registered, 0);
    assert_eq!(again.already_tracked, 2);
    assert_eq!(store.count_files().await.unwrap(), 2);
}

#[tokio::test]
async fn test_yaml_config_file_end_to_end() {
    let site = Site::new();
    let path = site.storage.parent().unwrap().join("buffmgr.yaml");
    fs::write(
        &path,
        format!(
            r#"
database:
  url: "{db}"
  tablenames:
    file: incoming
    event: incoming_events
ingester:
  storage: "{storage}"
  daemon: false
  batch_size: -1
"#,
            db = site.db.display(),
            storage = site.storage.display()
        ),
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    config.validate(&BackendRegistry::with_builtins()).unwrap();
    assert_eq!(config.ingester().unwrap().batch_limit(), None);

    let store = site.open(&config).await;
    assert_eq!(store.tables().file.bare(), "incoming");
    site.shelve("a.fits", b"data");
    let id = track(&store, "a.fits", &[]).await;

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    ingester.run().await.unwrap();
    assert_eq!(store.current_status(id).await.unwrap(), Some(FileStatus::Success));
}

#[tokio::test]
async fn test_unmovable_file_is_retried_next_pass() {
    let site = Site::new();
    site.stage("a.fits", b"aaaa");
    site.stage("b.fits", b"bbbb");
    // A non-empty directory where a.fits should land makes its move fail.
    let blocker = site.storage.join("a.fits");
    write(&blocker, "keep", b"x");

    let config = site.config("");
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    let first = finder.run_once().await.unwrap();
    assert_eq!(first.discovered, 2);
    assert_eq!(first.registered, 1);
    assert_eq!(first.skipped, 1);
    assert!(site.staging.join("a.fits").exists());
    assert!(site.storage.join("b.fits").exists());
    assert_eq!(store.count_files().await.unwrap(), 1);

    fs::remove_dir_all(&blocker).unwrap();
    let second = finder.run_once().await.unwrap();
    assert_eq!(second.discovered, 1);
    assert_eq!(second.registered, 1);
    assert_eq!(second.skipped, 0);
    assert_eq!(fs::read(site.storage.join("a.fits")).unwrap(), b"aaaa");
    assert_eq!(store.count_files().await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_registration_undoes_move() {
    let site = Site::new();
    let staged = site.stage("night/a.fits", b"data");
    let config = site.config("");
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    // Lookups still work but recording the first event cannot.
    sqlx::query(&format!("DROP TABLE {}", store.tables().event.qualified()))
        .execute(store.pool())
        .await
        .unwrap();

    assert!(finder.run_once().await.is_err());
    assert!(staged.exists());
    assert!(!site.storage.join("night/a.fits").exists());
    assert!(!site.storage.join("night").exists());
    assert_eq!(store.count_files().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rsync_log_files_registered_and_ingested() {
    let site = Site::new();
    site.shelve("night/a.fits", b"aaaa");
    site.shelve("night/b.fits", b"bbbb");
    let log = site.rsync_log(
        "20240601",
        "\
building file list ... done
<f+++++++++ 4 night/a.fits
<f+++++++++ 4 ./night/b.fits
<f.st...... 4 night/old.fits
sent 8 bytes  received 58 bytes
",
    );

    let config = parse_config(&site);
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    let stats = finder.run_once().await.unwrap();
    assert_eq!(stats.discovered, 2);
    assert_eq!(stats.registered, 2);
    assert!(sentinel(&log).exists());
    assert!(site.storage.join("night/a.fits").exists());

    let again = finder.run_once().await.unwrap();
    assert_eq!(again.discovered, 0);

    let mut ingester = Ingester::from_config(
        &config,
        store.clone(),
        &BackendRegistry::with_builtins(),
        CancellationToken::new(),
    )
    .unwrap();
    let summary = ingester.run().await.unwrap();
    assert_eq!(summary.ingest.succeeded, 2);
    assert_eq!(
        store.files_with_status(FileStatus::Success).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_log_listing_missing_file_is_read_again() {
    let site = Site::new();
    let log = site.rsync_log("20240601", "<f+++++++++ 4 night/a.fits\n");
    let config = parse_config(&site);
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();

    let first = finder.run_once().await.unwrap();
    assert_eq!(first.skipped, 1);
    assert!(!sentinel(&log).exists());

    site.shelve("night/a.fits", b"data");
    let second = finder.run_once().await.unwrap();
    assert_eq!(second.registered, 1);
    assert_eq!(store.count_files().await.unwrap(), 1);
    assert!(sentinel(&log).exists());
}

#[tokio::test]
async fn test_check_reports_missing_and_untracked_files() {
    let site = Site::new();
    site.stage("night/a.fits", b"aaaa");
    site.stage("night/b.fits", b"bbbb");

    let mut config = site.config("");
    config.check = Some(
        toml::from_str(&format!(
            r#"
storage = "{storage}"
exclude_list = ['\.done$']
"#,
            storage = site.storage.display()
        ))
        .unwrap(),
    );
    let store = site.open(&config).await;
    let finder = Finder::from_config(config.finder().unwrap(), store.clone()).unwrap();
    assert_eq!(finder.run_once().await.unwrap().registered, 2);

    let check = ConsistencyCheck::from_config(config.check().unwrap(), store.clone()).unwrap();
    assert!(check.run().await.unwrap().is_consistent());

    fs::remove_file(site.storage.join("night/b.fits")).unwrap();
    site.shelve("night/stray.fits", b"ssss");
    site.shelve("night/rsync.log.done", b"");

    let report = check.run().await.unwrap();
    assert!(!report.is_consistent());
    let missing: Vec<&str> = report.missing.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(missing, vec!["night/b.fits"]);
    assert_eq!(report.untracked, vec!["night/stray.fits".to_string()]);
    assert_eq!(report.records, 2);
}
