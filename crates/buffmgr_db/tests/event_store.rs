//! Event store behaviour against an on-disk database shared by several pools.

use buffmgr_db::{
    EventStore, FileStatus, NewEvent, NewFile, Registration, StoreOptions, TableNames, TableRef,
};
use std::path::Path;
use tempfile::TempDir;

async fn open(path: &Path) -> EventStore {
    EventStore::open(StoreOptions::new(path.display().to_string()).with_max_connections(4))
        .await
        .unwrap()
}

async fn register(store: &EventStore, path: &str) -> i64 {
    match store
        .register_file(
            NewFile::new(path, format!("sum-{}", path), 100),
            NewEvent::now(FileStatus::Untried),
        )
        .await
        .unwrap()
    {
        Registration::Created(file) => file.id,
        Registration::AlreadyTracked(id) => id,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("store.db");

    // Two stores stand in for two scheduler processes.
    let a = open(&db_path).await;
    let b = open(&db_path).await;
    let file_id = register(&a, "night/a.fits").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = if i % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move {
            store.claim(file_id, FileStatus::Untried).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let pending = a
        .events_for_file(file_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status == FileStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn history_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("store.db");

    let file_id = {
        let store = open(&db_path).await;
        let id = register(&store, "a.fits").await;
        store.claim(id, FileStatus::Untried).await.unwrap().unwrap();
        store.close().await;
        id
    };

    let store = open(&db_path).await;
    assert_eq!(
        store.current_status(file_id).await.unwrap(),
        Some(FileStatus::Pending)
    );
    assert_eq!(store.recover_pending("process restarted").await.unwrap(), 1);
    assert_eq!(
        store.current_status(file_id).await.unwrap(),
        Some(FileStatus::Unknown)
    );
    assert!(store
        .files_with_status(FileStatus::Untried)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rerun_selects_only_rerun_files() {
    let store = EventStore::open_in_memory().await.unwrap();
    let done = register(&store, "done.fits").await;
    let again = register(&store, "again.fits").await;

    for id in [done, again] {
        store.claim(id, FileStatus::Untried).await.unwrap().unwrap();
        store
            .transition(id, FileStatus::Pending, NewEvent::now(FileStatus::Success))
            .await
            .unwrap()
            .unwrap();
    }
    store
        .append_event(again, NewEvent::now(FileStatus::Rerun))
        .await
        .unwrap();

    let selected = store.files_with_status(FileStatus::Rerun).await.unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].id, again);
}

#[tokio::test]
async fn custom_table_names_are_used() {
    let tables = TableNames {
        file: TableRef::new("obs_files"),
        event: TableRef::new("obs_events"),
    };
    let store = EventStore::open(StoreOptions::new("sqlite::memory:").with_tables(tables))
        .await
        .unwrap();
    register(&store, "x.fits").await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM obs_events")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}
