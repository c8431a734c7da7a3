//! Integration tests for applying changelogs to a live SQLite database.
//!
//! These tests exercise the whole path: action dispatch, checksummed
//! history, the change log lock and rollback, through a real connection.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use strata::prelude::*;
use strata::sqlite::SqliteDatabase;
use strata::{AcquireOutcome, ExecType, RollbackSource};

type SqliteEngine = Engine<
    SqliteDatabase,
    strata::SqlHistoryRepository<SqliteDatabase>,
    strata::SqlLockService<SqliteDatabase>,
>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn engine(db: &Arc<SqliteDatabase>, config: MigrationConfig) -> SqliteEngine {
    init_tracing();
    Engine::with_sql_history(config, Arc::new(MigrationContext::standard()), db.clone())
        .expect("engine")
}

fn users() -> ChangeSet {
    ChangeSet::new("1", "alice", "db/changelog.json").action(Action::create_table(
        "users",
        vec![
            ColumnDef::new("id", DataType::Integer).primary_key(),
            ColumnDef::new("email", DataType::Varchar(255)).not_null(),
        ],
    ))
}

fn posts() -> ChangeSet {
    ChangeSet::new("2", "alice", "db/changelog.json").action(Action::create_table(
        "posts",
        vec![
            ColumnDef::new("id", DataType::Integer).primary_key(),
            ColumnDef::new("title", DataType::Text),
        ],
    ))
}

async fn tables(db: &SqliteDatabase) -> Vec<String> {
    db.snapshot(&SnapshotFilter::all())
        .await
        .unwrap()
        .tables()
        .iter()
        .map(|t| t.name.clone())
        .collect()
}

/// Applying the same changelog twice changes nothing the second time.
#[tokio::test]
async fn test_update_is_idempotent() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    let changelog = ChangeLog::new(vec![users(), posts()]).unwrap();

    let first = engine.update(&changelog).await.unwrap();
    assert_eq!(first.applied.len(), 2);
    assert!(first.has_changes());

    let second = engine.update(&changelog).await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.up_to_date, 2);
    assert!(!second.has_changes());

    let names = tables(&db).await;
    assert!(names.contains(&"users".to_string()));
    assert!(names.contains(&"posts".to_string()));
}

/// History rows carry identity, order and the current checksum.
#[tokio::test]
async fn test_history_entries_recorded_in_order() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    let changelog = ChangeLog::new(vec![users(), posts()]).unwrap();
    let report = engine.update(&changelog).await.unwrap();

    let entries = engine.history().entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id.id, "1");
    assert_eq!(entries[0].id.author, "alice");
    assert_eq!(entries[0].order_executed, 1);
    assert_eq!(entries[1].order_executed, 2);
    assert_eq!(entries[0].exec_type, ExecType::Executed);
    assert_eq!(entries[0].deployment_id.as_deref(), Some(report.deployment_id.as_str()));

    let expected = users().checksum(strata::ChecksumVersion::LATEST).unwrap();
    assert_eq!(entries[0].checksum.as_ref(), Some(&expected));
}

/// An edited changeset fails validation before any SQL runs.
#[tokio::test]
async fn test_checksum_mismatch_fails_before_sql() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    engine.update(&ChangeLog::new(vec![users()]).unwrap()).await.unwrap();

    let edited = ChangeSet::new("1", "alice", "db/changelog.json").action(Action::create_table(
        "users",
        vec![ColumnDef::new("id", DataType::BigInt).primary_key()],
    ));
    let err = engine
        .update(&ChangeLog::new(vec![edited.clone(), posts()]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::ChecksumMismatch { .. }), "{err}");
    assert!(!tables(&db).await.contains(&"posts".to_string()));

    // Lenient mode accepts the edit and carries on.
    let lenient = self::engine(&db, MigrationConfig::new().checksum_mode(ChecksumMode::Lenient)).await;
    let report = lenient
        .update(&ChangeLog::new(vec![edited, posts()]).unwrap())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(tables(&db).await.contains(&"posts".to_string()));
}

/// A second engine waits for the lock and then gives up.
#[tokio::test]
async fn test_lock_timeout_when_held() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let holder = engine(&db, MigrationConfig::new()).await;
    let quick = MigrationConfig::new()
        .lock_wait_timeout(Duration::from_millis(100))
        .lock_recheck_interval(Duration::from_millis(10));
    let waiter = engine(&db, quick).await;

    holder.lock_service().initialize().await.unwrap();
    let outcome = holder.lock_service().try_acquire(holder.holder()).await.unwrap();
    assert!(matches!(outcome, AcquireOutcome::Acquired));
    assert!(holder.list_locks().await.unwrap().is_some());

    let changelog = ChangeLog::new(vec![users()]).unwrap();
    let err = waiter.update(&changelog).await.unwrap_err();
    assert!(matches!(err, MigrationError::LockTimeout { .. }), "{err}");
    assert!(matches!(
        waiter.snapshot(&SnapshotFilter::all()).await,
        Err(MigrationError::LockHeld(_))
    ));

    holder.lock_service().release(holder.holder()).await.unwrap();
    let report = waiter.update(&changelog).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(waiter.list_locks().await.unwrap().is_none());
}

/// A failing statement rolls the whole changeset back on SQLite.
#[tokio::test]
async fn test_failed_changeset_rolled_back() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    let broken = ChangeSet::new("3", "bob", "db/changelog.json")
        .action(Action::sql("CREATE TABLE half (id INTEGER)"))
        .action(Action::sql("INSERT INTO missing VALUES (1)"));

    let err = engine
        .update(&ChangeLog::new(vec![users(), broken]).unwrap())
        .await
        .unwrap_err();
    match err {
        MigrationError::Execution {
            change_set,
            index,
            rolled_back,
            ..
        } => {
            assert_eq!(change_set, "db/changelog.json::3::bob");
            assert_eq!(index, 1);
            assert!(rolled_back);
        }
        other => panic!("unexpected error: {other}"),
    }

    let names = tables(&db).await;
    assert!(names.contains(&"users".to_string()));
    assert!(!names.contains(&"half".to_string()));
    assert_eq!(engine.history().entries().await.unwrap().len(), 1);
}

/// Raw SQL has no inverse, but a rollback inferred at apply time undoes it.
#[tokio::test]
async fn test_inferred_rollback_restores_schema() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new().infer_rollback(true)).await;
    engine.update(&ChangeLog::new(vec![users()]).unwrap()).await.unwrap();
    let before = engine.snapshot(&SnapshotFilter::all()).await.unwrap();

    let audit = ChangeSet::new("2", "carol", "db/changelog.json")
        .action(Action::sql("CREATE TABLE audit (id INTEGER NOT NULL, note TEXT)"));
    let changelog = ChangeLog::new(vec![users(), audit]).unwrap();
    engine.update(&changelog).await.unwrap();
    assert!(tables(&db).await.contains(&"audit".to_string()));

    let entry = engine.history().entries().await.unwrap().pop().unwrap();
    assert!(entry.inferred_rollback.is_some());

    let rolled = engine.rollback_count(&changelog, 1).await.unwrap();
    assert_eq!(rolled.len(), 1);
    assert_eq!(rolled[0].source, RollbackSource::Inferred);

    let after = engine.snapshot(&SnapshotFilter::all()).await.unwrap();
    assert!(strata::diff::diff(&before, &after).is_empty());
    assert_eq!(engine.history().entries().await.unwrap().len(), 1);
}

/// Without a declared or inferred rollback, raw SQL cannot be rolled back.
#[tokio::test]
async fn test_rollback_without_source_fails_before_sql() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    let audit = ChangeSet::new("2", "carol", "db/changelog.json")
        .action(Action::sql("CREATE TABLE audit (id INTEGER)"));
    let changelog = ChangeLog::new(vec![users(), audit]).unwrap();
    engine.update(&changelog).await.unwrap();

    let err = engine.rollback_count(&changelog, 2).await.unwrap_err();
    assert!(matches!(err, MigrationError::RollbackFailed(_)), "{err}");
    assert!(tables(&db).await.contains(&"users".to_string()));
    assert_eq!(engine.history().entries().await.unwrap().len(), 2);
}

/// Tagging and rolling back to the tag undoes later changesets only.
#[tokio::test]
async fn test_rollback_to_tag() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    engine.update(&ChangeLog::new(vec![users()]).unwrap()).await.unwrap();
    engine.tag("v1").await.unwrap();

    let changelog = ChangeLog::new(vec![users(), posts()]).unwrap();
    engine.update(&changelog).await.unwrap();

    let rolled = engine.rollback_to_tag(&changelog, "v1").await.unwrap();
    assert_eq!(rolled.len(), 1);
    assert_eq!(rolled[0].source, RollbackSource::Inverse);
    assert_eq!(rolled[0].statements[0].sql, "DROP TABLE posts");

    let names = tables(&db).await;
    assert!(names.contains(&"users".to_string()));
    assert!(!names.contains(&"posts".to_string()));

    let err = engine.rollback_to_tag(&changelog, "v9").await.unwrap_err();
    assert!(matches!(err, MigrationError::NotFound(_)));
}

/// Preview scripts render pending changesets without touching the schema.
#[tokio::test]
async fn test_update_sql_preview() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    let engine = engine(&db, MigrationConfig::new()).await;
    let changelog = ChangeLog::new(vec![users()]).unwrap();

    let script = engine.update_sql(&changelog).await.unwrap();
    assert!(script.contains("CREATE TABLE users"));
    assert!(!tables(&db).await.contains(&"users".to_string()));

    let status = engine.status(&changelog).await.unwrap();
    assert_eq!(status.len(), 1);
    assert!(status[0].is_pending());
}

/// Sync records changesets without running them.
#[tokio::test]
async fn test_changelog_sync_marks_ran() {
    let db = Arc::new(SqliteDatabase::memory().await.unwrap());
    db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(255) NOT NULL)")
        .await
        .unwrap();
    let engine = engine(&db, MigrationConfig::new()).await;
    let changelog = ChangeLog::new(vec![users()]).unwrap();

    let marked = engine.changelog_sync(&changelog).await.unwrap();
    assert_eq!(marked.len(), 1);
    let entries = engine.history().entries().await.unwrap();
    assert_eq!(entries[0].exec_type, ExecType::MarkRan);

    let report = engine.update(&changelog).await.unwrap();
    assert_eq!(report.up_to_date, 1);
}
