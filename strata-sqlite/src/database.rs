//! SQLite database handle.

use async_trait::async_trait;
use strata_migrate::{MigrateResult, Row, Snapshot, SnapshotFilter};
use strata_migrate::driver::{Driver, SnapshotSource};
use tokio_rusqlite::Connection;
use tracing::{debug, info, trace};

use crate::config::{DatabasePath, SqliteConfig};
use crate::error::{SqliteError, SqliteResult};
use crate::introspect;

/// A single SQLite connection the migration engine runs through.
///
/// The connection lives on a dedicated thread, so `BEGIN` and the statements
/// that follow it always share one session.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Connection,
    config: SqliteConfig,
}

impl SqliteDatabase {
    /// Open a database and apply the connection pragmas.
    pub async fn open(config: SqliteConfig) -> SqliteResult<Self> {
        let conn = match &config.path {
            DatabasePath::Memory => Connection::open_in_memory().await,
            DatabasePath::File(path) => Connection::open(path).await,
        }
        .map_err(|e| SqliteError::connection(format!("{}: {}", config.path_str(), e)))?;

        let init = config.init_sql();
        conn.call(move |c| Ok(c.execute_batch(&init)?)).await?;

        info!(path = %config.path_str(), "Opened SQLite database");
        Ok(Self { conn, config })
    }

    /// Open an in-memory database.
    pub async fn memory() -> SqliteResult<Self> {
        Self::open(SqliteConfig::memory()).await
    }

    /// Open (or create) a database file.
    pub async fn file(path: impl AsRef<std::path::Path>) -> SqliteResult<Self> {
        Self::open(SqliteConfig::file(path)).await
    }

    /// Open from a `sqlite://` URL.
    pub async fn connect(url: &str) -> SqliteResult<Self> {
        Self::open(SqliteConfig::from_url(url)?).await
    }

    /// The configuration this database was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Run a batch of statements outside the migration engine.
    pub async fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing batch");
        self.conn
            .call(move |c| Ok(c.execute_batch(&sql)?))
            .await
            .map_err(SqliteError::from)
    }

    async fn execute_raw(&self, sql: &str) -> SqliteResult<u64> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing statement");
        self.conn
            .call(move |c| match c.execute(&sql, []) {
                Ok(n) => Ok(n as u64),
                // PRAGMA and friends hand back rows.
                Err(rusqlite::Error::ExecuteReturnedResults) => {
                    let mut stmt = c.prepare(&sql)?;
                    let mut rows = stmt.query([])?;
                    while rows.next()?.is_some() {}
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            })
            .await
            .map_err(SqliteError::from)
    }

    async fn query_raw(&self, sql: &str) -> SqliteResult<Vec<Row>> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing query");
        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let columns: Vec<String> = stmt
                    .column_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect();

                let rows = stmt.query_map([], |row| Ok(crate::types::to_row(row, &columns)))?;
                let results: Result<Vec<_>, _> = rows.collect();
                Ok(results?)
            })
            .await
            .map_err(SqliteError::from)
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.config.path_str())
            .finish()
    }
}

#[async_trait]
impl Driver for SqliteDatabase {
    fn dialect(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        Ok(self.execute_raw(sql).await?)
    }

    async fn query(&self, sql: &str) -> MigrateResult<Vec<Row>> {
        Ok(self.query_raw(sql).await?)
    }

    async fn begin(&self) -> MigrateResult<()> {
        trace!("BEGIN");
        Ok(self.execute_batch("BEGIN").await?)
    }

    async fn commit(&self) -> MigrateResult<()> {
        trace!("COMMIT");
        Ok(self.execute_batch("COMMIT").await?)
    }

    async fn rollback(&self) -> MigrateResult<()> {
        trace!("ROLLBACK");
        Ok(self.execute_batch("ROLLBACK").await?)
    }
}

#[async_trait]
impl SnapshotSource for SqliteDatabase {
    async fn snapshot(&self, filter: &SnapshotFilter) -> MigrateResult<Snapshot> {
        let raw = self
            .conn
            .call(|c| Ok(introspect::read_schema(c)?))
            .await
            .map_err(SqliteError::from)?;
        Ok(introspect::build_snapshot(&raw, filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_execute_and_query() {
        let db = SqliteDatabase::memory().await.unwrap();
        db.execute("CREATE TABLE t (id INTEGER, name TEXT)").await.unwrap();
        let affected = db
            .execute("INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let rows = db.query("SELECT id, name FROM t ORDER BY id").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].int("ID"), Some(2));
        assert_eq!(rows[1].text("name").as_deref(), Some("b"));
        assert_eq!(db.query_scalar("SELECT COUNT(*) FROM t").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_pragma_through_execute() {
        let db = SqliteDatabase::memory().await.unwrap();
        assert_eq!(db.execute("PRAGMA foreign_keys = ON").await.unwrap(), 0);
        assert_eq!(db.query_scalar("PRAGMA foreign_keys").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_rollback_discards_ddl() {
        let db = SqliteDatabase::memory().await.unwrap();
        db.begin().await.unwrap();
        db.execute("CREATE TABLE gone (id INTEGER)").await.unwrap();
        db.rollback().await.unwrap();

        let snapshot = db.snapshot(&SnapshotFilter::all()).await.unwrap();
        assert!(!snapshot.has_table("gone"));

        db.begin().await.unwrap();
        db.execute("CREATE TABLE kept (id INTEGER)").await.unwrap();
        db.commit().await.unwrap();
        assert!(db.snapshot(&SnapshotFilter::all()).await.unwrap().has_table("kept"));
    }

    #[tokio::test]
    async fn test_errors_surface_as_database_errors() {
        let db = SqliteDatabase::memory().await.unwrap();
        let err = db.execute("CREATE TABLE (").await.unwrap_err();
        assert!(matches!(err, strata_migrate::MigrationError::Database(_)));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let db = SqliteDatabase::file(&path).await.unwrap();
            db.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY)").await.unwrap();
        }
        let db = SqliteDatabase::connect(&format!("sqlite://{}", path.display())).await.unwrap();
        let snapshot = db.snapshot(&SnapshotFilter::all()).await.unwrap();
        assert_eq!(snapshot.dialect(), Some("sqlite"));
        assert!(snapshot.has_table("notes"));
    }
}
