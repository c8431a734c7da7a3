//! Driver abstraction: the only way the engine talks to a database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::action::Action;
use crate::dialect::Dialect;
use crate::error::MigrateResult;
use crate::logic::MigrationContext;
use crate::snapshot::{ObjectType, Snapshot, SnapshotFilter};
use crate::statement::Statement;

/// One result row with column order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<JsonValue>,
}

impl Row {
    /// Create a row from parallel column/value lists.
    pub fn new(columns: Vec<String>, values: Vec<JsonValue>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value by column name (case-insensitive).
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    /// First value of the row.
    pub fn first(&self) -> Option<&JsonValue> {
        self.values.first()
    }

    /// Text form of a value: strings unquoted, NULL as `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(json_text)
    }

    /// Integer value, accepting numeric strings.
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            JsonValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Boolean value, accepting 0/1 and textual forms.
    pub fn bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Number(n) => n.as_i64().map(|i| i != 0),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" | "y" => Some(true),
                "false" | "f" | "0" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Timestamp value, accepting RFC 3339 and `YYYY-MM-DD HH:MM:SS[.fff]`.
    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.text(column)?)
    }
}

/// Parse a timestamp as databases commonly return it.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Render a JSON value as plain text.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Sends SQL to a live connection.
///
/// Implementations own exactly one connection so that `begin`, the
/// statements that follow, and `commit`/`rollback` share a session.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Dialect id of the connected database.
    fn dialect(&self) -> &str;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> MigrateResult<u64>;

    /// Run a query.
    async fn query(&self, sql: &str) -> MigrateResult<Vec<Row>>;

    /// Begin a transaction.
    async fn begin(&self) -> MigrateResult<()>;

    /// Commit the current transaction.
    async fn commit(&self) -> MigrateResult<()>;

    /// Roll back the current transaction.
    async fn rollback(&self) -> MigrateResult<()>;

    /// First column of the first row, as text.
    async fn query_scalar(&self, sql: &str) -> MigrateResult<Option<String>> {
        let rows = self.query(sql).await?;
        Ok(rows.first().and_then(Row::first).and_then(json_text))
    }
}

/// Reads live schema metadata.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Capture the current schema, restricted by `filter`.
    async fn snapshot(&self, filter: &SnapshotFilter) -> MigrateResult<Snapshot>;
}

/// A connection that can both run SQL and describe its schema.
pub trait Database: Driver + SnapshotSource {}

impl<T: Driver + SnapshotSource + ?Sized> Database for T {}

/// A database together with what is needed to render actions for it.
///
/// The SQL-backed history and lock services write through this, so their
/// own tables go through the same action logic as user changesets.
pub struct SqlRunner<D: ?Sized> {
    database: Arc<D>,
    context: Arc<MigrationContext>,
    dialect: Arc<Dialect>,
    max_depth: usize,
}

impl<D: Database + ?Sized> SqlRunner<D> {
    /// Create a runner for the database's own dialect.
    pub fn new(database: Arc<D>, context: Arc<MigrationContext>) -> MigrateResult<Self> {
        let dialect = context.dialect(database.dialect())?;
        Ok(Self {
            database,
            context,
            dialect,
            max_depth: 8,
        })
    }

    /// Set the rewrite depth used when rendering.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// The database.
    pub fn database(&self) -> &Arc<D> {
        &self.database
    }

    /// The target dialect.
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Render an action.
    pub fn render(&self, action: &Action) -> MigrateResult<Vec<Statement>> {
        self.context.logics.resolve(action, &self.dialect, self.max_depth)
    }

    /// Render and execute an action, returning the total affected row count.
    pub async fn run(&self, action: &Action) -> MigrateResult<u64> {
        let mut affected = 0;
        for statement in self.render(action)? {
            debug!(sql = %statement.sql, "Executing bookkeeping statement");
            affected += self.database.execute(&statement.sql).await?;
        }
        Ok(affected)
    }

    /// Whether a table exists in the live schema.
    pub async fn table_exists(&self, table: &str) -> MigrateResult<bool> {
        let filter = SnapshotFilter::all().object_types([ObjectType::Table]);
        Ok(self.database.snapshot(&filter).await?.has_table(table))
    }
}
