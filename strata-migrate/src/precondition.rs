//! Changeset preconditions: boolean trees evaluated against the live schema.
//!
//! A condition that evaluates to false is a *failure*; a condition that cannot
//! be evaluated at all (a query error, say) is an *error*. Each has its own
//! policy on the [`PreconditionContainer`].

use std::fmt;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::changeset::ChangeSetId;
use crate::dialect::Dialect;
use crate::driver::Database;
use crate::error::ValidationErrors;
use crate::history::HistoryEntry;
use crate::snapshot::{Snapshot, SnapshotFilter};

/// What to do when preconditions fail or error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailPolicy {
    /// Stop the whole run.
    #[default]
    Halt,
    /// Skip this changeset; it is retried on the next run.
    Continue,
    /// Skip this changeset and record it as MARK_RAN.
    MarkRan,
    /// Log a warning and run the changeset anyway.
    Warn,
}

/// A single condition or a combination of conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    And(Vec<Precondition>),
    Or(Vec<Precondition>),
    Not(Box<Precondition>),
    TableExists {
        table: String,
    },
    ColumnExists {
        table: String,
        column: String,
    },
    ViewExists {
        view: String,
    },
    IndexExists {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        index: String,
    },
    SequenceExists {
        sequence: String,
    },
    ForeignKeyExists {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        name: String,
    },
    PrimaryKeyExists {
        table: String,
    },
    ChangeSetExecuted {
        id: String,
        author: String,
        path: String,
    },
    /// Passes when the target dialect is one of `dbms`.
    DbmsIs {
        dbms: Vec<String>,
    },
    /// Passes when the query's scalar result equals `expected`.
    SqlCheck {
        sql: String,
        expected: String,
    },
}

/// Result of evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionOutcome {
    Passed,
    Failed(String),
    Errored(String),
}

impl PreconditionOutcome {
    /// Whether the condition held.
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// What a precondition may look at while it is evaluated.
pub struct PreconditionContext<'a> {
    database: &'a dyn Database,
    dialect: &'a Dialect,
    history: &'a [HistoryEntry],
    snapshot: OnceCell<Snapshot>,
}

impl<'a> PreconditionContext<'a> {
    /// Create a context. The schema is captured lazily, at most once.
    pub fn new(database: &'a dyn Database, dialect: &'a Dialect, history: &'a [HistoryEntry]) -> Self {
        Self {
            database,
            dialect,
            history,
            snapshot: OnceCell::new(),
        }
    }

    async fn snapshot(&self) -> Result<&Snapshot, String> {
        self.snapshot
            .get_or_try_init(|| async {
                self.database
                    .snapshot(&SnapshotFilter::all())
                    .await
                    .map_err(|e| format!("could not read schema: {}", e))
            })
            .await
    }
}

impl Precondition {
    /// Evaluate against a context.
    pub fn evaluate<'b>(&'b self, ctx: &'b PreconditionContext<'_>) -> BoxFuture<'b, PreconditionOutcome> {
        async move {
            match self {
                Self::And(all) => {
                    for condition in all {
                        let outcome = condition.evaluate(ctx).await;
                        if !outcome.passed() {
                            return outcome;
                        }
                    }
                    PreconditionOutcome::Passed
                }
                Self::Or(any) => {
                    let mut failures = Vec::new();
                    let mut error = None;
                    for condition in any {
                        match condition.evaluate(ctx).await {
                            PreconditionOutcome::Passed => return PreconditionOutcome::Passed,
                            PreconditionOutcome::Failed(msg) => failures.push(msg),
                            PreconditionOutcome::Errored(msg) => {
                                error.get_or_insert(msg);
                            }
                        }
                    }
                    match error {
                        Some(msg) => PreconditionOutcome::Errored(msg),
                        None => PreconditionOutcome::Failed(failures.join(" and ")),
                    }
                }
                Self::Not(inner) => match inner.evaluate(ctx).await {
                    PreconditionOutcome::Passed => {
                        PreconditionOutcome::Failed(format!("expected not: {}", inner))
                    }
                    PreconditionOutcome::Failed(_) => PreconditionOutcome::Passed,
                    errored => errored,
                },
                Self::ChangeSetExecuted { id, author, path } => {
                    let target = ChangeSetId::new(id.clone(), author.clone(), path.clone());
                    check(
                        ctx.history.iter().any(|e| e.id == target),
                        || format!("changeset {} has not been executed", target),
                    )
                }
                Self::DbmsIs { dbms } => check(
                    dbms.iter().any(|d| d.trim().eq_ignore_ascii_case(ctx.dialect.id())),
                    || format!("dbms is {}, expected one of {}", ctx.dialect.id(), dbms.join(", ")),
                ),
                Self::SqlCheck { sql, expected } => match ctx.database.query_scalar(sql).await {
                    Ok(actual) => {
                        let actual = actual.unwrap_or_default();
                        check(actual.trim() == expected.trim(), || {
                            format!("'{}' returned '{}', expected '{}'", sql, actual, expected)
                        })
                    }
                    Err(e) => PreconditionOutcome::Errored(e.to_string()),
                },
                leaf => match ctx.snapshot().await {
                    Ok(snapshot) => leaf.check_schema(snapshot),
                    Err(msg) => PreconditionOutcome::Errored(msg),
                },
            }
        }
        .boxed()
    }

    fn check_schema(&self, snapshot: &Snapshot) -> PreconditionOutcome {
        let holds = match self {
            Self::TableExists { table } => snapshot.has_table(table),
            Self::ColumnExists { table, column } => snapshot.has_column(table, column),
            Self::ViewExists { view } => snapshot.has_view(view),
            Self::IndexExists { table, index } => snapshot.has_index(table.as_deref(), index),
            Self::SequenceExists { sequence } => snapshot.has_sequence(sequence),
            Self::ForeignKeyExists { table, name } => snapshot.has_foreign_key(table.as_deref(), name),
            Self::PrimaryKeyExists { table } => snapshot.has_primary_key(table),
            _ => true,
        };
        check(holds, || format!("expected: {}", self))
    }

    fn validate_into(&self, errors: &mut ValidationErrors) {
        match self {
            Self::And(all) | Self::Or(all) => {
                errors.require_non_empty("preconditions", all);
                for condition in all {
                    condition.validate_into(errors);
                }
            }
            Self::Not(inner) => inner.validate_into(errors),
            Self::TableExists { table } | Self::PrimaryKeyExists { table } => {
                errors.require("table", table);
            }
            Self::ColumnExists { table, column } => {
                errors.require("table", table).require("column", column);
            }
            Self::ViewExists { view } => {
                errors.require("view", view);
            }
            Self::IndexExists { index, .. } => {
                errors.require("index", index);
            }
            Self::SequenceExists { sequence } => {
                errors.require("sequence", sequence);
            }
            Self::ForeignKeyExists { name, .. } => {
                errors.require("name", name);
            }
            Self::ChangeSetExecuted { id, author, path } => {
                errors.require("id", id).require("author", author).require("path", path);
            }
            Self::DbmsIs { dbms } => {
                errors.require_non_empty("dbms", dbms);
            }
            Self::SqlCheck { sql, .. } => {
                errors.require("sql", sql);
            }
        }
    }
}

fn check(holds: bool, message: impl FnOnce() -> String) -> PreconditionOutcome {
    if holds {
        PreconditionOutcome::Passed
    } else {
        PreconditionOutcome::Failed(message())
    }
}

fn join(f: &mut fmt::Formatter<'_>, conditions: &[Precondition], op: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, c) in conditions.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", op)?;
        }
        write!(f, "{}", c)?;
    }
    f.write_str(")")
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(all) => join(f, all, "and"),
            Self::Or(any) => join(f, any, "or"),
            Self::Not(inner) => write!(f, "not {}", inner),
            Self::TableExists { table } => write!(f, "table {} exists", table),
            Self::ColumnExists { table, column } => write!(f, "column {}.{} exists", table, column),
            Self::ViewExists { view } => write!(f, "view {} exists", view),
            Self::IndexExists { table: Some(t), index } => write!(f, "index {} on {} exists", index, t),
            Self::IndexExists { index, .. } => write!(f, "index {} exists", index),
            Self::SequenceExists { sequence } => write!(f, "sequence {} exists", sequence),
            Self::ForeignKeyExists { name, .. } => write!(f, "foreign key {} exists", name),
            Self::PrimaryKeyExists { table } => write!(f, "primary key on {} exists", table),
            Self::ChangeSetExecuted { id, author, path } => {
                write!(f, "changeset {}::{}::{} executed", path, id, author)
            }
            Self::DbmsIs { dbms } => write!(f, "dbms is {}", dbms.join(" or ")),
            Self::SqlCheck { sql, expected } => write!(f, "'{}' returns '{}'", sql, expected),
        }
    }
}

/// The preconditions of one changeset, ANDed together, with their policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreconditionContainer {
    /// Conditions that must all hold.
    #[serde(default)]
    pub conditions: Vec<Precondition>,
    /// Policy when a condition is false.
    #[serde(default)]
    pub on_fail: FailPolicy,
    /// Policy when a condition cannot be evaluated.
    #[serde(default)]
    pub on_error: FailPolicy,
    /// Replaces the generated failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_message: Option<String>,
    /// Replaces the generated error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_message: Option<String>,
}

impl PreconditionContainer {
    /// Create an empty container (always passes).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    pub fn condition(mut self, condition: Precondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Set the on-fail policy.
    pub fn on_fail(mut self, policy: FailPolicy) -> Self {
        self.on_fail = policy;
        self
    }

    /// Set the on-error policy.
    pub fn on_error(mut self, policy: FailPolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Set a custom failure message.
    pub fn fail_message(mut self, message: impl Into<String>) -> Self {
        self.on_fail_message = Some(message.into());
        self
    }

    /// Evaluate every condition in order, stopping at the first that does not pass.
    pub async fn check(&self, ctx: &PreconditionContext<'_>) -> PreconditionOutcome {
        for condition in &self.conditions {
            match condition.evaluate(ctx).await {
                PreconditionOutcome::Passed => {}
                PreconditionOutcome::Failed(msg) => {
                    return PreconditionOutcome::Failed(self.on_fail_message.clone().unwrap_or(msg));
                }
                PreconditionOutcome::Errored(msg) => {
                    return PreconditionOutcome::Errored(self.on_error_message.clone().unwrap_or(msg));
                }
            }
        }
        PreconditionOutcome::Passed
    }

    /// Structural problems with the conditions.
    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for condition in &self.conditions {
            condition.validate_into(&mut errors);
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ColumnDef, DataType};
    use crate::dialect::DialectRegistry;
    use crate::driver::{Driver, Row, SnapshotSource};
    use crate::error::{MigrateResult, MigrationError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        snapshot: Snapshot,
        snapshots_taken: AtomicUsize,
    }

    #[async_trait]
    impl Driver for Fixture {
        fn dialect(&self) -> &str {
            "sqlite"
        }

        async fn execute(&self, _sql: &str) -> MigrateResult<u64> {
            Ok(0)
        }

        async fn query(&self, sql: &str) -> MigrateResult<Vec<Row>> {
            if sql.contains("broken") {
                return Err(MigrationError::database("no such table: broken"));
            }
            Ok(vec![Row::from_pairs([("n", json!(3))])])
        }

        async fn begin(&self) -> MigrateResult<()> {
            Ok(())
        }

        async fn commit(&self) -> MigrateResult<()> {
            Ok(())
        }

        async fn rollback(&self) -> MigrateResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotSource for Fixture {
        async fn snapshot(&self, _filter: &SnapshotFilter) -> MigrateResult<Snapshot> {
            self.snapshots_taken.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    fn fixture() -> Fixture {
        let snapshot = Snapshot::empty()
            .with_action(&Action::create_table(
                "users",
                vec![ColumnDef::new("id", DataType::Integer).primary_key()],
            ))
            .unwrap();
        Fixture {
            snapshot,
            snapshots_taken: AtomicUsize::new(0),
        }
    }

    fn table(name: &str) -> Precondition {
        Precondition::TableExists { table: name.into() }
    }

    #[tokio::test]
    async fn test_boolean_tree() {
        let db = fixture();
        let dialect = DialectRegistry::standard().get("sqlite").unwrap();
        let ctx = PreconditionContext::new(&db, &dialect, &[]);

        assert!(table("users").evaluate(&ctx).await.passed());
        assert!(!table("orders").evaluate(&ctx).await.passed());
        assert!(
            Precondition::Or(vec![table("orders"), table("users")])
                .evaluate(&ctx)
                .await
                .passed()
        );
        assert!(
            Precondition::Not(Box::new(table("orders")))
                .evaluate(&ctx)
                .await
                .passed()
        );
        assert!(
            Precondition::PrimaryKeyExists {
                table: "users".into()
            }
            .evaluate(&ctx)
            .await
            .passed()
        );
        assert_eq!(db.snapshots_taken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sql_check_and_errors() {
        let db = fixture();
        let dialect = DialectRegistry::standard().get("sqlite").unwrap();
        let ctx = PreconditionContext::new(&db, &dialect, &[]);

        let ok = Precondition::SqlCheck {
            sql: "SELECT COUNT(*) FROM users".into(),
            expected: "3".into(),
        };
        assert!(ok.evaluate(&ctx).await.passed());

        let broken = Precondition::SqlCheck {
            sql: "SELECT COUNT(*) FROM broken".into(),
            expected: "0".into(),
        };
        assert!(matches!(
            broken.evaluate(&ctx).await,
            PreconditionOutcome::Errored(_)
        ));
        assert!(matches!(
            Precondition::Not(Box::new(broken)).evaluate(&ctx).await,
            PreconditionOutcome::Errored(_)
        ));
    }

    #[tokio::test]
    async fn test_container_messages() {
        let db = fixture();
        let dialect = DialectRegistry::standard().get("sqlite").unwrap();
        let ctx = PreconditionContext::new(&db, &dialect, &[]);

        let container = PreconditionContainer::new()
            .condition(Precondition::DbmsIs {
                dbms: vec!["sqlite".into()],
            })
            .condition(table("orders"))
            .on_fail(FailPolicy::MarkRan)
            .fail_message("orders must exist first");
        assert_eq!(
            container.check(&ctx).await,
            PreconditionOutcome::Failed("orders must exist first".into())
        );
        assert_eq!(PreconditionContainer::new().check(&ctx).await, PreconditionOutcome::Passed);
    }

    #[test]
    fn test_validate_and_serde() {
        let container = PreconditionContainer::new()
            .condition(Precondition::And(Vec::new()))
            .condition(table(""));
        assert_eq!(container.validate().len(), 2);

        let json = json!({
            "conditions": [{"not": {"tableExists": {"table": "users"}}}],
            "onFail": "MARK_RAN"
        });
        let parsed: PreconditionContainer = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.on_fail, FailPolicy::MarkRan);
        assert_eq!(parsed.on_error, FailPolicy::Halt);
        assert_eq!(parsed.conditions[0].to_string(), "not table users exists");
    }
}
