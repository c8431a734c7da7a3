use async_trait::async_trait;
use tracing::{debug, info};

use crate::action::{Action, ColumnDef, DataType, Value};
use crate::changeset::ChangeSetId;
use crate::checksum::Checksum;
use crate::driver::{Database, Row, SqlRunner};
use crate::error::{MigrateResult, MigrationError};
use crate::statement::Statement;

use super::{ExecType, HistoryEntry, HistoryRepository};

const COLUMNS: [&str; 12] = [
    "id",
    "author",
    "filename",
    "date_executed",
    "order_executed",
    "exec_type",
    "checksum",
    "description",
    "comments",
    "tag",
    "deployment_id",
    "inferred_rollback",
];

/// History stored in a table of the target database.
///
/// Every write is an [`Action`] rendered for the target dialect. The checksum
/// column keeps the `"<version>:<digest>"` text, so the generation travels
/// with the value.
pub struct SqlHistoryRepository<D: ?Sized> {
    runner: SqlRunner<D>,
    table: String,
}

impl<D: Database + ?Sized> SqlHistoryRepository<D> {
    /// Create a repository over `table`.
    pub fn new(runner: SqlRunner<D>, table: impl Into<String>) -> Self {
        Self {
            runner,
            table: table.into(),
        }
    }

    /// History table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table(&self) -> Action {
        let text = |name: &str, len: u32| ColumnDef::new(name, DataType::Varchar(len));
        Action::create_table(
            self.table.clone(),
            vec![
                text("id", 255).not_null(),
                text("author", 255).not_null(),
                text("filename", 255).not_null(),
                ColumnDef::new("date_executed", DataType::Timestamp).not_null(),
                ColumnDef::new("order_executed", DataType::Integer).not_null(),
                text("exec_type", 10).not_null(),
                text("checksum", 80),
                text("description", 255),
                text("comments", 255),
                text("tag", 255),
                text("deployment_id", 36),
                ColumnDef::new("inferred_rollback", DataType::Text),
            ],
        )
    }

    fn identity(id: &ChangeSetId) -> Vec<(String, Value)> {
        vec![
            ("id".to_string(), Value::Text(id.id.clone())),
            ("author".to_string(), Value::Text(id.author.clone())),
            ("filename".to_string(), Value::Text(id.path.clone())),
        ]
    }

    fn values(entry: &HistoryEntry) -> MigrateResult<Vec<Value>> {
        let rollback = entry
            .inferred_rollback
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| MigrationError::serialization(e.to_string()))?;
        Ok(vec![
            Value::Text(entry.id.id.clone()),
            Value::Text(entry.id.author.clone()),
            Value::Text(entry.id.path.clone()),
            Value::Timestamp(entry.applied_at),
            Value::Int(entry.order_executed),
            Value::Text(entry.exec_type.as_str().to_string()),
            Value::from(entry.checksum.as_ref().map(Checksum::to_string)),
            Value::from(entry.description.clone()),
            Value::from(entry.comments.clone()),
            Value::from(entry.tag.clone()),
            Value::from(entry.deployment_id.clone()),
            Value::from(rollback),
        ])
    }

    fn insert(&self, entry: &HistoryEntry) -> MigrateResult<Action> {
        Ok(Action::Insert {
            table: self.table.clone(),
            columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
            values: Self::values(entry)?,
        })
    }

    fn select(&self) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY order_executed",
            COLUMNS.join(", "),
            self.runner.dialect().escape(&self.table)
        )
    }
}

/// Decode one history row.
pub(crate) fn entry_from_row(row: &Row) -> MigrateResult<HistoryEntry> {
    let required = |column: &str| {
        row.text(column).ok_or_else(|| {
            MigrationError::database(format!("history row is missing '{}'", column))
        })
    };
    let id = ChangeSetId::new(required("id")?, required("author")?, required("filename")?);
    let applied_at = row.timestamp("date_executed").ok_or_else(|| {
        MigrationError::database(format!("history row for {} has an unreadable date", id))
    })?;
    let order_executed = row.int("order_executed").ok_or_else(|| {
        MigrationError::database(format!("history row for {} has no order", id))
    })?;
    let checksum = row
        .text("checksum")
        .filter(|c| !c.trim().is_empty())
        .map(|c| Checksum::parse(&c))
        .transpose()?;
    let inferred_rollback = row
        .text("inferred_rollback")
        .map(|json| serde_json::from_str::<Vec<Action>>(&json))
        .transpose()
        .map_err(|e| MigrationError::serialization(e.to_string()))?;

    Ok(HistoryEntry {
        exec_type: ExecType::parse(&required("exec_type")?)?,
        id,
        checksum,
        applied_at,
        order_executed,
        description: row.text("description"),
        comments: row.text("comments"),
        tag: row.text("tag"),
        deployment_id: row.text("deployment_id"),
        inferred_rollback,
    })
}

#[async_trait]
impl<D: Database + ?Sized> HistoryRepository for SqlHistoryRepository<D> {
    async fn initialize(&self) -> MigrateResult<()> {
        if self.runner.table_exists(&self.table).await? {
            return Ok(());
        }
        info!(table = %self.table, "Creating change log history table");
        self.runner.run(&self.create_table()).await?;
        Ok(())
    }

    async fn entries(&self) -> MigrateResult<Vec<HistoryEntry>> {
        let rows = self.runner.database().query(&self.select()).await?;
        debug!(table = %self.table, count = rows.len(), "Read change log history");
        rows.iter().map(entry_from_row).collect()
    }

    async fn append(&self, entry: &HistoryEntry) -> MigrateResult<()> {
        self.runner.run(&self.insert(entry)?).await?;
        Ok(())
    }

    async fn replace(&self, entry: &HistoryEntry) -> MigrateResult<()> {
        let set = COLUMNS
            .iter()
            .skip(3)
            .map(|c| c.to_string())
            .zip(Self::values(entry)?.into_iter().skip(3))
            .collect();
        let updated = self
            .runner
            .run(&Action::Update {
                table: self.table.clone(),
                set,
                filter: Self::identity(&entry.id),
            })
            .await?;
        if updated == 0 {
            return Err(MigrationError::NotFound(entry.id.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, id: &ChangeSetId) -> MigrateResult<()> {
        self.runner
            .run(&Action::Delete {
                table: self.table.clone(),
                filter: Self::identity(id),
            })
            .await?;
        Ok(())
    }

    async fn update_checksum(&self, id: &ChangeSetId, checksum: &Checksum) -> MigrateResult<()> {
        let updated = self
            .runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: vec![("checksum".to_string(), Value::Text(checksum.to_string()))],
                filter: Self::identity(id),
            })
            .await?;
        if updated == 0 {
            return Err(MigrationError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn clear_checksums(&self) -> MigrateResult<()> {
        self.runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: vec![("checksum".to_string(), Value::Null)],
                filter: Vec::new(),
            })
            .await?;
        Ok(())
    }

    async fn tag_last(&self, tag: &str) -> MigrateResult<bool> {
        let last = self
            .runner
            .database()
            .query_scalar(&format!(
                "SELECT MAX(order_executed) FROM {}",
                self.runner.dialect().escape(&self.table)
            ))
            .await?;
        let Some(order) = last.and_then(|o| o.trim().parse::<i64>().ok()) else {
            return Ok(false);
        };
        self.runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: vec![("tag".to_string(), Value::Text(tag.to_string()))],
                filter: vec![("order_executed".to_string(), Value::Int(order))],
            })
            .await?;
        Ok(true)
    }

    fn render_append(&self, entry: &HistoryEntry) -> MigrateResult<Vec<Statement>> {
        self.runner.render(&self.insert(entry)?)
    }
}
