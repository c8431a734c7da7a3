//! Dialect-specific overrides.

use crate::action::{Action, ActionKind, DataType, quote_string};
use crate::dialect::{Dialect, DialectFamily};
use crate::error::{MigrateResult, ValidationErrors};
use crate::statement::Statement;

use super::standard::{alter_table, create_table_sql};
use super::{ActionLogic, LogicOutput, Priority};

fn specialized_for(dialect: &Dialect, family: DialectFamily, action: &Action) -> Priority {
    if dialect.family_kind() != family {
        return Priority::NotApplicable;
    }
    // Leave backfilled NOT NULL to the rewrite.
    if let Action::SetNullable {
        nullable: false,
        backfill: Some(_),
        ..
    } = action
    {
        return Priority::NotApplicable;
    }
    Priority::Specialized
}

fn require_type(action: &Action, dialect: &Dialect) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    if let Action::SetNullable {
        data_type: None, ..
    } = action
    {
        errors.add(
            "dataType",
            format!("setNullable on {} must restate the column type", dialect.name()),
        );
    }
    errors
}

fn statements(sql: Vec<String>) -> MigrateResult<LogicOutput> {
    Ok(LogicOutput::Statements(
        sql.into_iter().map(Statement::new).collect(),
    ))
}

fn type_sql(dialect: &Dialect, data_type: &Option<DataType>) -> String {
    data_type
        .as_ref()
        .map(|t| dialect.type_name(t))
        .unwrap_or_default()
}

/// MySQL and MariaDB spellings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlLogic;

impl ActionLogic for MySqlLogic {
    fn name(&self) -> &str {
        "mysql"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[
            ActionKind::RenameTable,
            ActionKind::ModifyDataType,
            ActionKind::SetNullable,
            ActionKind::DropPrimaryKey,
            ActionKind::DropForeignKey,
            ActionKind::DropUniqueConstraint,
            ActionKind::DropIndex,
        ]
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        specialized_for(dialect, DialectFamily::MySql, action)
    }

    fn validate(&self, action: &Action, dialect: &Dialect) -> ValidationErrors {
        require_type(action, dialect)
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let d = dialect;
        let sql = match action {
            Action::RenameTable { from, to } => {
                format!("RENAME TABLE {} TO {}", d.escape(from), d.escape(to))
            }
            Action::ModifyDataType {
                table,
                column,
                data_type,
            } => format!(
                "{} MODIFY {} {}",
                alter_table(d, table),
                d.escape(column),
                d.type_name(data_type)
            ),
            Action::SetNullable {
                table,
                column,
                nullable,
                data_type,
                ..
            } => format!(
                "{} MODIFY {} {} {}",
                alter_table(d, table),
                d.escape(column),
                type_sql(d, data_type),
                if *nullable { "NULL" } else { "NOT NULL" }
            ),
            Action::DropPrimaryKey { table, .. } => {
                format!("{} DROP PRIMARY KEY", alter_table(d, table))
            }
            Action::DropForeignKey { table, name } => {
                format!("{} DROP FOREIGN KEY {}", alter_table(d, table), d.escape(name))
            }
            Action::DropUniqueConstraint { table, name } => {
                format!("{} DROP INDEX {}", alter_table(d, table), d.escape(name))
            }
            Action::DropIndex { table, name } => {
                format!("DROP INDEX {} ON {}", d.escape(name), d.escape(table))
            }
            _ => return Ok(LogicOutput::Rewrite(Vec::new())),
        };
        statements(vec![sql])
    }
}

/// SQL Server spellings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsSqlLogic;

impl MsSqlLogic {
    fn default_constraint(table: &str, column: &str) -> String {
        format!("DF_{}_{}", table, column)
    }
}

impl ActionLogic for MsSqlLogic {
    fn name(&self) -> &str {
        "mssql"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[
            ActionKind::RenameTable,
            ActionKind::RenameColumn,
            ActionKind::ModifyDataType,
            ActionKind::SetNullable,
            ActionKind::AddDefaultValue,
            ActionKind::DropDefaultValue,
            ActionKind::DropIndex,
        ]
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        specialized_for(dialect, DialectFamily::MsSql, action)
    }

    fn validate(&self, action: &Action, dialect: &Dialect) -> ValidationErrors {
        require_type(action, dialect)
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let d = dialect;
        let sql = match action {
            Action::RenameTable { from, to } => {
                format!("EXEC sp_rename {}, {}", quote_string(from), quote_string(to))
            }
            Action::RenameColumn { table, from, to } => format!(
                "EXEC sp_rename {}, {}, 'COLUMN'",
                quote_string(&format!("{}.{}", table, from)),
                quote_string(to)
            ),
            Action::ModifyDataType {
                table,
                column,
                data_type,
            } => format!(
                "{} ALTER COLUMN {} {}",
                alter_table(d, table),
                d.escape(column),
                d.type_name(data_type)
            ),
            Action::SetNullable {
                table,
                column,
                nullable,
                data_type,
                ..
            } => format!(
                "{} ALTER COLUMN {} {} {}",
                alter_table(d, table),
                d.escape(column),
                type_sql(d, data_type),
                if *nullable { "NULL" } else { "NOT NULL" }
            ),
            Action::AddDefaultValue {
                table,
                column,
                default,
                ..
            } => format!(
                "{} ADD CONSTRAINT {} DEFAULT {} FOR {}",
                alter_table(d, table),
                d.escape(&Self::default_constraint(table, column)),
                d.default_sql(default),
                d.escape(column)
            ),
            Action::DropDefaultValue { table, column, .. } => format!(
                "{} DROP CONSTRAINT {}",
                alter_table(d, table),
                d.escape(&Self::default_constraint(table, column))
            ),
            Action::DropIndex { table, name } => {
                format!("DROP INDEX {} ON {}", d.escape(name), d.escape(table))
            }
            _ => return Ok(LogicOutput::Rewrite(Vec::new())),
        };
        statements(vec![sql])
    }
}

/// Oracle `MODIFY` spellings.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleLogic;

impl ActionLogic for OracleLogic {
    fn name(&self) -> &str {
        "oracle"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[
            ActionKind::ModifyDataType,
            ActionKind::SetNullable,
            ActionKind::AddDefaultValue,
            ActionKind::DropDefaultValue,
        ]
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        specialized_for(dialect, DialectFamily::Oracle, action)
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let d = dialect;
        let sql = match action {
            Action::ModifyDataType {
                table,
                column,
                data_type,
            } => format!(
                "{} MODIFY ({} {})",
                alter_table(d, table),
                d.escape(column),
                d.type_name(data_type)
            ),
            Action::SetNullable {
                table,
                column,
                nullable,
                ..
            } => format!(
                "{} MODIFY {} {}",
                alter_table(d, table),
                d.escape(column),
                if *nullable { "NULL" } else { "NOT NULL" }
            ),
            Action::AddDefaultValue {
                table,
                column,
                default,
                ..
            } => format!(
                "{} MODIFY {} DEFAULT {}",
                alter_table(d, table),
                d.escape(column),
                d.default_sql(default)
            ),
            Action::DropDefaultValue { table, column, .. } => format!(
                "{} MODIFY {} DEFAULT NULL",
                alter_table(d, table),
                d.escape(column)
            ),
            _ => return Ok(LogicOutput::Rewrite(Vec::new())),
        };
        statements(vec![sql])
    }
}

/// SQLite auto-increment tables.
///
/// SQLite only auto-increments a rowid alias, which must be declared inline as
/// `INTEGER PRIMARY KEY AUTOINCREMENT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteLogic;

impl ActionLogic for SqliteLogic {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::CreateTable]
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        match action {
            Action::CreateTable { columns, .. }
                if dialect.family_kind() == DialectFamily::Sqlite
                    && columns.iter().any(|c| c.auto_increment) =>
            {
                Priority::Specialized
            }
            _ => Priority::NotApplicable,
        }
    }

    fn validate(&self, action: &Action, _dialect: &Dialect) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        let Action::CreateTable { table, columns, .. } = action else {
            return errors;
        };
        errors.require("table", table);
        let auto: Vec<_> = columns.iter().filter(|c| c.auto_increment).collect();
        let keys = columns.iter().filter(|c| c.primary_key).count();
        let integer = auto.first().is_some_and(|c| {
            matches!(
                c.data_type,
                DataType::SmallInt | DataType::Integer | DataType::BigInt
            )
        });
        if auto.len() != 1 || keys != 1 || !auto[0].primary_key || !integer {
            errors.add(
                "autoIncrement",
                "SQLite auto-increment requires a single-column integer primary key",
            );
        }
        errors
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let Action::CreateTable {
            table,
            columns,
            primary_key_name,
            if_not_exists,
            ..
        } = action
        else {
            return Ok(LogicOutput::Rewrite(Vec::new()));
        };
        let rowid = columns
            .iter()
            .find(|c| c.auto_increment)
            .map(|c| c.name.as_str());
        statements(vec![create_table_sql(
            dialect,
            table,
            columns,
            primary_key_name.as_deref(),
            *if_not_exists,
            rowid,
        )])
    }
}
