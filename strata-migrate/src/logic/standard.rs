//! ANSI-style rendering for every action kind.

use crate::action::{Action, ActionKind, ColumnDef, ForeignKeyDef, Value};
use crate::dialect::{Dialect, DialectFamily, Feature};
use crate::error::{MigrateResult, ValidationErrors};
use crate::statement::{Statement, split_sql};

use super::{ActionLogic, LogicOutput, Priority};

/// Native rendering, applicable whenever the dialect has the needed feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLogic;

impl ActionLogic for StandardLogic {
    fn name(&self) -> &str {
        "standard"
    }

    fn kinds(&self) -> &[ActionKind] {
        &ActionKind::ALL
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        let native = match action {
            Action::AddColumn { columns, .. } => columns.len() == 1,
            Action::DropColumn { columns, .. } => {
                columns.len() == 1 && dialect.supports(Feature::DropColumn)
            }
            Action::RenameTable { .. } => dialect.supports(Feature::RenameTable),
            Action::RenameColumn { .. } => dialect.supports(Feature::RenameColumn),
            Action::ModifyDataType { .. } => dialect.supports(Feature::AlterColumnType),
            Action::SetNullable {
                nullable, backfill, ..
            } => dialect.supports(Feature::AlterNullability) && (*nullable || backfill.is_none()),
            Action::AddDefaultValue { .. } | Action::DropDefaultValue { .. } => {
                dialect.supports(Feature::AlterDefault)
            }
            Action::AddPrimaryKey { .. } | Action::DropPrimaryKey { .. } => {
                dialect.supports(Feature::AlterPrimaryKey)
            }
            Action::AddForeignKey(_) | Action::DropForeignKey { .. } => {
                dialect.supports(Feature::AlterForeignKeys)
            }
            Action::AddUniqueConstraint { .. } | Action::DropUniqueConstraint { .. } => {
                dialect.supports(Feature::AlterUniqueConstraints)
            }
            Action::CreateSequence { .. } | Action::DropSequence { .. } => {
                dialect.supports(Feature::Sequences)
            }
            Action::CreateView { replace, .. } => {
                !*replace || dialect.supports(Feature::CreateOrReplaceView)
            }
            _ => true,
        };
        if native {
            Priority::Default
        } else {
            Priority::NotApplicable
        }
    }

    fn validate(&self, action: &Action, dialect: &Dialect) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        match action {
            Action::CreateTable {
                table,
                columns,
                if_not_exists,
                ..
            } => {
                errors.require("table", table).require_non_empty("columns", columns);
                validate_columns(columns, dialect, &mut errors);
                if *if_not_exists && !dialect.supports(Feature::IfNotExists) {
                    errors.unsupported("createTable ifNotExists", dialect.name());
                }
            }
            Action::DropTable {
                table,
                cascade,
                if_exists,
            } => {
                errors.require("table", table);
                if *cascade && !dialect.supports(Feature::DropCascade) {
                    errors.unsupported("dropTable cascade", dialect.name());
                }
                if *if_exists && !dialect.supports(Feature::IfExists) {
                    errors.unsupported("dropTable ifExists", dialect.name());
                }
            }
            Action::AddColumn { table, columns } => {
                errors.require("table", table).require_non_empty("columns", columns);
                validate_columns(columns, dialect, &mut errors);
                if columns.iter().any(|c| c.unique) && !dialect.supports(Feature::AlterUniqueConstraints) {
                    errors.unsupported("addColumn with unique", dialect.name());
                }
                if columns.iter().any(|c| c.primary_key) && !dialect.supports(Feature::AlterPrimaryKey) {
                    errors.unsupported("addColumn with primaryKey", dialect.name());
                }
            }
            Action::DropColumn { table, columns } => {
                errors.require("table", table).require_non_empty("columns", columns);
            }
            Action::RenameTable { from, to } => {
                errors.require("from", from).require("to", to);
            }
            Action::RenameColumn { table, from, to } => {
                errors.require("table", table).require("from", from).require("to", to);
            }
            Action::AddPrimaryKey { table, columns, .. } => {
                errors.require("table", table).require_non_empty("columns", columns);
            }
            Action::AddForeignKey(fk) => {
                errors
                    .require("name", &fk.name)
                    .require("table", &fk.table)
                    .require("referencedTable", &fk.referenced_table)
                    .require_non_empty("columns", &fk.columns);
                if fk.columns.len() != fk.referenced_columns.len() {
                    errors.add(
                        "referencedColumns",
                        format!(
                            "{} column(s) cannot reference {} column(s)",
                            fk.columns.len(),
                            fk.referenced_columns.len()
                        ),
                    );
                }
            }
            Action::AddUniqueConstraint { table, name, columns }
            | Action::CreateIndex {
                table,
                name,
                columns,
                ..
            } => {
                errors
                    .require("table", table)
                    .require("name", name)
                    .require_non_empty("columns", columns);
            }
            Action::CreateView {
                name, definition, ..
            } => {
                errors.require("name", name).require("definition", definition);
            }
            Action::DropView { name, if_exists } => {
                errors.require("name", name);
                if *if_exists && !dialect.supports(Feature::IfExists) {
                    errors.unsupported("dropView ifExists", dialect.name());
                }
            }
            Action::Sql { sql } => {
                errors.require("sql", sql);
            }
            Action::Insert {
                table,
                columns,
                values,
            } => {
                errors.require("table", table).require_non_empty("columns", columns);
                if columns.len() != values.len() {
                    errors.add(
                        "values",
                        format!("{} value(s) for {} column(s)", values.len(), columns.len()),
                    );
                }
            }
            Action::Update { table, set, .. } => {
                errors.require("table", table).require_non_empty("set", set);
            }
            _ => {}
        }
        errors
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let d = dialect;
        let sql = match action {
            Action::CreateTable {
                table,
                columns,
                primary_key_name,
                if_not_exists,
                ..
            } => vec![create_table_sql(
                d,
                table,
                columns,
                primary_key_name.as_deref(),
                *if_not_exists,
                None,
            )],
            Action::DropTable {
                table,
                cascade,
                if_exists,
            } => {
                let mut sql = "DROP TABLE ".to_string();
                if *if_exists {
                    sql.push_str("IF EXISTS ");
                }
                sql.push_str(&d.escape(table));
                if *cascade {
                    sql.push(' ');
                    sql.push_str(d.cascade());
                }
                vec![sql]
            }
            Action::RenameTable { from, to } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                d.escape(from),
                d.escape(to)
            )],
            Action::AddColumn { table, columns } => {
                let keyword = match d.family_kind() {
                    DialectFamily::MsSql | DialectFamily::Oracle | DialectFamily::Firebird => "ADD",
                    _ => "ADD COLUMN",
                };
                columns
                    .iter()
                    .map(|c| {
                        let mut def = column_sql(d, c);
                        if c.primary_key {
                            def.push_str(" PRIMARY KEY");
                        }
                        if c.unique {
                            def.push_str(&format!(
                                " CONSTRAINT {} UNIQUE",
                                d.escape(&c.unique_constraint_name(table))
                            ));
                        }
                        format!("{} {} {}", alter_table(d, table), keyword, def)
                    })
                    .collect()
            }
            Action::DropColumn { table, columns } => columns
                .iter()
                .map(|c| format!("{} DROP COLUMN {}", alter_table(d, table), d.escape(c)))
                .collect(),
            Action::RenameColumn { table, from, to } => vec![format!(
                "{} RENAME COLUMN {} TO {}",
                alter_table(d, table),
                d.escape(from),
                d.escape(to)
            )],
            Action::ModifyDataType {
                table,
                column,
                data_type,
            } => vec![format!(
                "{} ALTER COLUMN {} SET DATA TYPE {}",
                alter_table(d, table),
                d.escape(column),
                d.type_name(data_type)
            )],
            Action::SetNullable {
                table,
                column,
                nullable,
                ..
            } => vec![format!(
                "{} ALTER COLUMN {} {} NOT NULL",
                alter_table(d, table),
                d.escape(column),
                if *nullable { "DROP" } else { "SET" }
            )],
            Action::AddDefaultValue {
                table,
                column,
                default,
                ..
            } => vec![format!(
                "{} ALTER COLUMN {} SET DEFAULT {}",
                alter_table(d, table),
                d.escape(column),
                d.default_sql(default)
            )],
            Action::DropDefaultValue { table, column, .. } => vec![format!(
                "{} ALTER COLUMN {} DROP DEFAULT",
                alter_table(d, table),
                d.escape(column)
            )],
            Action::AddPrimaryKey {
                table,
                name,
                columns,
            } => vec![format!(
                "{} ADD {}PRIMARY KEY ({})",
                alter_table(d, table),
                constraint_prefix(d, name.as_deref()),
                d.escape_list(columns)
            )],
            Action::DropPrimaryKey { table, name } => vec![match name {
                Some(name) => format!("{} DROP CONSTRAINT {}", alter_table(d, table), d.escape(name)),
                None => format!("{} DROP PRIMARY KEY", alter_table(d, table)),
            }],
            Action::AddForeignKey(fk) => vec![add_foreign_key_sql(d, fk)],
            Action::DropForeignKey { table, name } | Action::DropUniqueConstraint { table, name } => {
                vec![format!(
                    "{} DROP CONSTRAINT {}",
                    alter_table(d, table),
                    d.escape(name)
                )]
            }
            Action::AddUniqueConstraint {
                table,
                name,
                columns,
            } => vec![format!(
                "{} ADD CONSTRAINT {} UNIQUE ({})",
                alter_table(d, table),
                d.escape(name),
                d.escape_list(columns)
            )],
            Action::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => vec![format!(
                "CREATE {}INDEX {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                d.escape(name),
                d.escape(table),
                d.escape_list(columns)
            )],
            Action::DropIndex { name, .. } => vec![format!("DROP INDEX {}", d.escape(name))],
            Action::CreateSequence {
                name,
                start,
                increment,
            } => {
                let mut sql = format!("CREATE SEQUENCE {}", d.escape(name));
                if let Some(start) = start {
                    sql.push_str(&format!(" START WITH {}", start));
                }
                if let Some(increment) = increment {
                    sql.push_str(&format!(" INCREMENT BY {}", increment));
                }
                vec![sql]
            }
            Action::DropSequence { name } => vec![format!("DROP SEQUENCE {}", d.escape(name))],
            Action::CreateView {
                name,
                definition,
                replace,
            } => vec![format!(
                "CREATE {}VIEW {} AS {}",
                if *replace { "OR REPLACE " } else { "" },
                d.escape(name),
                view_body(definition)
            )],
            Action::DropView { name, if_exists } => vec![format!(
                "DROP VIEW {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                d.escape(name)
            )],
            Action::Sql { sql } => {
                let parts = split_sql(sql);
                if parts.is_empty() {
                    vec![sql.trim().to_string()]
                } else {
                    parts
                }
            }
            Action::Insert {
                table,
                columns,
                values,
            } => vec![format!(
                "INSERT INTO {} ({}) VALUES ({})",
                d.escape(table),
                d.escape_list(columns),
                values.iter().map(|v| d.literal(v)).collect::<Vec<_>>().join(", ")
            )],
            Action::Update { table, set, filter } => vec![format!(
                "UPDATE {} SET {}{}",
                d.escape(table),
                set.iter()
                    .map(|(c, v)| format!("{} = {}", d.escape(c), d.literal(v)))
                    .collect::<Vec<_>>()
                    .join(", "),
                where_clause(d, filter)
            )],
            Action::Delete { table, filter } => vec![format!(
                "DELETE FROM {}{}",
                d.escape(table),
                where_clause(d, filter)
            )],
        };
        Ok(LogicOutput::Statements(
            sql.into_iter().map(Statement::new).collect(),
        ))
    }
}

fn validate_columns(columns: &[ColumnDef], dialect: &Dialect, errors: &mut ValidationErrors) {
    let mut seen = std::collections::BTreeSet::new();
    for column in columns {
        errors.require("columns.name", &column.name);
        if !seen.insert(column.name.to_lowercase()) {
            errors.add("columns", format!("duplicate column '{}'", column.name));
        }
        if column.auto_increment && !dialect.supports(Feature::AutoIncrement) {
            errors.unsupported("autoIncrement", dialect.name());
        }
    }
}

/// `ALTER TABLE <table>`
pub(crate) fn alter_table(dialect: &Dialect, table: &str) -> String {
    format!("ALTER TABLE {}", dialect.escape(table))
}

/// Column definition as used inside `CREATE TABLE` and `ADD COLUMN`.
pub(crate) fn column_sql(dialect: &Dialect, column: &ColumnDef) -> String {
    let mut sql = format!(
        "{} {}",
        dialect.escape(&column.name),
        dialect.type_name(&column.data_type)
    );
    if column.auto_increment {
        sql.push(' ');
        sql.push_str(dialect.auto_increment().clause());
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&dialect.default_sql(default));
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

/// `CREATE TABLE` with inline primary key and named unique constraints.
///
/// `rowid_column` renders that column as `INTEGER PRIMARY KEY AUTOINCREMENT`
/// and suppresses the table-level primary key.
pub(crate) fn create_table_sql(
    dialect: &Dialect,
    table: &str,
    columns: &[ColumnDef],
    primary_key_name: Option<&str>,
    if_not_exists: bool,
    rowid_column: Option<&str>,
) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|c| {
            if rowid_column == Some(c.name.as_str()) {
                format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", dialect.escape(&c.name))
            } else {
                column_sql(dialect, c)
            }
        })
        .collect();

    let pk: Vec<String> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();
    if !pk.is_empty() && rowid_column.is_none() {
        parts.push(format!(
            "{}PRIMARY KEY ({})",
            constraint_prefix(dialect, primary_key_name),
            dialect.escape_list(&pk)
        ));
    }
    for column in columns.iter().filter(|c| c.unique) {
        parts.push(format!(
            "CONSTRAINT {} UNIQUE ({})",
            dialect.escape(&column.unique_constraint_name(table)),
            dialect.escape(&column.name)
        ));
    }

    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        dialect.escape(table),
        parts.join(", ")
    )
}

fn constraint_prefix(dialect: &Dialect, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("CONSTRAINT {} ", dialect.escape(name)),
        None => String::new(),
    }
}

fn add_foreign_key_sql(dialect: &Dialect, fk: &ForeignKeyDef) -> String {
    let mut sql = format!(
        "{} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        alter_table(dialect, &fk.table),
        dialect.escape(&fk.name),
        dialect.escape_list(&fk.columns),
        dialect.escape(&fk.referenced_table),
        dialect.escape_list(&fk.referenced_columns)
    );
    if let Some(on_delete) = fk.on_delete {
        sql.push_str(" ON DELETE ");
        sql.push_str(on_delete.as_sql());
    }
    if let Some(on_update) = fk.on_update {
        sql.push_str(" ON UPDATE ");
        sql.push_str(on_update.as_sql());
    }
    sql
}

/// View definition without a trailing delimiter.
pub(crate) fn view_body(definition: &str) -> &str {
    definition.trim().trim_end_matches(';').trim_end()
}

/// ` WHERE a = 1 AND b IS NULL`, or nothing for an empty filter.
pub(crate) fn where_clause(dialect: &Dialect, filter: &[(String, Value)]) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let terms: Vec<String> = filter
        .iter()
        .map(|(column, value)| match value {
            Value::Null => format!("{} IS NULL", dialect.escape(column)),
            other => format!("{} = {}", dialect.escape(column), dialect.literal(other)),
        })
        .collect();
    format!(" WHERE {}", terms.join(" AND "))
}
