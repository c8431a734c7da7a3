//! Dialect capabilities and the dialect registry.
//!
//! A [`Dialect`] is pure data: how identifiers are quoted, which features the
//! database supports, how portable types are spelled. It never renders whole
//! statements; that is the job of [`ActionLogic`](crate::logic::ActionLogic).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{DataType, DefaultValue, Value, quote_string};
use crate::error::{MigrateResult, MigrationError, ValidationErrors};

/// Optional schema features that vary between databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// `CREATE SEQUENCE` / `DROP SEQUENCE`.
    Sequences,
    /// DDL participates in transactions.
    TransactionalDdl,
    /// `ALTER TABLE ... DROP COLUMN`.
    DropColumn,
    /// `ALTER TABLE ... RENAME COLUMN`.
    RenameColumn,
    /// `ALTER TABLE ... RENAME TO`.
    RenameTable,
    /// Changing a column's type in place.
    AlterColumnType,
    /// Changing a column's nullability in place.
    AlterNullability,
    /// Adding or dropping a column default in place.
    AlterDefault,
    /// `ALTER TABLE ... ADD/DROP CONSTRAINT ... FOREIGN KEY`.
    AlterForeignKeys,
    /// `ALTER TABLE ... ADD/DROP CONSTRAINT ... UNIQUE`.
    AlterUniqueConstraints,
    /// `ALTER TABLE ... ADD/DROP PRIMARY KEY`.
    AlterPrimaryKey,
    /// `CREATE OR REPLACE VIEW`.
    CreateOrReplaceView,
    /// `DROP TABLE ... CASCADE`.
    DropCascade,
    /// `DROP ... IF EXISTS`.
    IfExists,
    /// `CREATE ... IF NOT EXISTS`.
    IfNotExists,
    /// Auto-increment columns.
    AutoIncrement,
}

/// How an auto-increment column is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIncrementStyle {
    /// `GENERATED BY DEFAULT AS IDENTITY`
    GeneratedIdentity,
    /// `AUTO_INCREMENT`
    AutoIncrementKeyword,
    /// `IDENTITY(1,1)`
    SqlServerIdentity,
    /// `AUTOINCREMENT`
    Autoincrement,
    /// `INTEGER PRIMARY KEY AUTOINCREMENT`, only on a single-column key.
    Rowid,
}

impl AutoIncrementStyle {
    /// Clause appended after the column type.
    pub fn clause(&self) -> &'static str {
        match self {
            Self::GeneratedIdentity => "GENERATED BY DEFAULT AS IDENTITY",
            Self::AutoIncrementKeyword => "AUTO_INCREMENT",
            Self::SqlServerIdentity => "IDENTITY(1,1)",
            Self::Autoincrement | Self::Rowid => "AUTOINCREMENT",
        }
    }
}

/// Database family, used for type spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectFamily {
    Postgres,
    MySql,
    Sqlite,
    H2,
    MsSql,
    Oracle,
    Db2,
    Derby,
    HsqlDb,
    Firebird,
    Snowflake,
    /// A user-registered dialect using canonical type names.
    Generic,
}

const RESERVED_WORDS: &[&str] = &[
    "ALL", "ALTER", "AND", "AS", "BY", "CHECK", "COLUMN", "CONSTRAINT", "CREATE", "DEFAULT",
    "DELETE", "DROP", "FOREIGN", "FROM", "GRANT", "GROUP", "IN", "INDEX", "INSERT", "IS", "KEY",
    "LIMIT", "NOT", "NULL", "ON", "OR", "ORDER", "PRIMARY", "REFERENCES", "SELECT", "SET",
    "TABLE", "TO", "UNIQUE", "UPDATE", "USER", "VALUES", "VIEW", "WHERE",
];

/// Capabilities of one target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    id: String,
    name: String,
    family: DialectFamily,
    quote_open: char,
    quote_close: char,
    max_identifier_length: Option<usize>,
    delimiter: String,
    features: BTreeSet<Feature>,
    auto_increment: AutoIncrementStyle,
    cascade_clause: &'static str,
    numeric_booleans: bool,
}

impl Dialect {
    /// Create a dialect with ANSI defaults and no optional features.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into().to_lowercase(),
            name: name.into(),
            family: DialectFamily::Generic,
            quote_open: '"',
            quote_close: '"',
            max_identifier_length: None,
            delimiter: ";".to_string(),
            features: BTreeSet::new(),
            auto_increment: AutoIncrementStyle::GeneratedIdentity,
            cascade_clause: "CASCADE",
            numeric_booleans: false,
        }
    }

    /// Set the type-spelling family.
    pub fn family(mut self, family: DialectFamily) -> Self {
        self.family = family;
        self
    }

    /// Set identifier quote characters.
    pub fn quotes(mut self, open: char, close: char) -> Self {
        self.quote_open = open;
        self.quote_close = close;
        self
    }

    /// Set the maximum identifier length.
    pub fn max_identifier_length(mut self, len: usize) -> Self {
        self.max_identifier_length = Some(len);
        self
    }

    /// Set the script delimiter.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Enable features.
    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features.extend(features);
        self
    }

    /// Set the auto-increment style.
    pub fn auto_increment_style(mut self, style: AutoIncrementStyle) -> Self {
        self.auto_increment = style;
        self
    }

    /// Set the clause used for cascading drops.
    pub fn cascade_clause(mut self, clause: &'static str) -> Self {
        self.cascade_clause = clause;
        self
    }

    /// Render booleans as `1`/`0`.
    pub fn numeric_booleans(mut self) -> Self {
        self.numeric_booleans = true;
        self
    }

    /// Registry identifier (`postgresql`, `sqlite`, ...).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type-spelling family.
    pub fn family_kind(&self) -> DialectFamily {
        self.family
    }

    /// Script delimiter.
    pub fn statement_delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Identifier length limit, if any.
    pub fn identifier_limit(&self) -> Option<usize> {
        self.max_identifier_length
    }

    /// Auto-increment style.
    pub fn auto_increment(&self) -> AutoIncrementStyle {
        self.auto_increment
    }

    /// Cascading drop clause.
    pub fn cascade(&self) -> &'static str {
        self.cascade_clause
    }

    /// Check whether a feature is supported.
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Whether DDL can be rolled back.
    pub fn transactional_ddl(&self) -> bool {
        self.supports(Feature::TransactionalDdl)
    }

    /// Quote an identifier unconditionally.
    pub fn quote(&self, ident: &str) -> String {
        let close = self.quote_close.to_string();
        let escaped = ident.replace(&close, &close.repeat(2));
        format!("{}{}{}", self.quote_open, escaped, self.quote_close)
    }

    /// Quote an identifier only when it is reserved or not a plain name.
    pub fn escape(&self, ident: &str) -> String {
        let plain = ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        let reserved = RESERVED_WORDS.contains(&ident.to_uppercase().as_str());
        if plain && !reserved {
            ident.to_string()
        } else {
            self.quote(ident)
        }
    }

    /// Escape and comma-join a list of identifiers.
    pub fn escape_list(&self, idents: &[String]) -> String {
        idents
            .iter()
            .map(|i| self.escape(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Spell a portable type for this database.
    pub fn type_name(&self, data_type: &DataType) -> String {
        use DataType as T;
        use DialectFamily as F;

        let spelled = match (self.family, data_type) {
            (F::MsSql, T::Boolean) => "BIT",
            (F::Oracle, T::Boolean) => "NUMBER(1)",
            (F::Oracle, T::SmallInt) => "NUMBER(5)",
            (F::Oracle, T::Integer) => "NUMBER(10)",
            (F::Oracle, T::BigInt) => "NUMBER(19)",
            (F::Oracle, T::Decimal { precision, scale }) => {
                return format!("NUMBER({},{})", precision, scale);
            }
            (F::MySql, T::Integer) => "INT",
            (F::Postgres, T::Float) | (F::MsSql, T::Float) => "REAL",
            (F::Postgres | F::Oracle | F::Firebird, T::Double) => "DOUBLE PRECISION",
            (F::MsSql, T::Double) => "FLOAT",
            (F::Oracle, T::Varchar(n)) => return format!("VARCHAR2({})", n),
            (F::MsSql, T::Varchar(n)) => return format!("NVARCHAR({})", n),
            (F::MsSql, T::Text | T::Json) => "NVARCHAR(MAX)",
            (F::Oracle | F::Db2 | F::Derby | F::H2 | F::HsqlDb, T::Text) => "CLOB",
            (F::MySql, T::Text) => "LONGTEXT",
            (F::Firebird, T::Text) => "BLOB SUB_TYPE TEXT",
            (F::Oracle, T::Time) => "TIMESTAMP",
            (F::MySql, T::Timestamp) => "DATETIME",
            (F::MsSql, T::Timestamp) => "DATETIME2",
            (F::MySql | F::Db2 | F::Derby, T::TimestampTz) => "TIMESTAMP",
            (F::MsSql, T::TimestampTz) => "DATETIMEOFFSET",
            (F::Snowflake, T::TimestampTz) => "TIMESTAMP_TZ",
            (F::Postgres, T::Blob) => "BYTEA",
            (F::MySql, T::Blob) => "LONGBLOB",
            (F::MsSql, T::Blob) => "VARBINARY(MAX)",
            (F::Snowflake, T::Blob) => "BINARY",
            (F::Postgres | F::H2 | F::Generic | F::Sqlite, T::Uuid) => "UUID",
            (F::MsSql, T::Uuid) => "UNIQUEIDENTIFIER",
            (_, T::Uuid) => "CHAR(36)",
            (F::Snowflake, T::Json) => "VARIANT",
            (F::Oracle | F::Db2 | F::Derby | F::HsqlDb, T::Json) => "CLOB",
            (F::Firebird, T::Json) => "BLOB SUB_TYPE TEXT",
            _ => return data_type.to_string(),
        };
        spelled.to_string()
    }

    /// Render a literal value.
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(b) if self.numeric_booleans => (if *b { "1" } else { "0" }).to_string(),
            Value::Timestamp(ts) if self.family == DialectFamily::Oracle => format!(
                "TIMESTAMP {}",
                quote_string(&ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            ),
            other => other.sql_literal(),
        }
    }

    /// Render a column default.
    pub fn default_sql(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Literal(v) => self.literal(v),
            DefaultValue::Expression(e) => e.trim().to_string(),
        }
    }

    /// Record an error for every identifier longer than the dialect allows.
    pub fn validate_identifiers<'a>(
        &self,
        identifiers: impl IntoIterator<Item = &'a str>,
        errors: &mut ValidationErrors,
    ) {
        let Some(limit) = self.max_identifier_length else {
            return;
        };
        for ident in identifiers {
            let len = ident.chars().count();
            if len > limit {
                errors.add(
                    ident,
                    format!(
                        "identifier is {} characters, {} allows at most {}",
                        len, self.name, limit
                    ),
                );
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Registry of known dialects, keyed by lower-case id.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    dialects: BTreeMap<String, Arc<Dialect>>,
    aliases: BTreeMap<String, String>,
}

impl DialectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in dialect.
    pub fn standard() -> Self {
        use Feature::*;

        let common = [DropColumn, RenameColumn, RenameTable, AutoIncrement];
        let alters = [
            AlterColumnType,
            AlterNullability,
            AlterDefault,
            AlterForeignKeys,
            AlterUniqueConstraints,
            AlterPrimaryKey,
        ];

        let mut registry = Self::new();
        registry
            .register(
                Dialect::new("postgresql", "PostgreSQL")
                    .family(DialectFamily::Postgres)
                    .max_identifier_length(63)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([
                        Sequences,
                        TransactionalDdl,
                        CreateOrReplaceView,
                        DropCascade,
                        IfExists,
                        IfNotExists,
                    ]),
            )
            .register(
                Dialect::new("mysql", "MySQL")
                    .family(DialectFamily::MySql)
                    .quotes('`', '`')
                    .max_identifier_length(64)
                    .auto_increment_style(AutoIncrementStyle::AutoIncrementKeyword)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([CreateOrReplaceView, DropCascade, IfExists, IfNotExists]),
            )
            .register(
                Dialect::new("mariadb", "MariaDB")
                    .family(DialectFamily::MySql)
                    .quotes('`', '`')
                    .max_identifier_length(64)
                    .auto_increment_style(AutoIncrementStyle::AutoIncrementKeyword)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([
                        Sequences,
                        CreateOrReplaceView,
                        DropCascade,
                        IfExists,
                        IfNotExists,
                    ]),
            )
            .register(
                Dialect::new("sqlite", "SQLite")
                    .family(DialectFamily::Sqlite)
                    .auto_increment_style(AutoIncrementStyle::Rowid)
                    .with_features(common)
                    .with_features([TransactionalDdl, IfExists, IfNotExists]),
            )
            .register(
                Dialect::new("h2", "H2")
                    .family(DialectFamily::H2)
                    .max_identifier_length(256)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([
                        Sequences,
                        CreateOrReplaceView,
                        DropCascade,
                        IfExists,
                        IfNotExists,
                    ]),
            )
            .register(
                Dialect::new("mssql", "Microsoft SQL Server")
                    .family(DialectFamily::MsSql)
                    .quotes('[', ']')
                    .max_identifier_length(128)
                    .auto_increment_style(AutoIncrementStyle::SqlServerIdentity)
                    .numeric_booleans()
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, TransactionalDdl, IfExists]),
            )
            .register(
                Dialect::new("oracle", "Oracle")
                    .family(DialectFamily::Oracle)
                    .max_identifier_length(128)
                    .cascade_clause("CASCADE CONSTRAINTS")
                    .numeric_booleans()
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, CreateOrReplaceView, DropCascade]),
            )
            .register(
                Dialect::new("db2", "DB2")
                    .family(DialectFamily::Db2)
                    .max_identifier_length(128)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, TransactionalDdl, CreateOrReplaceView]),
            )
            .register(
                Dialect::new("derby", "Apache Derby")
                    .family(DialectFamily::Derby)
                    .max_identifier_length(128)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, TransactionalDdl]),
            )
            .register(
                Dialect::new("hsqldb", "HyperSQL")
                    .family(DialectFamily::HsqlDb)
                    .max_identifier_length(128)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, DropCascade, IfExists]),
            )
            .register(
                Dialect::new("firebird", "Firebird")
                    .family(DialectFamily::Firebird)
                    .max_identifier_length(31)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([Sequences, TransactionalDdl]),
            )
            .register(
                Dialect::new("snowflake", "Snowflake")
                    .family(DialectFamily::Snowflake)
                    .max_identifier_length(255)
                    .auto_increment_style(AutoIncrementStyle::Autoincrement)
                    .with_features(common)
                    .with_features(alters)
                    .with_features([
                        Sequences,
                        CreateOrReplaceView,
                        DropCascade,
                        IfExists,
                        IfNotExists,
                    ]),
            );

        registry.alias("postgres", "postgresql");
        registry.alias("sqlserver", "mssql");
        registry
    }

    /// Register (or replace) a dialect.
    pub fn register(&mut self, dialect: Dialect) -> &mut Self {
        self.dialects
            .insert(dialect.id().to_string(), Arc::new(dialect));
        self
    }

    /// Register an alternative id for an existing dialect.
    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases
            .insert(alias.to_lowercase(), target.to_lowercase());
        self
    }

    /// Look up a dialect by id or alias (case-insensitive).
    pub fn get(&self, id: &str) -> MigrateResult<Arc<Dialect>> {
        let key = id.trim().to_lowercase();
        let key = self.aliases.get(&key).cloned().unwrap_or(key);
        self.dialects
            .get(&key)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownDialect(id.to_string()))
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.dialects.keys().map(String::as_str)
    }

    /// Number of registered dialects.
    pub fn len(&self) -> usize {
        self.dialects.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.dialects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_has_builtin_dialects() {
        let registry = DialectRegistry::standard();
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.get("Postgres").unwrap().id(), "postgresql");
        assert!(matches!(
            registry.get("informix"),
            Err(MigrationError::UnknownDialect(_))
        ));
    }

    #[test]
    fn test_escape_only_when_needed() {
        let registry = DialectRegistry::standard();
        let pg = registry.get("postgresql").unwrap();
        assert_eq!(pg.escape("users"), "users");
        assert_eq!(pg.escape("order"), "\"order\"");
        assert_eq!(pg.escape("my table"), "\"my table\"");

        let mssql = registry.get("mssql").unwrap();
        assert_eq!(mssql.escape("user"), "[user]");

        let mysql = registry.get("mysql").unwrap();
        assert_eq!(mysql.quote("a`b"), "`a``b`");
    }

    #[test]
    fn test_type_names() {
        let registry = DialectRegistry::standard();
        let oracle = registry.get("oracle").unwrap();
        assert_eq!(oracle.type_name(&DataType::Varchar(20)), "VARCHAR2(20)");
        assert_eq!(oracle.type_name(&DataType::Integer), "NUMBER(10)");

        let sqlite = registry.get("sqlite").unwrap();
        assert_eq!(sqlite.type_name(&DataType::Varchar(20)), "VARCHAR(20)");
        assert_eq!(sqlite.type_name(&DataType::Integer), "INTEGER");

        let pg = registry.get("postgresql").unwrap();
        assert_eq!(pg.type_name(&DataType::Blob), "BYTEA");
    }

    #[test]
    fn test_identifier_length_validation() {
        let registry = DialectRegistry::standard();
        let firebird = registry.get("firebird").unwrap();
        let mut errors = ValidationErrors::new();
        let long = "a".repeat(40);
        firebird.validate_identifiers(["short", long.as_str()], &mut errors);
        assert_eq!(errors.len(), 1);

        let sqlite = registry.get("sqlite").unwrap();
        let mut errors = ValidationErrors::new();
        sqlite.validate_identifiers([long.as_str()], &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_boolean_literals() {
        let registry = DialectRegistry::standard();
        assert_eq!(registry.get("mssql").unwrap().literal(&Value::Bool(true)), "1");
        assert_eq!(
            registry.get("postgresql").unwrap().literal(&Value::Bool(false)),
            "FALSE"
        );
    }

    #[test]
    fn test_feature_matrix() {
        let registry = DialectRegistry::standard();
        let sqlite = registry.get("sqlite").unwrap();
        assert!(!sqlite.supports(Feature::Sequences));
        assert!(!sqlite.supports(Feature::AlterColumnType));
        assert!(sqlite.transactional_ddl());

        let mysql = registry.get("mysql").unwrap();
        assert!(!mysql.transactional_ddl());
        assert!(!mysql.supports(Feature::Sequences));
    }
}
