//! Dialect-neutral schema operations.
//!
//! An [`Action`] describes *what* should happen to a schema ("create table
//! `users`"), never *how* a particular database spells it. Actions are turned
//! into [`Statement`](crate::statement::Statement)s by the
//! [`LogicRegistry`](crate::logic::LogicRegistry).

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::ObjectRef;

/// Type tag of an [`Action`], used as the dispatch key for action logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    RenameColumn,
    ModifyDataType,
    SetNullable,
    AddDefaultValue,
    DropDefaultValue,
    AddPrimaryKey,
    DropPrimaryKey,
    AddForeignKey,
    DropForeignKey,
    AddUniqueConstraint,
    DropUniqueConstraint,
    CreateIndex,
    DropIndex,
    CreateSequence,
    DropSequence,
    CreateView,
    DropView,
    Sql,
    Insert,
    Update,
    Delete,
}

impl ActionKind {
    /// Every action kind, in declaration order.
    pub const ALL: [ActionKind; 26] = [
        Self::CreateTable,
        Self::DropTable,
        Self::RenameTable,
        Self::AddColumn,
        Self::DropColumn,
        Self::RenameColumn,
        Self::ModifyDataType,
        Self::SetNullable,
        Self::AddDefaultValue,
        Self::DropDefaultValue,
        Self::AddPrimaryKey,
        Self::DropPrimaryKey,
        Self::AddForeignKey,
        Self::DropForeignKey,
        Self::AddUniqueConstraint,
        Self::DropUniqueConstraint,
        Self::CreateIndex,
        Self::DropIndex,
        Self::CreateSequence,
        Self::DropSequence,
        Self::CreateView,
        Self::DropView,
        Self::Sql,
        Self::Insert,
        Self::Update,
        Self::Delete,
    ];

    /// The camelCase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTable => "createTable",
            Self::DropTable => "dropTable",
            Self::RenameTable => "renameTable",
            Self::AddColumn => "addColumn",
            Self::DropColumn => "dropColumn",
            Self::RenameColumn => "renameColumn",
            Self::ModifyDataType => "modifyDataType",
            Self::SetNullable => "setNullable",
            Self::AddDefaultValue => "addDefaultValue",
            Self::DropDefaultValue => "dropDefaultValue",
            Self::AddPrimaryKey => "addPrimaryKey",
            Self::DropPrimaryKey => "dropPrimaryKey",
            Self::AddForeignKey => "addForeignKey",
            Self::DropForeignKey => "dropForeignKey",
            Self::AddUniqueConstraint => "addUniqueConstraint",
            Self::DropUniqueConstraint => "dropUniqueConstraint",
            Self::CreateIndex => "createIndex",
            Self::DropIndex => "dropIndex",
            Self::CreateSequence => "createSequence",
            Self::DropSequence => "dropSequence",
            Self::CreateView => "createView",
            Self::DropView => "dropView",
            Self::Sql => "sql",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A portable column data type.
///
/// Serialized as its canonical SQL spelling so that changelogs and checksums
/// stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DataType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Decimal { precision: u32, scale: u32 },
    Float,
    Double,
    Char(u32),
    Varchar(u32),
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Blob,
    Uuid,
    Json,
    /// Anything not covered above, passed through verbatim.
    Custom(String),
}

impl DataType {
    /// Parse a SQL type name, falling back to [`DataType::Custom`].
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        let (base, args) = match normalized.find('(') {
            Some(open) if normalized.ends_with(')') => (
                normalized[..open].trim().to_string(),
                normalized[open + 1..normalized.len() - 1]
                    .split(',')
                    .map(|a| a.trim().parse::<u32>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok(),
            ),
            _ => (normalized.clone(), Some(Vec::new())),
        };
        let Some(args) = args else {
            return Self::Custom(raw.trim().to_string());
        };

        match (base.as_str(), args.as_slice()) {
            ("BOOLEAN" | "BOOL", []) => Self::Boolean,
            ("SMALLINT" | "INT2", []) => Self::SmallInt,
            ("INTEGER" | "INT" | "INT4", []) => Self::Integer,
            ("BIGINT" | "INT8", []) => Self::BigInt,
            ("DECIMAL" | "NUMERIC", [p]) => Self::Decimal {
                precision: *p,
                scale: 0,
            },
            ("DECIMAL" | "NUMERIC", [p, s]) => Self::Decimal {
                precision: *p,
                scale: *s,
            },
            ("FLOAT" | "REAL", []) => Self::Float,
            ("DOUBLE" | "DOUBLE PRECISION", []) => Self::Double,
            ("CHAR" | "CHARACTER", [n]) => Self::Char(*n),
            ("VARCHAR" | "CHARACTER VARYING", [n]) => Self::Varchar(*n),
            ("TEXT" | "CLOB", []) => Self::Text,
            ("DATE", []) => Self::Date,
            ("TIME", []) => Self::Time,
            ("TIMESTAMP" | "DATETIME", []) => Self::Timestamp,
            ("TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ", []) => Self::TimestampTz,
            ("BLOB" | "BYTEA", []) => Self::Blob,
            ("UUID", []) => Self::Uuid,
            ("JSON", []) => Self::Json,
            _ => Self::Custom(raw.trim().to_string()),
        }
    }

    /// Canonical spelling used for comparisons across snapshots.
    pub fn normalize(raw: &str) -> String {
        Self::parse(raw).to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("BOOLEAN"),
            Self::SmallInt => f.write_str("SMALLINT"),
            Self::Integer => f.write_str("INTEGER"),
            Self::BigInt => f.write_str("BIGINT"),
            Self::Decimal { precision, scale } => write!(f, "DECIMAL({},{})", precision, scale),
            Self::Float => f.write_str("FLOAT"),
            Self::Double => f.write_str("DOUBLE"),
            Self::Char(n) => write!(f, "CHAR({})", n),
            Self::Varchar(n) => write!(f, "VARCHAR({})", n),
            Self::Text => f.write_str("TEXT"),
            Self::Date => f.write_str("DATE"),
            Self::Time => f.write_str("TIME"),
            Self::Timestamp => f.write_str("TIMESTAMP"),
            Self::TimestampTz => f.write_str("TIMESTAMP WITH TIME ZONE"),
            Self::Blob => f.write_str("BLOB"),
            Self::Uuid => f.write_str("UUID"),
            Self::Json => f.write_str("JSON"),
            Self::Custom(raw) => f.write_str(raw),
        }
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

/// A literal value carried by an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Render as a portable SQL literal (`TRUE`, `42`, `'it''s'`).
    pub fn sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Text(s) => quote_string(s),
            Self::Timestamp(ts) => quote_string(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// A column default.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultValue {
    /// A literal value.
    Literal(Value),
    /// A database expression (`CURRENT_TIMESTAMP`), emitted verbatim.
    Expression(String),
}

impl DefaultValue {
    /// Portable SQL text of this default, as a snapshot records it.
    pub fn sql_text(&self) -> String {
        match self {
            Self::Literal(v) => v.sql_literal(),
            Self::Expression(e) => e.trim().to_string(),
        }
    }

    /// Recover a default from the SQL text a snapshot recorded.
    pub fn from_sql_text(text: &str) -> Self {
        let text = text.trim();
        if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
            let inner = &text[1..text.len() - 1];
            return Self::Literal(Value::Text(inner.replace("''", "'")));
        }
        if let Ok(i) = text.parse::<i64>() {
            return Self::Literal(Value::Int(i));
        }
        match text.to_uppercase().as_str() {
            "TRUE" => Self::Literal(Value::Bool(true)),
            "FALSE" => Self::Literal(Value::Bool(false)),
            "NULL" => Self::Literal(Value::Null),
            _ => Self::Expression(text.to_string()),
        }
    }
}

/// Referential action for foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl ReferentialAction {
    /// SQL keyword form.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
        }
    }

    /// Parse the SQL keyword form (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "CASCADE" => Some(Self::Cascade),
            "SET NULL" => Some(Self::SetNull),
            "SET DEFAULT" => Some(Self::SetDefault),
            "RESTRICT" => Some(Self::Restrict),
            "NO ACTION" => Some(Self::NoAction),
            _ => None,
        }
    }
}

/// Column definition used by `createTable` and `addColumn`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default value.
    pub default: Option<DefaultValue>,
    /// Whether the column is auto-incremented.
    pub auto_increment: bool,
    /// Whether the column is (part of) the primary key.
    pub primary_key: bool,
    /// Whether the column carries a UNIQUE constraint.
    pub unique: bool,
    /// Free-text comment. Excluded from checksums.
    pub remarks: Option<String>,
}

impl ColumnDef {
    /// Create a nullable column of the given type.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
            auto_increment: false,
            primary_key: false,
            unique: false,
            remarks: None,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark the column auto-increment.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Mark the column unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set a default value.
    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Set remarks.
    pub fn remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    /// Name of the constraint backing `unique` on this column.
    pub fn unique_constraint_name(&self, table: &str) -> String {
        format!("uq_{}_{}", table, self.name)
    }
}

/// Foreign key definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Constraint name.
    pub name: String,
    /// Referencing table.
    pub table: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub referenced_table: String,
    /// Referenced columns.
    pub referenced_columns: Vec<String>,
    /// ON DELETE behaviour.
    pub on_delete: Option<ReferentialAction>,
    /// ON UPDATE behaviour.
    pub on_update: Option<ReferentialAction>,
}

/// An atomic, dialect-neutral schema operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
        primary_key_name: Option<String>,
        if_not_exists: bool,
        remarks: Option<String>,
    },
    DropTable {
        table: String,
        cascade: bool,
        if_exists: bool,
    },
    RenameTable {
        from: String,
        to: String,
    },
    AddColumn {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropColumn {
        table: String,
        columns: Vec<String>,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    ModifyDataType {
        table: String,
        column: String,
        data_type: DataType,
    },
    SetNullable {
        table: String,
        column: String,
        nullable: bool,
        /// Required by dialects that restate the column type.
        data_type: Option<DataType>,
        /// Value written into existing NULLs before adding NOT NULL.
        backfill: Option<Value>,
    },
    AddDefaultValue {
        table: String,
        column: String,
        default: DefaultValue,
        data_type: Option<DataType>,
    },
    DropDefaultValue {
        table: String,
        column: String,
        data_type: Option<DataType>,
    },
    AddPrimaryKey {
        table: String,
        name: Option<String>,
        columns: Vec<String>,
    },
    DropPrimaryKey {
        table: String,
        name: Option<String>,
    },
    AddForeignKey(ForeignKeyDef),
    DropForeignKey {
        table: String,
        name: String,
    },
    AddUniqueConstraint {
        table: String,
        name: String,
        columns: Vec<String>,
    },
    DropUniqueConstraint {
        table: String,
        name: String,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    CreateSequence {
        name: String,
        start: Option<i64>,
        increment: Option<i64>,
    },
    DropSequence {
        name: String,
    },
    CreateView {
        name: String,
        definition: String,
        replace: bool,
    },
    DropView {
        name: String,
        if_exists: bool,
    },
    Sql {
        sql: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        set: Vec<(String, Value)>,
        filter: Vec<(String, Value)>,
    },
    Delete {
        table: String,
        filter: Vec<(String, Value)>,
    },
}

impl Action {
    /// Build a `createTable` action.
    pub fn create_table(table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self::CreateTable {
            table: table.into(),
            columns,
            primary_key_name: None,
            if_not_exists: false,
            remarks: None,
        }
    }

    /// Build a plain `dropTable` action.
    pub fn drop_table(table: impl Into<String>) -> Self {
        Self::DropTable {
            table: table.into(),
            cascade: false,
            if_exists: false,
        }
    }

    /// Build a single-column `addColumn` action.
    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        Self::AddColumn {
            table: table.into(),
            columns: vec![column],
        }
    }

    /// Build a single-column `dropColumn` action.
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::DropColumn {
            table: table.into(),
            columns: vec![column.into()],
        }
    }

    /// Build a raw SQL action.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::Sql { sql: sql.into() }
    }

    /// The dispatch tag of this action.
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateTable { .. } => ActionKind::CreateTable,
            Self::DropTable { .. } => ActionKind::DropTable,
            Self::RenameTable { .. } => ActionKind::RenameTable,
            Self::AddColumn { .. } => ActionKind::AddColumn,
            Self::DropColumn { .. } => ActionKind::DropColumn,
            Self::RenameColumn { .. } => ActionKind::RenameColumn,
            Self::ModifyDataType { .. } => ActionKind::ModifyDataType,
            Self::SetNullable { .. } => ActionKind::SetNullable,
            Self::AddDefaultValue { .. } => ActionKind::AddDefaultValue,
            Self::DropDefaultValue { .. } => ActionKind::DropDefaultValue,
            Self::AddPrimaryKey { .. } => ActionKind::AddPrimaryKey,
            Self::DropPrimaryKey { .. } => ActionKind::DropPrimaryKey,
            Self::AddForeignKey(_) => ActionKind::AddForeignKey,
            Self::DropForeignKey { .. } => ActionKind::DropForeignKey,
            Self::AddUniqueConstraint { .. } => ActionKind::AddUniqueConstraint,
            Self::DropUniqueConstraint { .. } => ActionKind::DropUniqueConstraint,
            Self::CreateIndex { .. } => ActionKind::CreateIndex,
            Self::DropIndex { .. } => ActionKind::DropIndex,
            Self::CreateSequence { .. } => ActionKind::CreateSequence,
            Self::DropSequence { .. } => ActionKind::DropSequence,
            Self::CreateView { .. } => ActionKind::CreateView,
            Self::DropView { .. } => ActionKind::DropView,
            Self::Sql { .. } => ActionKind::Sql,
            Self::Insert { .. } => ActionKind::Insert,
            Self::Update { .. } => ActionKind::Update,
            Self::Delete { .. } => ActionKind::Delete,
        }
    }

    /// Copy with free-text remarks removed; this is what checksums see.
    pub fn without_cosmetics(&self) -> Self {
        let mut action = self.clone();
        match &mut action {
            Self::CreateTable {
                columns, remarks, ..
            } => {
                *remarks = None;
                columns.iter_mut().for_each(|c| c.remarks = None);
            }
            Self::AddColumn { columns, .. } => {
                columns.iter_mut().for_each(|c| c.remarks = None);
            }
            _ => {}
        }
        action
    }

    /// Every identifier this action introduces or names.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        match self {
            Self::CreateTable {
                table,
                columns,
                primary_key_name,
                ..
            } => {
                ids.push(table);
                ids.extend(columns.iter().map(|c| c.name.as_str()));
                ids.extend(primary_key_name.as_deref());
            }
            Self::DropTable { table, .. } => ids.push(table),
            Self::RenameTable { from, to } => ids.extend([from.as_str(), to.as_str()]),
            Self::AddColumn { table, columns } => {
                ids.push(table);
                ids.extend(columns.iter().map(|c| c.name.as_str()));
            }
            Self::DropColumn { table, columns } => {
                ids.push(table);
                ids.extend(columns.iter().map(String::as_str));
            }
            Self::RenameColumn { table, from, to } => {
                ids.extend([table.as_str(), from.as_str(), to.as_str()])
            }
            Self::ModifyDataType { table, column, .. }
            | Self::SetNullable { table, column, .. }
            | Self::AddDefaultValue { table, column, .. }
            | Self::DropDefaultValue { table, column, .. } => {
                ids.extend([table.as_str(), column.as_str()])
            }
            Self::AddPrimaryKey {
                table,
                name,
                columns,
            } => {
                ids.push(table);
                ids.extend(name.as_deref());
                ids.extend(columns.iter().map(String::as_str));
            }
            Self::DropPrimaryKey { table, name } => {
                ids.push(table);
                ids.extend(name.as_deref());
            }
            Self::AddForeignKey(fk) => {
                ids.extend([fk.name.as_str(), fk.table.as_str(), fk.referenced_table.as_str()]);
                ids.extend(fk.columns.iter().map(String::as_str));
                ids.extend(fk.referenced_columns.iter().map(String::as_str));
            }
            Self::DropForeignKey { table, name }
            | Self::DropUniqueConstraint { table, name }
            | Self::DropIndex { table, name } => ids.extend([table.as_str(), name.as_str()]),
            Self::AddUniqueConstraint {
                table,
                name,
                columns,
            }
            | Self::CreateIndex {
                table,
                name,
                columns,
                ..
            } => {
                ids.extend([table.as_str(), name.as_str()]);
                ids.extend(columns.iter().map(String::as_str));
            }
            Self::CreateSequence { name, .. }
            | Self::DropSequence { name }
            | Self::CreateView { name, .. }
            | Self::DropView { name, .. } => ids.push(name),
            Self::Sql { .. } => {}
            Self::Insert { table, columns, .. } => {
                ids.push(table);
                ids.extend(columns.iter().map(String::as_str));
            }
            Self::Update { table, set, filter } => {
                ids.push(table);
                ids.extend(set.iter().chain(filter.iter()).map(|(c, _)| c.as_str()));
            }
            Self::Delete { table, filter } => {
                ids.push(table);
                ids.extend(filter.iter().map(|(c, _)| c.as_str()));
            }
        }
        ids
    }

    /// Schema objects touched by this action.
    pub fn affected_objects(&self) -> Vec<ObjectRef> {
        match self {
            Self::CreateTable { table, .. } | Self::DropTable { table, .. } => {
                vec![ObjectRef::table(table)]
            }
            Self::RenameTable { from, to } => vec![ObjectRef::table(from), ObjectRef::table(to)],
            Self::AddColumn { table, columns } => columns
                .iter()
                .map(|c| ObjectRef::column(table, &c.name))
                .collect(),
            Self::DropColumn { table, columns } => {
                columns.iter().map(|c| ObjectRef::column(table, c)).collect()
            }
            Self::RenameColumn { table, from, to } => {
                vec![ObjectRef::column(table, from), ObjectRef::column(table, to)]
            }
            Self::ModifyDataType { table, column, .. }
            | Self::SetNullable { table, column, .. }
            | Self::AddDefaultValue { table, column, .. }
            | Self::DropDefaultValue { table, column, .. } => {
                vec![ObjectRef::column(table, column)]
            }
            Self::AddPrimaryKey { table, .. } | Self::DropPrimaryKey { table, .. } => {
                vec![ObjectRef::primary_key(table)]
            }
            Self::AddForeignKey(fk) => vec![
                ObjectRef::foreign_key(&fk.table, &fk.name),
                ObjectRef::table(&fk.referenced_table),
            ],
            Self::DropForeignKey { table, name } => vec![ObjectRef::foreign_key(table, name)],
            Self::AddUniqueConstraint { table, name, .. }
            | Self::DropUniqueConstraint { table, name } => {
                vec![ObjectRef::unique_constraint(table, name)]
            }
            Self::CreateIndex { table, name, .. } | Self::DropIndex { table, name } => {
                vec![ObjectRef::index(table, name)]
            }
            Self::CreateSequence { name, .. } | Self::DropSequence { name } => {
                vec![ObjectRef::sequence(name)]
            }
            Self::CreateView { name, .. } | Self::DropView { name, .. } => {
                vec![ObjectRef::view(name)]
            }
            Self::Sql { .. } => Vec::new(),
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                vec![ObjectRef::table(table)]
            }
        }
    }

    /// The action(s) that undo this one, when that can be known without a
    /// snapshot of the prior state.
    pub fn inverse(&self) -> Option<Vec<Action>> {
        let inverse = match self {
            Self::CreateTable { table, .. } => vec![Action::drop_table(table.clone())],
            Self::RenameTable { from, to } => vec![Self::RenameTable {
                from: to.clone(),
                to: from.clone(),
            }],
            Self::AddColumn { table, columns } => vec![Self::DropColumn {
                table: table.clone(),
                columns: columns.iter().map(|c| c.name.clone()).collect(),
            }],
            Self::RenameColumn { table, from, to } => vec![Self::RenameColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            }],
            Self::SetNullable {
                table,
                column,
                nullable,
                data_type,
                ..
            } => vec![Self::SetNullable {
                table: table.clone(),
                column: column.clone(),
                nullable: !nullable,
                data_type: data_type.clone(),
                backfill: None,
            }],
            Self::AddDefaultValue {
                table,
                column,
                data_type,
                ..
            } => vec![Self::DropDefaultValue {
                table: table.clone(),
                column: column.clone(),
                data_type: data_type.clone(),
            }],
            Self::AddPrimaryKey { table, name, .. } => vec![Self::DropPrimaryKey {
                table: table.clone(),
                name: name.clone(),
            }],
            Self::AddForeignKey(fk) => vec![Self::DropForeignKey {
                table: fk.table.clone(),
                name: fk.name.clone(),
            }],
            Self::AddUniqueConstraint { table, name, .. } => vec![Self::DropUniqueConstraint {
                table: table.clone(),
                name: name.clone(),
            }],
            Self::CreateIndex { table, name, .. } => vec![Self::DropIndex {
                table: table.clone(),
                name: name.clone(),
            }],
            Self::CreateSequence { name, .. } => vec![Self::DropSequence { name: name.clone() }],
            Self::CreateView {
                name,
                replace: false,
                ..
            } => vec![Self::DropView {
                name: name.clone(),
                if_exists: false,
            }],
            _ => return None,
        };
        Some(inverse)
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        let target = self
            .affected_objects()
            .first()
            .map(|o| o.to_string())
            .unwrap_or_default();
        if target.is_empty() {
            self.kind().to_string()
        } else {
            format!("{} {}", self.kind(), target)
        }
    }
}
