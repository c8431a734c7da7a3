//! Immutable schema snapshots.
//!
//! A [`Snapshot`] is a flat set of object collections. Cross references
//! (column to table, foreign key to its two tables) are [`TableId`] indices
//! into the snapshot's own table list, so a snapshot is cheap to clone and
//! compare. Snapshots are built with a [`SnapshotBuilder`], either from live
//! database metadata or by applying actions to an existing snapshot.

mod builder;
mod filter;

pub use builder::SnapshotBuilder;
pub use filter::SnapshotFilter;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::{Action, ReferentialAction};
use crate::error::MigrateResult;

/// Kinds of schema object, in dependency order.
///
/// Sequences and tables come before the objects that hang off tables, and
/// foreign keys and views come last because they reference other tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectType {
    Sequence,
    Table,
    Column,
    PrimaryKey,
    UniqueConstraint,
    Index,
    ForeignKey,
    View,
}

impl ObjectType {
    /// Every object type in dependency order.
    pub const ALL: [ObjectType; 8] = [
        Self::Sequence,
        Self::Table,
        Self::Column,
        Self::PrimaryKey,
        Self::UniqueConstraint,
        Self::Index,
        Self::ForeignKey,
        Self::View,
    ];

    /// camelCase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Table => "table",
            Self::Column => "column",
            Self::PrimaryKey => "primaryKey",
            Self::UniqueConstraint => "uniqueConstraint",
            Self::Index => "index",
            Self::ForeignKey => "foreignKey",
            Self::View => "view",
        }
    }

    /// Parse a camelCase or snake_case name.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().to_lowercase() == key)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one schema object independent of any snapshot.
///
/// Ordering is by object type first, which gives diffs their dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object kind.
    pub object_type: ObjectType,
    /// Owning table for table-scoped objects.
    pub container: Option<String>,
    /// Object name. For primary keys, the table name.
    pub name: String,
}

impl ObjectRef {
    fn scoped(object_type: ObjectType, table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object_type,
            container: Some(table.into()),
            name: name.into(),
        }
    }

    fn top_level(object_type: ObjectType, name: impl Into<String>) -> Self {
        Self {
            object_type,
            container: None,
            name: name.into(),
        }
    }

    /// A table.
    pub fn table(name: impl Into<String>) -> Self {
        Self::top_level(ObjectType::Table, name)
    }

    /// A column of a table.
    pub fn column(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ObjectType::Column, table, name)
    }

    /// The primary key of a table.
    pub fn primary_key(table: impl Into<String>) -> Self {
        let table = table.into();
        Self::scoped(ObjectType::PrimaryKey, table.clone(), table)
    }

    /// A unique constraint.
    pub fn unique_constraint(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ObjectType::UniqueConstraint, table, name)
    }

    /// An index.
    pub fn index(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ObjectType::Index, table, name)
    }

    /// A foreign key.
    pub fn foreign_key(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ObjectType::ForeignKey, table, name)
    }

    /// A sequence.
    pub fn sequence(name: impl Into<String>) -> Self {
        Self::top_level(ObjectType::Sequence, name)
    }

    /// A view.
    pub fn view(name: impl Into<String>) -> Self {
        Self::top_level(ObjectType::View, name)
    }

    /// Table this object belongs to (the table itself for tables).
    pub fn table_name(&self) -> Option<&str> {
        match self.object_type {
            ObjectType::Table => Some(&self.name),
            _ => self.container.as_deref(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.object_type, &self.container) {
            (ObjectType::Column, Some(table)) => write!(f, "column {}.{}", table, self.name),
            (ObjectType::PrimaryKey, Some(table)) => write!(f, "primaryKey on {}", table),
            (ty, Some(table)) => write!(f, "{} {} on {}", ty, self.name, table),
            (ty, None) => write!(f, "{} {}", ty, self.name),
        }
    }
}

/// Stable index of a table within one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub(crate) usize);

impl TableId {
    /// Raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Table comment.
    pub remarks: Option<String>,
}

/// A column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Owning table.
    pub table: TableId,
    /// Column name.
    pub name: String,
    /// Declared type as reported by the database.
    pub data_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression as SQL text.
    pub default: Option<String>,
    /// Whether the column is auto-incremented.
    pub auto_increment: bool,
}

/// A primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Owning table.
    pub table: TableId,
    /// Constraint name, when the database reports one.
    pub name: Option<String>,
    /// Key columns in order.
    pub columns: Vec<String>,
}

/// A unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Owning table.
    pub table: TableId,
    /// Constraint name.
    pub name: String,
    /// Constrained columns.
    pub columns: Vec<String>,
}

/// An index that is not backing a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Indexed table.
    pub table: TableId,
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
}

/// A foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing table.
    pub table: TableId,
    /// Constraint name.
    pub name: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table name.
    pub referenced_table: String,
    /// Referenced table, if it is part of this snapshot.
    pub referenced: Option<TableId>,
    /// Referenced columns.
    pub referenced_columns: Vec<String>,
    /// ON DELETE behaviour.
    pub on_delete: Option<ReferentialAction>,
    /// ON UPDATE behaviour.
    pub on_update: Option<ReferentialAction>,
}

/// A sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name.
    pub name: String,
    /// Start value.
    pub start: Option<i64>,
    /// Increment.
    pub increment: Option<i64>,
}

/// A view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// View name.
    pub name: String,
    /// The SELECT text.
    pub definition: String,
}

/// Point-in-time structure of a schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub(crate) dialect: Option<String>,
    pub(crate) tables: Vec<Table>,
    pub(crate) columns: Vec<Column>,
    pub(crate) primary_keys: Vec<PrimaryKey>,
    pub(crate) unique_constraints: Vec<UniqueConstraint>,
    pub(crate) indexes: Vec<Index>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) sequences: Vec<Sequence>,
    pub(crate) views: Vec<View>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start a builder.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    /// Dialect the snapshot was captured from, if any.
    pub fn dialect(&self) -> Option<&str> {
        self.dialect.as_deref()
    }

    /// All tables.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// All columns.
    pub fn all_columns(&self) -> &[Column] {
        &self.columns
    }

    /// All primary keys.
    pub fn primary_keys(&self) -> &[PrimaryKey] {
        &self.primary_keys
    }

    /// All unique constraints.
    pub fn unique_constraints(&self) -> &[UniqueConstraint] {
        &self.unique_constraints
    }

    /// All indexes.
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// All foreign keys.
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// All sequences.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// All views.
    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Resolve a table id.
    pub fn table_by_id(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.0)
    }

    /// Name of a table by id; empty for a dangling id.
    pub fn table_name(&self, id: TableId) -> &str {
        self.table_by_id(id).map(|t| t.name.as_str()).unwrap_or("")
    }

    /// Find a table by name.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|t| t.name == name)
            .map(TableId)
    }

    /// Columns of a table in declaration order.
    pub fn columns(&self, table: TableId) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(move |c| c.table == table)
    }

    /// Find a column.
    pub fn column(&self, table: &str, column: &str) -> Option<&Column> {
        let id = self.table_id(table)?;
        self.columns(id).find(|c| c.name == column)
    }

    /// Primary key of a table.
    pub fn primary_key(&self, table: TableId) -> Option<&PrimaryKey> {
        self.primary_keys.iter().find(|pk| pk.table == table)
    }

    /// Whether a table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.table_id(name).is_some()
    }

    /// Whether a column exists.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    /// Whether a view exists.
    pub fn has_view(&self, name: &str) -> bool {
        self.views.iter().any(|v| v.name == name)
    }

    /// Whether a sequence exists.
    pub fn has_sequence(&self, name: &str) -> bool {
        self.sequences.iter().any(|s| s.name == name)
    }

    /// Whether an index exists, optionally restricted to one table.
    pub fn has_index(&self, table: Option<&str>, name: &str) -> bool {
        self.indexes.iter().any(|i| {
            i.name == name && table.is_none_or(|t| self.table_name(i.table) == t)
        })
    }

    /// Whether a foreign key exists, optionally restricted to one table.
    pub fn has_foreign_key(&self, table: Option<&str>, name: &str) -> bool {
        self.foreign_keys.iter().any(|fk| {
            fk.name == name && table.is_none_or(|t| self.table_name(fk.table) == t)
        })
    }

    /// Whether a table has a primary key.
    pub fn has_primary_key(&self, table: &str) -> bool {
        self.table_id(table)
            .and_then(|id| self.primary_key(id))
            .is_some()
    }

    /// Number of objects of all types.
    pub fn object_count(&self) -> usize {
        self.tables.len()
            + self.columns.len()
            + self.primary_keys.len()
            + self.unique_constraints.len()
            + self.indexes.len()
            + self.foreign_keys.len()
            + self.sequences.len()
            + self.views.len()
    }

    /// Whether the snapshot contains no objects.
    pub fn is_empty(&self) -> bool {
        self.object_count() == 0
    }

    /// Structural equality, ignoring declaration order and cosmetic fields.
    pub fn is_equivalent(&self, other: &Snapshot) -> bool {
        crate::diff::diff(self, other).is_empty()
    }

    /// A new snapshot reflecting `action` applied to this one.
    ///
    /// Raw SQL and data manipulation actions leave the structure unchanged.
    pub fn with_action(&self, action: &Action) -> MigrateResult<Snapshot> {
        let mut builder = SnapshotBuilder::from_snapshot(self);
        builder.apply(action)?;
        Ok(builder.build())
    }

    /// A new snapshot reflecting all `actions` applied in order.
    pub fn with_actions<'a>(
        &self,
        actions: impl IntoIterator<Item = &'a Action>,
    ) -> MigrateResult<Snapshot> {
        let mut builder = SnapshotBuilder::from_snapshot(self);
        for action in actions {
            builder.apply(action)?;
        }
        Ok(builder.build())
    }

    /// A copy containing only the objects the filter admits.
    pub fn filtered(&self, filter: &SnapshotFilter) -> Snapshot {
        SnapshotBuilder::from_snapshot_filtered(self, filter).build()
    }
}
