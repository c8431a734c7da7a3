use crate::action::{Action, ColumnDef, DataType};
use crate::error::{MigrateResult, MigrationError};

use super::{
    Column, ForeignKey, Index, ObjectType, PrimaryKey, Sequence, Snapshot, SnapshotFilter, Table,
    TableId, UniqueConstraint, View,
};

/// Mutable, name-addressed model used to assemble a [`Snapshot`].
///
/// Dropped tables leave a hole so that ids handed out earlier stay valid;
/// [`build`](Self::build) compacts them.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    dialect: Option<String>,
    tables: Vec<Option<Table>>,
    columns: Vec<Column>,
    primary_keys: Vec<PrimaryKey>,
    unique_constraints: Vec<UniqueConstraint>,
    indexes: Vec<Index>,
    foreign_keys: Vec<ForeignKey>,
    sequences: Vec<Sequence>,
    views: Vec<View>,
}

impl SnapshotBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the source dialect.
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    /// Start from an existing snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            dialect: snapshot.dialect.clone(),
            tables: snapshot.tables.iter().cloned().map(Some).collect(),
            columns: snapshot.columns.clone(),
            primary_keys: snapshot.primary_keys.clone(),
            unique_constraints: snapshot.unique_constraints.clone(),
            indexes: snapshot.indexes.clone(),
            foreign_keys: snapshot.foreign_keys.clone(),
            sequences: snapshot.sequences.clone(),
            views: snapshot.views.clone(),
        }
    }

    /// Start from the part of a snapshot a filter admits.
    ///
    /// Objects owned by an excluded table are excluded with it.
    pub fn from_snapshot_filtered(snapshot: &Snapshot, filter: &SnapshotFilter) -> Self {
        let mut builder = Self::from_snapshot(snapshot);
        for slot in builder.tables.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|t| !filter.admits(ObjectType::Table, &t.name))
            {
                *slot = None;
            }
        }

        let live = |id: TableId, tables: &[Option<Table>]| tables[id.0].is_some();
        let tables = builder.tables.clone();
        builder
            .columns
            .retain(|c| live(c.table, &tables) && filter.admits(ObjectType::Column, &c.name));
        builder.primary_keys.retain(|pk| live(pk.table, &tables));
        builder.unique_constraints.retain(|u| {
            live(u.table, &tables) && filter.admits(ObjectType::UniqueConstraint, &u.name)
        });
        builder
            .indexes
            .retain(|i| live(i.table, &tables) && filter.admits(ObjectType::Index, &i.name));
        builder.foreign_keys.retain(|fk| {
            live(fk.table, &tables) && filter.admits(ObjectType::ForeignKey, &fk.name)
        });
        builder
            .sequences
            .retain(|s| filter.admits(ObjectType::Sequence, &s.name));
        builder
            .views
            .retain(|v| filter.admits(ObjectType::View, &v.name));
        builder
    }

    /// Look up a live table.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.name == name))
            .map(TableId)
    }

    fn require_table(&self, name: &str) -> MigrateResult<TableId> {
        self.table_id(name)
            .ok_or_else(|| MigrationError::model(format!("table '{}' does not exist", name)))
    }

    fn column_mut(&mut self, table: &str, column: &str) -> MigrateResult<&mut Column> {
        let id = self.require_table(table)?;
        self.columns
            .iter_mut()
            .find(|c| c.table == id && c.name == column)
            .ok_or_else(|| {
                MigrationError::model(format!("column '{}.{}' does not exist", table, column))
            })
    }

    /// Add a table.
    pub fn add_table(&mut self, name: &str) -> MigrateResult<TableId> {
        if self.table_id(name).is_some() {
            return Err(MigrationError::model(format!("table '{}' already exists", name)));
        }
        self.tables.push(Some(Table {
            name: name.to_string(),
            remarks: None,
        }));
        Ok(TableId(self.tables.len() - 1))
    }

    /// Set a table comment.
    pub fn set_table_remarks(&mut self, table: &str, remarks: Option<String>) -> MigrateResult<()> {
        let id = self.require_table(table)?;
        if let Some(t) = self.tables[id.0].as_mut() {
            t.remarks = remarks;
        }
        Ok(())
    }

    /// Add a nullable column and return it for further adjustment.
    pub fn add_column(
        &mut self,
        table: &str,
        name: &str,
        data_type: &str,
    ) -> MigrateResult<&mut Column> {
        let id = self.require_table(table)?;
        if self.columns.iter().any(|c| c.table == id && c.name == name) {
            return Err(MigrationError::model(format!(
                "column '{}.{}' already exists",
                table, name
            )));
        }
        self.columns.push(Column {
            table: id,
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            default: None,
            auto_increment: false,
        });
        let last = self.columns.len() - 1;
        Ok(&mut self.columns[last])
    }

    /// Set the primary key of a table.
    pub fn set_primary_key(
        &mut self,
        table: &str,
        name: Option<String>,
        columns: Vec<String>,
    ) -> MigrateResult<()> {
        let id = self.require_table(table)?;
        if self.primary_keys.iter().any(|pk| pk.table == id) {
            return Err(MigrationError::model(format!(
                "table '{}' already has a primary key",
                table
            )));
        }
        self.primary_keys.push(PrimaryKey {
            table: id,
            name,
            columns,
        });
        Ok(())
    }

    /// Add a unique constraint.
    pub fn add_unique_constraint(
        &mut self,
        table: &str,
        name: &str,
        columns: Vec<String>,
    ) -> MigrateResult<()> {
        let id = self.require_table(table)?;
        self.unique_constraints.push(UniqueConstraint {
            table: id,
            name: name.to_string(),
            columns,
        });
        Ok(())
    }

    /// Add an index.
    pub fn add_index(
        &mut self,
        table: &str,
        name: &str,
        columns: Vec<String>,
        unique: bool,
    ) -> MigrateResult<()> {
        let id = self.require_table(table)?;
        if self.indexes.iter().any(|i| i.name == name) {
            return Err(MigrationError::model(format!("index '{}' already exists", name)));
        }
        self.indexes.push(Index {
            table: id,
            name: name.to_string(),
            columns,
            unique,
        });
        Ok(())
    }

    /// Add a foreign key and return it for further adjustment.
    pub fn add_foreign_key(
        &mut self,
        table: &str,
        name: &str,
        columns: Vec<String>,
        referenced_table: &str,
        referenced_columns: Vec<String>,
    ) -> MigrateResult<&mut ForeignKey> {
        let id = self.require_table(table)?;
        self.foreign_keys.push(ForeignKey {
            table: id,
            name: name.to_string(),
            columns,
            referenced_table: referenced_table.to_string(),
            referenced: None,
            referenced_columns,
            on_delete: None,
            on_update: None,
        });
        let last = self.foreign_keys.len() - 1;
        Ok(&mut self.foreign_keys[last])
    }

    /// Add a sequence.
    pub fn add_sequence(&mut self, name: &str, start: Option<i64>, increment: Option<i64>) {
        self.sequences.push(Sequence {
            name: name.to_string(),
            start,
            increment,
        });
    }

    /// Add or replace a view.
    pub fn add_view(&mut self, name: &str, definition: &str) {
        self.views.retain(|v| v.name != name);
        self.views.push(View {
            name: name.to_string(),
            definition: definition.trim().to_string(),
        });
    }

    /// Remove a table and everything it owns.
    pub fn remove_table(&mut self, name: &str) -> MigrateResult<()> {
        let id = self.require_table(name)?;
        self.tables[id.0] = None;
        self.columns.retain(|c| c.table != id);
        self.primary_keys.retain(|pk| pk.table != id);
        self.unique_constraints.retain(|u| u.table != id);
        self.indexes.retain(|i| i.table != id);
        self.foreign_keys.retain(|fk| fk.table != id);
        Ok(())
    }

    /// Apply one action to the model.
    pub fn apply(&mut self, action: &Action) -> MigrateResult<()> {
        match action {
            Action::CreateTable {
                table,
                columns,
                primary_key_name,
                if_not_exists,
                remarks,
            } => {
                if *if_not_exists && self.table_id(table).is_some() {
                    return Ok(());
                }
                self.add_table(table)?;
                self.set_table_remarks(table, remarks.clone())?;
                self.add_column_defs(table, columns)?;
                let pk: Vec<String> = columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| c.name.clone())
                    .collect();
                if !pk.is_empty() {
                    self.set_primary_key(table, primary_key_name.clone(), pk)?;
                }
            }
            Action::DropTable {
                table, if_exists, ..
            } => {
                if *if_exists && self.table_id(table).is_none() {
                    return Ok(());
                }
                self.remove_table(table)?;
            }
            Action::RenameTable { from, to } => {
                let id = self.require_table(from)?;
                if self.table_id(to).is_some() {
                    return Err(MigrationError::model(format!("table '{}' already exists", to)));
                }
                if let Some(t) = self.tables[id.0].as_mut() {
                    t.name = to.clone();
                }
                for fk in self.foreign_keys.iter_mut() {
                    if &fk.referenced_table == from {
                        fk.referenced_table = to.clone();
                    }
                }
            }
            Action::AddColumn { table, columns } => {
                self.add_column_defs(table, columns)?;
                let pk: Vec<String> = columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| c.name.clone())
                    .collect();
                if !pk.is_empty() {
                    self.set_primary_key(table, None, pk)?;
                }
            }
            Action::DropColumn { table, columns } => {
                let id = self.require_table(table)?;
                for column in columns {
                    self.column_mut(table, column)?;
                    self.columns.retain(|c| !(c.table == id && &c.name == column));
                    let uses = |cols: &Vec<String>| cols.contains(column);
                    self.indexes.retain(|i| !(i.table == id && uses(&i.columns)));
                    self.unique_constraints
                        .retain(|u| !(u.table == id && uses(&u.columns)));
                    self.foreign_keys
                        .retain(|fk| !(fk.table == id && uses(&fk.columns)));
                }
            }
            Action::RenameColumn { table, from, to } => {
                let id = self.require_table(table)?;
                self.column_mut(table, from)?.name = to.clone();
                let rename = |cols: &mut Vec<String>| {
                    for c in cols.iter_mut() {
                        if *c == *from {
                            *c = to.clone();
                        }
                    }
                };
                self.primary_keys
                    .iter_mut()
                    .filter(|pk| pk.table == id)
                    .for_each(|pk| rename(&mut pk.columns));
                self.unique_constraints
                    .iter_mut()
                    .filter(|u| u.table == id)
                    .for_each(|u| rename(&mut u.columns));
                self.indexes
                    .iter_mut()
                    .filter(|i| i.table == id)
                    .for_each(|i| rename(&mut i.columns));
                for fk in self.foreign_keys.iter_mut() {
                    if fk.table == id {
                        rename(&mut fk.columns);
                    }
                    if &fk.referenced_table == table {
                        rename(&mut fk.referenced_columns);
                    }
                }
            }
            Action::ModifyDataType {
                table,
                column,
                data_type,
            } => {
                self.column_mut(table, column)?.data_type = data_type.to_string();
            }
            Action::SetNullable {
                table,
                column,
                nullable,
                ..
            } => {
                self.column_mut(table, column)?.nullable = *nullable;
            }
            Action::AddDefaultValue {
                table,
                column,
                default,
                ..
            } => {
                self.column_mut(table, column)?.default = Some(default.sql_text());
            }
            Action::DropDefaultValue { table, column, .. } => {
                self.column_mut(table, column)?.default = None;
            }
            Action::AddPrimaryKey {
                table,
                name,
                columns,
            } => self.set_primary_key(table, name.clone(), columns.clone())?,
            Action::DropPrimaryKey { table, .. } => {
                let id = self.require_table(table)?;
                let before = self.primary_keys.len();
                self.primary_keys.retain(|pk| pk.table != id);
                if before == self.primary_keys.len() {
                    return Err(MigrationError::model(format!(
                        "table '{}' has no primary key",
                        table
                    )));
                }
            }
            Action::AddForeignKey(fk) => {
                let added = self.add_foreign_key(
                    &fk.table,
                    &fk.name,
                    fk.columns.clone(),
                    &fk.referenced_table,
                    fk.referenced_columns.clone(),
                )?;
                added.on_delete = fk.on_delete;
                added.on_update = fk.on_update;
            }
            Action::DropForeignKey { table, name } => {
                let id = self.require_table(table)?;
                let before = self.foreign_keys.len();
                self.foreign_keys
                    .retain(|fk| !(fk.table == id && &fk.name == name));
                if before == self.foreign_keys.len() {
                    return Err(MigrationError::model(format!(
                        "foreign key '{}' does not exist",
                        name
                    )));
                }
            }
            Action::AddUniqueConstraint {
                table,
                name,
                columns,
            } => self.add_unique_constraint(table, name, columns.clone())?,
            Action::DropUniqueConstraint { table, name } => {
                let id = self.require_table(table)?;
                let before = self.unique_constraints.len();
                self.unique_constraints
                    .retain(|u| !(u.table == id && &u.name == name));
                if before == self.unique_constraints.len() {
                    return Err(MigrationError::model(format!(
                        "unique constraint '{}' does not exist",
                        name
                    )));
                }
            }
            Action::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => self.add_index(table, name, columns.clone(), *unique)?,
            Action::DropIndex { name, .. } => {
                let before = self.indexes.len();
                self.indexes.retain(|i| &i.name != name);
                if before == self.indexes.len() {
                    return Err(MigrationError::model(format!("index '{}' does not exist", name)));
                }
            }
            Action::CreateSequence {
                name,
                start,
                increment,
            } => {
                if self.sequences.iter().any(|s| &s.name == name) {
                    return Err(MigrationError::model(format!(
                        "sequence '{}' already exists",
                        name
                    )));
                }
                self.add_sequence(name, *start, *increment);
            }
            Action::DropSequence { name } => {
                let before = self.sequences.len();
                self.sequences.retain(|s| &s.name != name);
                if before == self.sequences.len() {
                    return Err(MigrationError::model(format!(
                        "sequence '{}' does not exist",
                        name
                    )));
                }
            }
            Action::CreateView {
                name,
                definition,
                replace,
            } => {
                if !replace && self.views.iter().any(|v| &v.name == name) {
                    return Err(MigrationError::model(format!("view '{}' already exists", name)));
                }
                self.add_view(name, definition);
            }
            Action::DropView { name, if_exists } => {
                let before = self.views.len();
                self.views.retain(|v| &v.name != name);
                if before == self.views.len() && !if_exists {
                    return Err(MigrationError::model(format!("view '{}' does not exist", name)));
                }
            }
            Action::Sql { .. } | Action::Insert { .. } | Action::Update { .. } | Action::Delete { .. } => {}
        }
        Ok(())
    }

    fn add_column_defs(&mut self, table: &str, columns: &[ColumnDef]) -> MigrateResult<()> {
        for def in columns {
            let column = self.add_column(table, &def.name, &def.data_type.to_string())?;
            column.nullable = def.nullable && !def.primary_key;
            column.default = def.default.as_ref().map(|d| d.sql_text());
            column.auto_increment = def.auto_increment;
        }
        for def in columns.iter().filter(|c| c.unique) {
            self.add_unique_constraint(
                table,
                &def.unique_constraint_name(table),
                vec![def.name.clone()],
            )?;
        }
        Ok(())
    }

    /// Freeze into an immutable snapshot, compacting table ids.
    pub fn build(self) -> Snapshot {
        let mut remap = vec![None; self.tables.len()];
        let mut tables = Vec::new();
        for (old, slot) in self.tables.into_iter().enumerate() {
            if let Some(table) = slot {
                remap[old] = Some(TableId(tables.len()));
                tables.push(table);
            }
        }
        let map = |id: TableId| remap.get(id.0).copied().flatten();

        let columns = self
            .columns
            .into_iter()
            .filter_map(|mut c| {
                c.table = map(c.table)?;
                c.data_type = DataType::normalize(&c.data_type);
                Some(c)
            })
            .collect();
        let primary_keys = self
            .primary_keys
            .into_iter()
            .filter_map(|mut pk| {
                pk.table = map(pk.table)?;
                Some(pk)
            })
            .collect();
        let unique_constraints = self
            .unique_constraints
            .into_iter()
            .filter_map(|mut u| {
                u.table = map(u.table)?;
                Some(u)
            })
            .collect();
        let indexes = self
            .indexes
            .into_iter()
            .filter_map(|mut i| {
                i.table = map(i.table)?;
                Some(i)
            })
            .collect();
        let foreign_keys = self
            .foreign_keys
            .into_iter()
            .filter_map(|mut fk| {
                fk.table = map(fk.table)?;
                fk.referenced = tables
                    .iter()
                    .position(|t: &Table| t.name == fk.referenced_table)
                    .map(TableId);
                Some(fk)
            })
            .collect();

        Snapshot {
            dialect: self.dialect,
            tables,
            columns,
            primary_keys,
            unique_constraints,
            indexes,
            foreign_keys,
            sequences: self.sequences,
            views: self.views,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, DefaultValue, ForeignKeyDef, Value};

    fn base() -> Snapshot {
        Snapshot::empty()
            .with_actions(&[
                Action::create_table(
                    "users",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("email", DataType::Varchar(100)).unique(),
                    ],
                ),
                Action::create_table(
                    "orders",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("user_id", DataType::Integer),
                    ],
                ),
                Action::AddForeignKey(ForeignKeyDef {
                    name: "fk_orders_user".into(),
                    table: "orders".into(),
                    columns: vec!["user_id".into()],
                    referenced_table: "users".into(),
                    referenced_columns: vec!["id".into()],
                    on_delete: None,
                    on_update: None,
                }),
            ])
            .unwrap()
    }

    #[test]
    fn test_create_table_models_constraints() {
        let snapshot = base();
        assert_eq!(snapshot.tables().len(), 2);
        assert!(snapshot.has_primary_key("users"));
        assert_eq!(snapshot.unique_constraints()[0].name, "uq_users_email");
        let fk = &snapshot.foreign_keys()[0];
        assert_eq!(fk.referenced, snapshot.table_id("users"));
        assert!(!snapshot.column("users", "id").unwrap().nullable);
    }

    #[test]
    fn test_drop_table_compacts_ids() {
        let snapshot = base().with_action(&Action::drop_table("users")).unwrap();
        assert_eq!(snapshot.tables().len(), 1);
        let orders = snapshot.table_id("orders").unwrap();
        assert_eq!(orders.index(), 0);
        assert_eq!(snapshot.columns(orders).count(), 2);
        assert_eq!(snapshot.foreign_keys()[0].referenced, None);
    }

    #[test]
    fn test_rename_column_updates_references() {
        let snapshot = base()
            .with_action(&Action::RenameColumn {
                table: "users".into(),
                from: "id".into(),
                to: "user_id".into(),
            })
            .unwrap();
        let users = snapshot.table_id("users").unwrap();
        assert_eq!(snapshot.primary_key(users).unwrap().columns, vec!["user_id"]);
        assert_eq!(snapshot.foreign_keys()[0].referenced_columns, vec!["user_id"]);
    }

    #[test]
    fn test_defaults_are_recorded_as_sql_text() {
        let snapshot = base()
            .with_action(&Action::AddDefaultValue {
                table: "users".into(),
                column: "email".into(),
                default: DefaultValue::Literal(Value::Text("none".into())),
                data_type: None,
            })
            .unwrap();
        assert_eq!(
            snapshot.column("users", "email").unwrap().default.as_deref(),
            Some("'none'")
        );
    }

    #[test]
    fn test_errors_on_missing_objects() {
        let err = base()
            .with_action(&Action::drop_column("users", "nope"))
            .unwrap_err();
        assert!(matches!(err, MigrationError::Model(_)));
        assert!(base().with_action(&Action::drop_table("nope")).is_err());
    }

    #[test]
    fn test_raw_sql_is_opaque() {
        let snapshot = base();
        let after = snapshot.with_action(&Action::sql("DROP TABLE users")).unwrap();
        assert_eq!(snapshot, after);
    }
}
