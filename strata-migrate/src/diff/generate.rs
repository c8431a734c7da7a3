//! Turning diffs into actions.
//!
//! Generated actions transform the *reference* snapshot into the
//! *comparison* snapshot. They are emitted in a fixed phase order so the
//! result can run top to bottom: dependents are dropped before what they
//! depend on, and created after it.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::action::{Action, ColumnDef, DataType, DefaultValue, ForeignKeyDef};
use crate::changeset::{ChangeLog, ChangeSet};
use crate::error::{MigrateResult, MigrationError};
use crate::snapshot::{
    Column, ForeignKey, Index, ObjectRef, ObjectType, PrimaryKey, Sequence, Snapshot,
    TableId, UniqueConstraint, View,
};

use super::{Diff, DiffKind};

/// Identity given to generated changesets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogOptions {
    /// Changeset ids are `"{id_prefix}-{n}"`, counting from 1.
    pub id_prefix: String,
    /// Author recorded on every changeset.
    pub author: String,
    /// Source path recorded on every changeset.
    pub path: String,
}

impl ChangeLogOptions {
    /// Options with the given author and path and the default prefix.
    pub fn new(author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the id prefix.
    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }
}

impl Default for ChangeLogOptions {
    fn default() -> Self {
        Self {
            id_prefix: "diff".to_string(),
            author: "strata".to_string(),
            path: "generated.json".to_string(),
        }
    }
}

/// Wrap each action in its own changeset.
pub fn generate_changelog(actions: &[Action], options: &ChangeLogOptions) -> MigrateResult<ChangeLog> {
    let change_sets = actions
        .iter()
        .enumerate()
        .map(|(n, action)| {
            ChangeSet::new(
                format!("{}-{}", options.id_prefix, n + 1),
                options.author.clone(),
                options.path.clone(),
            )
            .action(action.clone())
            .description(action.describe())
        })
        .collect();
    ChangeLog::new(change_sets)
}

/// Actions that turn `reference` into `comparison`.
///
/// `diffs` must be `diff(reference, comparison)` (or a filtered subset of it).
/// Rollback inference passes an inverted diff together with swapped
/// snapshots.
pub fn generate_actions(
    diffs: &[Diff],
    reference: &Snapshot,
    comparison: &Snapshot,
) -> MigrateResult<Vec<Action>> {
    let plan = Plan::new(diffs, reference, comparison)?;
    let actions = plan.actions()?;
    debug!(diffs = diffs.len(), actions = actions.len(), "Generated actions from diff");
    Ok(actions)
}

struct Plan<'a> {
    diffs: &'a [Diff],
    reference: &'a Snapshot,
    comparison: &'a Snapshot,
    created: BTreeSet<&'a str>,
    dropped: BTreeSet<&'a str>,
    /// Created tables whose key is declared inline.
    inline_keys: BTreeSet<&'a str>,
    /// Unique constraints declared inline on a created table.
    inline_uniques: BTreeSet<ObjectRef>,
}

impl<'a> Plan<'a> {
    fn new(diffs: &'a [Diff], reference: &'a Snapshot, comparison: &'a Snapshot) -> MigrateResult<Self> {
        let tables = move |kind: &DiffKind| -> BTreeSet<&'a str> {
            diffs
                .iter()
                .filter(|d| d.object.object_type == ObjectType::Table && &d.kind == kind)
                .map(|d| d.object.name.as_str())
                .collect()
        };
        let mut plan = Self {
            diffs,
            reference,
            comparison,
            created: tables(&DiffKind::Unexpected),
            dropped: tables(&DiffKind::Missing),
            inline_keys: BTreeSet::new(),
            inline_uniques: BTreeSet::new(),
        };

        for &table in &plan.created {
            let Some(id) = comparison.table_id(table) else {
                return Err(not_found(&ObjectRef::table(table)));
            };
            let declared: Vec<&str> = comparison.columns(id).map(|c| c.name.as_str()).collect();
            // Inline keys follow column order; anything else is added afterwards.
            let inline = comparison.primary_key(id).is_none_or(|pk| {
                let in_order: Vec<&str> = declared
                    .iter()
                    .copied()
                    .filter(|c| pk.columns.iter().any(|k| k == c))
                    .collect();
                in_order == pk.columns.iter().map(String::as_str).collect::<Vec<_>>()
            });
            if inline {
                plan.inline_keys.insert(table);
            }
            for unique in comparison.unique_constraints().iter().filter(|u| u.table == id) {
                if let [column] = unique.columns.as_slice() {
                    if unique.name == format!("uq_{}_{}", table, column) {
                        plan.inline_uniques
                            .insert(ObjectRef::unique_constraint(table, &unique.name));
                    }
                }
            }
        }
        Ok(plan)
    }

    fn of(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.diffs
            .iter()
            .filter(move |d| d.object.object_type == object_type)
    }

    fn missing(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.of(object_type).filter(|d| d.kind == DiffKind::Missing)
    }

    fn unexpected(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.of(object_type).filter(|d| d.kind == DiffKind::Unexpected)
    }

    fn changed(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.of(object_type)
            .filter(|d| matches!(d.kind, DiffKind::Changed(_)))
    }

    /// Missing or changed: the reference version has to go.
    fn outgoing(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.of(object_type).filter(|d| d.kind != DiffKind::Unexpected)
    }

    /// Unexpected or changed: the comparison version has to be created.
    fn incoming(&self, object_type: ObjectType) -> impl Iterator<Item = &'a Diff> + '_ {
        self.of(object_type).filter(|d| d.kind != DiffKind::Missing)
    }

    fn on_dropped_table(&self, diff: &Diff) -> bool {
        diff.object
            .table_name()
            .is_some_and(|t| self.dropped.contains(t))
    }

    fn on_created_table(&self, diff: &Diff) -> bool {
        diff.object
            .table_name()
            .is_some_and(|t| self.created.contains(t))
    }

    fn actions(&self) -> MigrateResult<Vec<Action>> {
        let mut out = Vec::new();
        let (reference, comparison) = (self.reference, self.comparison);

        for d in self.missing(ObjectType::View) {
            out.push(Action::DropView {
                name: d.object.name.clone(),
                if_exists: false,
            });
        }
        // Foreign keys go first, including those of dropped tables, so no
        // table drop is blocked by a reference.
        for d in self.outgoing(ObjectType::ForeignKey) {
            let fk = foreign_key(reference, &d.object)?;
            out.push(Action::DropForeignKey {
                table: reference.table_name(fk.table).to_string(),
                name: fk.name.clone(),
            });
        }
        for d in self.outgoing(ObjectType::Index) {
            if !self.on_dropped_table(d) {
                out.push(Action::DropIndex {
                    table: container(&d.object)?,
                    name: d.object.name.clone(),
                });
            }
        }
        for d in self.outgoing(ObjectType::UniqueConstraint) {
            if !self.on_dropped_table(d) {
                out.push(Action::DropUniqueConstraint {
                    table: container(&d.object)?,
                    name: d.object.name.clone(),
                });
            }
        }
        for d in self.outgoing(ObjectType::PrimaryKey) {
            if !self.on_dropped_table(d) {
                let pk = primary_key(reference, &d.object)?;
                out.push(Action::DropPrimaryKey {
                    table: reference.table_name(pk.table).to_string(),
                    name: pk.name.clone(),
                });
            }
        }
        for d in self.changed(ObjectType::Sequence) {
            out.push(Action::DropSequence {
                name: d.object.name.clone(),
            });
        }

        for d in self.incoming(ObjectType::Sequence) {
            let seq = sequence(comparison, &d.object)?;
            out.push(Action::CreateSequence {
                name: seq.name.clone(),
                start: seq.start,
                increment: seq.increment,
            });
        }
        for d in self.unexpected(ObjectType::Table) {
            out.push(self.create_table(&d.object.name)?);
        }
        for d in self.unexpected(ObjectType::Column) {
            if !self.on_created_table(d) {
                let column = column(comparison, &d.object)?;
                out.push(Action::add_column(container(&d.object)?, column_def(column)));
            }
        }
        for d in self.changed(ObjectType::Column) {
            self.alter_column(d, &mut out)?;
        }
        for d in self.missing(ObjectType::Column) {
            if !self.on_dropped_table(d) {
                out.push(Action::drop_column(container(&d.object)?, d.object.name.clone()));
            }
        }
        for d in self.missing(ObjectType::Table) {
            out.push(Action::drop_table(d.object.name.clone()));
        }
        for d in self.missing(ObjectType::Sequence) {
            out.push(Action::DropSequence {
                name: d.object.name.clone(),
            });
        }

        for d in self.incoming(ObjectType::PrimaryKey) {
            let table = container(&d.object)?;
            if self.inline_keys.contains(table.as_str()) {
                continue;
            }
            let pk = primary_key(comparison, &d.object)?;
            out.push(Action::AddPrimaryKey {
                table,
                name: pk.name.clone(),
                columns: pk.columns.clone(),
            });
        }
        for d in self.incoming(ObjectType::UniqueConstraint) {
            if self.inline_uniques.contains(&d.object) {
                continue;
            }
            let unique = unique_constraint(comparison, &d.object)?;
            out.push(Action::AddUniqueConstraint {
                table: comparison.table_name(unique.table).to_string(),
                name: unique.name.clone(),
                columns: unique.columns.clone(),
            });
        }
        for d in self.incoming(ObjectType::Index) {
            let index = index(comparison, &d.object)?;
            out.push(Action::CreateIndex {
                table: comparison.table_name(index.table).to_string(),
                name: index.name.clone(),
                columns: index.columns.clone(),
                unique: index.unique,
            });
        }
        for d in self.incoming(ObjectType::ForeignKey) {
            let fk = foreign_key(comparison, &d.object)?;
            out.push(Action::AddForeignKey(ForeignKeyDef {
                name: fk.name.clone(),
                table: comparison.table_name(fk.table).to_string(),
                columns: fk.columns.clone(),
                referenced_table: fk.referenced_table.clone(),
                referenced_columns: fk.referenced_columns.clone(),
                on_delete: fk.on_delete,
                on_update: fk.on_update,
            }));
        }
        for d in self.incoming(ObjectType::View) {
            let view = view(comparison, &d.object)?;
            out.push(Action::CreateView {
                name: view.name.clone(),
                definition: view.definition.clone(),
                replace: matches!(d.kind, DiffKind::Changed(_)),
            });
        }
        Ok(out)
    }

    fn create_table(&self, table: &str) -> MigrateResult<Action> {
        let snapshot = self.comparison;
        let id = snapshot
            .table_id(table)
            .ok_or_else(|| not_found(&ObjectRef::table(table)))?;
        let inline_key = self
            .inline_keys
            .contains(table)
            .then(|| snapshot.primary_key(id))
            .flatten();

        let columns = snapshot
            .columns(id)
            .map(|c| {
                let mut def = column_def(c);
                def.primary_key = inline_key.is_some_and(|pk| pk.columns.contains(&c.name));
                def.unique = self
                    .inline_uniques
                    .contains(&ObjectRef::unique_constraint(table, def.unique_constraint_name(table)));
                def
            })
            .collect();

        Ok(Action::CreateTable {
            table: table.to_string(),
            columns,
            primary_key_name: inline_key.and_then(|pk| pk.name.clone()),
            if_not_exists: false,
            remarks: snapshot.table_by_id(id).and_then(|t| t.remarks.clone()),
        })
    }

    fn alter_column(&self, diff: &Diff, out: &mut Vec<Action>) -> MigrateResult<()> {
        let table = container(&diff.object)?;
        let target = column(self.comparison, &diff.object)?;
        let data_type = DataType::parse(&target.data_type);

        if diff.delta("type").is_some() {
            out.push(Action::ModifyDataType {
                table: table.clone(),
                column: target.name.clone(),
                data_type: data_type.clone(),
            });
        }
        if diff.delta("nullable").is_some() {
            out.push(Action::SetNullable {
                table: table.clone(),
                column: target.name.clone(),
                nullable: target.nullable,
                data_type: Some(data_type.clone()),
                backfill: None,
            });
        }
        if diff.delta("default").is_some() {
            out.push(match &target.default {
                Some(text) => Action::AddDefaultValue {
                    table: table.clone(),
                    column: target.name.clone(),
                    default: DefaultValue::from_sql_text(text),
                    data_type: Some(data_type.clone()),
                },
                None => Action::DropDefaultValue {
                    table: table.clone(),
                    column: target.name.clone(),
                    data_type: Some(data_type.clone()),
                },
            });
        }
        if diff.delta("autoIncrement").is_some() {
            warn!(column = %diff.object, "Auto-increment changes are not generated; alter the column manually");
        }
        Ok(())
    }
}

fn column_def(column: &Column) -> ColumnDef {
    let mut def = ColumnDef::new(column.name.clone(), DataType::parse(&column.data_type));
    def.nullable = column.nullable;
    def.default = column.default.as_deref().map(DefaultValue::from_sql_text);
    def.auto_increment = column.auto_increment;
    def
}

fn not_found(object: &ObjectRef) -> MigrationError {
    MigrationError::model(format!("{} is not part of the snapshot being diffed", object))
}

fn container(object: &ObjectRef) -> MigrateResult<String> {
    object
        .container
        .clone()
        .ok_or_else(|| MigrationError::model(format!("{} has no owning table", object)))
}

fn scoped<'s, T>(
    snapshot: &'s Snapshot,
    items: &'s [T],
    object: &ObjectRef,
    owner: impl Fn(&T) -> TableId,
    name: impl Fn(&T) -> &str,
) -> MigrateResult<&'s T> {
    let table = object.container.as_deref();
    items
        .iter()
        .find(|item| table == Some(snapshot.table_name(owner(item))) && name(item) == object.name)
        .ok_or_else(|| not_found(object))
}

fn column<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s Column> {
    scoped(snapshot, snapshot.all_columns(), object, |c| c.table, |c| c.name.as_str())
}

fn primary_key<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s PrimaryKey> {
    snapshot
        .table_id(&object.name)
        .and_then(|id| snapshot.primary_key(id))
        .ok_or_else(|| not_found(object))
}

fn unique_constraint<'s>(
    snapshot: &'s Snapshot,
    object: &ObjectRef,
) -> MigrateResult<&'s UniqueConstraint> {
    scoped(snapshot, snapshot.unique_constraints(), object, |u| u.table, |u| u.name.as_str())
}

fn index<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s Index> {
    scoped(snapshot, snapshot.indexes(), object, |i| i.table, |i| i.name.as_str())
}

fn foreign_key<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s ForeignKey> {
    scoped(snapshot, snapshot.foreign_keys(), object, |fk| fk.table, |fk| fk.name.as_str())
}

fn sequence<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s Sequence> {
    snapshot
        .sequences()
        .iter()
        .find(|s| s.name == object.name)
        .ok_or_else(|| not_found(object))
}

fn view<'s>(snapshot: &'s Snapshot, object: &ObjectRef) -> MigrateResult<&'s View> {
    snapshot
        .views()
        .iter()
        .find(|v| v.name == object.name)
        .ok_or_else(|| not_found(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, Value};
    use crate::diff::diff;
    use pretty_assertions::assert_eq;

    fn reference() -> Snapshot {
        Snapshot::empty()
            .with_actions(&[
                Action::CreateSequence {
                    name: "seq_a".into(),
                    start: Some(1),
                    increment: Some(1),
                },
                Action::create_table(
                    "users",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("email", DataType::Varchar(100)).unique(),
                        ColumnDef::new("name", DataType::Text),
                    ],
                ),
                Action::create_table(
                    "posts",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("user_id", DataType::Integer),
                        ColumnDef::new("title", DataType::Varchar(200)),
                    ],
                ),
                Action::create_table(
                    "tags",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("user_id", DataType::Integer),
                    ],
                ),
                fk("fk_posts_user", "posts", "users"),
                fk("fk_tags_user", "tags", "users"),
                Action::CreateIndex {
                    table: "posts".into(),
                    name: "idx_posts_title".into(),
                    columns: vec!["title".into()],
                    unique: false,
                },
                Action::CreateView {
                    name: "v_users".into(),
                    definition: "SELECT id FROM users".into(),
                    replace: false,
                },
            ])
            .unwrap()
    }

    fn comparison() -> Snapshot {
        Snapshot::empty()
            .with_actions(&[
                Action::CreateSequence {
                    name: "seq_b".into(),
                    start: Some(100),
                    increment: Some(10),
                },
                Action::create_table(
                    "users",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("email", DataType::Varchar(255)).not_null().unique(),
                        ColumnDef::new("name", DataType::Text)
                            .default_value(DefaultValue::Literal(Value::Text("x".into()))),
                        ColumnDef::new("created", DataType::Timestamp),
                    ],
                ),
                Action::create_table(
                    "posts",
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("user_id", DataType::Integer),
                    ],
                ),
                Action::create_table(
                    "comments",
                    vec![
                        ColumnDef::new("id", DataType::BigInt).primary_key(),
                        ColumnDef::new("post_id", DataType::Integer).not_null(),
                    ],
                ),
                fk("fk_posts_user", "posts", "users"),
                Action::AddForeignKey(ForeignKeyDef {
                    name: "fk_comments_post".into(),
                    table: "comments".into(),
                    columns: vec!["post_id".into()],
                    referenced_table: "posts".into(),
                    referenced_columns: vec!["id".into()],
                    on_delete: None,
                    on_update: None,
                }),
                Action::CreateIndex {
                    table: "posts".into(),
                    name: "idx_posts_user".into(),
                    columns: vec!["user_id".into()],
                    unique: false,
                },
                Action::CreateView {
                    name: "v_users".into(),
                    definition: "SELECT id, email FROM users".into(),
                    replace: false,
                },
            ])
            .unwrap()
    }

    fn fk(name: &str, table: &str, referenced: &str) -> Action {
        Action::AddForeignKey(ForeignKeyDef {
            name: name.into(),
            table: table.into(),
            columns: vec!["user_id".into()],
            referenced_table: referenced.into(),
            referenced_columns: vec!["id".into()],
            on_delete: None,
            on_update: None,
        })
    }

    #[test]
    fn test_applying_generated_actions_reaches_comparison() {
        let (a, b) = (reference(), comparison());
        let actions = generate_actions(&diff(&a, &b), &a, &b).unwrap();
        let migrated = a.with_actions(&actions).unwrap();
        assert!(migrated.is_equivalent(&b), "{:?}", diff(&migrated, &b));
    }

    #[test]
    fn test_reverse_direction_round_trips() {
        let (a, b) = (reference(), comparison());
        let actions = generate_actions(&diff(&b, &a), &b, &a).unwrap();
        let migrated = b.with_actions(&actions).unwrap();
        assert!(migrated.is_equivalent(&a), "{:?}", diff(&migrated, &a));
    }

    #[test]
    fn test_phase_order() {
        let (a, b) = (reference(), comparison());
        let kinds: Vec<ActionKind> = generate_actions(&diff(&a, &b), &a, &b)
            .unwrap()
            .iter()
            .map(Action::kind)
            .collect();
        let position = |kind: ActionKind| kinds.iter().position(|k| *k == kind).unwrap();

        assert!(position(ActionKind::DropForeignKey) < position(ActionKind::DropTable));
        assert!(position(ActionKind::DropIndex) < position(ActionKind::DropColumn));
        assert!(position(ActionKind::CreateSequence) < position(ActionKind::CreateTable));
        assert!(position(ActionKind::CreateTable) < position(ActionKind::AddForeignKey));
        assert!(position(ActionKind::AddColumn) < position(ActionKind::CreateIndex));
        assert_eq!(kinds.last(), Some(&ActionKind::CreateView));
    }

    #[test]
    fn test_created_table_declares_key_and_unique_inline() {
        let b = Snapshot::empty()
            .with_action(&Action::create_table(
                "users",
                vec![
                    ColumnDef::new("id", DataType::Integer).primary_key(),
                    ColumnDef::new("email", DataType::Varchar(255)).unique(),
                ],
            ))
            .unwrap();
        let a = Snapshot::empty();
        let actions = generate_actions(&diff(&a, &b), &a, &b).unwrap();
        assert_eq!(
            actions,
            vec![Action::create_table(
                "users",
                vec![
                    ColumnDef::new("id", DataType::Integer).primary_key(),
                    ColumnDef::new("email", DataType::Varchar(255)).unique(),
                ],
            )]
        );
    }

    #[test]
    fn test_out_of_order_key_is_added_separately() {
        let mut builder = Snapshot::builder();
        builder.add_table("pairs").unwrap();
        builder.add_column("pairs", "a", "INTEGER").unwrap().nullable = false;
        builder.add_column("pairs", "b", "INTEGER").unwrap().nullable = false;
        builder
            .set_primary_key("pairs", Some("pk_pairs".into()), vec!["b".into(), "a".into()])
            .unwrap();
        let b = builder.build();
        let a = Snapshot::empty();

        let actions = generate_actions(&diff(&a, &b), &a, &b).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[1],
            Action::AddPrimaryKey {
                table: "pairs".into(),
                name: Some("pk_pairs".into()),
                columns: vec!["b".into(), "a".into()],
            }
        );
        assert!(a.with_actions(&actions).unwrap().is_equivalent(&b));
    }

    #[test]
    fn test_generation_is_reproducible() {
        let (a, b) = (reference(), comparison());
        let first = generate_actions(&diff(&a, &b), &a, &b).unwrap();
        let second = generate_actions(&diff(&a, &b), &a, &b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_generate_changelog_numbers_change_sets() {
        let actions = vec![Action::drop_table("a"), Action::drop_table("b")];
        let log = generate_changelog(&actions, &ChangeLogOptions::new("bob", "gen.json").id_prefix("x"))
            .unwrap();
        let ids: Vec<String> = log.change_sets.iter().map(|cs| cs.id.to_string()).collect();
        assert_eq!(ids, vec!["gen.json::x-1::bob", "gen.json::x-2::bob"]);
        assert_eq!(log.change_sets[1].actions, vec![Action::drop_table("b")]);
    }
}
