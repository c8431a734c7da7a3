//! Structural comparison of two snapshots.
//!
//! [`diff`] reports what separates a *reference* snapshot from a *comparison*
//! snapshot. Objects only in the comparison are [`DiffKind::Unexpected`],
//! objects only in the reference are [`DiffKind::Missing`], and objects in both
//! whose comparable fields differ are [`DiffKind::Changed`] with one
//! [`FieldDelta`] per differing field.
//!
//! Output is sorted by [`ObjectRef`], whose ordering puts object types in
//! dependency order, so the same two snapshots always produce the same list.

mod generate;

pub use generate::{ChangeLogOptions, generate_actions, generate_changelog};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::{DataType, ReferentialAction};
use crate::snapshot::{ObjectRef, Snapshot};

/// A single differing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// Field name (`type`, `nullable`, `default`, ...).
    pub field: String,
    /// Value in the reference snapshot.
    pub reference: Option<String>,
    /// Value in the comparison snapshot.
    pub comparison: Option<String>,
}

impl FieldDelta {
    fn swapped(&self) -> Self {
        Self {
            field: self.field.clone(),
            reference: self.comparison.clone(),
            comparison: self.reference.clone(),
        }
    }
}

/// How an object differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffKind {
    /// Present only in the reference.
    Missing,
    /// Present only in the comparison.
    Unexpected,
    /// Present in both with differing fields.
    Changed(Vec<FieldDelta>),
}

/// One structural difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// The object.
    pub object: ObjectRef,
    /// The difference.
    pub kind: DiffKind,
}

impl Diff {
    /// The same difference seen from the other side.
    pub fn inverted(&self) -> Self {
        let kind = match &self.kind {
            DiffKind::Missing => DiffKind::Unexpected,
            DiffKind::Unexpected => DiffKind::Missing,
            DiffKind::Changed(deltas) => {
                DiffKind::Changed(deltas.iter().map(FieldDelta::swapped).collect())
            }
        };
        Self {
            object: self.object.clone(),
            kind,
        }
    }

    /// Delta for a field, if this is a change that touched it.
    pub fn delta(&self, field: &str) -> Option<&FieldDelta> {
        match &self.kind {
            DiffKind::Changed(deltas) => deltas.iter().find(|d| d.field == field),
            _ => None,
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiffKind::Missing => write!(f, "missing {}", self.object),
            DiffKind::Unexpected => write!(f, "unexpected {}", self.object),
            DiffKind::Changed(deltas) => {
                write!(f, "changed {}:", self.object)?;
                for d in deltas {
                    write!(
                        f,
                        " {} {} -> {};",
                        d.field,
                        d.reference.as_deref().unwrap_or("<none>"),
                        d.comparison.as_deref().unwrap_or("<none>")
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// Invert a diff list, keeping it sorted.
pub fn invert(diffs: &[Diff]) -> Vec<Diff> {
    let mut inverted: Vec<Diff> = diffs.iter().map(Diff::inverted).collect();
    inverted.sort_by(|a, b| a.object.cmp(&b.object));
    inverted
}

type Fields = Vec<(&'static str, Option<String>)>;

fn joined(columns: &[String]) -> Option<String> {
    Some(columns.join(","))
}

fn referential(action: Option<ReferentialAction>) -> Option<String> {
    Some(
        action
            .unwrap_or(ReferentialAction::NoAction)
            .as_sql()
            .to_string(),
    )
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_string()
}

/// Flatten a snapshot into comparable field lists keyed by object.
fn comparable(snapshot: &Snapshot) -> BTreeMap<ObjectRef, Fields> {
    let mut objects = BTreeMap::new();

    for seq in snapshot.sequences() {
        objects.insert(
            ObjectRef::sequence(&seq.name),
            vec![
                ("start", seq.start.map(|v| v.to_string())),
                ("increment", seq.increment.map(|v| v.to_string())),
            ],
        );
    }
    for table in snapshot.tables() {
        objects.insert(ObjectRef::table(&table.name), Vec::new());
    }
    for column in snapshot.all_columns() {
        let table = snapshot.table_name(column.table);
        objects.insert(
            ObjectRef::column(table, &column.name),
            vec![
                ("type", Some(DataType::normalize(&column.data_type))),
                ("nullable", Some(column.nullable.to_string())),
                ("default", column.default.as_ref().map(|d| d.trim().to_string())),
                ("autoIncrement", Some(column.auto_increment.to_string())),
            ],
        );
    }
    for pk in snapshot.primary_keys() {
        objects.insert(
            ObjectRef::primary_key(snapshot.table_name(pk.table)),
            vec![("columns", joined(&pk.columns))],
        );
    }
    for unique in snapshot.unique_constraints() {
        objects.insert(
            ObjectRef::unique_constraint(snapshot.table_name(unique.table), &unique.name),
            vec![("columns", joined(&unique.columns))],
        );
    }
    for index in snapshot.indexes() {
        objects.insert(
            ObjectRef::index(snapshot.table_name(index.table), &index.name),
            vec![
                ("columns", joined(&index.columns)),
                ("unique", Some(index.unique.to_string())),
            ],
        );
    }
    for fk in snapshot.foreign_keys() {
        objects.insert(
            ObjectRef::foreign_key(snapshot.table_name(fk.table), &fk.name),
            vec![
                ("columns", joined(&fk.columns)),
                ("referencedTable", Some(fk.referenced_table.clone())),
                ("referencedColumns", joined(&fk.referenced_columns)),
                ("onDelete", referential(fk.on_delete)),
                ("onUpdate", referential(fk.on_update)),
            ],
        );
    }
    for view in snapshot.views() {
        objects.insert(
            ObjectRef::view(&view.name),
            vec![("definition", Some(normalize_sql(&view.definition)))],
        );
    }
    objects
}

/// Compare two snapshots.
pub fn diff(reference: &Snapshot, comparison: &Snapshot) -> Vec<Diff> {
    let left = comparable(reference);
    let right = comparable(comparison);
    let keys: BTreeSet<&ObjectRef> = left.keys().chain(right.keys()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let kind = match (left.get(key), right.get(key)) {
                (Some(_), None) => DiffKind::Missing,
                (None, Some(_)) => DiffKind::Unexpected,
                (Some(a), Some(b)) => {
                    let deltas: Vec<FieldDelta> = a
                        .iter()
                        .zip(b.iter())
                        .filter(|((_, x), (_, y))| x != y)
                        .map(|((field, x), (_, y))| FieldDelta {
                            field: field.to_string(),
                            reference: x.clone(),
                            comparison: y.clone(),
                        })
                        .collect();
                    if deltas.is_empty() {
                        return None;
                    }
                    DiffKind::Changed(deltas)
                }
                (None, None) => return None,
            };
            Some(Diff {
                object: key.clone(),
                kind,
            })
        })
        .collect()
}
