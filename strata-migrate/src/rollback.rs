//! Choosing and inferring rollback actions.
//!
//! A changeset is rolled back with the first of these that exists:
//!
//! 1. the rollback actions declared on the changeset,
//! 2. the rollback inferred from snapshots when it was applied, recorded in
//!    its history entry,
//! 3. the inverses of its actions, in reverse order.
//!
//! If none is available the rollback fails before anything is executed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::changeset::ChangeSet;
use crate::diff::{diff, generate_actions, invert};
use crate::error::{MigrateResult, MigrationError};
use crate::history::HistoryEntry;
use crate::snapshot::Snapshot;

/// Where a rollback came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackSource {
    Explicit,
    Inferred,
    Inverse,
}

impl fmt::Display for RollbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explicit => "explicit",
            Self::Inferred => "inferred",
            Self::Inverse => "inverse",
        })
    }
}

/// Actions that take the schema from `after` back to `before`.
pub fn infer(before: &Snapshot, after: &Snapshot) -> MigrateResult<Vec<Action>> {
    generate_actions(&invert(&diff(before, after)), after, before)
}

/// Infer a rollback without a database by applying the changeset to `before`.
pub fn infer_offline(change_set: &ChangeSet, before: &Snapshot) -> MigrateResult<Vec<Action>> {
    let after = before.with_actions(&change_set.actions)?;
    infer(before, &after)
}

/// Inverses of `actions`, last action first.
pub fn inverse_actions(actions: &[Action]) -> MigrateResult<Vec<Action>> {
    let mut out = Vec::new();
    for action in actions.iter().rev() {
        let inverse = action.inverse().ok_or_else(|| {
            MigrationError::rollback_failed(format!(
                "{} has no automatic inverse; declare a rollback",
                action.describe()
            ))
        })?;
        out.extend(inverse);
    }
    Ok(out)
}

/// Pick the rollback for a changeset.
pub fn select(
    change_set: &ChangeSet,
    entry: Option<&HistoryEntry>,
) -> MigrateResult<(RollbackSource, Vec<Action>)> {
    if let Some(explicit) = change_set.rollback.as_ref().filter(|r| !r.is_empty()) {
        return Ok((RollbackSource::Explicit, explicit.clone()));
    }
    if let Some(inferred) = entry.and_then(|e| e.inferred_rollback.as_ref()) {
        return Ok((RollbackSource::Inferred, inferred.clone()));
    }
    inverse_actions(&change_set.actions)
        .map(|actions| (RollbackSource::Inverse, actions))
        .map_err(|e| match e {
            MigrationError::RollbackFailed(reason) => {
                MigrationError::rollback_failed(format!("changeset '{}': {}", change_set.id, reason))
            }
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, DataType, DefaultValue, Value};
    use crate::checksum::ChecksumVersion;
    use crate::history::ExecType;
    use pretty_assertions::assert_eq;

    fn base() -> Snapshot {
        Snapshot::empty()
            .with_action(&Action::create_table(
                "accounts",
                vec![
                    ColumnDef::new("id", DataType::Integer).primary_key(),
                    ColumnDef::new("balance", DataType::Decimal {
                        precision: 10,
                        scale: 2,
                    }),
                ],
            ))
            .unwrap()
    }

    fn change_set() -> ChangeSet {
        ChangeSet::new("2", "alice", "db.json")
            .action(Action::DropColumn {
                table: "accounts".into(),
                columns: vec!["balance".into()],
            })
            .action(Action::add_column(
                "accounts",
                ColumnDef::new("status", DataType::Varchar(16))
                    .not_null()
                    .default_value(DefaultValue::Literal(Value::Text("open".into()))),
            ))
            .action(Action::create_table(
                "audit",
                vec![ColumnDef::new("id", DataType::BigInt).primary_key()],
            ))
    }

    #[test]
    fn test_inferred_rollback_restores_prior_schema() {
        let before = base();
        let cs = change_set();
        let after = before.with_actions(&cs.actions).unwrap();
        let rollback = infer(&before, &after).unwrap();
        let restored = after.with_actions(&rollback).unwrap();
        assert!(restored.is_equivalent(&before));
        assert_eq!(rollback, infer_offline(&cs, &before).unwrap());
    }

    #[test]
    fn test_inverse_order_is_reversed() {
        let actions = vec![
            Action::create_table("a", vec![ColumnDef::new("id", DataType::Integer)]),
            Action::RenameTable {
                from: "a".into(),
                to: "b".into(),
            },
        ];
        assert_eq!(
            inverse_actions(&actions).unwrap(),
            vec![
                Action::RenameTable {
                    from: "b".into(),
                    to: "a".into(),
                },
                Action::drop_table("a"),
            ]
        );
    }

    #[test]
    fn test_selection_order() {
        let cs = change_set();
        let mut entry = HistoryEntry::for_change_set(
            &cs,
            cs.checksum(ChecksumVersion::LATEST).unwrap(),
            1,
            ExecType::Executed,
        );

        // Dropping a column has no inverse, so only recorded or declared rollbacks work.
        let err = select(&cs, Some(&entry)).unwrap_err();
        assert!(matches!(err, MigrationError::RollbackFailed(_)));
        assert!(err.to_string().contains("db.json::2::alice"));

        entry.inferred_rollback = Some(vec![Action::drop_table("audit")]);
        let (source, actions) = select(&cs, Some(&entry)).unwrap();
        assert_eq!(source, RollbackSource::Inferred);
        assert_eq!(actions, vec![Action::drop_table("audit")]);

        let declared = cs.clone().rollback(vec![Action::sql("DELETE FROM audit")]);
        let (source, _) = select(&declared, Some(&entry)).unwrap();
        assert_eq!(source, RollbackSource::Explicit);

        let simple = ChangeSet::new("3", "alice", "db.json").action(Action::create_table(
            "t",
            vec![ColumnDef::new("id", DataType::Integer)],
        ));
        let (source, actions) = select(&simple, None).unwrap();
        assert_eq!(source, RollbackSource::Inverse);
        assert_eq!(actions, vec![Action::drop_table("t")]);
    }
}
