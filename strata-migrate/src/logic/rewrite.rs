//! Rewrites that express an action through simpler ones.

use crate::action::{Action, ActionKind};
use crate::dialect::{Dialect, Feature};
use crate::error::MigrateResult;

use super::{ActionLogic, LogicOutput, Priority};

/// Multi-column `addColumn` becomes one action per column.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitAddColumn;

impl ActionLogic for SplitAddColumn {
    fn name(&self) -> &str {
        "rewrite.splitAddColumn"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::AddColumn]
    }

    fn priority(&self, action: &Action, _dialect: &Dialect) -> Priority {
        match action {
            Action::AddColumn { columns, .. } if columns.len() > 1 => Priority::DefaultNotSupported,
            _ => Priority::NotApplicable,
        }
    }

    fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let Action::AddColumn { table, columns } = action else {
            return Ok(LogicOutput::Rewrite(Vec::new()));
        };
        Ok(LogicOutput::Rewrite(
            columns
                .iter()
                .map(|c| Action::add_column(table.clone(), c.clone()))
                .collect(),
        ))
    }
}

/// Multi-column `dropColumn` becomes one action per column.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitDropColumn;

impl ActionLogic for SplitDropColumn {
    fn name(&self) -> &str {
        "rewrite.splitDropColumn"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::DropColumn]
    }

    fn priority(&self, action: &Action, _dialect: &Dialect) -> Priority {
        match action {
            Action::DropColumn { columns, .. } if columns.len() > 1 => Priority::DefaultNotSupported,
            _ => Priority::NotApplicable,
        }
    }

    fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let Action::DropColumn { table, columns } = action else {
            return Ok(LogicOutput::Rewrite(Vec::new()));
        };
        Ok(LogicOutput::Rewrite(
            columns
                .iter()
                .map(|c| Action::drop_column(table.clone(), c.clone()))
                .collect(),
        ))
    }
}

/// `CREATE OR REPLACE VIEW` on dialects without it becomes drop then create.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceViewAsDropCreate;

impl ActionLogic for ReplaceViewAsDropCreate {
    fn name(&self) -> &str {
        "rewrite.replaceViewAsDropCreate"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::CreateView]
    }

    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority {
        match action {
            Action::CreateView { replace: true, .. }
                if !dialect.supports(Feature::CreateOrReplaceView) =>
            {
                Priority::DefaultNotSupported
            }
            _ => Priority::NotApplicable,
        }
    }

    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let Action::CreateView {
            name, definition, ..
        } = action
        else {
            return Ok(LogicOutput::Rewrite(Vec::new()));
        };
        Ok(LogicOutput::Rewrite(vec![
            Action::DropView {
                name: name.clone(),
                if_exists: dialect.supports(Feature::IfExists),
            },
            Action::CreateView {
                name: name.clone(),
                definition: definition.clone(),
                replace: false,
            },
        ]))
    }
}

/// `setNullable(false)` with a backfill value fills existing NULLs first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillBeforeNotNull;

impl ActionLogic for BackfillBeforeNotNull {
    fn name(&self) -> &str {
        "rewrite.backfillBeforeNotNull"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::SetNullable]
    }

    fn priority(&self, action: &Action, _dialect: &Dialect) -> Priority {
        match action {
            Action::SetNullable {
                nullable: false,
                backfill: Some(_),
                ..
            } => Priority::DefaultNotSupported,
            _ => Priority::NotApplicable,
        }
    }

    fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let Action::SetNullable {
            table,
            column,
            data_type,
            backfill: Some(value),
            ..
        } = action
        else {
            return Ok(LogicOutput::Rewrite(Vec::new()));
        };
        Ok(LogicOutput::Rewrite(vec![
            Action::Update {
                table: table.clone(),
                set: vec![(column.clone(), value.clone())],
                filter: vec![(column.clone(), crate::action::Value::Null)],
            },
            Action::SetNullable {
                table: table.clone(),
                column: column.clone(),
                nullable: false,
                data_type: data_type.clone(),
                backfill: None,
            },
        ]))
    }
}

/// Unique constraints become unique indexes where constraints cannot be altered.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueConstraintAsIndex;

impl ActionLogic for UniqueConstraintAsIndex {
    fn name(&self) -> &str {
        "rewrite.uniqueConstraintAsIndex"
    }

    fn kinds(&self) -> &[ActionKind] {
        &[ActionKind::AddUniqueConstraint, ActionKind::DropUniqueConstraint]
    }

    fn priority(&self, _action: &Action, dialect: &Dialect) -> Priority {
        if dialect.supports(Feature::AlterUniqueConstraints) {
            Priority::NotApplicable
        } else {
            Priority::DefaultNotSupported
        }
    }

    fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
        let rewritten = match action {
            Action::AddUniqueConstraint {
                table,
                name,
                columns,
            } => vec![Action::CreateIndex {
                table: table.clone(),
                name: name.clone(),
                columns: columns.clone(),
                unique: true,
            }],
            Action::DropUniqueConstraint { table, name } => vec![Action::DropIndex {
                table: table.clone(),
                name: name.clone(),
            }],
            _ => Vec::new(),
        };
        Ok(LogicOutput::Rewrite(rewritten))
    }
}
