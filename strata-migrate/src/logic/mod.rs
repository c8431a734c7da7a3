//! Priority dispatch of actions to dialect SQL.
//!
//! Every [`ActionLogic`] registered for an action kind reports a [`Priority`]
//! for a concrete action on a concrete dialect. The highest priority other
//! than [`Priority::NotApplicable`] wins; ties go to the logic whose name sorts
//! first. A winning logic either renders statements or rewrites the action into
//! other actions, which are resolved in turn under a depth and cycle guard.

mod rewrite;
mod standard;
mod vendor;

pub use rewrite::{
    BackfillBeforeNotNull, ReplaceViewAsDropCreate, SplitAddColumn, SplitDropColumn,
    UniqueConstraintAsIndex,
};
pub use standard::StandardLogic;
pub use vendor::{MsSqlLogic, MySqlLogic, OracleLogic, SqliteLogic};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::action::{Action, ActionKind};
use crate::dialect::Dialect;
use crate::error::{MigrateResult, MigrationError, ValidationErrors};
use crate::statement::Statement;

/// How well a logic handles an action on a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Does not handle this action here.
    NotApplicable,
    /// The dialect lacks the feature natively; the logic rewrites.
    DefaultNotSupported,
    /// Direct native rendering.
    Default,
    /// Dialect-specific override.
    Specialized,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotApplicable => "NOT_APPLICABLE",
            Self::DefaultNotSupported => "DEFAULT_NOT_SUPPORTED",
            Self::Default => "DEFAULT",
            Self::Specialized => "SPECIALIZED",
        };
        f.write_str(name)
    }
}

/// What a logic produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicOutput {
    /// Terminal SQL.
    Statements(Vec<Statement>),
    /// Replacement actions to resolve instead.
    Rewrite(Vec<Action>),
}

/// A stateless strategy that renders or rewrites one family of actions.
pub trait ActionLogic: Send + Sync {
    /// Unique name; also the tie-break key.
    fn name(&self) -> &str;

    /// Action kinds this logic may handle.
    fn kinds(&self) -> &[ActionKind];

    /// Priority for this action on this dialect.
    fn priority(&self, action: &Action, dialect: &Dialect) -> Priority;

    /// Reject unusable action/dialect combinations before rendering.
    fn validate(&self, _action: &Action, _dialect: &Dialect) -> ValidationErrors {
        ValidationErrors::new()
    }

    /// Render or rewrite.
    fn execute(&self, action: &Action, dialect: &Dialect) -> MigrateResult<LogicOutput>;
}

impl fmt::Debug for dyn ActionLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionLogic")
            .field("name", &self.name())
            .finish()
    }
}

/// Registered action logics, keyed by action kind.
#[derive(Debug, Clone, Default)]
pub struct LogicRegistry {
    by_kind: BTreeMap<ActionKind, Vec<Arc<dyn ActionLogic>>>,
    names: BTreeSet<String>,
}

impl LogicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard renderings, rewrites and vendor overrides.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let logics: Vec<Arc<dyn ActionLogic>> = vec![
            Arc::new(StandardLogic),
            Arc::new(SplitAddColumn),
            Arc::new(SplitDropColumn),
            Arc::new(ReplaceViewAsDropCreate),
            Arc::new(BackfillBeforeNotNull),
            Arc::new(UniqueConstraintAsIndex),
            Arc::new(MySqlLogic),
            Arc::new(MsSqlLogic),
            Arc::new(OracleLogic),
            Arc::new(SqliteLogic),
        ];
        for logic in logics {
            registry.insert(logic);
        }
        registry
    }

    fn insert(&mut self, logic: Arc<dyn ActionLogic>) {
        self.names.insert(logic.name().to_string());
        for kind in logic.kinds() {
            self.by_kind.entry(*kind).or_default().push(Arc::clone(&logic));
        }
    }

    /// Register a logic. Names must be unique.
    pub fn register(&mut self, logic: Arc<dyn ActionLogic>) -> MigrateResult<&mut Self> {
        if self.names.contains(logic.name()) {
            return Err(MigrationError::configuration(format!(
                "action logic '{}' is already registered",
                logic.name()
            )));
        }
        self.insert(logic);
        Ok(self)
    }

    /// Names of every registered logic.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Pick the logic for an action: highest priority, then lowest name.
    pub fn select(&self, action: &Action, dialect: &Dialect) -> Option<(Arc<dyn ActionLogic>, Priority)> {
        self.by_kind
            .get(&action.kind())?
            .iter()
            .map(|logic| (logic, logic.priority(action, dialect)))
            .filter(|(_, priority)| *priority != Priority::NotApplicable)
            .min_by(|(a, pa), (b, pb)| pb.cmp(pa).then_with(|| a.name().cmp(b.name())))
            .map(|(logic, priority)| (Arc::clone(logic), priority))
    }

    /// Validate an action without rendering it.
    pub fn validate(&self, action: &Action, dialect: &Dialect) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        dialect.validate_identifiers(action.identifiers(), &mut errors);
        match self.select(action, dialect) {
            Some((logic, _)) => errors.extend(logic.validate(action, dialect)),
            None => {
                errors.unsupported(action.kind().as_str(), dialect.name());
            }
        }
        errors
    }

    /// Resolve an action to a non-empty list of statements.
    pub fn resolve(
        &self,
        action: &Action,
        dialect: &Dialect,
        max_depth: usize,
    ) -> MigrateResult<Vec<Statement>> {
        let mut path = Vec::new();
        let statements = self.resolve_inner(action, dialect, max_depth, &mut path)?;
        if statements.is_empty() {
            return Err(MigrationError::RewriteLimit {
                action: action.kind().to_string(),
                dialect: dialect.id().to_string(),
                depth: 0,
                reason: "resolution produced no statements".to_string(),
            });
        }
        Ok(statements)
    }

    fn resolve_inner(
        &self,
        action: &Action,
        dialect: &Dialect,
        max_depth: usize,
        path: &mut Vec<Action>,
    ) -> MigrateResult<Vec<Statement>> {
        if path.contains(action) {
            return Err(MigrationError::RewriteLimit {
                action: action.kind().to_string(),
                dialect: dialect.id().to_string(),
                depth: path.len(),
                reason: format!("rewrite cycle through {}", action.describe()),
            });
        }

        let errors = self.validate(action, dialect);
        if errors.has_errors() {
            return Err(MigrationError::Validation {
                change_set: String::new(),
                dialect: dialect.id().to_string(),
                errors,
            });
        }
        let Some((logic, priority)) = self.select(action, dialect) else {
            return Err(MigrationError::configuration(format!(
                "no logic selected for {}",
                action.describe()
            )));
        };
        trace!(
            logic = logic.name(),
            priority = %priority,
            action = %action.kind(),
            dialect = dialect.id(),
            "Selected action logic"
        );

        match logic.execute(action, dialect)? {
            LogicOutput::Statements(statements) => Ok(statements
                .into_iter()
                .map(|mut s| {
                    s.delimiter = dialect.statement_delimiter().to_string();
                    if s.affected.is_empty() {
                        s.affected = action.affected_objects();
                    }
                    s
                })
                .collect()),
            LogicOutput::Rewrite(actions) => {
                if path.len() >= max_depth {
                    return Err(MigrationError::RewriteLimit {
                        action: action.kind().to_string(),
                        dialect: dialect.id().to_string(),
                        depth: path.len() + 1,
                        reason: format!("more than {} rewrite hops", max_depth),
                    });
                }
                path.push(action.clone());
                let mut statements = Vec::new();
                for rewritten in &actions {
                    statements.extend(self.resolve_inner(rewritten, dialect, max_depth, path)?);
                }
                path.pop();
                Ok(statements)
            }
        }
    }
}

/// The registries every component shares. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// Known dialects.
    pub dialects: crate::dialect::DialectRegistry,
    /// Known action logics.
    pub logics: LogicRegistry,
}

impl MigrationContext {
    /// Create a context from explicit registries.
    pub fn new(dialects: crate::dialect::DialectRegistry, logics: LogicRegistry) -> Self {
        Self { dialects, logics }
    }

    /// Context with every built-in dialect and logic.
    pub fn standard() -> Self {
        Self::new(crate::dialect::DialectRegistry::standard(), LogicRegistry::standard())
    }

    /// Look up a dialect.
    pub fn dialect(&self, id: &str) -> MigrateResult<Arc<Dialect>> {
        self.dialects.get(id)
    }

    /// Resolve a list of actions in order.
    pub fn resolve_all(
        &self,
        actions: &[Action],
        dialect: &Dialect,
        max_depth: usize,
    ) -> MigrateResult<Vec<Statement>> {
        let mut statements = Vec::new();
        for action in actions {
            statements.extend(self.logics.resolve(action, dialect, max_depth)?);
        }
        Ok(statements)
    }
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, DataType};
    use crate::dialect::DialectRegistry;

    struct Fixed {
        name: &'static str,
        priority: Priority,
        sql: &'static str,
    }

    impl ActionLogic for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn kinds(&self) -> &[ActionKind] {
            &[ActionKind::Sql]
        }

        fn priority(&self, _action: &Action, _dialect: &Dialect) -> Priority {
            self.priority
        }

        fn execute(&self, _action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
            Ok(LogicOutput::Statements(vec![Statement::new(self.sql)]))
        }
    }

    /// Rewrites an action into itself.
    struct Loop;

    impl ActionLogic for Loop {
        fn name(&self) -> &str {
            "loop"
        }

        fn kinds(&self) -> &[ActionKind] {
            &[ActionKind::DropView]
        }

        fn priority(&self, _action: &Action, _dialect: &Dialect) -> Priority {
            Priority::Specialized
        }

        fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
            Ok(LogicOutput::Rewrite(vec![action.clone()]))
        }
    }

    /// Rewrites into an ever-deeper chain of distinct actions.
    struct Deepen;

    impl ActionLogic for Deepen {
        fn name(&self) -> &str {
            "deepen"
        }

        fn kinds(&self) -> &[ActionKind] {
            &[ActionKind::DropSequence]
        }

        fn priority(&self, _action: &Action, _dialect: &Dialect) -> Priority {
            Priority::Specialized
        }

        fn execute(&self, action: &Action, _dialect: &Dialect) -> MigrateResult<LogicOutput> {
            let Action::DropSequence { name } = action else {
                return Ok(LogicOutput::Rewrite(Vec::new()));
            };
            Ok(LogicOutput::Rewrite(vec![Action::DropSequence {
                name: format!("{}x", name),
            }]))
        }
    }

    fn sqlite() -> Arc<Dialect> {
        DialectRegistry::standard().get("sqlite").unwrap()
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Specialized > Priority::Default);
        assert!(Priority::Default > Priority::DefaultNotSupported);
        assert!(Priority::DefaultNotSupported > Priority::NotApplicable);
    }

    #[test]
    fn test_ties_break_on_name() {
        let mut registry = LogicRegistry::new();
        registry
            .register(Arc::new(Fixed {
                name: "zeta",
                priority: Priority::Specialized,
                sql: "SELECT 'zeta'",
            }))
            .unwrap()
            .register(Arc::new(Fixed {
                name: "alpha",
                priority: Priority::Specialized,
                sql: "SELECT 'alpha'",
            }))
            .unwrap()
            .register(Arc::new(Fixed {
                name: "low",
                priority: Priority::Default,
                sql: "SELECT 'low'",
            }))
            .unwrap();

        for _ in 0..10 {
            let statements = registry.resolve(&Action::sql("x"), &sqlite(), 8).unwrap();
            assert_eq!(statements[0].sql, "SELECT 'alpha'");
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = LogicRegistry::standard();
        let err = registry.register(Arc::new(StandardLogic)).unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }

    #[test]
    fn test_rewrite_cycle_is_fatal() {
        let mut registry = LogicRegistry::new();
        registry.register(Arc::new(Loop)).unwrap();
        let action = Action::DropView {
            name: "v".into(),
            if_exists: false,
        };
        let err = registry.resolve(&action, &sqlite(), 8).unwrap_err();
        assert!(matches!(err, MigrationError::RewriteLimit { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rewrite_depth_is_bounded() {
        let mut registry = LogicRegistry::new();
        registry.register(Arc::new(Deepen)).unwrap();
        let action = Action::DropSequence { name: "s".into() };
        match registry.resolve(&action, &sqlite(), 3).unwrap_err() {
            MigrationError::RewriteLimit { depth, .. } => assert_eq!(depth, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_is_validation_error() {
        let registry = LogicRegistry::standard();
        let action = Action::CreateSequence {
            name: "seq".into(),
            start: None,
            increment: None,
        };
        match registry.resolve(&action, &sqlite(), 8).unwrap_err() {
            MigrationError::Validation { errors, .. } => {
                assert!(errors.iter().any(|e| e.unsupported));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_statements_carry_delimiter_and_affected_objects() {
        let registry = LogicRegistry::standard();
        let action = Action::create_table("t", vec![ColumnDef::new("id", DataType::Integer)]);
        let statements = registry.resolve(&action, &sqlite(), 8).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].delimiter, ";");
        assert_eq!(statements[0].affected, action.affected_objects());
    }

    #[test]
    fn test_identifier_limit_checked_before_dispatch() {
        let registry = LogicRegistry::standard();
        let dialect = DialectRegistry::standard().get("firebird").unwrap();
        let action = Action::create_table(
            "a_table_name_that_is_far_too_long_for_firebird",
            vec![ColumnDef::new("id", DataType::Integer)],
        );
        assert!(registry.validate(&action, &dialect).has_errors());
    }
}
