use std::collections::BTreeSet;

use regex_lite::Regex;

use crate::error::{MigrateResult, MigrationError};

use super::ObjectType;

/// Restricts which objects a snapshot captures.
///
/// Name patterns are anchored, case-insensitive regular expressions matched
/// against top-level objects (tables, sequences, views). Table-scoped objects
/// follow their table and are only subject to the object-type filter.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    types: Option<BTreeSet<ObjectType>>,
}

impl SnapshotFilter {
    /// A filter that admits everything.
    pub fn all() -> Self {
        Self::default()
    }

    fn compile(pattern: &str) -> MigrateResult<Regex> {
        Regex::new(&format!("(?i)^(?:{})$", pattern)).map_err(|e| {
            MigrationError::configuration(format!("invalid name pattern '{}': {}", pattern, e))
        })
    }

    /// Only admit top-level objects whose name matches one of the include patterns.
    pub fn include(mut self, pattern: &str) -> MigrateResult<Self> {
        self.include.push(Self::compile(pattern)?);
        Ok(self)
    }

    /// Reject top-level objects whose name matches.
    pub fn exclude(mut self, pattern: &str) -> MigrateResult<Self> {
        self.exclude.push(Self::compile(pattern)?);
        Ok(self)
    }

    /// Restrict capture to the given object types.
    ///
    /// Columns are kept whenever tables are, since a table without columns
    /// cannot be recreated.
    pub fn object_types(mut self, types: impl IntoIterator<Item = ObjectType>) -> Self {
        let mut set: BTreeSet<ObjectType> = types.into_iter().collect();
        if set.contains(&ObjectType::Table) {
            set.insert(ObjectType::Column);
        }
        self.types = Some(set);
        self
    }

    /// Build from lists of include/exclude patterns, as found in configuration.
    pub fn from_patterns(include: &[String], exclude: &[String]) -> MigrateResult<Self> {
        let mut filter = Self::all();
        for p in include {
            filter = filter.include(p)?;
        }
        for p in exclude {
            filter = filter.exclude(p)?;
        }
        Ok(filter)
    }

    /// Whether an object type is captured at all.
    pub fn admits_type(&self, object_type: ObjectType) -> bool {
        self.types
            .as_ref()
            .is_none_or(|types| types.contains(&object_type))
    }

    /// Whether an object is captured.
    pub fn admits(&self, object_type: ObjectType, name: &str) -> bool {
        if !self.admits_type(object_type) {
            return false;
        }
        match object_type {
            ObjectType::Table | ObjectType::Sequence | ObjectType::View => {
                (self.include.is_empty() || self.include.iter().any(|r| r.is_match(name)))
                    && !self.exclude.iter().any(|r| r.is_match(name))
            }
            _ => true,
        }
    }

    /// Whether this filter admits everything.
    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.types.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ColumnDef, DataType};
    use crate::snapshot::Snapshot;

    #[test]
    fn test_patterns_are_anchored() {
        let filter = SnapshotFilter::all().include("user.*").unwrap();
        assert!(filter.admits(ObjectType::Table, "users"));
        assert!(filter.admits(ObjectType::Table, "USER_ROLES"));
        assert!(!filter.admits(ObjectType::Table, "app_users"));
        assert!(filter.admits(ObjectType::Column, "anything"));
    }

    #[test]
    fn test_exclude_wins() {
        let filter = SnapshotFilter::from_patterns(&[], &["strata_.*".to_string()]).unwrap();
        assert!(!filter.admits(ObjectType::Table, "strata_changelog"));
        assert!(filter.admits(ObjectType::Table, "orders"));
    }

    #[test]
    fn test_type_filter_keeps_columns_with_tables() {
        let filter = SnapshotFilter::all().object_types([ObjectType::Table]);
        assert!(filter.admits(ObjectType::Column, "id"));
        assert!(!filter.admits(ObjectType::Index, "idx"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            SnapshotFilter::all().include("("),
            Err(MigrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_filtered_snapshot_drops_owned_objects() {
        let snapshot = Snapshot::empty()
            .with_actions(&[
                Action::create_table("keep", vec![ColumnDef::new("id", DataType::Integer)]),
                Action::create_table("skip", vec![ColumnDef::new("id", DataType::Integer)]),
                Action::CreateIndex {
                    table: "skip".into(),
                    name: "idx_skip".into(),
                    columns: vec!["id".into()],
                    unique: false,
                },
            ])
            .unwrap();
        let filter = SnapshotFilter::all().exclude("skip").unwrap();
        let filtered = snapshot.filtered(&filter);
        assert_eq!(filtered.tables().len(), 1);
        assert_eq!(filtered.all_columns().len(), 1);
        assert!(filtered.indexes().is_empty());
    }
}
