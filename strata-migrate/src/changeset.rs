//! Changesets and changelogs.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::checksum::{Checksum, ChecksumVersion};
use crate::error::{MigrateResult, MigrationError};
use crate::precondition::PreconditionContainer;

/// Stable identity of a changeset: author, id and source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId {
    /// Identifier within the changelog.
    pub id: String,
    /// Author.
    pub author: String,
    /// Changelog path the changeset came from.
    pub path: String,
}

impl ChangeSetId {
    /// Create an identifier.
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

fn default_true() -> bool {
    true
}

/// An identified, ordered group of actions applied as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Identity.
    #[serde(flatten)]
    pub id: ChangeSetId,
    /// Actions in application order.
    pub actions: Vec<Action>,
    /// Gate evaluated before the changeset runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<PreconditionContainer>,
    /// Explicit rollback. `Some(vec![])` declares that nothing needs undoing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Vec<Action>>,
    /// Re-execute on every run.
    #[serde(default)]
    pub run_always: bool,
    /// Re-execute when the checksum changes instead of reporting a mismatch.
    #[serde(default)]
    pub run_on_change: bool,
    /// Dialect filter; entries prefixed with `!` exclude.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dbms: Vec<String>,
    /// Context labels; entries prefixed with `!` exclude.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<String>,
    /// Additional accepted checksums (`"any"` accepts every checksum).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_checksums: Vec<String>,
    /// When false, an execution failure is reported and the run continues.
    #[serde(default = "default_true")]
    pub fail_on_error: bool,
    /// Wrap the changeset in a transaction when the database allows it.
    #[serde(default = "default_true")]
    pub run_in_transaction: bool,
    /// Free-text description. Cosmetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-text comments. Cosmetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

impl ChangeSet {
    /// Create an empty changeset.
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: ChangeSetId::new(id, author, path),
            actions: Vec::new(),
            preconditions: None,
            rollback: None,
            run_always: false,
            run_on_change: false,
            dbms: Vec::new(),
            contexts: Vec::new(),
            valid_checksums: Vec::new(),
            fail_on_error: true,
            run_in_transaction: true,
            description: None,
            comments: None,
        }
    }

    /// Append an action.
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Set the explicit rollback.
    pub fn rollback(mut self, actions: Vec<Action>) -> Self {
        self.rollback = Some(actions);
        self
    }

    /// Set preconditions.
    pub fn preconditions(mut self, preconditions: PreconditionContainer) -> Self {
        self.preconditions = Some(preconditions);
        self
    }

    /// Mark as run-always.
    pub fn run_always(mut self) -> Self {
        self.run_always = true;
        self
    }

    /// Mark as run-on-change.
    pub fn run_on_change(mut self) -> Self {
        self.run_on_change = true;
        self
    }

    /// Restrict to dialects.
    pub fn dbms(mut self, dbms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dbms = dbms.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to contexts.
    pub fn contexts(mut self, contexts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Accept an additional checksum.
    pub fn valid_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.valid_checksums.push(checksum.into());
        self
    }

    /// Continue the run when this changeset fails.
    pub fn continue_on_error(mut self) -> Self {
        self.fail_on_error = false;
        self
    }

    /// Run outside a transaction.
    pub fn without_transaction(mut self) -> Self {
        self.run_in_transaction = false;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checksum of this changeset under the given generation.
    pub fn checksum(&self, version: ChecksumVersion) -> MigrateResult<Checksum> {
        Checksum::compute(&self.actions, version)
    }

    /// Whether `stored` is acceptable for this changeset.
    ///
    /// The stored value is compared against a fresh computation under the
    /// stored value's own generation, then against the declared overrides.
    pub fn accepts_checksum(&self, stored: &Checksum) -> MigrateResult<bool> {
        if self.checksum(stored.version)? == *stored {
            return Ok(true);
        }
        let stored_text = stored.to_string();
        Ok(self
            .valid_checksums
            .iter()
            .any(|v| v.trim().eq_ignore_ascii_case("any") || v.trim() == stored_text))
    }

    /// Whether the changeset targets the given dialect.
    pub fn applies_to_dbms(&self, dialect: &str) -> bool {
        label_filter_matches(&self.dbms, &[dialect.to_string()], "all", "none")
    }

    /// Whether the changeset runs under the active contexts.
    ///
    /// No active contexts means every changeset runs.
    pub fn matches_contexts(&self, active: &[String]) -> bool {
        active.is_empty() || label_filter_matches(&self.contexts, active, "all", "none")
    }
}

fn label_filter_matches(labels: &[String], active: &[String], all: &str, none: &str) -> bool {
    let labels: Vec<String> = labels
        .iter()
        .flat_map(|l| l.split(','))
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    if labels.is_empty() || labels.iter().any(|l| l == all) {
        return true;
    }
    if labels.iter().any(|l| l == none) {
        return false;
    }
    let active: Vec<String> = active.iter().map(|a| a.trim().to_lowercase()).collect();
    let (negated, positive): (Vec<&String>, Vec<&String>) =
        labels.iter().partition(|l| l.starts_with('!'));
    if negated
        .iter()
        .any(|n| active.iter().any(|a| a == n.trim_start_matches('!')))
    {
        return false;
    }
    positive.is_empty() || positive.iter().any(|p| active.contains(*p))
}

/// An ordered list of changesets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeLog {
    /// Changesets in application order.
    pub change_sets: Vec<ChangeSet>,
}

impl ChangeLog {
    /// Create a changelog, rejecting duplicate identifiers.
    pub fn new(change_sets: Vec<ChangeSet>) -> MigrateResult<Self> {
        let log = Self { change_sets };
        log.check_duplicates()?;
        Ok(log)
    }

    fn check_duplicates(&self) -> MigrateResult<()> {
        let mut seen = HashSet::new();
        for cs in &self.change_sets {
            if !seen.insert(&cs.id) {
                return Err(MigrationError::configuration(format!(
                    "duplicate changeset identifier '{}'",
                    cs.id
                )));
            }
        }
        Ok(())
    }

    /// Find a changeset.
    pub fn get(&self, id: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| &cs.id == id)
    }

    /// Number of changesets.
    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    /// Whether the changelog is empty.
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> MigrateResult<Self> {
        let log: Self = serde_json::from_str(json)
            .map_err(|e| MigrationError::serialization(e.to_string()))?;
        log.check_duplicates()?;
        Ok(log)
    }

    /// Serialize to pretty JSON. Output is stable for identical input.
    pub fn to_json(&self) -> MigrateResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MigrationError::serialization(e.to_string()))
    }

    /// Load a JSON changelog file.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&content)
    }

    /// Write the changelog as JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> MigrateResult<()> {
        tokio::fs::write(path.as_ref(), self.to_json()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ColumnDef, DataType};

    fn sample() -> ChangeSet {
        ChangeSet::new("1", "alice", "db/changelog.json").action(Action::create_table(
            "t",
            vec![ColumnDef::new("id", DataType::Integer)],
        ))
    }

    #[test]
    fn test_id_display() {
        assert_eq!(sample().id.to_string(), "db/changelog.json::1::alice");
    }

    #[test]
    fn test_dbms_filter() {
        let cs = sample().dbms(["postgresql", "mysql"]);
        assert!(cs.applies_to_dbms("postgresql"));
        assert!(!cs.applies_to_dbms("sqlite"));

        let cs = sample().dbms(["!sqlite"]);
        assert!(cs.applies_to_dbms("postgresql"));
        assert!(!cs.applies_to_dbms("sqlite"));

        assert!(sample().applies_to_dbms("anything"));
        assert!(sample().dbms(["all"]).applies_to_dbms("h2"));
        assert!(!sample().dbms(["none"]).applies_to_dbms("h2"));
    }

    #[test]
    fn test_context_filter() {
        let cs = sample().contexts(["test, dev"]);
        assert!(cs.matches_contexts(&[]));
        assert!(cs.matches_contexts(&["dev".to_string()]));
        assert!(!cs.matches_contexts(&["prod".to_string()]));
        assert!(sample().matches_contexts(&["prod".to_string()]));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ChangeLog::new(vec![sample(), sample()]).unwrap_err();
        assert!(err.to_string().contains("duplicate changeset identifier"));
    }

    #[test]
    fn test_valid_checksum_override() {
        let stored = Checksum::parse("2:deadbeef").unwrap();
        assert!(!sample().accepts_checksum(&stored).unwrap());
        assert!(sample().valid_checksum("2:deadbeef").accepts_checksum(&stored).unwrap());
        assert!(sample().valid_checksum("ANY").accepts_checksum(&stored).unwrap());
    }

    #[test]
    fn test_json_round_trip_keeps_defaults() {
        let log = ChangeLog::new(vec![sample()]).unwrap();
        let json = log.to_json().unwrap();
        assert!(!json.contains("preconditions"));
        let back = ChangeLog::from_json(&json).unwrap();
        assert_eq!(back, log);
        assert!(back.change_sets[0].fail_on_error);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changelog.json");
        let log = ChangeLog::new(vec![sample()]).unwrap();
        log.save(&path).await.unwrap();
        assert_eq!(ChangeLog::load(&path).await.unwrap(), log);
    }
}
