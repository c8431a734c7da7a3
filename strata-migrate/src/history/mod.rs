//! Changelog history: what ran, when, and with which checksum.

mod memory;
mod sql;

pub use memory::InMemoryHistory;
pub use sql::SqlHistoryRepository;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::changeset::{ChangeSet, ChangeSetId};
use crate::checksum::Checksum;
use crate::config::ChecksumMode;
use crate::error::{MigrateResult, MigrationError};
use crate::statement::Statement;

/// Outcome recorded for a changeset execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    /// Applied for the first time.
    Executed,
    /// Failed; only reported, never persisted.
    Failed,
    /// Not applied (precondition CONTINUE, filters).
    Skipped,
    /// Applied again (run-always / run-on-change).
    Reran,
    /// Recorded as applied without executing.
    MarkRan,
}

impl ExecType {
    /// Persisted text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Reran => "RERAN",
            Self::MarkRan => "MARK_RAN",
        }
    }

    /// Parse the persisted form.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        match text.trim().to_uppercase().as_str() {
            "EXECUTED" => Ok(Self::Executed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            "RERAN" => Ok(Self::Reran),
            "MARK_RAN" => Ok(Self::MarkRan),
            other => Err(MigrationError::database(format!(
                "unknown exec type '{}' in history",
                other
            ))),
        }
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a changeset still needs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// No history entry.
    NotRan,
    /// Recorded with an acceptable checksum.
    AlreadyRan,
    /// Recorded, but must run again.
    RunAgain,
    /// Recorded as MARK_RAN with an acceptable checksum.
    MarkRan,
    /// Recorded with a checksum that no longer matches.
    InvalidChecksum,
}

impl RunStatus {
    /// Whether the engine will execute the changeset.
    pub fn will_run(&self) -> bool {
        matches!(self, Self::NotRan | Self::RunAgain)
    }
}

/// One persisted history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Changeset identity.
    pub id: ChangeSetId,
    /// Stored checksum; `None` after `clear_checksums`.
    pub checksum: Option<Checksum>,
    /// When the changeset was applied.
    pub applied_at: DateTime<Utc>,
    /// Strictly increasing execution order.
    pub order_executed: i64,
    /// Outcome.
    pub exec_type: ExecType,
    /// Description copied from the changeset.
    pub description: Option<String>,
    /// Comments copied from the changeset.
    pub comments: Option<String>,
    /// Tag, if the entry was tagged.
    pub tag: Option<String>,
    /// Identifier shared by every entry written in one run.
    pub deployment_id: Option<String>,
    /// Rollback actions inferred from snapshots when the changeset ran.
    pub inferred_rollback: Option<Vec<Action>>,
}

impl HistoryEntry {
    /// Create an entry for a changeset.
    pub fn for_change_set(
        change_set: &ChangeSet,
        checksum: Checksum,
        order_executed: i64,
        exec_type: ExecType,
    ) -> Self {
        Self {
            id: change_set.id.clone(),
            checksum: Some(checksum),
            applied_at: Utc::now(),
            order_executed,
            exec_type,
            description: change_set.description.clone(),
            comments: change_set.comments.clone(),
            tag: None,
            deployment_id: None,
            inferred_rollback: None,
        }
    }
}

/// Persistent store of history entries.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Create backing storage if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// All entries ordered by `order_executed`.
    async fn entries(&self) -> MigrateResult<Vec<HistoryEntry>>;

    /// Append a new entry.
    async fn append(&self, entry: &HistoryEntry) -> MigrateResult<()>;

    /// Replace the entry with the same identity.
    async fn replace(&self, entry: &HistoryEntry) -> MigrateResult<()>;

    /// Remove the entry with the given identity.
    async fn remove(&self, id: &ChangeSetId) -> MigrateResult<()>;

    /// Overwrite the stored checksum of one entry.
    async fn update_checksum(&self, id: &ChangeSetId, checksum: &Checksum) -> MigrateResult<()>;

    /// Null out every stored checksum.
    async fn clear_checksums(&self) -> MigrateResult<()>;

    /// Tag the most recent entry. Returns false if history is empty.
    async fn tag_last(&self, tag: &str) -> MigrateResult<bool>;

    /// Statements an `append` would run, for script output.
    fn render_append(&self, _entry: &HistoryEntry) -> MigrateResult<Vec<Statement>> {
        Ok(Vec::new())
    }

    /// Next order number.
    async fn next_order(&self) -> MigrateResult<i64> {
        let entries = self.entries().await?;
        Ok(entries.iter().map(|e| e.order_executed).max().unwrap_or(0) + 1)
    }

    /// Entry for a changeset.
    async fn find(&self, id: &ChangeSetId) -> MigrateResult<Option<HistoryEntry>> {
        Ok(self.entries().await?.into_iter().find(|e| &e.id == id))
    }
}

/// Decide whether a changeset needs to run, given its history entry.
///
/// Validation uses the generation recorded with the stored checksum.
pub fn run_status(change_set: &ChangeSet, entry: Option<&HistoryEntry>) -> MigrateResult<RunStatus> {
    let Some(entry) = entry else {
        return Ok(RunStatus::NotRan);
    };
    let accepted = match &entry.checksum {
        None => true,
        Some(stored) => change_set.accepts_checksum(stored)?,
    };
    let status = match (accepted, entry.exec_type) {
        (true, _) if change_set.run_always => RunStatus::RunAgain,
        (true, ExecType::MarkRan) => RunStatus::MarkRan,
        (true, _) => RunStatus::AlreadyRan,
        (false, _) if change_set.run_on_change || change_set.run_always => RunStatus::RunAgain,
        (false, _) => RunStatus::InvalidChecksum,
    };
    Ok(status)
}

/// Whether a changeset counts as applied under the given checksum mode.
pub fn was_applied(
    change_set: &ChangeSet,
    history: &[HistoryEntry],
    mode: ChecksumMode,
) -> MigrateResult<bool> {
    let entry = history.iter().find(|e| e.id == change_set.id);
    Ok(match run_status(change_set, entry)? {
        RunStatus::NotRan => false,
        RunStatus::AlreadyRan | RunStatus::MarkRan | RunStatus::RunAgain => true,
        RunStatus::InvalidChecksum => mode == ChecksumMode::Lenient,
    })
}
