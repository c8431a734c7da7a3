//! Execution engine.
//!
//! Every mutating command follows the same shape: acquire the change log
//! lock, work through the changelog strictly in order, release the lock on
//! every path. Validation (rendering every action, checking stored
//! checksums) runs before the first statement is sent, so configuration,
//! validation and checksum problems never leave the target half-migrated.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::changeset::{ChangeLog, ChangeSet, ChangeSetId};
use crate::checksum::ChecksumVersion;
use crate::config::{ChecksumMode, ChecksumUpgradePolicy, MigrationConfig};
use crate::dialect::Dialect;
use crate::diff::{ChangeLogOptions, Diff, generate_actions, generate_changelog};
use crate::driver::{Database, SqlRunner};
use crate::error::{MigrateResult, MigrationError};
use crate::history::{
    ExecType, HistoryEntry, HistoryRepository, RunStatus, SqlHistoryRepository, run_status,
    was_applied,
};
use crate::lock::{LockHolder, LockRecord, LockService, SqlLockService, acquire_with_backoff};
use crate::logic::MigrationContext;
use crate::precondition::{FailPolicy, PreconditionContext, PreconditionOutcome};
use crate::rollback::{self, RollbackSource};
use crate::snapshot::{Snapshot, SnapshotFilter};
use crate::statement::Statement;

/// Requests cancellation of a running command.
///
/// Cancellation is only observed between changesets. The command that
/// observes a request consumes it, so later commands run normally.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Ask the running command to stop at the next changeset boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// A changeset that failed without halting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChangeSet {
    /// The changeset.
    pub id: ChangeSetId,
    /// What went wrong, including the failing statement.
    pub message: String,
}

/// Result of an update run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Shared by every history entry written in this run.
    pub deployment_id: String,
    /// Changesets applied for the first time.
    pub applied: Vec<ChangeSetId>,
    /// Changesets applied again (run-always / run-on-change).
    pub reran: Vec<ChangeSetId>,
    /// Changesets recorded as MARK_RAN by a precondition policy.
    pub mark_ran: Vec<ChangeSetId>,
    /// Changesets skipped by filters or a CONTINUE precondition.
    pub skipped: Vec<ChangeSetId>,
    /// Changesets that were already applied.
    pub up_to_date: usize,
    /// Failures of changesets that do not halt the run.
    pub failed: Vec<FailedChangeSet>,
    /// Warnings produced during the run.
    pub warnings: Vec<String>,
    /// Statements that would have run, in dry-run mode.
    pub statements: Vec<Statement>,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl UpdateReport {
    /// Number of changesets executed in this run.
    pub fn executed_count(&self) -> usize {
        self.applied.len() + self.reran.len()
    }

    /// Whether the run changed anything.
    pub fn has_changes(&self) -> bool {
        self.executed_count() > 0 || !self.mark_ran.is_empty()
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.applied.is_empty() {
            parts.push(format!("{} applied", self.applied.len()));
        }
        if !self.reran.is_empty() {
            parts.push(format!("{} reran", self.reran.len()));
        }
        if !self.mark_ran.is_empty() {
            parts.push(format!("{} marked ran", self.mark_ran.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} FAILED", self.failed.len()));
        }

        if parts.is_empty() {
            format!("No changesets applied ({} up to date)", self.up_to_date)
        } else {
            format!("{} in {}ms", parts.join(", "), self.duration_ms)
        }
    }
}

/// Where one changeset stands against the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetStatus {
    /// The changeset.
    pub id: ChangeSetId,
    /// Run status derived from its history entry.
    pub status: RunStatus,
    /// Whether it counts as applied under the configured checksum mode.
    pub applied: bool,
    /// Whether dbms and context filters select it for this target.
    pub applicable: bool,
    /// Its history entry, if any.
    pub entry: Option<HistoryEntry>,
}

impl ChangeSetStatus {
    /// Whether the next update would execute it.
    pub fn is_pending(&self) -> bool {
        self.applicable && self.status.will_run()
    }
}

/// A changeset undone by a rollback command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolledBack {
    /// The changeset.
    pub id: ChangeSetId,
    /// Where its rollback actions came from.
    pub source: RollbackSource,
    /// The statements run (or, in dry-run mode, that would run).
    pub statements: Vec<Statement>,
}

enum Gate {
    Run,
    Warn(String),
    Skip(String),
    MarkRan(String),
}

enum StatementError {
    TimedOut(Duration),
    Failed(MigrationError),
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut(elapsed) => write!(f, "timed out after {:?}", elapsed),
            Self::Failed(e) => e.fmt(f),
        }
    }
}

/// Applies changelogs to one target database.
pub struct Engine<D, H, L> {
    config: MigrationConfig,
    context: Arc<MigrationContext>,
    dialect: Arc<Dialect>,
    database: Arc<D>,
    history: H,
    lock: L,
    holder: LockHolder,
    cancel: CancelHandle,
}

impl<D: Database> Engine<D, SqlHistoryRepository<D>, SqlLockService<D>> {
    /// Engine keeping history and lock in tables of the target database.
    pub fn with_sql_history(
        config: MigrationConfig,
        context: Arc<MigrationContext>,
        database: Arc<D>,
    ) -> MigrateResult<Self> {
        let depth = config.execution.max_rewrite_depth;
        let runner = || {
            SqlRunner::new(database.clone(), context.clone()).map(|r| r.with_max_depth(depth))
        };
        let history = SqlHistoryRepository::new(runner()?, config.history.table.clone());
        let lock = SqlLockService::new(runner()?, config.history.lock_table.clone());
        Self::new(config, context, database, history, lock)
    }
}

impl<D, H, L> Engine<D, H, L>
where
    D: Database,
    H: HistoryRepository,
    L: LockService,
{
    /// Create an engine. Fails if the configuration is invalid or the
    /// database reports an unknown dialect.
    pub fn new(
        config: MigrationConfig,
        context: Arc<MigrationContext>,
        database: Arc<D>,
        history: H,
        lock: L,
    ) -> MigrateResult<Self> {
        config.validate()?;
        let dialect = context.dialect(database.dialect())?;
        debug!(dialect = dialect.id(), "Created migration engine");
        Ok(Self {
            config,
            context,
            dialect,
            database,
            history,
            lock,
            holder: LockHolder::current(),
            cancel: CancelHandle::default(),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The target dialect.
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// The history repository.
    pub fn history(&self) -> &H {
        &self.history
    }

    /// The lock service.
    pub fn lock_service(&self) -> &L {
        &self.lock
    }

    /// Identity this engine locks with.
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Handle for cancelling a running command from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------
    // Read-only commands
    // ------------------------------------------------------------------

    /// Status of every changeset.
    pub async fn status(&self, changelog: &ChangeLog) -> MigrateResult<Vec<ChangeSetStatus>> {
        let history = self.read_history().await?;
        changelog
            .change_sets
            .iter()
            .map(|cs| {
                let entry = history.iter().find(|e| e.id == cs.id);
                Ok(ChangeSetStatus {
                    id: cs.id.clone(),
                    status: run_status(cs, entry)?,
                    applied: was_applied(cs, &history, self.config.checksum.mode)?,
                    applicable: self.applies(cs),
                    entry: entry.cloned(),
                })
            })
            .collect()
    }

    /// Validate the changelog against the dialect and the stored history.
    ///
    /// Returns the warnings an update would report.
    pub async fn validate(&self, changelog: &ChangeLog) -> MigrateResult<Vec<String>> {
        let history = self.read_history().await?;
        self.check(changelog, &history)
    }

    /// The SQL an update would run, as a script. Preconditions are not
    /// evaluated.
    pub async fn update_sql(&self, changelog: &ChangeLog) -> MigrateResult<String> {
        let history = self.read_history().await?;
        self.check(changelog, &history)?;

        let mut order = next_order(&history);
        let mut script = vec![format!("-- Update script for {}", self.dialect.name())];
        for cs in changelog.change_sets.iter().filter(|cs| self.applies(cs)) {
            let status = run_status(cs, history.iter().find(|e| e.id == cs.id))?;
            if !status.will_run() {
                continue;
            }
            script.push(String::new());
            script.push(format!("-- Changeset {}", cs.id));
            for statement in self.render(cs, &cs.actions)? {
                script.push(statement.to_script());
            }
            if status == RunStatus::NotRan {
                let checksum = cs.checksum(ChecksumVersion::LATEST)?;
                let entry = HistoryEntry::for_change_set(cs, checksum, order, ExecType::Executed);
                for statement in self.history.render_append(&entry)? {
                    script.push(statement.to_script());
                }
                order += 1;
            }
        }
        script.push(String::new());
        Ok(script.join("\n"))
    }

    /// Capture the live schema, without the history and lock tables.
    ///
    /// Refused while another process holds the lock, since a schema
    /// captured mid-migration is meaningless.
    pub async fn snapshot(&self, filter: &SnapshotFilter) -> MigrateResult<Snapshot> {
        self.ensure_unlocked().await?;
        self.capture(filter).await
    }

    /// Differences between the live schema (reference) and `target`.
    pub async fn diff(&self, target: &Snapshot, filter: &SnapshotFilter) -> MigrateResult<Vec<Diff>> {
        let live = self.snapshot(filter).await?;
        Ok(crate::diff::diff(&live, &target.filtered(filter)))
    }

    /// A changelog that brings the live schema to `target`.
    pub async fn generate_changelog(
        &self,
        target: &Snapshot,
        filter: &SnapshotFilter,
        options: &ChangeLogOptions,
    ) -> MigrateResult<ChangeLog> {
        let live = self.snapshot(filter).await?;
        let target = target.filtered(filter);
        let diffs = crate::diff::diff(&live, &target);
        let actions = generate_actions(&diffs, &live, &target)?;
        info!(diffs = diffs.len(), actions = actions.len(), "Generated changelog from diff");
        generate_changelog(&actions, options)
    }

    /// The current lock, if any.
    pub async fn list_locks(&self) -> MigrateResult<Option<LockRecord>> {
        self.lock.initialize().await?;
        self.lock.current().await
    }

    // ------------------------------------------------------------------
    // Mutating commands
    // ------------------------------------------------------------------

    /// Apply every pending changeset.
    pub async fn update(&self, changelog: &ChangeLog) -> MigrateResult<UpdateReport> {
        self.acquire().await?;
        let result = self.update_locked(changelog).await;
        self.release(result).await
    }

    /// Record every pending changeset as MARK_RAN without executing it.
    pub async fn changelog_sync(&self, changelog: &ChangeLog) -> MigrateResult<Vec<ChangeSetId>> {
        self.acquire().await?;
        let result = self.sync_locked(changelog).await;
        self.release(result).await
    }

    /// Null out stored checksums; the next update stores fresh ones.
    pub async fn clear_checksums(&self) -> MigrateResult<()> {
        self.acquire().await?;
        let result = async {
            self.history.initialize().await?;
            self.history.clear_checksums().await?;
            info!("Cleared stored checksums");
            Ok(())
        }
        .await;
        self.release(result).await
    }

    /// Tag the most recently applied changeset.
    pub async fn tag(&self, tag: &str) -> MigrateResult<()> {
        self.acquire().await?;
        let result = async {
            self.history.initialize().await?;
            if !self.history.tag_last(tag).await? {
                return Err(MigrationError::NotFound("history entry to tag".to_string()));
            }
            info!(tag, "Tagged database state");
            Ok(())
        }
        .await;
        self.release(result).await
    }

    /// Roll back the last `count` applied changesets.
    pub async fn rollback_count(
        &self,
        changelog: &ChangeLog,
        count: usize,
    ) -> MigrateResult<Vec<RolledBack>> {
        self.acquire().await?;
        let result = async {
            let mut entries = self.read_history().await?;
            entries.reverse();
            entries.truncate(count);
            self.rollback_entries(changelog, entries).await
        }
        .await;
        self.release(result).await
    }

    /// Roll back every changeset applied after the entry carrying `tag`.
    pub async fn rollback_to_tag(&self, changelog: &ChangeLog, tag: &str) -> MigrateResult<Vec<RolledBack>> {
        self.acquire().await?;
        let result = async {
            let entries = self.read_history().await?;
            let tagged = entries
                .iter()
                .rev()
                .find(|e| e.tag.as_deref() == Some(tag))
                .map(|e| e.order_executed)
                .ok_or_else(|| MigrationError::NotFound(format!("tag {}", tag)))?;
            let later = entries
                .into_iter()
                .rev()
                .filter(|e| e.order_executed > tagged)
                .collect();
            self.rollback_entries(changelog, later).await
        }
        .await;
        self.release(result).await
    }

    /// Release the lock whoever holds it. For locks left by crashed processes.
    pub async fn release_locks(&self) -> MigrateResult<()> {
        self.lock.initialize().await?;
        if let Some(record) = self.lock.current().await? {
            warn!(lock = %record.describe(), "Forcibly releasing change log lock");
        }
        self.lock.force_release().await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn acquire(&self) -> MigrateResult<()> {
        self.lock.initialize().await?;
        acquire_with_backoff(&self.lock, &self.holder, &self.config.lock).await
    }

    async fn release<T>(&self, result: MigrateResult<T>) -> MigrateResult<T> {
        match self.lock.release(&self.holder).await {
            Ok(()) => {
                debug!(holder = %self.holder, "Released change log lock");
                result
            }
            Err(e) => {
                warn!(error = %e, "Could not release change log lock");
                result.and(Err(e))
            }
        }
    }

    async fn ensure_unlocked(&self) -> MigrateResult<()> {
        self.lock.initialize().await?;
        match self.lock.current().await? {
            Some(record) if record.holder.as_ref() != Some(&self.holder) => {
                Err(MigrationError::LockHeld(record.describe()))
            }
            _ => Ok(()),
        }
    }

    async fn read_history(&self) -> MigrateResult<Vec<HistoryEntry>> {
        self.history.initialize().await?;
        self.history.entries().await
    }

    fn applies(&self, cs: &ChangeSet) -> bool {
        cs.applies_to_dbms(self.dialect.id()) && cs.matches_contexts(&self.config.execution.contexts)
    }

    fn render(&self, cs: &ChangeSet, actions: &[Action]) -> MigrateResult<Vec<Statement>> {
        self.context
            .resolve_all(actions, &self.dialect, self.config.execution.max_rewrite_depth)
            .map_err(|e| attribute(e, &cs.id))
    }

    fn unknown_dbms(&self, cs: &ChangeSet) -> Option<MigrationError> {
        if !self.config.execution.fail_on_unknown_dialect {
            return None;
        }
        let unknown: Vec<&str> = cs
            .dbms
            .iter()
            .flat_map(|d| d.split(','))
            .map(|d| d.trim().trim_start_matches('!'))
            .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("all") && !d.eq_ignore_ascii_case("none"))
            .filter(|d| self.context.dialects.get(&d.to_lowercase()).is_err())
            .collect();
        (!unknown.is_empty()).then(|| {
            MigrationError::configuration(format!(
                "changeset '{}' names unknown dbms: {}",
                cs.id,
                unknown.join(", ")
            ))
        })
    }

    /// Pre-run pass. Collects every problem instead of stopping at the first.
    fn check(&self, changelog: &ChangeLog, history: &[HistoryEntry]) -> MigrateResult<Vec<String>> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        for cs in &changelog.change_sets {
            problems.extend(self.unknown_dbms(cs));
            if let Some(preconditions) = &cs.preconditions {
                let errors = preconditions.validate();
                if errors.has_errors() {
                    problems.push(MigrationError::Validation {
                        change_set: cs.id.to_string(),
                        dialect: self.dialect.id().to_string(),
                        errors,
                    });
                }
            }
            if self.applies(cs) {
                problems.extend(self.render(cs, &cs.actions).err());
                if let Some(rollback) = &cs.rollback {
                    problems.extend(self.render(cs, rollback).err());
                }
            }

            let entry = history.iter().find(|e| e.id == cs.id);
            if run_status(cs, entry)? != RunStatus::InvalidChecksum {
                continue;
            }
            let Some(stored) = entry.and_then(|e| e.checksum.as_ref()) else {
                continue;
            };
            let actual = cs.checksum(stored.version)?;
            if self.config.checksum.update_checksums {
                warnings.push(format!(
                    "Checksum of '{}' changed from {} to {}; the stored value will be updated",
                    cs.id, stored, actual
                ));
            } else if self.config.checksum.mode == ChecksumMode::Lenient {
                warn!(change_set = %cs.id, stored = %stored, computed = %actual, "Checksum mismatch accepted");
                warnings.push(format!(
                    "Checksum of '{}' no longer matches (stored {}, computed {})",
                    cs.id, stored, actual
                ));
            } else {
                problems.push(MigrationError::ChecksumMismatch {
                    id: cs.id.to_string(),
                    expected: stored.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        match problems.len() {
            0 => Ok(warnings),
            1 => Err(problems.remove(0)),
            _ => Err(MigrationError::ChangeLogInvalid(problems)),
        }
    }

    async fn update_locked(&self, changelog: &ChangeLog) -> MigrateResult<UpdateReport> {
        let started = Instant::now();
        let mut history = self.read_history().await?;
        let mut report = UpdateReport {
            deployment_id: Uuid::new_v4().to_string(),
            warnings: self.check(changelog, &history)?,
            ..UpdateReport::default()
        };
        let dry_run = self.config.execution.dry_run;
        let mut order = next_order(&history);

        for (completed, cs) in changelog.change_sets.iter().enumerate() {
            if self.cancel.take() {
                warn!(completed, "Update cancelled at changeset boundary");
                return Err(MigrationError::Cancelled { completed });
            }
            if !self.applies(cs) {
                debug!(change_set = %cs.id, "Changeset filtered out by dbms or context");
                report.skipped.push(cs.id.clone());
                continue;
            }

            let entry = history.iter().find(|e| e.id == cs.id).cloned();
            let status = run_status(cs, entry.as_ref())?;
            match status {
                RunStatus::AlreadyRan | RunStatus::MarkRan => {
                    if !dry_run {
                        self.refresh_checksum(cs, entry.as_ref()).await?;
                    }
                    report.up_to_date += 1;
                    continue;
                }
                RunStatus::InvalidChecksum => {
                    if self.config.checksum.update_checksums && !dry_run {
                        let checksum = cs.checksum(ChecksumVersion::LATEST)?;
                        self.history.update_checksum(&cs.id, &checksum).await?;
                        info!(change_set = %cs.id, checksum = %checksum, "Updated stored checksum");
                    }
                    report.up_to_date += 1;
                    continue;
                }
                RunStatus::NotRan | RunStatus::RunAgain => {}
            }

            match self.check_preconditions(cs, &history).await? {
                Gate::Run => {}
                Gate::Warn(note) => report.warnings.push(note),
                Gate::Skip(note) => {
                    report.warnings.push(note);
                    report.skipped.push(cs.id.clone());
                    continue;
                }
                Gate::MarkRan(note) => {
                    report.warnings.push(note);
                    if !dry_run {
                        match &entry {
                            Some(existing) => {
                                let marked = self.rerecord(
                                    cs,
                                    existing,
                                    ExecType::MarkRan,
                                    &report.deployment_id,
                                    None,
                                )?;
                                self.history.replace(&marked).await?;
                            }
                            None => {
                                let recorded = self
                                    .record(cs, ExecType::MarkRan, order, &report.deployment_id, None)
                                    .await?;
                                history.push(recorded);
                                order += 1;
                            }
                        }
                    }
                    report.mark_ran.push(cs.id.clone());
                    continue;
                }
            }

            let statements = self.render(cs, &cs.actions)?;
            if dry_run {
                report.warnings.push(format!("[DRY RUN] Would apply: {}", cs.id));
                report.statements.extend(statements);
                report.applied.push(cs.id.clone());
                continue;
            }

            let before = self.rollback_baseline(cs).await?;
            info!(
                change_set = %cs.id,
                dialect = self.dialect.id(),
                statements = statements.len(),
                "Applying changeset"
            );
            if let Err(e) = self.execute(cs, &statements).await {
                if cs.fail_on_error {
                    error!(change_set = %cs.id, error = %e, "Changeset failed; halting run");
                    return Err(e);
                }
                warn!(change_set = %cs.id, error = %e, "Changeset failed; continuing");
                report.failed.push(FailedChangeSet {
                    id: cs.id.clone(),
                    message: e.to_string(),
                });
                continue;
            }
            let inferred = match before {
                Some(before) => self.infer_rollback(cs, &before).await,
                None => None,
            };

            match (status, entry) {
                (RunStatus::RunAgain, Some(existing)) => {
                    let rerun = self.rerecord(
                        cs,
                        &existing,
                        ExecType::Reran,
                        &report.deployment_id,
                        inferred,
                    )?;
                    self.history.replace(&rerun).await?;
                    report.reran.push(cs.id.clone());
                }
                _ => {
                    let recorded = self
                        .record(cs, ExecType::Executed, order, &report.deployment_id, inferred)
                        .await?;
                    history.push(recorded);
                    order += 1;
                    report.applied.push(cs.id.clone());
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as i64;
        info!(summary = %report.summary(), "Update finished");
        Ok(report)
    }

    async fn sync_locked(&self, changelog: &ChangeLog) -> MigrateResult<Vec<ChangeSetId>> {
        let history = self.read_history().await?;
        let deployment_id = Uuid::new_v4().to_string();
        let mut order = next_order(&history);
        let mut marked = Vec::new();

        for cs in changelog.change_sets.iter().filter(|cs| self.applies(cs)) {
            if run_status(cs, history.iter().find(|e| e.id == cs.id))? != RunStatus::NotRan {
                continue;
            }
            if !self.config.execution.dry_run {
                self.record(cs, ExecType::MarkRan, order, &deployment_id, None)
                    .await?;
                order += 1;
            }
            marked.push(cs.id.clone());
        }
        info!(count = marked.len(), "Marked changesets as ran");
        Ok(marked)
    }

    async fn record(
        &self,
        cs: &ChangeSet,
        exec_type: ExecType,
        order: i64,
        deployment_id: &str,
        inferred_rollback: Option<Vec<Action>>,
    ) -> MigrateResult<HistoryEntry> {
        let mut entry =
            HistoryEntry::for_change_set(cs, cs.checksum(ChecksumVersion::LATEST)?, order, exec_type);
        entry.deployment_id = Some(deployment_id.to_string());
        entry.inferred_rollback = inferred_rollback;
        self.history.append(&entry).await?;
        debug!(change_set = %cs.id, exec_type = %exec_type, order, "Recorded history entry");
        Ok(entry)
    }

    /// Entry replacing `existing` in place: same order and tag, so a rerun
    /// never adds a second row for the identifier.
    fn rerecord(
        &self,
        cs: &ChangeSet,
        existing: &HistoryEntry,
        exec_type: ExecType,
        deployment_id: &str,
        inferred_rollback: Option<Vec<Action>>,
    ) -> MigrateResult<HistoryEntry> {
        let mut entry = HistoryEntry::for_change_set(
            cs,
            cs.checksum(ChecksumVersion::LATEST)?,
            existing.order_executed,
            exec_type,
        );
        entry.tag = existing.tag.clone();
        entry.deployment_id = Some(deployment_id.to_string());
        entry.inferred_rollback = inferred_rollback.or_else(|| existing.inferred_rollback.clone());
        Ok(entry)
    }

    /// Store a fresh checksum for a cleared entry, or upgrade an old
    /// generation when the policy asks for it.
    async fn refresh_checksum(&self, cs: &ChangeSet, entry: Option<&HistoryEntry>) -> MigrateResult<()> {
        let Some(entry) = entry else {
            return Ok(());
        };
        let refresh = match &entry.checksum {
            None => true,
            Some(stored) => {
                self.config.checksum.upgrade == ChecksumUpgradePolicy::UpgradeOnValidate
                    && stored.version < ChecksumVersion::LATEST
                    && cs.checksum(stored.version)? == *stored
            }
        };
        if refresh {
            let latest = cs.checksum(ChecksumVersion::LATEST)?;
            debug!(change_set = %cs.id, checksum = %latest, "Storing current checksum");
            self.history.update_checksum(&cs.id, &latest).await?;
        }
        Ok(())
    }

    async fn check_preconditions(&self, cs: &ChangeSet, history: &[HistoryEntry]) -> MigrateResult<Gate> {
        let Some(preconditions) = &cs.preconditions else {
            return Ok(Gate::Run);
        };
        let ctx = PreconditionContext::new(&*self.database, &self.dialect, history);
        let (policy, message, failed) = match preconditions.check(&ctx).await {
            PreconditionOutcome::Passed => return Ok(Gate::Run),
            PreconditionOutcome::Failed(message) => (preconditions.on_fail, message, true),
            PreconditionOutcome::Errored(message) => (preconditions.on_error, message, false),
        };
        let note = format!(
            "Preconditions of '{}' {}: {}",
            cs.id,
            if failed { "failed" } else { "could not be evaluated" },
            message
        );

        match policy {
            FailPolicy::Halt if failed => Err(MigrationError::PreconditionFailed {
                change_set: cs.id.to_string(),
                message,
            }),
            FailPolicy::Halt => Err(MigrationError::PreconditionError {
                change_set: cs.id.to_string(),
                message,
            }),
            FailPolicy::Continue => {
                info!(change_set = %cs.id, %message, "Skipping changeset");
                Ok(Gate::Skip(note))
            }
            FailPolicy::MarkRan => {
                info!(change_set = %cs.id, %message, "Marking changeset as ran");
                Ok(Gate::MarkRan(note))
            }
            FailPolicy::Warn => {
                warn!(change_set = %cs.id, %message, "Running changeset despite preconditions");
                Ok(Gate::Warn(note))
            }
        }
    }

    /// Run a changeset's statements as one unit.
    ///
    /// With transactional DDL a failure rolls the whole changeset back;
    /// without it, statements before the failing one stay applied.
    async fn execute(&self, cs: &ChangeSet, statements: &[Statement]) -> MigrateResult<()> {
        let transactional = cs.run_in_transaction && self.dialect.transactional_ddl();
        if transactional {
            self.database.begin().await?;
        }

        for (index, statement) in statements.iter().enumerate() {
            debug!(change_set = %cs.id, sql = %statement.sql, "Executing statement");
            let Err(e) = self.run_statement(&statement.sql).await else {
                continue;
            };
            if transactional {
                if let Err(rollback) = self.database.rollback().await {
                    warn!(change_set = %cs.id, error = %rollback, "Rollback after failure failed");
                }
            }
            error!(change_set = %cs.id, index, sql = %statement.sql, error = %e, "Statement failed");
            return Err(match e {
                StatementError::TimedOut(elapsed) => MigrationError::Timeout {
                    change_set: cs.id.to_string(),
                    dialect: self.dialect.id().to_string(),
                    statement: statement.sql.clone(),
                    index,
                    rolled_back: transactional,
                    elapsed,
                    retryable: self.config.execution.timeouts_retryable,
                },
                StatementError::Failed(MigrationError::Database(message)) => {
                    self.execution_error(cs, statement, index, transactional, message)
                }
                StatementError::Failed(other) => {
                    self.execution_error(cs, statement, index, transactional, other.to_string())
                }
            });
        }

        if transactional {
            self.database.commit().await?;
        }
        Ok(())
    }

    fn execution_error(
        &self,
        cs: &ChangeSet,
        statement: &Statement,
        index: usize,
        rolled_back: bool,
        message: String,
    ) -> MigrationError {
        MigrationError::Execution {
            change_set: cs.id.to_string(),
            dialect: self.dialect.id().to_string(),
            statement: statement.sql.clone(),
            index,
            rolled_back,
            message,
        }
    }

    async fn run_statement(&self, sql: &str) -> Result<u64, StatementError> {
        let Some(limit) = self.config.execution.statement_timeout else {
            return self.database.execute(sql).await.map_err(StatementError::Failed);
        };
        tokio::time::timeout(limit, self.database.execute(sql))
            .await
            .map_err(|_| StatementError::TimedOut(limit))?
            .map_err(StatementError::Failed)
    }

    fn bookkeeping_filter(&self, filter: &SnapshotFilter) -> MigrateResult<SnapshotFilter> {
        filter
            .clone()
            .exclude(&regex_lite::escape(&self.config.history.table))?
            .exclude(&regex_lite::escape(&self.config.history.lock_table))
    }

    async fn capture(&self, filter: &SnapshotFilter) -> MigrateResult<Snapshot> {
        let filter = self.bookkeeping_filter(filter)?;
        Ok(self.database.snapshot(&filter).await?.filtered(&filter))
    }

    async fn rollback_baseline(&self, cs: &ChangeSet) -> MigrateResult<Option<Snapshot>> {
        if !self.config.execution.infer_rollback || cs.rollback.is_some() {
            return Ok(None);
        }
        Ok(Some(self.capture(&SnapshotFilter::all()).await?))
    }

    async fn infer_rollback(&self, cs: &ChangeSet, before: &Snapshot) -> Option<Vec<Action>> {
        let inferred = match self.capture(&SnapshotFilter::all()).await {
            Ok(after) => rollback::infer(before, &after),
            Err(e) => Err(e),
        };
        match inferred {
            Ok(actions) if actions.is_empty() => None,
            Ok(actions) => {
                debug!(change_set = %cs.id, actions = actions.len(), "Inferred rollback");
                Some(actions)
            }
            Err(e) => {
                warn!(change_set = %cs.id, error = %e, "Could not infer rollback");
                None
            }
        }
    }

    async fn rollback_entries(
        &self,
        changelog: &ChangeLog,
        entries: Vec<HistoryEntry>,
    ) -> MigrateResult<Vec<RolledBack>> {
        // Resolve everything first so a missing rollback fails before any SQL.
        let mut plan = Vec::new();
        for entry in &entries {
            let cs = changelog.get(&entry.id).ok_or_else(|| {
                MigrationError::rollback_failed(format!(
                    "changeset '{}' is not in the changelog",
                    entry.id
                ))
            })?;
            let (source, actions) = rollback::select(cs, Some(entry))?;
            let statements = self.render(cs, &actions)?;
            plan.push((cs, source, statements));
        }

        let mut done = Vec::new();
        for (completed, (cs, source, statements)) in plan.into_iter().enumerate() {
            if self.cancel.take() {
                warn!(completed, "Rollback cancelled at changeset boundary");
                return Err(MigrationError::Cancelled { completed });
            }
            info!(change_set = %cs.id, source = %source, "Rolling back changeset");
            if !self.config.execution.dry_run {
                self.execute(cs, &statements).await?;
                self.history.remove(&cs.id).await?;
            }
            done.push(RolledBack {
                id: cs.id.clone(),
                source,
                statements,
            });
        }
        Ok(done)
    }
}

fn next_order(history: &[HistoryEntry]) -> i64 {
    history.iter().map(|e| e.order_executed).max().unwrap_or(0) + 1
}

/// Attach the changeset identity to errors raised while rendering it.
fn attribute(error: MigrationError, id: &ChangeSetId) -> MigrationError {
    match error {
        MigrationError::Validation {
            change_set,
            dialect,
            errors,
        } if change_set.is_empty() => MigrationError::Validation {
            change_set: id.to_string(),
            dialect,
            errors,
        },
        MigrationError::Configuration(message) => {
            MigrationError::Configuration(format!("changeset '{}': {}", id, message))
        }
        MigrationError::RewriteLimit {
            action,
            dialect,
            depth,
            reason,
        } => MigrationError::RewriteLimit {
            action,
            dialect,
            depth,
            reason: format!("{} in changeset '{}'", reason, id),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::action::{ColumnDef, DataType};
    use crate::checksum::Checksum;
    use crate::driver::{Driver, Row, SnapshotSource};
    use crate::history::InMemoryHistory;
    use crate::lock::{AcquireOutcome, InMemoryLock};
    use crate::precondition::{Precondition, PreconditionContainer};
    use pretty_assertions::assert_eq;

    struct MockDb {
        dialect: &'static str,
        fail_on: Option<&'static str>,
        delay: Option<Duration>,
        log: Mutex<Vec<String>>,
    }

    impl MockDb {
        fn new(dialect: &'static str) -> Self {
            Self {
                dialect,
                fail_on: None,
                delay: None,
                log: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, marker: &'static str) -> Self {
            self.fail_on = Some(marker);
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl Driver for MockDb {
        fn dialect(&self) -> &str {
            self.dialect
        }

        async fn execute(&self, sql: &str) -> MigrateResult<u64> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on.is_some_and(|m| sql.contains(m)) {
                return Err(MigrationError::database(format!("syntax error near '{}'", sql)));
            }
            self.log.lock().push(sql.to_string());
            Ok(0)
        }

        async fn query(&self, _sql: &str) -> MigrateResult<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn begin(&self) -> MigrateResult<()> {
            self.log.lock().push("BEGIN".to_string());
            Ok(())
        }

        async fn commit(&self) -> MigrateResult<()> {
            self.log.lock().push("COMMIT".to_string());
            Ok(())
        }

        async fn rollback(&self) -> MigrateResult<()> {
            self.log.lock().push("ROLLBACK".to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotSource for MockDb {
        async fn snapshot(&self, _filter: &SnapshotFilter) -> MigrateResult<Snapshot> {
            Ok(Snapshot::empty())
        }
    }

    type TestEngine = Engine<MockDb, InMemoryHistory, Arc<InMemoryLock>>;

    fn engine_with(db: MockDb, config: MigrationConfig, lock: Arc<InMemoryLock>) -> (TestEngine, Arc<MockDb>) {
        let db = Arc::new(db);
        let engine = Engine::new(
            config,
            Arc::new(MigrationContext::standard()),
            db.clone(),
            InMemoryHistory::new(),
            lock,
        )
        .unwrap();
        (engine, db)
    }

    fn engine(db: MockDb) -> (TestEngine, Arc<MockDb>) {
        engine_with(db, MigrationConfig::new(), Arc::new(InMemoryLock::new()))
    }

    fn create(id: &str, table: &str) -> ChangeSet {
        ChangeSet::new(id, "alice", "db.json").action(Action::create_table(
            table,
            vec![ColumnDef::new("id", DataType::Integer)],
        ))
    }

    fn log_of(change_sets: Vec<ChangeSet>) -> ChangeLog {
        ChangeLog::new(change_sets).unwrap()
    }

    #[tokio::test]
    async fn test_second_update_applies_nothing() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![create("1", "t1"), create("2", "t2")]);

        let first = engine.update(&log).await.unwrap();
        assert_eq!(first.applied.len(), 2);
        let executed = db.log();
        assert_eq!(executed.iter().filter(|s| s.starts_with("CREATE TABLE")).count(), 2);

        let second = engine.update(&log).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.up_to_date, 2);
        assert_eq!(db.log(), executed);

        let orders: Vec<i64> = engine
            .history()
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.order_executed)
            .collect();
        assert_eq!(orders, vec![1, 2]);
        assert!(engine.list_locks().await.unwrap().is_none());
    }

    async fn seed_modified(engine: &TestEngine) -> ChangeLog {
        let original = create("1", "t1");
        let entry = HistoryEntry::for_change_set(
            &original,
            original.checksum(ChecksumVersion::LATEST).unwrap(),
            1,
            ExecType::Executed,
        );
        engine.history().append(&entry).await.unwrap();
        let modified = create("1", "t1_renamed");
        log_of(vec![modified, create("2", "t2")])
    }

    #[tokio::test]
    async fn test_strict_checksum_mismatch_fails_before_sql() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = seed_modified(&engine).await;

        let err = engine.update(&log).await.unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { ref id, .. } if id == "db.json::1::alice"));
        assert!(err.is_pre_execution());
        assert!(db.log().is_empty());
    }

    #[tokio::test]
    async fn test_lenient_mode_warns_and_continues() {
        let config = MigrationConfig::new().checksum_mode(ChecksumMode::Lenient);
        let (engine, _db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));
        let log = seed_modified(&engine).await;

        let report = engine.update(&log).await.unwrap();
        assert_eq!(report.applied, vec![ChangeSetId::new("2", "alice", "db.json")]);
        assert!(report.warnings.iter().any(|w| w.contains("no longer matches")));
    }

    #[tokio::test]
    async fn test_update_checksums_overwrites_stored_value() {
        let config = MigrationConfig::new().update_checksums(true);
        let (engine, _db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));
        let log = seed_modified(&engine).await;

        engine.update(&log).await.unwrap();
        let stored = engine
            .history()
            .find(&ChangeSetId::new("1", "alice", "db.json"))
            .await
            .unwrap()
            .unwrap();
        let expected = log.change_sets[0].checksum(ChecksumVersion::LATEST).unwrap();
        assert_eq!(stored.checksum, Some(expected));
    }

    #[tokio::test]
    async fn test_held_lock_times_out_without_executing() {
        let lock = Arc::new(InMemoryLock::new());
        let other = LockHolder::current();
        assert_eq!(lock.try_acquire(&other).await.unwrap(), AcquireOutcome::Acquired);

        let config = MigrationConfig::new()
            .lock_wait_timeout(Duration::from_millis(60))
            .lock_recheck_interval(Duration::from_millis(10));
        let (engine, db) = engine_with(MockDb::new("sqlite"), config, lock);

        let err = engine.update(&log_of(vec![create("1", "t1")])).await.unwrap_err();
        match err {
            MigrationError::LockTimeout { holder, .. } => {
                assert!(holder.unwrap().contains(&other.host));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(db.log().is_empty());
        assert!(engine.history().entries().await.unwrap().is_empty());
        assert!(matches!(
            engine.snapshot(&SnapshotFilter::all()).await,
            Err(MigrationError::LockHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_transactional_failure_rolls_back_change_set() {
        let (engine, db) = engine(MockDb::new("sqlite").failing_on("boom"));
        let cs = ChangeSet::new("1", "alice", "db.json")
            .action(Action::sql("CREATE TABLE a (id INTEGER)"))
            .action(Action::sql("boom"));

        let err = engine.update(&log_of(vec![cs])).await.unwrap_err();
        match err {
            MigrationError::Execution {
                change_set,
                index,
                rolled_back,
                statement,
                ..
            } => {
                assert_eq!(change_set, "db.json::1::alice");
                assert_eq!(index, 1);
                assert!(rolled_back);
                assert_eq!(statement, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(db.log(), vec!["BEGIN", "CREATE TABLE a (id INTEGER)", "ROLLBACK"]);
        assert!(engine.history().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_transactional_failure_keeps_earlier_statements() {
        let (engine, db) = engine(MockDb::new("mysql").failing_on("boom"));
        let cs = ChangeSet::new("1", "alice", "db.json")
            .action(Action::sql("CREATE TABLE a (id INTEGER)"))
            .action(Action::sql("boom"));

        let err = engine.update(&log_of(vec![cs])).await.unwrap_err();
        assert!(matches!(err, MigrationError::Execution { rolled_back: false, index: 1, .. }));
        assert_eq!(db.log(), vec!["CREATE TABLE a (id INTEGER)"]);
    }

    #[tokio::test]
    async fn test_continue_on_error_reports_failure() {
        let (engine, _db) = engine(MockDb::new("sqlite").failing_on("boom"));
        let broken = ChangeSet::new("1", "alice", "db.json")
            .action(Action::sql("boom"))
            .continue_on_error();

        let report = engine.update(&log_of(vec![broken, create("2", "t2")])).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].message.contains("boom"));
        assert_eq!(report.applied, vec![ChangeSetId::new("2", "alice", "db.json")]);
        assert!(report.summary().contains("1 FAILED"));
    }

    #[tokio::test]
    async fn test_precondition_policies() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let missing = |policy: FailPolicy| {
            PreconditionContainer::new()
                .condition(Precondition::TableExists {
                    table: "missing".into(),
                })
                .on_fail(policy)
        };
        let log = log_of(vec![
            create("1", "t1").preconditions(missing(FailPolicy::Warn)),
            create("2", "t2").preconditions(missing(FailPolicy::MarkRan)),
            create("3", "t3").preconditions(missing(FailPolicy::Continue)),
            create("4", "t4").preconditions(missing(FailPolicy::Halt)),
            create("5", "t5"),
        ]);

        let err = engine.update(&log).await.unwrap_err();
        assert!(matches!(err, MigrationError::PreconditionFailed { ref change_set, .. } if change_set == "db.json::4::alice"));

        let entries = engine.history().entries().await.unwrap();
        let recorded: Vec<(&str, ExecType)> = entries
            .iter()
            .map(|e| (e.id.id.as_str(), e.exec_type))
            .collect();
        assert_eq!(recorded, vec![("1", ExecType::Executed), ("2", ExecType::MarkRan)]);
        assert_eq!(db.log().iter().filter(|s| s.starts_with("CREATE TABLE")).count(), 1);
    }

    #[tokio::test]
    async fn test_run_always_replaces_history_entry() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![
            ChangeSet::new("1", "alice", "db.json")
                .action(Action::sql("UPDATE counters SET n = n + 1"))
                .run_always(),
        ]);

        engine.update(&log).await.unwrap();
        let report = engine.update(&log).await.unwrap();
        assert_eq!(report.reran.len(), 1);

        let entries = engine.history().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exec_type, ExecType::Reran);
        assert_eq!(entries[0].order_executed, 1);
        assert_eq!(db.log().iter().filter(|s| s.starts_with("UPDATE")).count(), 2);
    }

    #[tokio::test]
    async fn test_mark_ran_rerun_replaces_history_entry() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let bump = || {
            ChangeSet::new("1", "alice", "db.json")
                .action(Action::sql("UPDATE counters SET n = n + 1"))
                .run_always()
        };
        engine.update(&log_of(vec![bump()])).await.unwrap();
        engine.tag("v1").await.unwrap();

        let gated = bump().preconditions(
            PreconditionContainer::new()
                .condition(Precondition::TableExists {
                    table: "missing".into(),
                })
                .on_fail(FailPolicy::MarkRan),
        );
        let report = engine.update(&log_of(vec![gated])).await.unwrap();
        assert_eq!(report.mark_ran.len(), 1);

        let entries = engine.history().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exec_type, ExecType::MarkRan);
        assert_eq!(entries[0].order_executed, 1);
        assert_eq!(entries[0].tag.as_deref(), Some("v1"));
        assert_eq!(db.log().iter().filter(|s| s.starts_with("UPDATE")).count(), 1);
    }

    async fn seed_v1(engine: &TestEngine) -> ChangeSet {
        let cs = create("1", "t1");
        let entry = HistoryEntry::for_change_set(
            &cs,
            cs.checksum(ChecksumVersion::V1).unwrap(),
            1,
            ExecType::Executed,
        );
        engine.history().append(&entry).await.unwrap();
        cs
    }

    async fn stored_checksum(engine: &TestEngine) -> Checksum {
        engine
            .history()
            .find(&ChangeSetId::new("1", "alice", "db.json"))
            .await
            .unwrap()
            .unwrap()
            .checksum
            .unwrap()
    }

    #[tokio::test]
    async fn test_preserve_keeps_old_checksum_generation() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let cs = seed_v1(&engine).await;

        let report = engine.update(&log_of(vec![cs.clone()])).await.unwrap();
        assert_eq!(report.up_to_date, 1);
        assert!(db.log().is_empty());
        assert_eq!(stored_checksum(&engine).await, cs.checksum(ChecksumVersion::V1).unwrap());
    }

    #[tokio::test]
    async fn test_upgrade_on_validate_rewrites_to_latest() {
        let config = MigrationConfig::new().checksum_upgrade(ChecksumUpgradePolicy::UpgradeOnValidate);
        let (engine, db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));
        let cs = seed_v1(&engine).await;

        let report = engine.update(&log_of(vec![cs.clone()])).await.unwrap();
        assert_eq!(report.up_to_date, 1);
        assert!(db.log().is_empty());
        let stored = stored_checksum(&engine).await;
        assert_eq!(stored.version, ChecksumVersion::LATEST);
        assert_eq!(stored, cs.checksum(ChecksumVersion::LATEST).unwrap());
    }

    #[tokio::test]
    async fn test_upgrade_on_validate_skips_mismatched_entry() {
        let config = MigrationConfig::new()
            .checksum_mode(ChecksumMode::Lenient)
            .checksum_upgrade(ChecksumUpgradePolicy::UpgradeOnValidate);
        let (engine, _db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));
        let original = seed_v1(&engine).await;

        let edited = create("1", "t1_renamed");
        engine.update(&log_of(vec![edited])).await.unwrap();
        assert_eq!(
            stored_checksum(&engine).await,
            original.checksum(ChecksumVersion::V1).unwrap()
        );
    }

    #[tokio::test]
    async fn test_dry_run_collects_statements() {
        let config = MigrationConfig::new().dry_run(true);
        let (engine, db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));

        let report = engine.update(&log_of(vec![create("1", "t1")])).await.unwrap();
        assert_eq!(report.statements.len(), 1);
        assert!(db.log().is_empty());
        assert!(engine.history().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_sql_script() {
        let (engine, db) = engine(MockDb::new("postgresql"));
        let script = engine.update_sql(&log_of(vec![create("1", "t1")])).await.unwrap();
        assert!(script.starts_with("-- Update script for PostgreSQL"));
        assert!(script.contains("-- Changeset db.json::1::alice"));
        assert!(script.contains("CREATE TABLE t1 (id INTEGER);"));
        assert!(db.log().is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_names_change_set() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let cs = ChangeSet::new("9", "alice", "db.json").action(Action::CreateSequence {
            name: "seq".into(),
            start: None,
            increment: None,
        });

        let err = engine.update(&log_of(vec![create("1", "t1"), cs])).await.unwrap_err();
        match err {
            MigrationError::Validation {
                change_set,
                dialect,
                errors,
            } => {
                assert_eq!(change_set, "db.json::9::alice");
                assert_eq!(dialect, "sqlite");
                assert!(errors.iter().any(|e| e.unsupported));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(db.log().is_empty());
    }

    #[tokio::test]
    async fn test_statement_timeout() {
        let mut db = MockDb::new("sqlite");
        db.delay = Some(Duration::from_millis(200));
        let config = MigrationConfig::new().statement_timeout(Duration::from_millis(20));
        let (engine, _db) = engine_with(db, config, Arc::new(InMemoryLock::new()));

        let err = engine.update(&log_of(vec![create("1", "t1")])).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("db.json::1::alice"));
        match err {
            MigrationError::Timeout {
                change_set,
                dialect,
                statement,
                index,
                rolled_back,
                retryable,
                ..
            } => {
                assert_eq!(change_set, "db.json::1::alice");
                assert_eq!(dialect, "sqlite");
                assert_eq!(statement, "CREATE TABLE t1 (id INTEGER)");
                assert_eq!(index, 0);
                assert!(rolled_back);
                assert!(retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.history().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_at_boundary_and_releases_lock() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        engine.cancel_handle().cancel();

        let log = log_of(vec![create("1", "t1")]);
        let err = engine.update(&log).await.unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled { completed: 0 }));
        assert!(db.log().is_empty());
        assert!(engine.list_locks().await.unwrap().is_none());

        // The request was consumed by the cancelled run.
        assert!(!engine.cancel_handle().is_cancelled());
        let report = engine.update(&log).await.unwrap();
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_count_runs_inverse() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![create("1", "t1"), create("2", "t2")]);
        engine.update(&log).await.unwrap();

        let undone = engine.rollback_count(&log, 1).await.unwrap();
        assert_eq!(undone.len(), 1);
        assert_eq!(undone[0].id, ChangeSetId::new("2", "alice", "db.json"));
        assert_eq!(undone[0].source, RollbackSource::Inverse);
        assert!(db.log().iter().any(|s| s == "DROP TABLE t2"));
        assert_eq!(engine.history().entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_to_tag() {
        let (engine, _db) = engine(MockDb::new("sqlite"));
        engine.update(&log_of(vec![create("1", "t1")])).await.unwrap();
        engine.tag("v1").await.unwrap();

        let log = log_of(vec![create("1", "t1"), create("2", "t2"), create("3", "t3")]);
        engine.update(&log).await.unwrap();

        let undone: Vec<String> = engine
            .rollback_to_tag(&log, "v1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.id)
            .collect();
        assert_eq!(undone, vec!["3", "2"]);
        assert_eq!(engine.history().entries().await.unwrap().len(), 1);
        assert!(matches!(
            engine.rollback_to_tag(&log, "v9").await,
            Err(MigrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_without_inverse_fails_before_sql() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![
            create("1", "t1"),
            ChangeSet::new("2", "alice", "db.json").action(Action::sql("INSERT INTO t1 VALUES (1)")),
        ]);
        engine.update(&log).await.unwrap();
        let before = db.log();

        let err = engine.rollback_count(&log, 2).await.unwrap_err();
        assert!(matches!(err, MigrationError::RollbackFailed(_)));
        assert_eq!(db.log(), before);
        assert_eq!(engine.history().entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_then_clear_checksums() {
        let (engine, db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![create("1", "t1"), create("2", "t2")]);

        let marked = engine.changelog_sync(&log).await.unwrap();
        assert_eq!(marked.len(), 2);
        assert!(db.log().is_empty());

        engine.clear_checksums().await.unwrap();
        assert!(engine.history().entries().await.unwrap().iter().all(|e| e.checksum.is_none()));

        let report = engine.update(&log).await.unwrap();
        assert_eq!(report.up_to_date, 2);
        assert!(db.log().is_empty());
        let entries = engine.history().entries().await.unwrap();
        assert!(entries.iter().all(|e| e.checksum.is_some()));
        assert!(entries.iter().all(|e| e.exec_type == ExecType::MarkRan));
    }

    #[tokio::test]
    async fn test_status_and_filters() {
        let config = MigrationConfig::new().contexts(["prod"]);
        let (engine, _db) = engine_with(MockDb::new("sqlite"), config, Arc::new(InMemoryLock::new()));
        let log = log_of(vec![
            create("1", "t1"),
            create("2", "t2").contexts(["test"]),
            create("3", "t3").dbms(["postgresql"]),
        ]);

        let statuses = engine.status(&log).await.unwrap();
        let pending: Vec<bool> = statuses.iter().map(ChangeSetStatus::is_pending).collect();
        assert_eq!(pending, vec![true, false, false]);

        let report = engine.update(&log).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(engine.status(&log).await.unwrap()[0].applied);
    }

    #[tokio::test]
    async fn test_unknown_dbms_is_rejected() {
        let (engine, _db) = engine(MockDb::new("sqlite"));
        let log = log_of(vec![create("1", "t1").dbms(["oracle", "!informix"])]);
        let err = engine.validate(&log).await.unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(ref m) if m.contains("informix")));
    }

    #[test]
    fn test_report_summary() {
        let report = UpdateReport {
            applied: vec![ChangeSetId::new("1", "a", "p"), ChangeSetId::new("2", "a", "p")],
            skipped: vec![ChangeSetId::new("3", "a", "p")],
            duration_ms: 12,
            ..UpdateReport::default()
        };
        assert!(report.has_changes());
        assert_eq!(report.summary(), "2 applied, 1 skipped in 12ms");
        assert_eq!(UpdateReport::default().summary(), "No changesets applied (0 up to date)");
    }
}
