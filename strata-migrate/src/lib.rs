//! # strata-migrate
//!
//! Change-management engine for strata.
//!
//! This crate provides:
//! - A dialect-neutral [`Action`] model for schema and data changes
//! - **Priority dispatch** of actions to dialect SQL, with rewrites
//! - Checksummed, ordered change history stored in the target database
//! - A cooperative change log lock so only one process migrates at a time
//! - Schema snapshots, snapshot diffing and changelog generation
//! - Rollback from declared actions, recorded inferences or action inverses
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │  ChangeLog   │────▶│ LogicRegistry  │────▶│ Statements  │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!        │                                           │
//!        ▼                                           ▼
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │   History    │◀────│     Engine     │────▶│   Driver    │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!                              │
//!                              ▼
//!                      ┌────────────────┐
//!                      │ Snapshot/Diff  │
//!                      └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_migrate::prelude::*;
//!
//! async fn migrate<D: Database>(db: Arc<D>) -> MigrateResult<()> {
//!     let changelog = ChangeLog::new(vec![
//!         ChangeSet::new("1", "alice", "db/changelog.json").action(Action::create_table(
//!             "users",
//!             vec![
//!                 ColumnDef::new("id", DataType::BigInt).primary_key(),
//!                 ColumnDef::new("email", DataType::Varchar(255)).not_null(),
//!             ],
//!         )),
//!     ])?;
//!
//!     let engine = Engine::with_sql_history(
//!         MigrationConfig::new(),
//!         Arc::new(MigrationContext::standard()),
//!         db,
//!     )?;
//!     let report = engine.update(&changelog).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Checksums
//!
//! Every history entry stores the checksum of its changeset as
//! `"<version>:<digest>"`. A stored value is always validated with the
//! algorithm generation it was written with, so upgrading the algorithm
//! never reports spurious mismatches.

pub mod action;
pub mod changeset;
pub mod checksum;
pub mod config;
pub mod dialect;
pub mod diff;
pub mod driver;
pub mod engine;
pub mod error;
pub mod history;
pub mod lock;
pub mod logic;
pub mod precondition;
pub mod rollback;
pub mod snapshot;
pub mod statement;

// Re-exports
pub use action::{
    Action, ActionKind, ColumnDef, DataType, DefaultValue, ForeignKeyDef, ReferentialAction,
    Value,
};
pub use changeset::{ChangeLog, ChangeSet, ChangeSetId};
pub use checksum::{Checksum, ChecksumVersion};
pub use config::{
    ChecksumConfig, ChecksumMode, ChecksumUpgradePolicy, ExecutionConfig, HistoryConfig,
    LockConfig, MigrationConfig, StalePolicy,
};
pub use dialect::{Dialect, DialectFamily, DialectRegistry, Feature};
pub use diff::{ChangeLogOptions, Diff, DiffKind, FieldDelta};
pub use driver::{Database, Driver, Row, SnapshotSource, SqlRunner};
pub use engine::{
    CancelHandle, ChangeSetStatus, Engine, FailedChangeSet, RolledBack, UpdateReport,
};
pub use error::{MigrateResult, MigrationError, ValidationError, ValidationErrors};
pub use history::{
    ExecType, HistoryEntry, HistoryRepository, InMemoryHistory, RunStatus, SqlHistoryRepository,
};
pub use lock::{
    AcquireOutcome, InMemoryLock, LockHolder, LockRecord, LockService, SqlLockService,
};
pub use logic::{ActionLogic, LogicOutput, LogicRegistry, MigrationContext, Priority};
pub use precondition::{FailPolicy, Precondition, PreconditionContainer, PreconditionOutcome};
pub use rollback::RollbackSource;
pub use snapshot::{ObjectRef, ObjectType, Snapshot, SnapshotBuilder, SnapshotFilter};
pub use statement::Statement;

/// Commonly used items.
pub mod prelude {
    pub use crate::action::{Action, ColumnDef, DataType, DefaultValue, Value};
    pub use crate::changeset::{ChangeLog, ChangeSet, ChangeSetId};
    pub use crate::config::{ChecksumMode, MigrationConfig};
    pub use crate::driver::{Database, Driver, SnapshotSource};
    pub use crate::engine::{Engine, UpdateReport};
    pub use crate::error::{MigrateResult, MigrationError};
    pub use crate::history::HistoryRepository;
    pub use crate::lock::LockService;
    pub use crate::logic::MigrationContext;
    pub use crate::snapshot::{Snapshot, SnapshotFilter};
}
