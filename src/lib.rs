//! # Strata
//!
//! Dialect-adaptive database schema change management.
//!
//! Strata provides:
//! - Changesets made of dialect-neutral actions, rendered per database
//! - A checksummed, ordered change history kept in the target database
//! - A change log lock so that concurrent deployments serialize
//! - Schema snapshots, diffing and changelog generation
//! - Rollback by count or tag, with inferred rollbacks for irreversible changes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata::prelude::*;
//! use strata::sqlite::SqliteDatabase;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Arc::new(SqliteDatabase::file("app.db").await?);
//!     let engine = Engine::with_sql_history(
//!         MigrationConfig::from_file("strata.toml")?,
//!         Arc::new(MigrationContext::standard()),
//!         db,
//!     )?;
//!
//!     let changelog = ChangeLog::new(vec![
//!         ChangeSet::new("1", "alice", "changelog.json").action(Action::create_table(
//!             "users",
//!             vec![
//!                 ColumnDef::new("id", DataType::Integer).primary_key(),
//!                 ColumnDef::new("email", DataType::Varchar(255)).not_null(),
//!             ],
//!         )),
//!     ])?;
//!
//!     let report = engine.update(&changelog).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use strata_migrate::*;

/// SQLite driver.
#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite {
    pub use strata_sqlite::*;
}
