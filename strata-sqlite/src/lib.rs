//! SQLite driver for strata.
//!
//! This crate connects the strata migration engine to SQLite, using
//! `tokio-rusqlite` for asynchronous access.
//!
//! # Features
//!
//! - A [`Driver`](strata_migrate::Driver) over a single dedicated connection
//! - Schema introspection into [`Snapshot`](strata_migrate::Snapshot)s,
//!   including names of declared constraints
//! - Transactional DDL
//! - In-memory and file-based databases
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_migrate::prelude::*;
//! use strata_sqlite::{SqliteConfig, SqliteDatabase};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = SqliteDatabase::open(SqliteConfig::from_url("sqlite://./app.db")?).await?;
//!     let engine = Engine::with_sql_history(
//!         MigrationConfig::new(),
//!         Arc::new(MigrationContext::standard()),
//!         Arc::new(db),
//!     )?;
//!
//!     let changelog = ChangeLog::load("db/changelog.json").await?;
//!     println!("{}", engine.update(&changelog).await?.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
mod introspect;
pub mod types;

pub use config::{DatabasePath, JournalMode, SqliteConfig, SynchronousMode};
pub use database::SqliteDatabase;
pub use error::{SqliteError, SqliteResult};
