//! Error types for the change-management engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur while resolving, validating or applying changesets.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error reported by a driver.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid engine configuration, reported before any database mutation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No dialect is registered under the given identifier.
    #[error("Unknown dialect '{0}'")]
    UnknownDialect(String),

    /// Action rewriting did not reach a terminal rendering.
    #[error("Action '{action}' could not be resolved for {dialect} within {depth} rewrite hops: {reason}")]
    RewriteLimit {
        /// Kind of the action being resolved when the limit was hit.
        action: String,
        /// Target dialect.
        dialect: String,
        /// Number of hops taken.
        depth: usize,
        /// Why resolution stopped (depth or cycle).
        reason: String,
    },

    /// An action/dialect combination was rejected.
    #[error("Validation failed for changeset '{change_set}' on {dialect}:\n{errors}")]
    Validation {
        /// Changeset identifier.
        change_set: String,
        /// Target dialect.
        dialect: String,
        /// Field-level errors.
        errors: ValidationErrors,
    },

    /// A precondition failed under a HALT policy.
    #[error("Precondition failed for changeset '{change_set}': {message}")]
    PreconditionFailed {
        /// Changeset identifier.
        change_set: String,
        /// Failure description.
        message: String,
    },

    /// A precondition could not be evaluated under a HALT policy.
    #[error("Precondition error for changeset '{change_set}': {message}")]
    PreconditionError {
        /// Changeset identifier.
        change_set: String,
        /// Error description.
        message: String,
    },

    /// Changeset checksum mismatch.
    #[error("Checksum mismatch for changeset '{id}': stored {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Changeset identifier.
        id: String,
        /// Checksum recorded in the history.
        expected: String,
        /// Checksum computed from the changelog.
        actual: String,
    },

    /// Several changesets failed validation in the pre-run pass.
    #[error("Changelog validation failed with {} problem(s):\n{}", .0.len(), join_errors(.0))]
    ChangeLogInvalid(Vec<MigrationError>),

    /// SQL was rejected by the database.
    #[error(
        "Changeset '{change_set}' failed on {dialect} at statement {index} ({}): {message}\n  SQL: {statement}",
        rollback_note(.rolled_back)
    )]
    Execution {
        /// Changeset identifier.
        change_set: String,
        /// Target dialect.
        dialect: String,
        /// The failing SQL text.
        statement: String,
        /// Zero-based index of the failing statement within the changeset.
        index: usize,
        /// Whether the changeset's statements were rolled back.
        rolled_back: bool,
        /// Driver message.
        message: String,
    },

    /// Lock acquisition timed out.
    #[error("Could not acquire change log lock within {waited:?}{}", holder_suffix(.holder))]
    LockTimeout {
        /// Current holder, when known.
        holder: Option<String>,
        /// How long acquisition was attempted.
        waited: Duration,
    },

    /// Lock is held by another process.
    #[error("Change log lock is held by {0}")]
    LockHeld(String),

    /// Lock bookkeeping failed.
    #[error("Lock error: {0}")]
    Lock(String),

    /// A statement exceeded the configured timeout.
    #[error(
        "Changeset '{change_set}' timed out on {dialect} at statement {index} after {elapsed:?} ({}){}\n  SQL: {statement}",
        rollback_note(.rolled_back),
        retry_note(.retryable)
    )]
    Timeout {
        /// Changeset identifier.
        change_set: String,
        /// Target dialect.
        dialect: String,
        /// The SQL text that did not finish.
        statement: String,
        /// Zero-based index of the statement within the changeset.
        index: usize,
        /// Whether the changeset's statements were rolled back.
        rolled_back: bool,
        /// Time waited.
        elapsed: Duration,
        /// Whether the operator may retry the run.
        retryable: bool,
    },

    /// The run was cancelled at a changeset boundary.
    #[error("Run cancelled after {completed} changeset(s)")]
    Cancelled {
        /// Number of changesets that completed before cancellation.
        completed: usize,
    },

    /// An action could not be applied to an offline snapshot model.
    #[error("Snapshot model error: {0}")]
    Model(String),

    /// Rollback not possible.
    #[error("Cannot rollback: {0}")]
    RollbackFailed(String),

    /// Configuration file could not be read or parsed.
    #[error("Config file error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested item not found.
    #[error("'{0}' not found")]
    NotFound(String),
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a lock error.
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a snapshot model error.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a rollback error.
    pub fn rollback_failed(msg: impl Into<String>) -> Self {
        Self::RollbackFailed(msg.into())
    }

    /// Create a config file error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if the operator can simply retry the run.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::LockHeld(_) | Self::Cancelled { .. } => true,
            Self::Timeout { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this error was raised before any schema mutation could happen.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownDialect(_)
                | Self::RewriteLimit { .. }
                | Self::Validation { .. }
                | Self::ChecksumMismatch { .. }
                | Self::ChangeLogInvalid(_)
                | Self::LockTimeout { .. }
                | Self::LockHeld(_)
        )
    }
}

fn join_errors(errors: &[MigrationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "rolled back"
    } else {
        "earlier statements remain applied"
    }
}

fn retry_note(retryable: &bool) -> &'static str {
    if *retryable { " (retryable)" } else { "" }
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" (currently held by {})", h),
        None => String::new(),
    }
}

/// A single field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Offending attribute, or `"*"` for the whole action.
    pub field: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the problem is that the dialect lacks the feature.
    pub unsupported: bool,
}

/// Collected validation problems for one action or changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Create an empty error list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error against a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            unsupported: false,
        });
        self
    }

    /// Record that a feature is not supported by the dialect.
    pub fn unsupported(&mut self, what: impl Into<String>, dialect: &str) -> &mut Self {
        self.errors.push(ValidationError {
            field: "*".to_string(),
            message: format!("{} is not supported on {}", what.into(), dialect),
            unsupported: true,
        });
        self
    }

    /// Record an error if a string attribute is empty.
    pub fn require(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.add(field, format!("'{}' is required", field));
        }
        self
    }

    /// Record an error if a list attribute is empty.
    pub fn require_non_empty<T>(&mut self, field: &str, values: &[T]) -> &mut Self {
        if values.is_empty() {
            self.add(field, format!("'{}' must not be empty", field));
        }
        self
    }

    /// Append all errors from another list.
    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// Check whether any errors were recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Number of errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate over the errors.
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}
