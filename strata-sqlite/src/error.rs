//! Error types for SQLite operations.

use strata_migrate::MigrationError;
use thiserror::Error;

/// Result type for SQLite operations.
pub type SqliteResult<T> = Result<T, SqliteError>;

/// Error type for SQLite operations.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite driver error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Schema metadata could not be interpreted.
    #[error("Introspection error: {0}")]
    Introspection(String),
}

impl SqliteError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an introspection error.
    pub fn introspection(msg: impl Into<String>) -> Self {
        Self::Introspection(msg.into())
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(tokio_rusqlite::Error::Rusqlite(err))
    }
}

impl From<SqliteError> for MigrationError {
    fn from(err: SqliteError) -> Self {
        match err {
            // Keep the driver's own message; the engine adds statement context.
            SqliteError::Sqlite(tokio_rusqlite::Error::Rusqlite(e)) => {
                MigrationError::database(e.to_string())
            }
            SqliteError::Sqlite(e) => MigrationError::database(e.to_string()),
            SqliteError::Config(msg) => MigrationError::configuration(msg),
            SqliteError::Connection(msg) => MigrationError::database(format!("connection: {}", msg)),
            SqliteError::Introspection(msg) => {
                MigrationError::database(format!("introspection: {}", msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqliteError::config("invalid path");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("invalid path"));
    }

    #[test]
    fn test_error_conversion() {
        let err: MigrationError = SqliteError::config("bad url").into();
        assert!(matches!(err, MigrationError::Configuration(_)));

        let err: MigrationError = SqliteError::from(rusqlite::Error::InvalidQuery).into();
        assert!(matches!(err, MigrationError::Database(_)));
    }
}
