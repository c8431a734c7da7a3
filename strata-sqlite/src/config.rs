//! SQLite connection configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{SqliteError, SqliteResult};

/// SQLite database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqliteConfig {
    /// Database path (or ":memory:" for in-memory).
    pub path: DatabasePath,
    /// Enforce foreign keys.
    pub foreign_keys: bool,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u32>,
    /// Synchronous mode.
    pub synchronous: SynchronousMode,
    /// Journal mode.
    pub journal_mode: JournalMode,
}

/// Database location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum DatabasePath {
    /// In-memory database, private to one connection.
    #[default]
    Memory,
    /// File-based database.
    File(PathBuf),
}

impl DatabasePath {
    /// Path string for SQLite.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Memory => ":memory:",
            Self::File(path) => path.to_str().unwrap_or(":memory:"),
        }
    }

    /// Whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

impl From<String> for DatabasePath {
    fn from(value: String) -> Self {
        if value.is_empty() || value == ":memory:" {
            Self::Memory
        } else {
            Self::File(PathBuf::from(value))
        }
    }
}

/// SQLite synchronous mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    #[default]
    Normal,
    Full,
    Extra,
}

impl SynchronousMode {
    /// Pragma value.
    pub fn as_pragma(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Extra => "EXTRA",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "off" => Some(Self::Off),
            "normal" => Some(Self::Normal),
            "full" => Some(Self::Full),
            "extra" => Some(Self::Extra),
            _ => None,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Default rollback journal.
    #[default]
    Delete,
    Truncate,
    Persist,
    Memory,
    /// Write-ahead logging, best for concurrent readers.
    Wal,
}

impl JournalMode {
    /// Pragma value.
    pub fn as_pragma(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Memory => "MEMORY",
            Self::Wal => "WAL",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "delete" => Some(Self::Delete),
            "truncate" => Some(Self::Truncate),
            "persist" => Some(Self::Persist),
            "memory" => Some(Self::Memory),
            "wal" => Some(Self::Wal),
            _ => None,
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: DatabasePath::Memory,
            foreign_keys: true,
            busy_timeout_ms: Some(5000),
            synchronous: SynchronousMode::Normal,
            journal_mode: JournalMode::Delete,
        }
    }
}

impl SqliteConfig {
    /// Configuration for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Configuration for a file-based database.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            path: DatabasePath::File(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Parse a SQLite URL into configuration.
    ///
    /// Supported formats:
    /// - `sqlite::memory:` - In-memory database
    /// - `sqlite://path/to/db.sqlite` - File-based database
    /// - `file:path/to/db.sqlite` - Alternative format
    ///
    /// Query parameters `foreign_keys`, `busy_timeout`, `synchronous` and
    /// `journal_mode` override the defaults; unknown values are rejected.
    pub fn from_url(url: impl AsRef<str>) -> SqliteResult<Self> {
        let url = url.as_ref();
        if url == "sqlite::memory:" || url == ":memory:" {
            return Ok(Self::memory());
        }

        let (location, query) = match url.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (url, None),
        };
        let path = location
            .strip_prefix("sqlite://")
            .or_else(|| location.strip_prefix("sqlite:"))
            .or_else(|| location.strip_prefix("file:"))
            .unwrap_or(location);
        if path.is_empty() {
            return Err(SqliteError::config("database path is required"));
        }

        let mut config = if path == ":memory:" {
            Self::memory()
        } else {
            Self::file(path)
        };

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let invalid = || SqliteError::config(format!("invalid value '{}' for '{}'", value, key));
            match key {
                "mode" if value == "memory" => config.path = DatabasePath::Memory,
                "foreign_keys" => config.foreign_keys = value == "true" || value == "1",
                "busy_timeout" => {
                    config.busy_timeout_ms = Some(value.parse().map_err(|_| invalid())?);
                }
                "synchronous" => {
                    config.synchronous = SynchronousMode::parse(value).ok_or_else(invalid)?;
                }
                "journal_mode" => {
                    config.journal_mode = JournalMode::parse(value).ok_or_else(invalid)?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Path string for SQLite.
    pub fn path_str(&self) -> &str {
        self.path.as_str()
    }

    /// Pragmas run when a connection opens.
    pub fn init_sql(&self) -> String {
        let mut sql = String::new();

        if self.foreign_keys {
            sql.push_str("PRAGMA foreign_keys = ON;\n");
        }
        if !self.path.is_memory() {
            sql.push_str(&format!(
                "PRAGMA journal_mode = {};\n",
                self.journal_mode.as_pragma()
            ));
        }
        sql.push_str(&format!(
            "PRAGMA synchronous = {};\n",
            self.synchronous.as_pragma()
        ));
        if let Some(timeout) = self.busy_timeout_ms {
            sql.push_str(&format!("PRAGMA busy_timeout = {};\n", timeout));
        }

        sql
    }

    /// Enable or disable foreign keys.
    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    /// Set the busy timeout in milliseconds.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    /// Set the synchronous mode.
    pub fn synchronous(mut self, mode: SynchronousMode) -> Self {
        self.synchronous = mode;
        self
    }

    /// Set the journal mode.
    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_from_url_memory() {
        assert!(SqliteConfig::from_url("sqlite::memory:").unwrap().path.is_memory());
        assert!(SqliteConfig::from_url(":memory:").unwrap().path.is_memory());
        assert!(SqliteConfig::from_url("sqlite://x.db?mode=memory").unwrap().path.is_memory());
    }

    #[test]
    fn test_config_from_url_file() {
        let config = SqliteConfig::from_url("sqlite://./test.db").unwrap();
        assert_eq!(config.path_str(), "./test.db");

        let config = SqliteConfig::from_url("file:data/app.sqlite").unwrap();
        assert_eq!(config.path_str(), "data/app.sqlite");
    }

    #[test]
    fn test_config_from_url_with_options() {
        let config = SqliteConfig::from_url(
            "sqlite://./test.db?foreign_keys=0&busy_timeout=10000&synchronous=full&journal_mode=wal",
        )
        .unwrap();

        assert!(!config.foreign_keys);
        assert_eq!(config.busy_timeout_ms, Some(10000));
        assert_eq!(config.synchronous, SynchronousMode::Full);
        assert_eq!(config.journal_mode, JournalMode::Wal);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(SqliteConfig::from_url("sqlite://").is_err());
        assert!(SqliteConfig::from_url("sqlite://a.db?synchronous=sometimes").is_err());
        assert!(SqliteConfig::from_url("sqlite://a.db?busy_timeout=soon").is_err());
    }

    #[test]
    fn test_init_sql() {
        let sql = SqliteConfig::file("app.db").journal_mode(JournalMode::Wal).init_sql();
        assert!(sql.contains("foreign_keys = ON"));
        assert!(sql.contains("journal_mode = WAL"));
        assert!(sql.contains("synchronous = NORMAL"));

        let sql = SqliteConfig::memory().foreign_keys(false).init_sql();
        assert!(!sql.contains("foreign_keys"));
        assert!(!sql.contains("journal_mode"));
    }

    #[test]
    fn test_config_deserialize() {
        let config: SqliteConfig = serde_json::from_str(
            r#"{"path": "db/app.sqlite", "synchronous": "full", "busy_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(config.path, DatabasePath::File(PathBuf::from("db/app.sqlite")));
        assert_eq!(config.synchronous, SynchronousMode::Full);
        assert_eq!(config.busy_timeout_ms, Some(250));
        assert!(config.foreign_keys);
    }
}
