//! Engine configuration, loadable from `strata.toml`.
//!
//! Durations are written as text (`"30s"`, `"250ms"`, `"10m"`). `${VAR}`
//! references are expanded from the environment before parsing.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// How a stored checksum that no longer matches is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumMode {
    /// A mismatch fails validation before any SQL runs.
    #[default]
    Strict,
    /// A mismatch is a warning; the changeset counts as applied.
    Lenient,
}

/// What happens to checksums written by an older generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumUpgradePolicy {
    /// Keep them as written; always validate under their own generation.
    #[default]
    Preserve,
    /// After validating under the old generation, store the latest one.
    UpgradeOnValidate,
}

/// What to do with a lock older than `stale_after`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalePolicy {
    /// Log it and keep waiting.
    #[default]
    Report,
    /// Release it and take the lock.
    Reclaim,
}

/// History storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// History table name.
    pub table: String,
    /// Lock table name.
    pub lock_table: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            table: "strata_changelog".to_string(),
            lock_table: "strata_changelog_lock".to_string(),
        }
    }
}

/// Checksum handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChecksumConfig {
    /// Mismatch handling.
    pub mode: ChecksumMode,
    /// Old-generation handling.
    pub upgrade: ChecksumUpgradePolicy,
    /// Overwrite mismatched stored checksums with the current value instead
    /// of failing validation.
    pub update_checksums: bool,
}

/// Lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Give up after this long.
    #[serde(with = "duration_text")]
    pub wait_timeout: Duration,
    /// First retry delay.
    #[serde(with = "duration_text")]
    pub recheck_interval: Duration,
    /// Retry delays double up to this value.
    #[serde(with = "duration_text")]
    pub max_backoff: Duration,
    /// A lock held longer than this is considered stale.
    #[serde(with = "duration_text::option")]
    pub stale_after: Option<Duration>,
    /// Stale lock handling.
    pub stale_policy: StalePolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(300),
            recheck_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            stale_after: None,
            stale_policy: StalePolicy::Report,
        }
    }
}

/// Execution behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Render SQL but never execute it.
    pub dry_run: bool,
    /// Per-statement timeout.
    #[serde(with = "duration_text::option")]
    pub statement_timeout: Option<Duration>,
    /// Whether a timed-out statement may be retried by the operator.
    pub timeouts_retryable: bool,
    /// Maximum rewrite hops when resolving an action.
    pub max_rewrite_depth: usize,
    /// Record snapshot-inferred rollbacks with each applied changeset.
    pub infer_rollback: bool,
    /// Active contexts; empty runs every changeset.
    pub contexts: Vec<String>,
    /// Reject changesets whose `dbms` filter names an unknown dialect.
    pub fail_on_unknown_dialect: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            statement_timeout: None,
            timeouts_retryable: true,
            max_rewrite_depth: 8,
            infer_rollback: false,
            contexts: Vec::new(),
            fail_on_unknown_dialect: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// History storage.
    pub history: HistoryConfig,
    /// Checksum handling.
    pub checksum: ChecksumConfig,
    /// Lock acquisition.
    pub lock: LockConfig,
    /// Execution behaviour.
    pub execution: ExecutionConfig,
}

impl MigrationConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::config(format!("{}: {}", path.display(), e)))?;
        content.parse()
    }

    /// Set the history table name.
    pub fn history_table(mut self, table: impl Into<String>) -> Self {
        self.history.table = table.into();
        self
    }

    /// Set the lock table name.
    pub fn lock_table(mut self, table: impl Into<String>) -> Self {
        self.history.lock_table = table.into();
        self
    }

    /// Set the checksum mode.
    pub fn checksum_mode(mut self, mode: ChecksumMode) -> Self {
        self.checksum.mode = mode;
        self
    }

    /// Set the checksum upgrade policy.
    pub fn checksum_upgrade(mut self, policy: ChecksumUpgradePolicy) -> Self {
        self.checksum.upgrade = policy;
        self
    }

    /// Overwrite mismatched stored checksums instead of failing.
    pub fn update_checksums(mut self, update: bool) -> Self {
        self.checksum.update_checksums = update;
        self
    }

    /// Set the lock wait timeout.
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock.wait_timeout = timeout;
        self
    }

    /// Set the first lock retry delay.
    pub fn lock_recheck_interval(mut self, interval: Duration) -> Self {
        self.lock.recheck_interval = interval;
        self
    }

    /// Treat locks older than `age` as stale, handled per `policy`.
    pub fn stale_lock(mut self, age: Duration, policy: StalePolicy) -> Self {
        self.lock.stale_after = Some(age);
        self.lock.stale_policy = policy;
        self
    }

    /// Enable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.execution.dry_run = dry_run;
        self
    }

    /// Set the per-statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.execution.statement_timeout = Some(timeout);
        self
    }

    /// Set the maximum rewrite depth.
    pub fn max_rewrite_depth(mut self, depth: usize) -> Self {
        self.execution.max_rewrite_depth = depth;
        self
    }

    /// Record inferred rollbacks.
    pub fn infer_rollback(mut self, infer: bool) -> Self {
        self.execution.infer_rollback = infer;
        self
    }

    /// Set the active contexts.
    pub fn contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execution.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.history.table.trim().is_empty() || self.history.lock_table.trim().is_empty() {
            return Err(MigrationError::configuration(
                "history and lock table names must not be empty",
            ));
        }
        if self.history.table.eq_ignore_ascii_case(&self.history.lock_table) {
            return Err(MigrationError::configuration(
                "history and lock tables must differ",
            ));
        }
        if self.execution.max_rewrite_depth == 0 {
            return Err(MigrationError::configuration(
                "max_rewrite_depth must be at least 1",
            ));
        }
        if self.lock.recheck_interval.is_zero() {
            return Err(MigrationError::configuration(
                "lock recheck_interval must be positive",
            ));
        }
        Ok(())
    }
}

impl FromStr for MigrationConfig {
    type Err = MigrationError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| MigrationError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Expand `${VAR}` references; unknown variables are left as written.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Parse `"250ms"`, `"30s"`, `"10m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(text: &str) -> MigrateResult<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let n: u64 = number
        .parse()
        .map_err(|_| MigrationError::config(format!("invalid duration '{}'", text)))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(MigrationError::config(format!(
            "unknown duration unit '{}' in '{}'",
            other, text
        ))),
    }
}

/// Inverse of [`parse_duration`], preferring the largest exact unit.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1000 != 0 {
        format!("{}ms", ms)
    } else if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}s", ms / 1000)
    }
}

mod duration_text {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_str(&super::super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| super::super::parse_duration(&text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
