//! Change log lock: a persisted mutual-exclusion record per target schema.
//!
//! Acquisition retries with exponential backoff until the configured timeout.
//! A lock left behind by a crashed process is only taken over under an
//! explicit [`StalePolicy::Reclaim`] or through an operator's forced release.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{Action, ColumnDef, DataType, Value};
use crate::config::{LockConfig, StalePolicy};
use crate::driver::{Database, SqlRunner};
use crate::error::{MigrateResult, MigrationError};

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    /// Unique per engine instance.
    pub id: String,
    /// Host name.
    pub host: String,
    /// Process id.
    pub pid: u32,
}

impl LockHolder {
    /// Holder identity for this process.
    pub fn current() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            host,
            pid: std::process::id(),
        }
    }

    /// Compact persisted form `host:pid:id`.
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.host, self.pid, self.id)
    }

    /// Parse the persisted form. Hosts may contain `:`.
    pub fn decode(text: &str) -> Option<Self> {
        let mut parts = text.rsplitn(3, ':');
        let id = parts.next()?.to_string();
        let pid = parts.next()?.parse().ok()?;
        let host = parts.next()?.to_string();
        Some(Self { id, host, pid })
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.host, self.pid)
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Who holds it. `None` if the stored owner could not be read.
    pub holder: Option<LockHolder>,
    /// When it was granted.
    pub granted_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// How long the lock has been held, if known.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.granted_at.map(|granted| now - granted)
    }

    /// Holder and grant time, for messages.
    pub fn describe(&self) -> String {
        let holder = self
            .holder
            .as_ref()
            .map_or_else(|| "an unknown holder".to_string(), |h| h.to_string());
        match self.granted_at {
            Some(at) => format!("{} since {}", holder, at.to_rfc3339()),
            None => holder,
        }
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Held(LockRecord),
}

/// Storage of the lock record.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Create backing storage if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// One atomic attempt to take the lock.
    async fn try_acquire(&self, holder: &LockHolder) -> MigrateResult<AcquireOutcome>;

    /// Release the lock if `holder` owns it.
    async fn release(&self, holder: &LockHolder) -> MigrateResult<()>;

    /// The current lock, if any.
    async fn current(&self) -> MigrateResult<Option<LockRecord>>;

    /// Release the lock whoever holds it.
    async fn force_release(&self) -> MigrateResult<()>;
}

#[async_trait]
impl<T: LockService + ?Sized> LockService for Arc<T> {
    async fn initialize(&self) -> MigrateResult<()> {
        (**self).initialize().await
    }

    async fn try_acquire(&self, holder: &LockHolder) -> MigrateResult<AcquireOutcome> {
        (**self).try_acquire(holder).await
    }

    async fn release(&self, holder: &LockHolder) -> MigrateResult<()> {
        (**self).release(holder).await
    }

    async fn current(&self) -> MigrateResult<Option<LockRecord>> {
        (**self).current().await
    }

    async fn force_release(&self) -> MigrateResult<()> {
        (**self).force_release().await
    }
}

/// Acquire the lock, retrying with exponential backoff until `config.wait_timeout`.
pub async fn acquire_with_backoff<L: LockService + ?Sized>(
    service: &L,
    holder: &LockHolder,
    config: &LockConfig,
) -> MigrateResult<()> {
    let started = Instant::now();
    let mut delay = config.recheck_interval;
    let mut reported_stale = false;

    loop {
        let record = match service.try_acquire(holder).await? {
            AcquireOutcome::Acquired => {
                info!(holder = %holder, "Acquired change log lock");
                return Ok(());
            }
            AcquireOutcome::Held(record) => record,
        };

        let stale = match (config.stale_after, record.age(Utc::now())) {
            (Some(limit), Some(age)) => age.to_std().is_ok_and(|age| age > limit),
            _ => false,
        };
        if stale {
            match config.stale_policy {
                StalePolicy::Reclaim => {
                    warn!(lock = %record.describe(), "Reclaiming stale change log lock");
                    service.force_release().await?;
                    continue;
                }
                StalePolicy::Report if !reported_stale => {
                    warn!(
                        lock = %record.describe(),
                        "Change log lock looks stale; release it once the holder is known to be gone"
                    );
                    reported_stale = true;
                }
                StalePolicy::Report => {}
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= config.wait_timeout {
            return Err(MigrationError::LockTimeout {
                holder: Some(record.describe()),
                waited: elapsed,
            });
        }
        let sleep = delay.min(config.wait_timeout - elapsed);
        debug!(lock = %record.describe(), retry_in = ?sleep, "Change log lock is held");
        tokio::time::sleep(sleep).await;
        delay = (delay * 2).min(config.max_backoff);
    }
}

/// Lock kept in process memory. Share one instance through `Arc` to model
/// several engines contending for the same target.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    record: Mutex<Option<LockRecord>>,
}

impl InMemoryLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLock {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn try_acquire(&self, holder: &LockHolder) -> MigrateResult<AcquireOutcome> {
        let mut record = self.record.lock();
        match record.as_ref() {
            Some(existing) => Ok(AcquireOutcome::Held(existing.clone())),
            None => {
                *record = Some(LockRecord {
                    holder: Some(holder.clone()),
                    granted_at: Some(Utc::now()),
                });
                Ok(AcquireOutcome::Acquired)
            }
        }
    }

    async fn release(&self, holder: &LockHolder) -> MigrateResult<()> {
        let mut record = self.record.lock();
        if record
            .as_ref()
            .is_some_and(|r| r.holder.as_ref() == Some(holder))
        {
            *record = None;
        }
        Ok(())
    }

    async fn current(&self) -> MigrateResult<Option<LockRecord>> {
        Ok(self.record.lock().clone())
    }

    async fn force_release(&self) -> MigrateResult<()> {
        *self.record.lock() = None;
        Ok(())
    }
}

/// Lock stored as a single row (`id = 1`) in a table of the target database.
///
/// Acquisition is a conditional `UPDATE ... WHERE locked = FALSE`; the
/// affected row count decides who won.
pub struct SqlLockService<D: ?Sized> {
    runner: SqlRunner<D>,
    table: String,
}

impl<D: Database + ?Sized> SqlLockService<D> {
    /// Create a lock service over `table`.
    pub fn new(runner: SqlRunner<D>, table: impl Into<String>) -> Self {
        Self {
            runner,
            table: table.into(),
        }
    }

    fn lock_row() -> Vec<(String, Value)> {
        vec![("id".to_string(), Value::Int(1))]
    }

    fn set_unlocked() -> Vec<(String, Value)> {
        vec![
            ("locked".to_string(), Value::Bool(false)),
            ("lock_granted".to_string(), Value::Null),
            ("locked_by".to_string(), Value::Null),
        ]
    }
}

#[async_trait]
impl<D: Database + ?Sized> LockService for SqlLockService<D> {
    async fn initialize(&self) -> MigrateResult<()> {
        if !self.runner.table_exists(&self.table).await? {
            info!(table = %self.table, "Creating change log lock table");
            self.runner
                .run(&Action::create_table(
                    self.table.clone(),
                    vec![
                        ColumnDef::new("id", DataType::Integer).primary_key(),
                        ColumnDef::new("locked", DataType::Boolean).not_null(),
                        ColumnDef::new("lock_granted", DataType::Timestamp),
                        ColumnDef::new("locked_by", DataType::Varchar(255)),
                    ],
                ))
                .await?;
        }
        let count = self
            .runner
            .database()
            .query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE id = 1",
                self.runner.dialect().escape(&self.table)
            ))
            .await?;
        if count.as_deref().map(str::trim) != Some("1") {
            self.runner
                .run(&Action::Insert {
                    table: self.table.clone(),
                    columns: vec!["id".into(), "locked".into()],
                    values: vec![Value::Int(1), Value::Bool(false)],
                })
                .await?;
        }
        Ok(())
    }

    async fn try_acquire(&self, holder: &LockHolder) -> MigrateResult<AcquireOutcome> {
        let mut filter = Self::lock_row();
        filter.push(("locked".to_string(), Value::Bool(false)));
        let updated = self
            .runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: vec![
                    ("locked".to_string(), Value::Bool(true)),
                    ("lock_granted".to_string(), Value::Timestamp(Utc::now())),
                    ("locked_by".to_string(), Value::Text(holder.encode())),
                ],
                filter,
            })
            .await?;
        if updated == 1 {
            return Ok(AcquireOutcome::Acquired);
        }
        let record = self.current().await?.unwrap_or(LockRecord {
            holder: None,
            granted_at: None,
        });
        Ok(AcquireOutcome::Held(record))
    }

    async fn release(&self, holder: &LockHolder) -> MigrateResult<()> {
        let mut filter = Self::lock_row();
        filter.push(("locked_by".to_string(), Value::Text(holder.encode())));
        self.runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: Self::set_unlocked(),
                filter,
            })
            .await?;
        Ok(())
    }

    async fn current(&self) -> MigrateResult<Option<LockRecord>> {
        let rows = self
            .runner
            .database()
            .query(&format!(
                "SELECT locked, lock_granted, locked_by FROM {} WHERE id = 1",
                self.runner.dialect().escape(&self.table)
            ))
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        if !row.bool("locked").unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(LockRecord {
            holder: row.text("locked_by").and_then(|t| LockHolder::decode(&t)),
            granted_at: row.timestamp("lock_granted"),
        }))
    }

    async fn force_release(&self) -> MigrateResult<()> {
        warn!(table = %self.table, "Forcing release of change log lock");
        self.runner
            .run(&Action::Update {
                table: self.table.clone(),
                set: Self::set_unlocked(),
                filter: Self::lock_row(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> LockConfig {
        LockConfig {
            wait_timeout: Duration::from_millis(60),
            recheck_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            stale_after: None,
            stale_policy: StalePolicy::Report,
        }
    }

    #[test]
    fn test_holder_encoding() {
        let holder = LockHolder {
            id: "abc".into(),
            host: "db:host".into(),
            pid: 42,
        };
        assert_eq!(LockHolder::decode(&holder.encode()), Some(holder));
        assert_eq!(LockHolder::decode("garbage"), None);
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let lock = InMemoryLock::new();
        let first = LockHolder::current();
        let second = LockHolder::current();
        acquire_with_backoff(&lock, &first, &quick()).await.unwrap();

        let err = acquire_with_backoff(&lock, &second, &quick())
            .await
            .unwrap_err();
        match err {
            MigrationError::LockTimeout { holder, waited } => {
                assert!(holder.unwrap().contains(&first.host));
                assert!(waited >= Duration::from_millis(60));
            }
            other => panic!("unexpected {:?}", other),
        }

        lock.release(&second).await.unwrap();
        assert!(lock.current().await.unwrap().is_some());
        lock.release(&first).await.unwrap();
        assert!(lock.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_reclaimed_only_by_policy() {
        let lock = InMemoryLock::new();
        let crashed = LockHolder::current();
        *lock.record.lock() = Some(LockRecord {
            holder: Some(crashed),
            granted_at: Some(Utc::now() - chrono::Duration::hours(2)),
        });

        let mut config = quick();
        config.stale_after = Some(Duration::from_secs(60));
        let me = LockHolder::current();
        assert!(acquire_with_backoff(&lock, &me, &config).await.is_err());

        config.stale_policy = StalePolicy::Reclaim;
        acquire_with_backoff(&lock, &me, &config).await.unwrap();
        let record = lock.current().await.unwrap().unwrap();
        assert_eq!(record.holder, Some(me));
    }
}
