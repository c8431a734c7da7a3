use async_trait::async_trait;
use parking_lot::RwLock;

use crate::changeset::ChangeSetId;
use crate::checksum::Checksum;
use crate::error::{MigrateResult, MigrationError};

use super::{HistoryEntry, HistoryRepository};

/// History kept in process memory, for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history pre-populated with entries.
    pub fn with_entries(entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl HistoryRepository for InMemoryHistory {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn entries(&self) -> MigrateResult<Vec<HistoryEntry>> {
        let mut entries = self.entries.read().clone();
        entries.sort_by_key(|e| e.order_executed);
        Ok(entries)
    }

    async fn append(&self, entry: &HistoryEntry) -> MigrateResult<()> {
        let mut entries = self.entries.write();
        if let Some(last) = entries.iter().map(|e| e.order_executed).max() {
            if entry.order_executed <= last {
                return Err(MigrationError::database(format!(
                    "order {} is not greater than {}",
                    entry.order_executed, last
                )));
            }
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn replace(&self, entry: &HistoryEntry) -> MigrateResult<()> {
        let mut entries = self.entries.write();
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| MigrationError::NotFound(entry.id.to_string()))?;
        *slot = entry.clone();
        Ok(())
    }

    async fn remove(&self, id: &ChangeSetId) -> MigrateResult<()> {
        self.entries.write().retain(|e| &e.id != id);
        Ok(())
    }

    async fn update_checksum(&self, id: &ChangeSetId, checksum: &Checksum) -> MigrateResult<()> {
        let mut entries = self.entries.write();
        let slot = entries
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))?;
        slot.checksum = Some(checksum.clone());
        Ok(())
    }

    async fn clear_checksums(&self) -> MigrateResult<()> {
        for entry in self.entries.write().iter_mut() {
            entry.checksum = None;
        }
        Ok(())
    }

    async fn tag_last(&self, tag: &str) -> MigrateResult<bool> {
        let mut entries = self.entries.write();
        match entries.iter_mut().max_by_key(|e| e.order_executed) {
            Some(last) => {
                last.tag = Some(tag.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::changeset::ChangeSet;
    use crate::checksum::ChecksumVersion;
    use crate::history::ExecType;

    fn entry(id: &str, order: i64) -> HistoryEntry {
        let cs = ChangeSet::new(id, "bob", "log.json").action(Action::sql("SELECT 1"));
        HistoryEntry::for_change_set(
            &cs,
            cs.checksum(ChecksumVersion::LATEST).unwrap(),
            order,
            ExecType::Executed,
        )
    }

    #[tokio::test]
    async fn test_append_requires_increasing_order() {
        let history = InMemoryHistory::new();
        history.append(&entry("1", 1)).await.unwrap();
        history.append(&entry("2", 2)).await.unwrap();
        assert!(history.append(&entry("3", 2)).await.is_err());
        assert_eq!(history.next_order().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tag_and_clear() {
        let history = InMemoryHistory::with_entries(vec![entry("1", 1), entry("2", 2)]);
        assert!(history.tag_last("v1").await.unwrap());
        history.clear_checksums().await.unwrap();
        let entries = history.entries().await.unwrap();
        assert_eq!(entries[1].tag.as_deref(), Some("v1"));
        assert!(entries.iter().all(|e| e.checksum.is_none()));
        assert!(!InMemoryHistory::new().tag_last("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let history = InMemoryHistory::with_entries(vec![entry("1", 1)]);
        let mut rerun = entry("1", 5);
        rerun.exec_type = ExecType::Reran;
        history.replace(&rerun).await.unwrap();
        let found = history.find(&rerun.id).await.unwrap().unwrap();
        assert_eq!(found.order_executed, 5);
        history.remove(&rerun.id).await.unwrap();
        assert!(history.entries().await.unwrap().is_empty());
    }
}
