//! Where checkpoints go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::coordinator::CheckpointReason;

/// One stored state document and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub id: String,
    pub created_at: i64,
    pub reason: CheckpointReason,
    pub description: String,
    pub entities: usize,
    /// The serialized state document.
    pub document: String,
}

/// Durable storage for snapshots. Implementations are shared between the
/// foreground engine and the background writer.
pub trait StateSink: Send + Sync {
    fn store(&self, snapshot: &StoredSnapshot) -> anyhow::Result<()>;

    /// The most recently stored snapshot.
    fn latest(&self) -> anyhow::Result<Option<StoredSnapshot>>;

    /// Every stored snapshot, oldest first. Documents may be left empty.
    fn list(&self) -> anyhow::Result<Vec<StoredSnapshot>>;
}

/// Keeps snapshots in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<Vec<StoredSnapshot>>,
    write_delay: Option<Duration>,
    failing: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `store` sleeps for `delay` first.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateSink for MemoryStateStore {
    fn store(&self, snapshot: &StoredSnapshot) -> anyhow::Result<()> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("state store is unavailable"));
        }
        self.snapshots
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .push(snapshot.clone());
        Ok(())
    }

    fn latest(&self) -> anyhow::Result<Option<StoredSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .last()
            .cloned())
    }

    fn list(&self) -> anyhow::Result<Vec<StoredSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> StoredSnapshot {
        StoredSnapshot {
            id: id.into(),
            created_at: 0,
            reason: CheckpointReason::Periodic,
            description: String::new(),
            entities: 0,
            document: "[]".into(),
        }
    }

    #[test]
    fn test_memory_store_latest() {
        let store = MemoryStateStore::new();
        assert!(store.latest().unwrap().is_none());
        store.store(&snapshot("a")).unwrap();
        store.store(&snapshot("b")).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().id, "b");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_failing_store_rejects_writes() {
        let store = MemoryStateStore::new();
        store.set_failing(true);
        assert!(store.store(&snapshot("a")).is_err());
        assert!(store.is_empty());
    }
}
