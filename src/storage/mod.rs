//! SQLite storage layer -- schema, migrations and the snapshot sink.

pub mod schema;

use anyhow::{anyhow, Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;

use crate::persist::{CheckpointReason, StateSink, StoredSnapshot, STATE_VERSION};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Snapshot sink backed by the `model_snapshots` table.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    pub fn open(path: &str) -> Result<Self> {
        let pool = open_pool(path).with_context(|| format!("opening state database {path}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Delete all but the newest `keep` snapshots. Returns how many went.
    pub fn retain_latest(&self, keep: usize) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM model_snapshots WHERE seq NOT IN
                (SELECT seq FROM model_snapshots ORDER BY seq DESC LIMIT ?1)",
            rusqlite::params![keep as i64],
        )?;
        Ok(removed)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<(StoredSnapshot, String)> {
    let reason: String = row.get(1)?;
    let entities: i64 = row.get(3)?;
    Ok((
        StoredSnapshot {
            id: row.get(0)?,
            // Replaced below once the reason has been validated.
            reason: CheckpointReason::Periodic,
            description: row.get(2)?,
            entities: entities.max(0) as usize,
            document: row.get(4)?,
            created_at: row.get(5)?,
        },
        reason,
    ))
}

fn with_reason((mut snapshot, reason): (StoredSnapshot, String)) -> Result<StoredSnapshot> {
    snapshot.reason = reason.parse().map_err(|e: String| anyhow!(e))?;
    Ok(snapshot)
}

impl StateSink for SqliteStateStore {
    fn store(&self, snapshot: &StoredSnapshot) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO model_snapshots
                (id, reason, description, entities, document, created_at, state_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                snapshot.id,
                snapshot.reason.as_str(),
                snapshot.description,
                snapshot.entities as i64,
                snapshot.document,
                snapshot.created_at,
                STATE_VERSION,
            ],
        )
        .with_context(|| format!("storing snapshot {}", snapshot.id))?;
        Ok(())
    }

    fn latest(&self) -> Result<Option<StoredSnapshot>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, reason, description, entities, document, created_at
                 FROM model_snapshots ORDER BY seq DESC LIMIT 1",
                [],
                row_to_snapshot,
            )
            .optional()?;
        row.map(with_reason).transpose()
    }

    fn list(&self) -> Result<Vec<StoredSnapshot>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, reason, description, entities, '', created_at
             FROM model_snapshots ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        rows.map(|r| with_reason(r?)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, reason: CheckpointReason) -> StoredSnapshot {
        StoredSnapshot {
            id: id.into(),
            created_at: 1_700_000_000,
            reason,
            description: format!("{reason} checkpoint"),
            entities: 3,
            document: "[{\"t\":\"time\",\"v\":\"600\"}]".into(),
        }
    }

    #[test]
    fn test_store_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::open(path.to_str().unwrap()).unwrap();
        assert!(store.latest().unwrap().is_none());

        store.store(&snapshot("a", CheckpointReason::Periodic)).unwrap();
        store.store(&snapshot("b", CheckpointReason::Final)).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.id, "b");
        assert_eq!(latest.reason, CheckpointReason::Final);
        assert_eq!(latest, snapshot("b", CheckpointReason::Final));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "a");
        assert!(listed[0].document.is_empty());
    }

    #[test]
    fn test_retain_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::open(path.to_str().unwrap()).unwrap();
        for id in ["a", "b", "c"] {
            store.store(&snapshot(id, CheckpointReason::Periodic)).unwrap();
        }
        assert_eq!(store.retain_latest(1).unwrap(), 2);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.latest().unwrap().unwrap().id, "c");
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStateStore::open(path.to_str().unwrap()).unwrap();
            store.store(&snapshot("a", CheckpointReason::Final)).unwrap();
        }
        let store = SqliteStateStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().id, "a");
    }
}
