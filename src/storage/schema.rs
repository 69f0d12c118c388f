//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS model_snapshots (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            reason TEXT NOT NULL,
            description TEXT NOT NULL,
            entities INTEGER NOT NULL,
            document TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            stored_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_model_snapshots_created ON model_snapshots(created_at);",
    )?;

    // Migration: record the document layout version alongside each snapshot
    let has_state_version: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('model_snapshots') WHERE name='state_version'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_state_version == 0 {
        conn.execute(
            "ALTER TABLE model_snapshots ADD COLUMN state_version TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM model_snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let columns: i64 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('model_snapshots') WHERE name='state_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(columns, 1);
    }
}
