//! Database migrations
//!
//! Every step is additive and checks for the structure it creates, so a run
//! interrupted half-way (or replayed against an already-migrated file) is safe.

use crate::error::Result;
use crate::models::EntityType;
use rusqlite::{params, Connection, OptionalExtension};

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i32> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let found: Option<i32> = conn
        .query_row(
            "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
            params![table, column],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Apply a list of statements and record `version`, all in one transaction
fn apply(conn: &Connection, version: i32, statements: &[String]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
        params![version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: entity tables and local app state
fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec![
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
        .to_string(),
        // Integrity flags and other device-local state
        "CREATE TABLE IF NOT EXISTS app_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"
        .to_string(),
    ];

    for entity in EntityType::ALL {
        let table = entity.table();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                updated_ms INTEGER NOT NULL,
                deleted_at TEXT
            )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_ms)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_deleted ON {table}(deleted_at)"
        ));
    }

    apply(conn, 1, &statements)
}

/// Migration to version 2: sync cursor metadata and persisted locks
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS sync_lock (
            entity_type TEXT PRIMARY KEY,
            in_progress INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER
        )"
        .to_string(),
    ];

    apply(conn, 2, &statements)
}

/// Migration to version 3: per-row sync marker and name lookup index
fn migrate_v3(conn: &Connection) -> Result<()> {
    let mut statements = Vec::new();

    for entity in EntityType::ALL {
        let table = entity.table();
        if !column_exists(conn, table, "synced_at")? {
            statements.push(format!("ALTER TABLE {table} ADD COLUMN synced_at TEXT"));
        }
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name COLLATE NOCASE)"
        ));
    }

    apply(conn, 3, &statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_partial_v3_is_completed_on_rerun() {
        let conn = setup();
        migrate_v1(&conn).unwrap();
        migrate_v2(&conn).unwrap();
        // Simulate a crash after one ALTER landed but before version 3 was recorded
        conn.execute("ALTER TABLE clients ADD COLUMN synced_at TEXT", [])
            .unwrap();

        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
        for entity in EntityType::ALL {
            assert!(column_exists(&conn, entity.table(), "synced_at").unwrap());
        }
    }

    #[test]
    fn test_migration_creates_sync_tables() {
        let conn = setup();
        run(&conn).unwrap();

        assert!(table_exists(&conn, "sync_metadata").unwrap());
        assert!(table_exists(&conn, "sync_lock").unwrap());
        assert!(table_exists(&conn, "app_state").unwrap());
    }
}
