//! Database connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use super::migrations;

/// Database wrapper for the on-device `SQLite` store
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;

        let database = Self {
            conn,
            path: Some(path),
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let database = Self { conn, path: None };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    fn configure(&self) -> Result<()> {
        // journal_mode reports the resulting mode as a row; in-memory stays "memory"
        self.conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL").ok();
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.pragma_update(None, "cache_size", 10_000).ok();
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Run `PRAGMA quick_check`, returning every reported problem (empty when healthy)
    pub fn quick_check(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA quick_check")?;
        let messages = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(messages
            .into_iter()
            .filter(|message| !message.eq_ignore_ascii_case("ok"))
            .collect())
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i32> {
        migrations::get_version(&self.conn)
    }

    /// Filesystem location, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        assert_eq!(db.schema_version().unwrap(), migrations::CURRENT_VERSION);
    }

    #[test]
    fn test_open_file_and_reopen() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("quoteflow.db");

        {
            let db = Database::open(&db_path).unwrap();
            assert_eq!(db.path(), Some(db_path.as_path()));
        }

        let reopened = Database::open(&db_path).unwrap();
        assert_eq!(
            reopened.schema_version().unwrap(),
            migrations::CURRENT_VERSION
        );
        assert!(reopened.quick_check().unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_garbage_file() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("quoteflow.db");
        std::fs::write(&db_path, vec![0x42_u8; 8192]).unwrap();

        let error = Database::open(&db_path).err().unwrap();
        assert!(error.is_corrupted_database());
    }
}
