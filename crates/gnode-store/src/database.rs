//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use gnode_shared::constants::DATABASE_FILE_NAME;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/gnode/gnode.db`
    /// - macOS:   `~/Library/Application Support/org.g-node.gnode/gnode.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\g-node\gnode\data\gnode.db`
    pub fn new() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        tracing::info!(path = %path.display(), "opening database");

        Self::open_at(&path)
    }

    /// Location used by [`Database::new`].
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "g-node", "gnode").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join(DATABASE_FILE_NAME))
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Nothing survives the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // In-memory databases answer "memory" and stay that way.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "journal mode set");
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Run `f` inside a single transaction.
    ///
    /// Any error returned by `f` rolls back every write it made. A call made
    /// while a transaction is already open joins the outer one, so store
    /// helpers can use `atomic` internally and still compose into a larger
    /// request-level transaction.
    pub fn atomic<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Database) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| E::from(StoreError::from(e)))?;
        let out = f(self)?;
        tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn atomic_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let res: Result<()> = db.atomic(|db| {
            db.create_user("rollback")?;
            Err(StoreError::NotFound)
        });
        assert!(res.is_err());
        assert!(matches!(
            db.user_by_name("rollback"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn atomic_nests_into_outer_transaction() {
        let db = Database::open_in_memory().unwrap();

        let res: Result<()> = db.atomic(|db| {
            db.atomic(|db| db.create_user("inner").map(|_| ()))?;
            Err(StoreError::NotFound)
        });
        assert!(res.is_err());
        assert!(db.user_by_name("inner").is_err());
    }
}
