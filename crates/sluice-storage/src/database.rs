//! High-level database interface.

use std::path::PathBuf;

use sluice_core::{Session, SessionStore};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;
use crate::repository::SessionsRepo;

/// File name of the session database inside the data directory.
pub const DB_FILE: &str = "sluice.db";

/// High-level database interface for Sluice.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = sluice_core::config::project_dirs()
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join(DB_FILE))
    }

    // === Sessions ===

    /// Insert or update a session snapshot.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let conn = self.pool.get()?;
        SessionsRepo::upsert(&conn, session)
    }

    /// Get a session by id.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.pool.get()?;
        SessionsRepo::get_by_id(&conn, id)
    }

    /// Get recent sessions, newest first.
    pub fn get_recent_sessions(&self, limit: i64, offset: i64) -> Result<Vec<Session>> {
        let conn = self.pool.get()?;
        SessionsRepo::get_recent(&conn, limit, offset)
    }

    /// Count stored sessions.
    pub fn count_sessions(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        SessionsRepo::count(&conn)
    }

    /// Delete every stored session.
    pub fn clear_sessions(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        SessionsRepo::clear(&conn)
    }
}

impl SessionStore for Database {
    fn save(&self, session: &Session) -> sluice_core::Result<()> {
        Ok(self.save_session(session)?)
    }
}
