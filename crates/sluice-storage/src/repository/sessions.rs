//! Sessions repository.

use rusqlite::{params, Connection, OptionalExtension};
use sluice_core::Session;

use crate::error::Result;

/// Repository for session operations.
pub struct SessionsRepo;

impl SessionsRepo {
    /// Inserts a session or replaces the stored snapshot with the same id.
    pub fn upsert(conn: &Connection, session: &Session) -> Result<()> {
        let data = serde_json::to_string(session)?;

        conn.execute(
            "INSERT INTO sessions
                (id, host, method, uri, state, start_time, end_time, upload_bytes, download_bytes, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                host = ?2, method = ?3, uri = ?4, state = ?5, start_time = ?6,
                end_time = ?7, upload_bytes = ?8, download_bytes = ?9, data = ?10",
            params![
                session.id,
                session.host,
                session.method,
                session.uri,
                session.state,
                session.start_time.to_rfc3339(),
                session.end_time.map(|t| t.to_rfc3339()),
                session.upload_bytes as i64,
                session.download_bytes as i64,
                data,
            ],
        )?;

        Ok(())
    }

    /// Gets a session by id.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Session>> {
        let data: Option<String> = conn
            .query_row("SELECT data FROM sessions WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Gets the most recent sessions, newest first.
    pub fn get_recent(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<Session>> {
        let mut stmt = conn.prepare(
            "SELECT data FROM sessions ORDER BY start_time DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt
            .query_map([limit, offset], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|data| serde_json::from_str(&data).ok())
            .collect();

        Ok(rows)
    }

    /// Counts stored sessions.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Deletes all sessions, returning how many were removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM sessions", [])?)
    }
}
