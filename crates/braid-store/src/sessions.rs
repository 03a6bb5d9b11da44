use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use braid_core::ids::{NodeId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Small durable record kept beside a session's message tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: SessionId,
    pub rightmost_leaf: Option<NodeId>,
    /// Injected as a synthetic first user turn on context loads; never a tree node.
    pub preface: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionStateRepo {
    db: Database,
}

impl SessionStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a session record, failing with NotFound if it was never written.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionState, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        self.db.with_conn(|conn| find_session(conn, id))
    }

    /// Set or clear the session preface, creating the record if needed.
    #[instrument(skip(self, preface), fields(session_id = %id))]
    pub fn set_preface(
        &self,
        id: &SessionId,
        preface: Option<&str>,
    ) -> Result<SessionState, StoreError> {
        self.db.with_tx(|tx| {
            let now = Utc::now().to_rfc3339();
            ensure_session(tx, id, &now)?;
            tx.execute(
                "UPDATE sessions SET preface = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![preface, now, id.as_str()],
            )?;
            find_session(tx, id)?.ok_or_else(|| StoreError::NotFound(format!("session {id}")))
        })
    }

    pub fn clear_preface(&self, id: &SessionId) -> Result<SessionState, StoreError> {
        self.set_preface(id, None)
    }

    /// List sessions, most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<SessionState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, rightmost_leaf, preface, title, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC, id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }
}

pub(crate) fn ensure_session(
    conn: &Connection,
    id: &SessionId,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        rusqlite::params![id.as_str(), now],
    )?;
    Ok(())
}

pub(crate) fn find_session(
    conn: &Connection,
    id: &SessionId,
) -> Result<Option<SessionState>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, rightmost_leaf, preface, title, created_at, updated_at
         FROM sessions WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn set_rightmost_leaf(
    conn: &Connection,
    id: &SessionId,
    leaf: Option<&NodeId>,
    now: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET rightmost_leaf = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![leaf.map(NodeId::as_str), now, id.as_str()],
    )?;
    Ok(())
}

/// Returns true when the title was written.
pub(crate) fn set_title_if_absent(
    conn: &Connection,
    id: &SessionId,
    title: &str,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET title = ?1 WHERE id = ?2 AND title IS NULL",
        rusqlite::params![title, id.as_str()],
    )?;
    Ok(changed > 0)
}

pub(crate) fn preface_of(conn: &Connection, id: &SessionId) -> Result<Option<String>, StoreError> {
    let preface: Option<Option<String>> = conn
        .query_row("SELECT preface FROM sessions WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?;
    Ok(preface.flatten())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionState, StoreError> {
    Ok(SessionState {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        rightmost_leaf: row_helpers::get_opt::<String>(row, 1, "sessions", "rightmost_leaf")?
            .map(NodeId::from_raw),
        preface: row_helpers::get_opt(row, 2, "sessions", "preface")?,
        title: row_helpers::get_opt(row, 3, "sessions", "title")?,
        created_at: row_helpers::get(row, 4, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 5, "sessions", "updated_at")?,
    })
}
