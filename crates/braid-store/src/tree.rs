use std::collections::{HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use braid_core::ids::{NodeId, SessionId};
use braid_core::messages::{MessageNode, NodeKind, NodeWrite, Part, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::merge::{merge_metadata, strip_denylisted};
use crate::row_helpers;
use crate::sessions::{self, SessionStateRepo};
use crate::title::derive_title;

/// Id of the synthetic user turn carrying the session preface.
pub const PREFACE_NODE_ID: &str = "preface";

const NODE_COLUMNS: &str =
    "id, session_id, parent_id, role, kind, parts, metadata, sealed, created_at, updated_at";

/// Append-only branching conversation history, one tree per session.
pub struct MessageTree {
    db: Database,
    sessions: SessionStateRepo,
}

impl MessageTree {
    pub fn new(db: Database) -> Self {
        let sessions = SessionStateRepo::new(db.clone());
        Self { db, sessions }
    }

    pub fn sessions(&self) -> &SessionStateRepo {
        &self.sessions
    }

    /// Insert a new node. Any existing node with the same id is a conflict.
    #[instrument(
        skip(self, write),
        fields(session_id = %write.session_id, node_id = %write.id, role = %write.role)
    )]
    pub fn append(&self, write: NodeWrite) -> Result<MessageNode, StoreError> {
        self.db.with_tx(|tx| {
            if find_node(tx, &write.session_id, &write.id)?.is_some() {
                return Err(StoreError::Conflict(format!("node {} already exists", write.id)));
            }
            insert_node(tx, write)
        })
    }

    /// Merge into an existing non-user node, or append when the id is new.
    ///
    /// Parts are replaced wholesale; metadata is merged with counters summed.
    /// The parent pointer and role of an existing node never change.
    #[instrument(
        skip(self, write),
        fields(session_id = %write.session_id, node_id = %write.id, role = %write.role)
    )]
    pub fn upsert(&self, write: NodeWrite) -> Result<MessageNode, StoreError> {
        self.db.with_tx(|tx| {
            let Some(existing) = find_node(tx, &write.session_id, &write.id)? else {
                return insert_node(tx, write);
            };
            if existing.role == Role::User || write.role == Role::User {
                return Err(StoreError::Conflict(format!(
                    "user node {} cannot be upserted",
                    write.id
                )));
            }
            if existing.sealed {
                return Err(StoreError::Conflict(format!("node {} is sealed", write.id)));
            }

            let metadata = merge_metadata(existing.metadata, write.metadata);
            let now = timestamp();
            tx.execute(
                "UPDATE message_nodes SET parts = ?1, metadata = ?2, kind = ?3, updated_at = ?4
                 WHERE session_id = ?5 AND id = ?6",
                rusqlite::params![
                    serde_json::to_string(&write.parts)?,
                    serde_json::to_string(&metadata)?,
                    write.kind.as_str(),
                    now,
                    write.session_id.as_str(),
                    write.id.as_str(),
                ],
            )?;
            debug!(parts = write.parts.len(), "node merged");
            require_node(tx, &write.session_id, &write.id)
        })
    }

    /// Freeze a node; later upserts against it fail with a conflict.
    #[instrument(skip(self), fields(session_id = %session_id, node_id = %id))]
    pub fn seal(&self, session_id: &SessionId, id: &NodeId) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE message_nodes SET sealed = 1 WHERE session_id = ?1 AND id = ?2",
                rusqlite::params![session_id.as_str(), id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id, node_id = %id))]
    pub fn get(&self, session_id: &SessionId, id: &NodeId) -> Result<MessageNode, StoreError> {
        self.db.with_conn(|conn| require_node(conn, session_id, id))
    }

    pub fn find(
        &self,
        session_id: &SessionId,
        id: &NodeId,
    ) -> Result<Option<MessageNode>, StoreError> {
        self.db.with_conn(|conn| find_node(conn, session_id, id))
    }

    /// Every node of a session in append order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<MessageNode>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {NODE_COLUMNS} FROM message_nodes WHERE session_id = ?1 ORDER BY sequence"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_node(row)?);
            }
            Ok(out)
        })
    }

    /// Tip reached by following the most recently appended child from the
    /// most recent root. Sub-agent records are side branches and never chosen.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn resolve_rightmost_leaf(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<NodeId>, StoreError> {
        self.db.with_conn(|conn| rightmost_leaf(conn, session_id))
    }

    /// Ancestor chain from the root down to `leaf_id`, inclusive.
    #[instrument(skip(self), fields(session_id = %session_id, leaf_id = %leaf_id))]
    pub fn load_chain(
        &self,
        session_id: &SessionId,
        leaf_id: &NodeId,
    ) -> Result<Vec<MessageNode>, StoreError> {
        self.db.with_conn(|conn| load_chain(conn, session_id, leaf_id))
    }

    /// Chain as handed to a producer: the session preface, when set, leads
    /// as a synthetic user turn that is not part of the tree.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn load_context(
        &self,
        session_id: &SessionId,
        leaf_id: Option<&NodeId>,
    ) -> Result<Vec<MessageNode>, StoreError> {
        self.db.with_conn(|conn| {
            let mut chain = match leaf_id {
                Some(leaf) => load_chain(conn, session_id, leaf)?,
                None => Vec::new(),
            };
            if let Some(preface) = sessions::preface_of(conn, session_id)? {
                chain.insert(0, preface_node(session_id, preface));
            }
            Ok(chain)
        })
    }
}

fn preface_node(session_id: &SessionId, preface: String) -> MessageNode {
    let mut metadata = Map::new();
    metadata.insert("synthetic".into(), Value::Bool(true));
    MessageNode {
        id: NodeId::from_raw(PREFACE_NODE_ID),
        session_id: session_id.clone(),
        parent_id: None,
        role: Role::User,
        kind: NodeKind::Normal,
        parts: vec![Part::text(preface)],
        metadata,
        created_at: String::new(),
        updated_at: String::new(),
        sealed: true,
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn insert_node(conn: &Connection, mut write: NodeWrite) -> Result<MessageNode, StoreError> {
    let now = timestamp();
    sessions::ensure_session(conn, &write.session_id, &now)?;

    if let Some(parent) = &write.parent_id {
        if find_node(conn, &write.session_id, parent)?.is_none() {
            return Err(StoreError::NotFound(format!("parent node {parent}")));
        }
    }

    strip_denylisted(&mut write.metadata);
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM message_nodes WHERE session_id = ?1",
        [write.session_id.as_str()],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO message_nodes
            (session_id, id, parent_id, sequence, role, kind, parts, metadata, sealed,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        rusqlite::params![
            write.session_id.as_str(),
            write.id.as_str(),
            write.parent_id.as_ref().map(NodeId::as_str),
            sequence,
            write.role.as_str(),
            write.kind.as_str(),
            serde_json::to_string(&write.parts)?,
            serde_json::to_string(&write.metadata)?,
            now,
        ],
    )?;

    if write.role == Role::User {
        if let Some(title) = derive_title(&write.parts) {
            sessions::set_title_if_absent(conn, &write.session_id, &title)?;
        }
    }
    let leaf = rightmost_leaf(conn, &write.session_id)?;
    sessions::set_rightmost_leaf(conn, &write.session_id, leaf.as_ref(), &now)?;

    debug!(sequence, "node appended");
    require_node(conn, &write.session_id, &write.id)
}

fn find_node(
    conn: &Connection,
    session_id: &SessionId,
    id: &NodeId,
) -> Result<Option<MessageNode>, StoreError> {
    let sql =
        format!("SELECT {NODE_COLUMNS} FROM message_nodes WHERE session_id = ?1 AND id = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([session_id.as_str(), id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_node(row)?)),
        None => Ok(None),
    }
}

fn require_node(
    conn: &Connection,
    session_id: &SessionId,
    id: &NodeId,
) -> Result<MessageNode, StoreError> {
    find_node(conn, session_id, id)?.ok_or_else(|| StoreError::NotFound(format!("node {id}")))
}

fn rightmost_leaf(conn: &Connection, session_id: &SessionId) -> Result<Option<NodeId>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id FROM message_nodes
         WHERE session_id = ?1 AND role != 'subagent' ORDER BY sequence",
    )?;
    let mut rows = stmt.query([session_id.as_str()])?;

    // Ascending sequence, so the last insert per parent is its newest child.
    let mut newest_child: HashMap<Option<String>, String> = HashMap::new();
    while let Some(row) = rows.next()? {
        let id: String = row_helpers::get(row, 0, "message_nodes", "id")?;
        let parent: Option<String> = row_helpers::get_opt(row, 1, "message_nodes", "parent_id")?;
        newest_child.insert(parent, id);
    }

    let Some(mut cursor) = newest_child.get(&None).cloned() else {
        return Ok(None);
    };
    let mut seen = HashSet::new();
    while let Some(next) = newest_child.get(&Some(cursor.clone())) {
        if !seen.insert(cursor.clone()) {
            return Err(StoreError::CorruptRow {
                table: "message_nodes",
                column: "parent_id",
                detail: format!("cycle through {cursor}"),
            });
        }
        cursor = next.clone();
    }
    Ok(Some(NodeId::from_raw(cursor)))
}

fn load_chain(
    conn: &Connection,
    session_id: &SessionId,
    leaf_id: &NodeId,
) -> Result<Vec<MessageNode>, StoreError> {
    let leaf = require_node(conn, session_id, leaf_id)?;
    let mut seen = HashSet::from([leaf.id.clone()]);
    let mut chain = vec![leaf];

    while let Some(parent_id) = chain.last().and_then(|n| n.parent_id.clone()) {
        if !seen.insert(parent_id.clone()) {
            return Err(StoreError::CorruptRow {
                table: "message_nodes",
                column: "parent_id",
                detail: format!("cycle through {parent_id}"),
            });
        }
        let parent = find_node(conn, session_id, &parent_id)?.ok_or_else(|| StoreError::CorruptRow {
            table: "message_nodes",
            column: "parent_id",
            detail: format!("dangling parent {parent_id}"),
        })?;
        chain.push(parent);
    }

    chain.reverse();
    Ok(chain)
}

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<MessageNode, StoreError> {
    const T: &str = "message_nodes";
    let role: String = row_helpers::get(row, 3, T, "role")?;
    let kind: String = row_helpers::get(row, 4, T, "kind")?;
    let parts: String = row_helpers::get(row, 5, T, "parts")?;
    let metadata: String = row_helpers::get(row, 6, T, "metadata")?;
    Ok(MessageNode {
        id: NodeId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        parent_id: row_helpers::get_opt::<String>(row, 2, T, "parent_id")?.map(NodeId::from_raw),
        role: row_helpers::parse_enum(&role, T, "role")?,
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        parts: row_helpers::parse_json(&parts, T, "parts")?,
        metadata: row_helpers::parse_object(&metadata, T, "metadata")?,
        sealed: row_helpers::get::<bool>(row, 7, T, "sealed")?,
        created_at: row_helpers::get(row, 8, T, "created_at")?,
        updated_at: row_helpers::get(row, 9, T, "updated_at")?,
    })
}

/// Count of nodes stored for a session.
pub fn node_count(db: &Database, session_id: &SessionId) -> Result<u64, StoreError> {
    db.with_conn(|conn| {
        let count: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM message_nodes WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u64)
    })
}
