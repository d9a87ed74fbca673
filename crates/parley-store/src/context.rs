//! Versioned transcript storage.
//!
//! Every write produces a new version for the `(session, agent)` key; nothing is
//! edited in place. Rollback copies an old version forward as the newest one.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use parley_core::ids::{AgentId, SessionId};
use parley_core::messages::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;

pub const ROLLBACK_NOTE: &str = "rollback";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextVersion {
    pub version: u32,
    pub messages: Vec<ChatMessage>,
    pub note: Option<String>,
    pub created_at: String,
}

/// Durable transcript state, treated by the engine as an opaque versioned mailbox.
pub trait ContextStore: Send + Sync {
    /// Start a fresh history (version 1), discarding any previous one.
    fn create(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError>;

    /// Store latest transcript + `messages` as a new version.
    fn append(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError>;

    /// Load a specific version, or the latest when `version` is `None`.
    fn snapshot(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> Result<Option<ContextVersion>, StoreError>;

    /// Copy `version` forward as a new latest version.
    fn rollback(&self, session_id: &SessionId, agent_id: &AgentId, version: u32) -> Result<u32, StoreError>;

    /// Drop all versions for one key. Returns the number removed.
    fn delete(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<usize, StoreError>;

    /// Drop every key that belongs to the session. Returns the number of versions removed.
    fn clear_session(&self, session_id: &SessionId) -> Result<usize, StoreError>;
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

type Key = (SessionId, AgentId);

#[derive(Default)]
pub struct InMemoryContextStore {
    entries: Mutex<HashMap<Key, Vec<ContextVersion>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(session_id: &SessionId, agent_id: &AgentId) -> Key {
        (session_id.clone(), agent_id.clone())
    }
}

impl ContextStore for InMemoryContextStore {
    fn create(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError> {
        let version = ContextVersion {
            version: 1,
            messages: messages.to_vec(),
            note: None,
            created_at: now(),
        };
        self.entries
            .lock()
            .insert(Self::key(session_id, agent_id), vec![version]);
        Ok(1)
    }

    fn append(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError> {
        let mut entries = self.entries.lock();
        let versions = entries.entry(Self::key(session_id, agent_id)).or_default();
        let (next, mut transcript) = match versions.last() {
            Some(latest) => (latest.version + 1, latest.messages.clone()),
            None => (1, Vec::new()),
        };
        transcript.extend_from_slice(messages);
        versions.push(ContextVersion {
            version: next,
            messages: transcript,
            note: None,
            created_at: now(),
        });
        Ok(next)
    }

    fn snapshot(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> Result<Option<ContextVersion>, StoreError> {
        let entries = self.entries.lock();
        let Some(versions) = entries.get(&Self::key(session_id, agent_id)) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|c| c.version == v).cloned(),
            None => versions.last().cloned(),
        })
    }

    fn rollback(&self, session_id: &SessionId, agent_id: &AgentId, version: u32) -> Result<u32, StoreError> {
        let mut entries = self.entries.lock();
        let versions = entries
            .get_mut(&Self::key(session_id, agent_id))
            .ok_or_else(|| StoreError::NotFound(format!("context {session_id}/{agent_id}")))?;
        let target = versions
            .iter()
            .find(|c| c.version == version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("context version {version}")))?;
        let next = versions.last().map_or(1, |c| c.version + 1);
        versions.push(ContextVersion {
            version: next,
            messages: target.messages,
            note: Some(ROLLBACK_NOTE.to_string()),
            created_at: now(),
        });
        Ok(next)
    }

    fn delete(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .lock()
            .remove(&Self::key(session_id, agent_id))
            .map_or(0, |v| v.len()))
    }

    fn clear_session(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        entries.retain(|(sid, _), versions| {
            if sid == session_id {
                removed += versions.len();
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteContextStore {
    db: Database,
}

impl SqliteContextStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn latest_version(conn: &rusqlite::Connection, session_id: &str, agent_id: &str) -> Result<Option<u32>, StoreError> {
    let latest: Option<u32> = conn.query_row(
        "SELECT MAX(version) FROM context_versions WHERE session_id = ?1 AND agent_id = ?2",
        [session_id, agent_id],
        |row| row.get(0),
    )?;
    Ok(latest)
}

fn load_version(
    conn: &rusqlite::Connection,
    session_id: &str,
    agent_id: &str,
    version: u32,
) -> Result<Option<ContextVersion>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT version, messages, note, created_at FROM context_versions
         WHERE session_id = ?1 AND agent_id = ?2 AND version = ?3",
    )?;
    let mut rows = stmt.query(rusqlite::params![session_id, agent_id, version])?;
    match rows.next()? {
        Some(row) => {
            let raw: String = row.get(1)?;
            Ok(Some(ContextVersion {
                version: row.get(0)?,
                messages: serde_json::from_str(&raw)?,
                note: row.get(2)?,
                created_at: row.get(3)?,
            }))
        }
        None => Ok(None),
    }
}

fn insert_version(
    conn: &rusqlite::Connection,
    session_id: &str,
    agent_id: &str,
    version: u32,
    messages: &[ChatMessage],
    note: Option<&str>,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(messages)?;
    conn.execute(
        "INSERT INTO context_versions (session_id, agent_id, version, messages, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![session_id, agent_id, version, json, note, now()],
    )?;
    Ok(())
}

impl ContextStore for SqliteContextStore {
    #[instrument(skip(self, messages), fields(session_id = %session_id, agent_id = %agent_id))]
    fn create(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM context_versions WHERE session_id = ?1 AND agent_id = ?2",
                [session_id.as_str(), agent_id.as_str()],
            )?;
            insert_version(tx, session_id.as_str(), agent_id.as_str(), 1, messages, None)?;
            Ok(1)
        })
    }

    #[instrument(skip(self, messages), fields(session_id = %session_id, agent_id = %agent_id, count = messages.len()))]
    fn append(&self, session_id: &SessionId, agent_id: &AgentId, messages: &[ChatMessage]) -> Result<u32, StoreError> {
        self.db.with_tx(|tx| {
            let (sid, aid) = (session_id.as_str(), agent_id.as_str());
            let (next, mut transcript) = match latest_version(tx, sid, aid)? {
                Some(v) => {
                    let latest = load_version(tx, sid, aid, v)?;
                    (v + 1, latest.map(|c| c.messages).unwrap_or_default())
                }
                None => (1, Vec::new()),
            };
            transcript.extend_from_slice(messages);
            insert_version(tx, sid, aid, next, &transcript, None)?;
            debug!(version = next, "context appended");
            Ok(next)
        })
    }

    fn snapshot(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        version: Option<u32>,
    ) -> Result<Option<ContextVersion>, StoreError> {
        self.db.with_conn(|conn| {
            let (sid, aid) = (session_id.as_str(), agent_id.as_str());
            let target = match version {
                Some(v) => Some(v),
                None => latest_version(conn, sid, aid)?,
            };
            match target {
                Some(v) => load_version(conn, sid, aid, v),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, agent_id = %agent_id))]
    fn rollback(&self, session_id: &SessionId, agent_id: &AgentId, version: u32) -> Result<u32, StoreError> {
        self.db.with_tx(|tx| {
            let (sid, aid) = (session_id.as_str(), agent_id.as_str());
            let target = load_version(tx, sid, aid, version)?
                .ok_or_else(|| StoreError::NotFound(format!("context version {version}")))?;
            let next = latest_version(tx, sid, aid)?.map_or(1, |v| v + 1);
            insert_version(tx, sid, aid, next, &target.messages, Some(ROLLBACK_NOTE))?;
            Ok(next)
        })
    }

    fn delete(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM context_versions WHERE session_id = ?1 AND agent_id = ?2",
                [session_id.as_str(), agent_id.as_str()],
            )?)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn clear_session(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM context_versions WHERE session_id = ?1",
                [session_id.as_str()],
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (SessionId, AgentId) {
        (SessionId::from_raw("s1"), AgentId::from_raw("a1"))
    }

    fn stores() -> Vec<Box<dyn ContextStore>> {
        vec![
            Box::new(InMemoryContextStore::new()),
            Box::new(SqliteContextStore::new(Database::in_memory().unwrap())),
        ]
    }

    #[test]
    fn append_builds_on_latest_version() {
        for store in stores() {
            let (s, a) = ids();
            assert_eq!(store.append(&s, &a, &[ChatMessage::user("hi")]).unwrap(), 1);
            assert_eq!(store.append(&s, &a, &[ChatMessage::assistant("hello")]).unwrap(), 2);

            let latest = store.snapshot(&s, &a, None).unwrap().unwrap();
            assert_eq!(latest.version, 2);
            assert_eq!(latest.messages.len(), 2);

            let first = store.snapshot(&s, &a, Some(1)).unwrap().unwrap();
            assert_eq!(first.messages, vec![ChatMessage::user("hi")]);
        }
    }

    #[test]
    fn create_resets_history() {
        for store in stores() {
            let (s, a) = ids();
            store.append(&s, &a, &[ChatMessage::user("old")]).unwrap();
            store.append(&s, &a, &[ChatMessage::user("older")]).unwrap();
            assert_eq!(store.create(&s, &a, &[ChatMessage::system("fresh")]).unwrap(), 1);
            assert!(store.snapshot(&s, &a, Some(2)).unwrap().is_none());
            let latest = store.snapshot(&s, &a, None).unwrap().unwrap();
            assert_eq!(latest.messages, vec![ChatMessage::system("fresh")]);
        }
    }

    #[test]
    fn rollback_copies_forward_with_note() {
        for store in stores() {
            let (s, a) = ids();
            store.append(&s, &a, &[ChatMessage::user("one")]).unwrap();
            store.append(&s, &a, &[ChatMessage::user("two")]).unwrap();

            let v = store.rollback(&s, &a, 1).unwrap();
            assert_eq!(v, 3);
            let latest = store.snapshot(&s, &a, None).unwrap().unwrap();
            assert_eq!(latest.messages, vec![ChatMessage::user("one")]);
            assert_eq!(latest.note.as_deref(), Some(ROLLBACK_NOTE));
            // history is preserved
            assert_eq!(store.snapshot(&s, &a, Some(2)).unwrap().unwrap().messages.len(), 2);
        }
    }

    #[test]
    fn rollback_to_missing_version_is_not_found() {
        for store in stores() {
            let (s, a) = ids();
            store.append(&s, &a, &[ChatMessage::user("one")]).unwrap();
            assert!(matches!(store.rollback(&s, &a, 9), Err(StoreError::NotFound(_))));
        }
    }

    #[test]
    fn clear_session_removes_all_agents() {
        for store in stores() {
            let s = SessionId::from_raw("s1");
            let other = SessionId::from_raw("s2");
            let (a, b) = (AgentId::from_raw("a"), AgentId::from_raw("b"));
            store.append(&s, &a, &[ChatMessage::user("x")]).unwrap();
            store.append(&s, &b, &[ChatMessage::user("y")]).unwrap();
            store.append(&other, &a, &[ChatMessage::user("z")]).unwrap();

            assert_eq!(store.clear_session(&s).unwrap(), 2);
            assert!(store.snapshot(&s, &a, None).unwrap().is_none());
            assert!(store.snapshot(&s, &b, None).unwrap().is_none());
            assert!(store.snapshot(&other, &a, None).unwrap().is_some());
        }
    }

    #[test]
    fn clearing_unknown_session_is_harmless() {
        for store in stores() {
            assert_eq!(store.clear_session(&SessionId::from_raw("never")).unwrap(), 0);
            assert_eq!(
                store
                    .delete(&SessionId::from_raw("never"), &AgentId::from_raw("a"))
                    .unwrap(),
                0
            );
        }
    }
}
