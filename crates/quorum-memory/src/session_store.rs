use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use quorum_schema::{Message, Role, Session, SessionView};

use crate::migrations::run_session_migrations;

/// Multi-session conversation store. Message logs are append-only and keep
/// full per-agent attribution; collapsing for presentation happens at read
/// time.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_session_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_session_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create(&self, owner: &str, title: Option<&str>) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_owned(),
            title: title.unwrap_or("New session").to_owned(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let db = Arc::clone(&self.db);
        let row = session.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO sessions (id, owner, title, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    row.id,
                    row.owner,
                    row.title,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(session)
    }

    /// Create a session under a caller-supplied id if it does not exist
    /// yet, returning the stored row either way. Sessions are created on
    /// demand when a request names an id the store has not seen.
    pub async fn get_or_create(&self, id: &str, owner: &str) -> Result<Session> {
        if let Some(existing) = self.load(id).await? {
            return Ok(existing);
        }
        let session = Session {
            id: id.to_owned(),
            owner: owner.to_owned(),
            title: "New session".to_owned(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let db = Arc::clone(&self.db);
        let row = session.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT OR IGNORE INTO sessions (id, owner, title, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    row.id,
                    row.owner,
                    row.title,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(session)
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<Session>> {
        let db = Arc::clone(&self.db);
        let owner = owner.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, owner, title, created_at, updated_at
                FROM sessions
                WHERE owner = ?1
                ORDER BY updated_at DESC
                "#,
            )?;
            let rows = stmt.query_map(params![owner], row_to_session)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok::<Vec<Session>, anyhow::Error>(sessions)
        })
        .await?
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let session = conn
                .query_row(
                    "SELECT id, owner, title, created_at, updated_at FROM sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .optional()?;
            Ok::<Option<Session>, anyhow::Error>(session)
        })
        .await?
    }

    /// Append one message. The session's `updated_at` moves to the message
    /// timestamp. Fails if the session does not exist.
    pub async fn append(&self, message: &Message) -> Result<()> {
        let db = Arc::clone(&self.db);
        let msg = message.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            let updated = tx.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![msg.created_at.to_rfc3339(), msg.session_id],
            )?;
            if updated == 0 {
                return Err(anyhow!("session not found: {}", msg.session_id));
            }
            tx.execute(
                r#"
                INSERT INTO messages (id, session_id, role, content, agent, confidence, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    msg.id.to_string(),
                    msg.session_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.agent,
                    msg.confidence,
                    msg.created_at.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// All messages for a session, oldest first. The presentation view
    /// collapses each multi-agent run to its aggregator message.
    pub async fn messages(&self, id: &str, view: SessionView) -> Result<Vec<Message>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        let all = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, session_id, role, content, agent, confidence, created_at
                FROM messages
                WHERE session_id = ?1
                ORDER BY created_at ASC, id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![id], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok::<Vec<Message>, anyhow::Error>(messages)
        })
        .await??;

        Ok(match view {
            SessionView::Raw => all,
            SessionView::Presentation => collapse_runs(all),
        })
    }

    /// Last `n` messages, oldest first.
    pub async fn recent(&self, id: &str, n: usize) -> Result<Vec<Message>> {
        let mut all = self.messages(id, SessionView::Raw).await?;
        if all.len() > n {
            all = all.split_off(all.len() - n);
        }
        Ok(all)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok::<bool, anyhow::Error>(deleted > 0)
        })
        .await?
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();
        let title = title.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let updated = conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                params![title, id],
            )?;
            Ok::<bool, anyhow::Error>(updated > 0)
        })
        .await?
    }

    /// Remove messages whose content contains any pattern
    /// (case-insensitive substring). Returns the number removed.
    pub async fn delete_messages_matching(&self, patterns: &[String]) -> Result<usize> {
        if patterns.is_empty() {
            return Ok(0);
        }
        let db = Arc::clone(&self.db);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            let mut ids = std::collections::BTreeSet::new();
            for p in &patterns {
                let mut stmt =
                    tx.prepare("SELECT id FROM messages WHERE instr(lower(content), ?1) > 0")?;
                let rows = stmt.query_map(params![p], |r| r.get::<_, String>(0))?;
                for row in rows {
                    ids.insert(row?);
                }
            }
            for id in &ids {
                tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok::<usize, anyhow::Error>(ids.len())
        })
        .await?
    }

    pub async fn session_count(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
            Ok::<usize, anyhow::Error>(n as usize)
        })
        .await?
    }

    pub async fn export_sessions(&self) -> Result<Vec<(Session, Vec<Message>)>> {
        let db = Arc::clone(&self.db);
        let sessions = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt =
                conn.prepare("SELECT id, owner, title, created_at, updated_at FROM sessions")?;
            let rows = stmt.query_map([], row_to_session)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<Vec<Session>, anyhow::Error>(out)
        })
        .await??;

        let mut exported = Vec::with_capacity(sessions.len());
        for session in sessions {
            let messages = self.messages(&session.id, SessionView::Raw).await?;
            exported.push((session, messages));
        }
        Ok(exported)
    }

    pub async fn import_sessions(&self, sessions: Vec<(Session, Vec<Message>)>) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            for (session, messages) in &sessions {
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO sessions (id, owner, title, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        session.id,
                        session.owner,
                        session.title,
                        session.created_at.to_rfc3339(),
                        session.updated_at.to_rfc3339(),
                    ],
                )?;
                for msg in messages {
                    tx.execute(
                        r#"
                        INSERT OR REPLACE INTO messages
                            (id, session_id, role, content, agent, confidence, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                        "#,
                        params![
                            msg.id.to_string(),
                            msg.session_id,
                            msg.role.as_str(),
                            msg.content,
                            msg.agent,
                            msg.confidence,
                            msg.created_at.to_rfc3339(),
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }
}

/// Collapse each contiguous assistant block that contains an aggregator
/// message down to that aggregator message; blocks without one (single-agent
/// runs) are kept as-is.
fn collapse_runs(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut block: Vec<Message> = Vec::new();

    let flush = |block: &mut Vec<Message>, out: &mut Vec<Message>| {
        if block.is_empty() {
            return;
        }
        if let Some(agg) = block
            .iter()
            .rev()
            .find(|m| m.agent.as_deref() == Some("aggregator"))
        {
            out.push(agg.clone());
        } else {
            out.append(block);
        }
        block.clear();
    };

    for msg in messages {
        if msg.role == Role::Assistant {
            block.push(msg);
        } else {
            flush(&mut block, &mut out);
            out.push(msg);
        }
    }
    flush(&mut block, &mut out);
    out
}

fn parse_role(raw: &str) -> Role {
    match raw {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        _ => Role::User,
    }
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let created_raw: String = row.get(3)?;
    let updated_raw: String = row.get(4)?;
    Ok(Session {
        id: row.get(0)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_datetime_sql(&created_raw)?,
        updated_at: parse_datetime_sql(&updated_raw)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id_raw: String = row.get(0)?;
    let role_raw: String = row.get(2)?;
    let created_raw: String = row.get(6)?;
    Ok(Message {
        id: Uuid::parse_str(&id_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        session_id: row.get(1)?,
        role: parse_role(&role_raw),
        content: row.get(3)?,
        agent: row.get(4)?,
        confidence: row.get(5)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}
