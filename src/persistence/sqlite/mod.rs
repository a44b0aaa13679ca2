use super::Persistence;
use crate::model::{Agent, AgentId, Conversation, ConversationId, Label, LabelId, Message, Session};
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// SQLite-backed persistence. Each record is stored as a JSON document
/// keyed by id; messages additionally carry `(conversation_id, seq)` for
/// ordered loads.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema().with_context(|| {
            format!(
                "Failed to initialize database schema at: {}",
                db_path.display()
            )
        })?;
        debug!("sqlite persistence opened at {}", db_path.display());
        Ok(db)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL,
                UNIQUE (conversation_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, seq);
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS labels (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn upsert<T: Serialize>(&self, table: &str, id: &str, record: &T) -> Result<()> {
        let data = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO {table} (id, data) VALUES (?1, ?2)"),
            params![id, data],
        )
        .with_context(|| format!("Failed to save {table} record {id}"))?;
        Ok(())
    }

    fn load_all<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT data FROM {table} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let data = row?;
            out.push(
                serde_json::from_str(&data)
                    .with_context(|| format!("Corrupt {table} record"))?,
            );
        }
        Ok(out)
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(())
    }

    fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
        let data = serde_json::to_string(message)?;
        conn.execute(
            "INSERT OR REPLACE INTO messages (id, conversation_id, seq, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message.id.as_str(),
                message.conversation_id.as_str(),
                i64::try_from(message.seq).context("message seq out of range")?,
                data
            ],
        )
        .with_context(|| format!("Failed to save message {}", message.id))?;
        Ok(())
    }
}

impl Persistence for SqlitePersistence {
    fn save_session(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_string(session)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        // Only one session record exists at a time.
        tx.execute("DELETE FROM sessions WHERE id != ?1", params![session.id.as_str()])?;
        tx.execute(
            "INSERT OR REPLACE INTO sessions (id, data) VALUES (?1, ?2)",
            params![session.id.as_str(), data],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_session(&self) -> Result<Option<Session>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM sessions LIMIT 1", [], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Corrupt session record"))
            .transpose()
    }

    fn delete_session(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sessions", [])?;
        Ok(())
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.upsert("conversations", conversation.id.as_str(), conversation)
    }

    fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.load_all("conversations")
    }

    fn save_message(&self, message: &Message) -> Result<()> {
        let conn = self.lock()?;
        Self::insert_message(&conn, message)
    }

    fn save_messages_with_conversation(
        &self,
        messages: &[Message],
        conversation: &Conversation,
    ) -> Result<()> {
        let data = serde_json::to_string(conversation)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for message in messages {
            Self::insert_message(&tx, message)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO conversations (id, data) VALUES (?1, ?2)",
            params![conversation.id.as_str(), data],
        )
        .with_context(|| format!("Failed to save conversation {}", conversation.id))?;
        tx.commit()?;
        Ok(())
    }

    fn load_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT data FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![conversation_id.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).context("Corrupt message record")?);
        }
        Ok(out)
    }

    fn save_agent(&self, agent: &Agent) -> Result<()> {
        self.upsert("agents", agent.id.as_str(), agent)
    }

    fn load_agents(&self) -> Result<Vec<Agent>> {
        self.load_all("agents")
    }

    fn delete_agent(&self, agent_id: &AgentId) -> Result<()> {
        self.delete("agents", agent_id.as_str())
    }

    fn save_label(&self, label: &Label) -> Result<()> {
        self.upsert("labels", label.id.as_str(), label)
    }

    fn load_labels(&self) -> Result<Vec<Label>> {
        self.load_all("labels")
    }

    fn delete_label(&self, label_id: &LabelId) -> Result<()> {
        self.delete("labels", label_id.as_str())
    }
}
