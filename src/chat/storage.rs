// Persistent message storage using SQLite

use crate::chat::error::ChatResult;
use crate::chat::message::{Message, MessageKind, MessageStatus, NewMessage};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest page returned by `list_since`
pub const MAX_PAGE: usize = 200;

/// Operations the chat core needs from a message store
pub trait MessageStore: Send + Sync {
    /// Validate and persist a new message with status `sent`
    fn create(&self, new: NewMessage) -> ChatResult<Message>;

    /// Look up a message by id
    fn find_by_id(&self, id: &str) -> ChatResult<Option<Message>>;

    /// Messages created at or after `after`, oldest first
    fn list_since(&self, after: Option<u64>, limit: usize) -> ChatResult<Vec<Message>>;

    /// Move a message from `sent` to `delivered` unless `requester_id` sent it
    ///
    /// Must be atomic per message: returns `true` only for the one caller
    /// that performed the transition.
    fn mark_delivered(&self, id: &str, requester_id: &str, at: u64) -> ChatResult<bool>;
}

const MESSAGE_COLUMNS: &str = "id, sender_id, content, kind, file_url, file_name, file_size, \
                               mime_type, status, created_at, delivered_at";

/// SQLite-backed message store
pub struct SqliteMessageStore {
    db_path: PathBuf,
}

impl SqliteMessageStore {
    /// Open (and create if needed) the database at `db_path`
    pub fn new(db_path: &Path) -> ChatResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };

        store.initialize_db()?;

        Ok(store)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Get database connection
    fn get_connection(&self) -> ChatResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Initialize database schema
    fn initialize_db(&self) -> ChatResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                content TEXT,
                kind TEXT NOT NULL,
                file_url TEXT,
                file_name TEXT,
                file_size INTEGER,
                mime_type TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                delivered_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at)",
            [],
        )?;

        Ok(())
    }

    fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
        let kind: String = row.get(3)?;
        let kind = MessageKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown message kind '{kind}'").into(),
            )
        })?;

        Ok(Message {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            content: row.get(2)?,
            kind,
            file_url: row.get(4)?,
            file_name: row.get(5)?,
            file_size: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
            mime_type: row.get(7)?,
            status: MessageStatus::parse(&row.get::<_, String>(8)?),
            created_at: row.get::<_, i64>(9)? as u64,
            delivered_at: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
        })
    }
}

impl MessageStore for SqliteMessageStore {
    fn create(&self, new: NewMessage) -> ChatResult<Message> {
        let message = new.into_message()?;
        let conn = self.get_connection()?;

        conn.execute(
            "INSERT INTO messages (id, sender_id, content, kind, file_url, file_name, file_size,
                                   mime_type, status, created_at, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.sender_id,
                message.content,
                message.kind.as_str(),
                message.file_url,
                message.file_name,
                message.file_size.map(|s| s as i64),
                message.mime_type,
                message.status.as_str(),
                message.created_at as i64,
                None::<i64>,
            ],
        )?;

        Ok(message)
    }

    fn find_by_id(&self, id: &str) -> ChatResult<Option<Message>> {
        let conn = self.get_connection()?;

        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                Self::row_to_message,
            )
            .optional()?;

        Ok(message)
    }

    fn list_since(&self, after: Option<u64>, limit: usize) -> ChatResult<Vec<Message>> {
        let conn = self.get_connection()?;
        let limit = limit.min(MAX_PAGE) as i64;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE ?1 IS NULL OR created_at >= ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2"
        ))?;

        let messages = stmt
            .query_map(params![after.map(|a| a as i64), limit], Self::row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    fn mark_delivered(&self, id: &str, requester_id: &str, at: u64) -> ChatResult<bool> {
        let conn = self.get_connection()?;

        // The status predicate makes this a compare-and-swap on the row
        let changed = conn.execute(
            "UPDATE messages SET status = ?1, delivered_at = ?2
             WHERE id = ?3 AND status = ?4 AND sender_id != ?5",
            params![
                MessageStatus::Delivered.as_str(),
                at as i64,
                id,
                MessageStatus::Sent.as_str(),
                requester_id,
            ],
        )?;

        Ok(changed == 1)
    }
}
