//! SQLite-backed chat threads and messages.

use crate::error::ThreadError;
use crate::model::{Message, Role, Thread};
use crate::utils::now_rfc3339;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub struct ThreadStore {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
          id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT PRIMARY KEY,
          thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
          role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
          content TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_threads_updated_at ON threads(updated_at);
        "#,
    )
}

impl ThreadStore {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, ThreadError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ThreadError::Open {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ThreadError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ThreadError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_thread(&self, title: &str) -> Result<Thread, ThreadError> {
        let title = checked_title(title)?;
        let now = now_rfc3339();
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            title,
            created_at: now.clone(),
            updated_at: now,
        };
        self.conn.lock().execute(
            "INSERT INTO threads (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![thread.id, thread.title, thread.created_at, thread.updated_at],
        )?;
        tracing::debug!(thread_id = %thread.id, "thread created");
        Ok(thread)
    }

    pub fn get_thread(&self, id: &str) -> Result<Thread, ThreadError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM threads WHERE id = ?1",
            params![id],
            thread_from_row,
        )
        .optional()?
        .ok_or_else(|| ThreadError::NotFound(id.to_string()))
    }

    /// Most recently updated first.
    pub fn list_threads(&self) -> Result<Vec<Thread>, ThreadError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM threads
             ORDER BY updated_at DESC, rowid DESC",
        )?;
        let threads = stmt
            .query_map([], thread_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(threads)
    }

    pub fn thread_count(&self) -> Result<u64, ThreadError> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn update_thread(&self, id: &str, title: &str) -> Result<Thread, ThreadError> {
        let title = checked_title(title)?;
        let changed = self.conn.lock().execute(
            "UPDATE threads SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(ThreadError::NotFound(id.to_string()));
        }
        self.get_thread(id)
    }

    /// Deletes the thread and, by cascade, its messages.
    pub fn delete_thread(&self, id: &str) -> Result<(), ThreadError> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM threads WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ThreadError::NotFound(id.to_string()));
        }
        tracing::debug!(thread_id = id, "thread deleted");
        Ok(())
    }

    /// Append a message and touch the thread's `updated_at`.
    pub fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, ThreadError> {
        if content.trim().is_empty() {
            return Err(ThreadError::EmptyMessage);
        }
        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now_rfc3339(),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let touched = tx.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![message.created_at, thread_id],
        )?;
        if touched == 0 {
            return Err(ThreadError::NotFound(thread_id.to_string()));
        }
        tx.execute(
            "INSERT INTO messages (id, thread_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.thread_id,
                message.role.as_ref(),
                message.content,
                message.created_at
            ],
        )?;
        tx.commit()?;
        Ok(message)
    }

    /// Oldest first.
    pub fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>, ThreadError> {
        let conn = self.conn.lock();
        let exists = conn
            .query_row(
                "SELECT 1 FROM threads WHERE id = ?1",
                params![thread_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(ThreadError::NotFound(thread_id.to_string()));
        }

        let mut stmt = conn.prepare(
            "SELECT id, thread_id, role, content, created_at FROM messages
             WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let messages = stmt
            .query_map(params![thread_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }
}

fn checked_title(title: &str) -> Result<String, ThreadError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ThreadError::InvalidTitle);
    }
    Ok(title.to_string())
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = Role::from_str(&role).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}
