//! Message record store: one SQLite row per accepted message.
//!
//! Writes go through a single mutex-guarded connection, so concurrent
//! sessions append one whole row at a time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, Row};
use tracing::{debug, info};

use crate::error::{MailcatchError, Result};
use crate::model::mail::{MessageRecord, ParsedEmail};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT,
    recipients TEXT,
    subject TEXT,
    body TEXT,
    date TEXT,
    attachments TEXT
);
"#;

/// Durable, append-only list of received messages.
pub struct RecordStore {
    location: PathBuf,
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MailcatchError::io(parent, e))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened message store");

        Ok(Self {
            location: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// A throwaway store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            location: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Persist a message and return its id.
    ///
    /// Either the whole row is committed or nothing is.
    pub fn append(&self, email: &ParsedEmail) -> Result<i64> {
        let attachments: Vec<String> = email
            .attachments
            .iter()
            .map(|a| a.storage_path.to_string_lossy().into_owned())
            .collect();
        let attachments_json = serde_json::to_string(&attachments)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO emails (sender, recipients, subject, body, date, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                email.sender,
                email.recipients,
                email.subject,
                email.body,
                email.date,
                attachments_json
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(id, "Appended message record");
        Ok(id)
    }

    /// Every record, newest first.
    pub fn list_all(&self) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipients, subject, body, date, attachments
             FROM emails ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MailcatchError::StorageWrite("record store lock poisoned".into()))
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<MessageRecord> {
    let attachments_json: Option<String> = row.get(6)?;
    let attachments = match attachments_json.as_deref() {
        Some(json) => serde_json::from_str(json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        None => Vec::new(),
    };

    Ok(MessageRecord {
        id: row.get(0)?,
        sender: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        recipients: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        subject: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        body: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        date: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        attachments,
    })
}
