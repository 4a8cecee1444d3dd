use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error as StdError;
use std::fmt;
use std::path::Path;

/// Storage errors for the local chunk database
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite error
    Sqlite(rusqlite::Error),
    /// A status string in the database could not be parsed
    BadStatus(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "storage error: {}", e),
            StoreError::BadStatus(s) => write!(f, "unknown session status '{}'", s),
        }
    }
}

impl StdError for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Recording session status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Recording,
    Uploading,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "recording" => Ok(SessionStatus::Recording),
            "uploading" => Ok(SessionStatus::Uploading),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(StoreError::BadStatus(other.to_string())),
        }
    }

    /// Forward-only transition table. Completed and Failed are terminal.
    pub fn allows(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Recording, Uploading) | (Recording, Completed) | (Recording, Failed) => true,
            (Uploading, Completed) | (Uploading, Failed) => true,
            _ => false,
        }
    }
}

/// A bounded slice of captured audio, persisted as one record.
/// Identity is (session_id, chunk_index); indexes start at 0 and are never reused.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub media_type: String,
    pub data: Vec<u8>,
    pub created_at_ms: i64,
    pub uploaded: bool,
}

impl AudioChunk {
    /// Stable composite identifier, e.g. "abc123_chunk_000042"
    pub fn chunk_id(&self) -> String {
        format!("{}_chunk_{:06}", self.session_id, self.chunk_index)
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub status: SessionStatus,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
}

/// Partial session update; only the set fields are written.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub ended_at_ms: Option<i64>,
    pub status: Option<SessionStatus>,
    pub total_chunks: Option<u32>,
    pub uploaded_chunks: Option<u32>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Local durable store for chunks and sessions.
///
/// Each engine opens its own connection to the same database file; WAL mode
/// gives concurrent read-by-sync / write-by-capture with read-after-write
/// consistency within the process.
pub struct ChunkStore {
    conn: Connection,
}

impl ChunkStore {
    /// Open (or create) the store at the given path.
    /// Enables WAL mode and foreign keys.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for unit tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                started_at_ms INTEGER NOT NULL,
                ended_at_ms INTEGER,
                status TEXT NOT NULL,
                total_chunks INTEGER NOT NULL DEFAULT 0,
                uploaded_chunks INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS chunks (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                media_type TEXT NOT NULL,
                audio_data BLOB NOT NULL,
                created_at_ms INTEGER NOT NULL,
                uploaded INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_pending
                ON chunks(session_id, uploaded, chunk_index);
            CREATE INDEX IF NOT EXISTS idx_sessions_status
                ON sessions(status);",
        )?;
        Ok(())
    }

    /// Upsert a chunk; idempotent on (session_id, chunk_index).
    pub fn save_chunk(&self, chunk: &AudioChunk) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO chunks
                (session_id, chunk_index, media_type, audio_data, created_at_ms, uploaded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chunk.session_id,
                chunk.chunk_index,
                chunk.media_type,
                chunk.data,
                chunk.created_at_ms,
                chunk.uploaded as i32,
            ],
        )?;
        Ok(())
    }

    /// All not-yet-uploaded chunks for a session, lowest index first.
    pub fn get_unuploaded_chunks(&self, session_id: &str) -> Result<Vec<AudioChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, chunk_index, media_type, audio_data, created_at_ms, uploaded
             FROM chunks
             WHERE session_id = ?1 AND uploaded = 0
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt.query_map([session_id], row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// All chunks for a session regardless of upload state, ordered by index.
    pub fn get_chunks_for_session(&self, session_id: &str) -> Result<Vec<AudioChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, chunk_index, media_type, audio_data, created_at_ms, uploaded
             FROM chunks
             WHERE session_id = ?1
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt.query_map([session_id], row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// Set the uploaded flag; idempotent.
    pub fn mark_chunk_uploaded(&self, session_id: &str, chunk_index: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE chunks SET uploaded = 1 WHERE session_id = ?1 AND chunk_index = ?2",
            params![session_id, chunk_index],
        )?;
        Ok(())
    }

    pub fn create_session(&self, session: &RecordingSession) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions
                (id, started_at_ms, ended_at_ms, status, total_chunks, uploaded_chunks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.started_at_ms,
                session.ended_at_ms,
                session.status.as_str(),
                session.total_chunks,
                session.uploaded_chunks,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<RecordingSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, started_at_ms, ended_at_ms, status, total_chunks, uploaded_chunks
                 FROM sessions WHERE id = ?1",
                [session_id],
                row_to_session,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(s) => Ok(Some(RecordingSession {
                id: s.0,
                started_at_ms: s.1,
                ended_at_ms: s.2,
                status: SessionStatus::parse(&s.3)?,
                total_chunks: s.4 as u32,
                uploaded_chunks: s.5 as u32,
            })),
        }
    }

    /// Merge a partial update onto a session.
    ///
    /// A missing session is recreated with the update merged onto sane
    /// defaults (status recording, zero counts) rather than failing.
    /// A status write that would move backward is dropped with a warning;
    /// the remaining fields still apply. Only the supplied fields are
    /// written, so concurrent capture/sync updates of different fields
    /// cannot clobber each other.
    pub fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<()> {
        let existing = self.get_session(session_id)?;

        let existing = match existing {
            None => {
                warn!("session {} not found, creating from update", session_id);
                return self.create_session(&RecordingSession {
                    id: session_id.to_string(),
                    started_at_ms: now_ms(),
                    ended_at_ms: update.ended_at_ms,
                    status: update.status.unwrap_or(SessionStatus::Recording),
                    total_chunks: update.total_chunks.unwrap_or(0),
                    uploaded_chunks: update.uploaded_chunks.unwrap_or(0),
                });
            }
            Some(existing) => existing,
        };

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(next) = update.status {
            if existing.status.allows(next) {
                clauses.push("status = ?");
                values.push(Box::new(next.as_str()));
            } else {
                warn!(
                    "ignoring backward status transition {} -> {} for session {}",
                    existing.status.as_str(),
                    next.as_str(),
                    session_id
                );
            }
        }
        if let Some(ended) = update.ended_at_ms {
            clauses.push("ended_at_ms = ?");
            values.push(Box::new(ended));
        }
        if let Some(total) = update.total_chunks {
            clauses.push("total_chunks = ?");
            values.push(Box::new(total));
        }
        if let Some(uploaded) = update.uploaded_chunks {
            clauses.push("uploaded_chunks = ?");
            values.push(Box::new(uploaded));
        }

        if clauses.is_empty() {
            return Ok(());
        }

        values.push(Box::new(session_id.to_string()));
        let sql = format!("UPDATE sessions SET {} WHERE id = ?", clauses.join(", "));
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }

    /// Sessions whose status is recording or uploading, for resumption
    /// after an abnormal restart.
    pub fn get_incomplete_sessions(&self) -> Result<Vec<RecordingSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at_ms, ended_at_ms, status, total_chunks, uploaded_chunks
             FROM sessions
             WHERE status IN ('recording', 'uploading')
             ORDER BY started_at_ms ASC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            let s = row?;
            sessions.push(RecordingSession {
                id: s.0,
                started_at_ms: s.1,
                ended_at_ms: s.2,
                status: SessionStatus::parse(&s.3)?,
                total_chunks: s.4 as u32,
                uploaded_chunks: s.5 as u32,
            });
        }
        Ok(sessions)
    }

    /// Remove the session and all of its chunks together.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        // Chunks cascade via the foreign key
        self.conn
            .execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        Ok(())
    }
}

type SessionRow = (String, i64, Option<i64>, String, i64, i64);

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<AudioChunk> {
    let uploaded: i32 = row.get(5)?;
    Ok(AudioChunk {
        session_id: row.get(0)?,
        chunk_index: row.get::<_, i64>(1)? as u32,
        media_type: row.get(2)?,
        data: row.get(3)?,
        created_at_ms: row.get(4)?,
        uploaded: uploaded != 0,
    })
}
