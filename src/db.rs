use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::EngineError;

pub const DB_FILE: &str = "rollcall.sqlite3";

/// Shared handle to one workspace database. Cloning is cheap; all clones
/// serialize on the same connection, and per-session write locks live in the
/// same registry so redemption and close exclude each other regardless of
/// which clone they came through.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Store {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(workspace)?;
        let conn = Connection::open(workspace.join(DB_FILE))?;
        apply_schema(&conn)?;
        Ok(Self::wrap(conn))
    }

    /// In-memory workspace, used by direct engine tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Store {
            conn: Arc::new(Mutex::new(conn)),
            session_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Storage("connection lock poisoned".to_string()))
    }

    /// Exclusive section for one session. Acquire this before the connection
    /// lock, never after, so redemption and close keep a single lock order.
    pub(crate) fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>, EngineError> {
        let mut locks = self
            .session_locks
            .lock()
            .map_err(|_| EngineError::Storage("session lock registry poisoned".to_string()))?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Drop the lock entry for a closed session. Safe once the row is
    /// closed: the ledger rejects every write against a closed session, so
    /// two late callers racing on fresh locks have nothing left to corrupt.
    pub(crate) fn forget_session_lock(&self, session_id: &str) {
        if let Ok(mut locks) = self.session_locks.lock() {
            locks.remove(session_id);
        }
    }
}

/// Timestamp encoding used everywhere in the database. Fixed-width UTC so
/// lexicographic TEXT comparison in SQL matches chronological order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_instances(
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            section TEXT NOT NULL,
            room TEXT,
            scheduled_start TEXT NOT NULL,
            scheduled_end TEXT NOT NULL,
            late_threshold_minutes INTEGER NOT NULL DEFAULT 10
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_instance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(class_instance_id, student_id),
            FOREIGN KEY(class_instance_id) REFERENCES class_instances(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_instance_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            class_instance_id TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE,
            code TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            closed_at TEXT,
            FOREIGN KEY(class_instance_id) REFERENCES class_instances(id)
        )",
        [],
    )?;
    // Existing workspaces may predate the closed_at column.
    ensure_sessions_closed_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_class ON sessions(class_instance_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_code ON sessions(code)",
        [],
    )?;
    // Storage-level backstop for the one-active-session-per-class invariant.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
         ON sessions(class_instance_id) WHERE state = 'active'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            channel TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_session
         ON attendance_records(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_sessions_closed_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sessions", "closed_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE sessions ADD COLUMN closed_at TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
