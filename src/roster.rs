use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::db;
use crate::error::EngineError;

/// One scheduled meeting of a course section. Created through the roster IPC
/// surface and immutable afterwards; the engine only ever reads it.
#[derive(Debug, Clone)]
pub struct ClassInstance {
    pub id: String,
    pub subject: String,
    pub section: String,
    pub room: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub late_threshold_minutes: i64,
}

pub fn get_class_instance(
    conn: &Connection,
    class_instance_id: &str,
) -> Result<Option<ClassInstance>, EngineError> {
    let row: Option<(String, String, String, Option<String>, String, String, i64)> = conn
        .query_row(
            "SELECT id, subject, section, room, scheduled_start, scheduled_end,
                    late_threshold_minutes
             FROM class_instances WHERE id = ?",
            [class_instance_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, subject, section, room, start_raw, end_raw, late_threshold_minutes)) = row
    else {
        return Ok(None);
    };
    let scheduled_start = db::parse_ts(&start_raw)
        .map_err(|e| EngineError::Storage(format!("bad scheduled_start for {}: {}", id, e)))?;
    let scheduled_end = db::parse_ts(&end_raw)
        .map_err(|e| EngineError::Storage(format!("bad scheduled_end for {}: {}", id, e)))?;
    Ok(Some(ClassInstance {
        id,
        subject,
        section,
        room,
        scheduled_start,
        scheduled_end,
        late_threshold_minutes,
    }))
}

/// Student ids enrolled in a class meeting; the close routine uses this as
/// the backfill universe.
pub fn list_enrolled(
    conn: &Connection,
    class_instance_id: &str,
) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT e.student_id
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.class_instance_id = ?
         ORDER BY s.last_name, s.first_name",
    )?;
    let ids = stmt
        .query_map([class_instance_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, EngineError> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(hit.is_some())
}
