//! Authoritative per-session, per-student attendance determinations.
//!
//! Every channel (token redemption, code redemption, manual marking, close
//! backfill) lands here, so uniqueness on (session_id, student_id) is
//! enforced in exactly one place. Callers that need mutual exclusion against
//! a concurrent close go through [`record`], which takes the per-session
//! lock; the close routine itself calls [`record_on`] inside its own locked
//! transaction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::db::{self, Store};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Redeemed,
    Manual,
    AutoAbsent,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Redeemed => "redeemed",
            Channel::Manual => "manual",
            Channel::AutoAbsent => "auto_absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redeemed" => Some(Channel::Redeemed),
            "manual" => Some(Channel::Manual),
            "auto_absent" => Some(Channel::AutoAbsent),
            _ => None,
        }
    }
}

/// What an existing record allows a new write to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// First write wins; anything already there is a conflict.
    InsertOnly,
    /// Manual marking may replace a close-backfilled AutoAbsent record.
    /// Redeemed and Manual records are still conflicts.
    SupersedeAutoAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Superseded,
}

pub struct Determination<'a> {
    pub session_id: &'a str,
    pub student_id: &'a str,
    pub status: AttendanceStatus,
    pub channel: Channel,
    pub recorded_at: DateTime<Utc>,
}

/// One stored determination, raw timestamp included.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub student_id: String,
    pub status: AttendanceStatus,
    pub channel: Channel,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub present: i64,
    pub absent: i64,
}

/// Record one determination under the session's exclusive lock.
pub fn record(
    store: &Store,
    det: &Determination<'_>,
    policy: RecordPolicy,
) -> Result<RecordOutcome, EngineError> {
    let lock = store.session_lock(det.session_id)?;
    let _guard = lock
        .lock()
        .map_err(|_| EngineError::Storage("session lock poisoned".to_string()))?;
    let conn = store.conn()?;
    record_on(&conn, det, policy)
}

/// Record one determination on an already-serialized connection. The session
/// row is re-validated here, inside the exclusive section, so a state flip
/// that happened while the caller was waiting on the lock is always seen.
pub fn record_on(
    conn: &Connection,
    det: &Determination<'_>,
    policy: RecordPolicy,
) -> Result<RecordOutcome, EngineError> {
    let session: Option<(String, String)> = conn
        .query_row(
            "SELECT state, expires_at FROM sessions WHERE id = ?",
            [det.session_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((state, expires_raw)) = session else {
        return Err(EngineError::NotFound("session"));
    };

    match det.channel {
        // Self-reported presence is only valid while the window is open,
        // measured against the stored deadline rather than the state column.
        Channel::Redeemed => {
            if state != "active" {
                return Err(EngineError::WindowClosed);
            }
            let expires_at = db::parse_ts(&expires_raw).map_err(|e| {
                EngineError::Storage(format!("bad expires_at for {}: {}", det.session_id, e))
            })?;
            if det.recorded_at > expires_at {
                return Err(EngineError::WindowClosed);
            }
        }
        // Manual marking and the close backfill stay legal on an expired
        // session; only a closed one is sealed.
        Channel::Manual | Channel::AutoAbsent => {
            if state == "closed" {
                return Err(EngineError::WindowClosed);
            }
        }
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT channel FROM attendance_records
             WHERE session_id = ? AND student_id = ?",
            [det.session_id, det.student_id],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(existing_channel) = existing {
        if policy == RecordPolicy::SupersedeAutoAbsent
            && existing_channel == Channel::AutoAbsent.as_str()
        {
            conn.execute(
                "UPDATE attendance_records
                 SET status = ?, channel = ?, recorded_at = ?
                 WHERE session_id = ? AND student_id = ?",
                (
                    det.status.as_str(),
                    det.channel.as_str(),
                    db::ts(det.recorded_at),
                    det.session_id,
                    det.student_id,
                ),
            )?;
            return Ok(RecordOutcome::Superseded);
        }
        return Err(EngineError::Conflict);
    }

    // OR IGNORE plus a changes() check: the primary key is the backstop if
    // another writer slipped a row in between the probe and the insert.
    conn.execute(
        "INSERT OR IGNORE INTO attendance_records
         (session_id, student_id, status, channel, recorded_at)
         VALUES (?, ?, ?, ?, ?)",
        (
            det.session_id,
            det.student_id,
            det.status.as_str(),
            det.channel.as_str(),
            db::ts(det.recorded_at),
        ),
    )?;
    if conn.changes() == 0 {
        return Err(EngineError::Conflict);
    }
    Ok(RecordOutcome::Inserted)
}

pub fn list(conn: &Connection, session_id: &str) -> Result<Vec<LedgerRow>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status, channel, recorded_at
         FROM attendance_records WHERE session_id = ?
         ORDER BY recorded_at, student_id",
    )?;
    let raw = stmt
        .query_map([session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(raw.len());
    for (student_id, status, channel, recorded_at) in raw {
        let status = AttendanceStatus::parse(&status)
            .ok_or_else(|| EngineError::Storage(format!("bad status value {:?}", status)))?;
        let channel = Channel::parse(&channel)
            .ok_or_else(|| EngineError::Storage(format!("bad channel value {:?}", channel)))?;
        rows.push(LedgerRow {
            student_id,
            status,
            channel,
            recorded_at,
        });
    }
    Ok(rows)
}

pub fn count_by_status(conn: &Connection, session_id: &str) -> Result<Tally, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM attendance_records
         WHERE session_id = ? GROUP BY status",
    )?;
    let mut tally = Tally::default();
    let counted = stmt.query_map([session_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    for row in counted {
        let (status, n) = row?;
        match status.as_str() {
            "present" => tally.present = n,
            "absent" => tally.absent = n,
            other => {
                return Err(EngineError::Storage(format!("bad status value {:?}", other)));
            }
        }
    }
    Ok(tally)
}
