//! Session lifecycle: Inactive → Active → Expired → Closed.
//!
//! `expires_at` is fixed at open time and every rule that matters measures
//! against it directly. The timer's tick and the lazy flip in [`status`]
//! only reconcile the stored state column for display; redemption validity
//! never depends on either having run.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::credentials;
use crate::db::{self, Store};
use crate::error::EngineError;
use crate::ledger::{self, AttendanceStatus, Channel, Determination, RecordOutcome, RecordPolicy};
use crate::roster;
use crate::schedule;

pub const SETTING_WINDOW_MINUTES: &str = "session.windowMinutes";
pub const SETTING_FALLBACK_MINUTES: &str = "session.fallbackMinutes";

/// Upper bound the IPC surface accepts for the window cap and the fallback
/// grace.
pub const MAX_WINDOW_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionState::Active),
            "expired" => Some(SessionState::Expired),
            "closed" => Some(SessionState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub class_instance_id: String,
    pub token: String,
    pub code: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Counts reported by [`close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSummary {
    pub present: i64,
    pub absent: i64,
    pub auto_absent: i64,
}

/// Expiry policy from the settings table. `window_minutes` caps how long a
/// window may run past its opening; unset means the window simply runs to
/// the scheduled end. `fallback_minutes` rescues the degenerate case where
/// the derived deadline would not lie in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryConfig {
    pub window_minutes: Option<i64>,
    pub fallback_minutes: i64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        ExpiryConfig {
            window_minutes: None,
            fallback_minutes: 10,
        }
    }
}

impl ExpiryConfig {
    pub fn load(conn: &Connection) -> Result<Self, EngineError> {
        let mut config = ExpiryConfig::default();
        if let Some(v) = db::settings_get_json(conn, SETTING_WINDOW_MINUTES)
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            config.window_minutes = v.as_i64();
        }
        if let Some(v) = db::settings_get_json(conn, SETTING_FALLBACK_MINUTES)
            .map_err(|e| EngineError::Storage(e.to_string()))?
        {
            if let Some(minutes) = v.as_i64() {
                config.fallback_minutes = minutes;
            }
        }
        Ok(config)
    }

    pub fn expiry_for(
        &self,
        now: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    ) -> DateTime<Utc> {
        // Settings rows written by other tools may carry values past what
        // the clock can represent; an unrepresentable cap simply never binds.
        let mut expires = match self.window_minutes {
            Some(cap) if cap > 0 => Duration::try_minutes(cap)
                .and_then(|d| now.checked_add_signed(d))
                .map_or(scheduled_end, |capped| capped.min(scheduled_end)),
            _ => scheduled_end,
        };
        if expires <= now {
            let grace = Duration::try_minutes(self.fallback_minutes.max(1))
                .unwrap_or_else(|| Duration::minutes(1));
            expires = now
                .checked_add_signed(grace)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        expires
    }
}

pub(crate) fn load(conn: &Connection, session_id: &str) -> Result<Option<Session>, EngineError> {
    let row: Option<(String, String, String, String, String, String, String, Option<String>)> =
        conn.query_row(
            "SELECT id, class_instance_id, token, code, state, created_at, expires_at,
                    closed_at
             FROM sessions WHERE id = ?",
            [session_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, class_instance_id, token, code, state_raw, created_raw, expires_raw, closed_raw)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(from_columns(
        id,
        class_instance_id,
        token,
        code,
        &state_raw,
        &created_raw,
        &expires_raw,
        closed_raw.as_deref(),
    )?))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn from_columns(
    id: String,
    class_instance_id: String,
    token: String,
    code: String,
    state_raw: &str,
    created_raw: &str,
    expires_raw: &str,
    closed_raw: Option<&str>,
) -> Result<Session, EngineError> {
    let state = SessionState::parse(state_raw)
        .ok_or_else(|| EngineError::Storage(format!("bad session state {:?}", state_raw)))?;
    let created_at = db::parse_ts(created_raw)
        .map_err(|e| EngineError::Storage(format!("bad created_at for {}: {}", id, e)))?;
    let expires_at = db::parse_ts(expires_raw)
        .map_err(|e| EngineError::Storage(format!("bad expires_at for {}: {}", id, e)))?;
    let closed_at = match closed_raw {
        Some(raw) => Some(
            db::parse_ts(raw)
                .map_err(|e| EngineError::Storage(format!("bad closed_at for {}: {}", id, e)))?,
        ),
        None => None,
    };
    Ok(Session {
        id,
        class_instance_id,
        token,
        code,
        state,
        created_at,
        expires_at,
        closed_at,
    })
}

/// Open an attendance window for a class. Fails unless the classifier says
/// the class is currently collectable, and while the class already has an
/// active session.
pub fn open(store: &Store, class_id: &str, now: DateTime<Utc>) -> Result<Session, EngineError> {
    let conn = store.conn()?;
    let class = roster::get_class_instance(&conn, class_id)?
        .ok_or(EngineError::NotFound("class"))?;

    let status = schedule::classify(
        now,
        class.scheduled_start,
        class.scheduled_end,
        class.late_threshold_minutes,
    );
    if !status.allows_opening() {
        return Err(EngineError::IneligibleWindow { status });
    }

    if let Some(session_id) = active_session_id(&conn, class_id)? {
        return Err(EngineError::AlreadyActive { session_id });
    }

    let config = ExpiryConfig::load(&conn)?;
    let expires_at = config.expiry_for(now, class.scheduled_end);
    let creds = credentials::issue(|code| {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE code = ? AND state = 'active'",
                [code],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    })?;

    let id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO sessions
         (id, class_instance_id, token, code, state, created_at, expires_at)
         VALUES (?, ?, ?, ?, 'active', ?, ?)",
        (
            &id,
            class_id,
            &creds.token,
            &creds.code,
            db::ts(now),
            db::ts(expires_at),
        ),
    );
    if let Err(e) = inserted {
        // The partial unique index is the backstop for a racing open, e.g.
        // a second daemon sharing the workspace file.
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                if let Some(session_id) = active_session_id(&conn, class_id)? {
                    return Err(EngineError::AlreadyActive { session_id });
                }
            }
        }
        return Err(e.into());
    }

    info!(
        session = %id,
        class = %class_id,
        code = %creds.code,
        expires_at = %db::ts(expires_at),
        "attendance window opened"
    );
    Ok(Session {
        id,
        class_instance_id: class_id.to_string(),
        token: creds.token,
        code: creds.code,
        state: SessionState::Active,
        created_at: now,
        expires_at,
        closed_at: None,
    })
}

fn active_session_id(conn: &Connection, class_id: &str) -> Result<Option<String>, EngineError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE class_instance_id = ? AND state = 'active'",
            [class_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Current view of one session. A session stored as active whose deadline
/// has passed is flipped to expired here, so the reported state is fresh
/// even when no tick ever ran.
pub fn status(store: &Store, session_id: &str, now: DateTime<Utc>) -> Result<Session, EngineError> {
    let conn = store.conn()?;
    let mut session = load(&conn, session_id)?.ok_or(EngineError::NotFound("session"))?;
    if session.state == SessionState::Active && now > session.expires_at {
        conn.execute(
            "UPDATE sessions SET state = 'expired' WHERE id = ? AND state = 'active'",
            [session_id],
        )?;
        session.state = SessionState::Expired;
        debug!(session = %session_id, "session expired on status read");
    }
    Ok(session)
}

/// Reconcile every stored-active session against the wall clock. Returns the
/// ids that flipped to expired. Safe at any cadence; a tick that finds
/// nothing to do is a no-op.
pub fn tick(store: &Store, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
    let conn = store.conn()?;
    let cutoff = db::ts(now);
    let mut stmt = conn.prepare(
        "SELECT id FROM sessions WHERE state = 'active' AND expires_at < ?",
    )?;
    let due = stmt
        .query_map([&cutoff], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    if due.is_empty() {
        return Ok(due);
    }
    conn.execute(
        "UPDATE sessions SET state = 'expired' WHERE state = 'active' AND expires_at < ?",
        [&cutoff],
    )?;
    for id in &due {
        info!(session = %id, "session expired");
    }
    Ok(due)
}

/// Close a session, backfilling an AutoAbsent record for every enrolled
/// student with no determination. Runs under the session's exclusive lock
/// and a single transaction, so a concurrent redemption either lands before
/// the backfill scan or is rejected after the close.
pub fn close(
    store: &Store,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<CloseSummary, EngineError> {
    let lock = store.session_lock(session_id)?;
    let _guard = lock
        .lock()
        .map_err(|_| EngineError::Storage("session lock poisoned".to_string()))?;
    let conn = store.conn()?;

    let session = load(&conn, session_id)?.ok_or(EngineError::NotFound("session"))?;
    if session.state == SessionState::Closed {
        return Err(EngineError::AlreadyClosed);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::Storage(e.to_string()))?;

    let mut auto_absent = 0i64;
    for student_id in roster::list_enrolled(&tx, &session.class_instance_id)? {
        let det = Determination {
            session_id,
            student_id: &student_id,
            status: AttendanceStatus::Absent,
            channel: Channel::AutoAbsent,
            recorded_at: now,
        };
        match ledger::record_on(&tx, &det, RecordPolicy::InsertOnly) {
            Ok(RecordOutcome::Inserted) => auto_absent += 1,
            Ok(RecordOutcome::Superseded) => {}
            // Already determined through some channel; nothing to backfill.
            Err(EngineError::Conflict) => {}
            Err(e) => return Err(e),
        }
    }

    tx.execute(
        "UPDATE sessions SET state = 'closed', closed_at = ? WHERE id = ?",
        (db::ts(now), session_id),
    )?;
    let tally = ledger::count_by_status(&tx, session_id)?;
    tx.commit().map_err(|e| EngineError::Storage(e.to_string()))?;

    // The closed state now rejects every write, so the lock entry can go.
    store.forget_session_lock(session_id);

    info!(
        session = %session_id,
        present = tally.present,
        absent = tally.absent,
        auto_absent,
        "session closed"
    );
    Ok(CloseSummary {
        present: tally.present,
        absent: tally.absent,
        auto_absent,
    })
}
