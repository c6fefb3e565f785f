//! Entry points for the three determination channels: token redemption,
//! code redemption, manual marking.
//!
//! Resolution looks at every session that ever carried the credential and
//! picks the most relevant one (active first, then expired, then closed,
//! newest wins). A credential of a closed session therefore still resolves
//! and is rejected as `WindowClosed`; only a credential the workspace has
//! never seen is `UnknownCredential`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::credentials;
use crate::db::Store;
use crate::error::EngineError;
use crate::ledger::{self, AttendanceStatus, Channel, Determination, RecordOutcome, RecordPolicy};
use crate::roster;
use crate::session::{self, Session};

const RESOLVE_BY_TOKEN: &str = "SELECT id, class_instance_id, token, code, state, created_at,
        expires_at, closed_at
 FROM sessions WHERE token = ?
 ORDER BY CASE state WHEN 'active' THEN 0 WHEN 'expired' THEN 1 ELSE 2 END,
          created_at DESC
 LIMIT 1";

const RESOLVE_BY_CODE: &str = "SELECT id, class_instance_id, token, code, state, created_at,
        expires_at, closed_at
 FROM sessions WHERE code = ?
 ORDER BY CASE state WHEN 'active' THEN 0 WHEN 'expired' THEN 1 ELSE 2 END,
          created_at DESC
 LIMIT 1";

/// What a successful redemption landed on.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub session_id: String,
    pub class_instance_id: String,
    pub recorded_at: DateTime<Utc>,
}

pub fn redeem_by_token(
    store: &Store,
    token: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<Redemption, EngineError> {
    let resolved = {
        let conn = store.conn()?;
        resolve(&conn, RESOLVE_BY_TOKEN, token)?
    };
    let Some(session) = resolved else {
        warn!(student = %student_id, "redemption with unknown token");
        return Err(EngineError::UnknownCredential);
    };
    redeem(store, session, student_id, now)
}

pub fn redeem_by_code(
    store: &Store,
    code: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<Redemption, EngineError> {
    let code = credentials::normalize_code(code);
    let resolved = {
        let conn = store.conn()?;
        resolve(&conn, RESOLVE_BY_CODE, &code)?
    };
    let Some(session) = resolved else {
        warn!(student = %student_id, code = %code, "redemption with unknown code");
        return Err(EngineError::UnknownCredential);
    };
    redeem(store, session, student_id, now)
}

fn redeem(
    store: &Store,
    session: Session,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<Redemption, EngineError> {
    {
        let conn = store.conn()?;
        if !roster::student_exists(&conn, student_id)? {
            return Err(EngineError::NotFound("student"));
        }
    }
    let det = Determination {
        session_id: &session.id,
        student_id,
        status: AttendanceStatus::Present,
        channel: Channel::Redeemed,
        recorded_at: now,
    };
    match ledger::record(store, &det, RecordPolicy::InsertOnly) {
        Ok(_) => {
            debug!(session = %session.id, student = %student_id, "redemption recorded");
            Ok(Redemption {
                session_id: session.id,
                class_instance_id: session.class_instance_id,
                recorded_at: now,
            })
        }
        // The student already has a determination; from the caller's side a
        // repeated scan is benign.
        Err(EngineError::Conflict) => Err(EngineError::AlreadyRecorded),
        Err(e) => Err(e),
    }
}

/// Privileged marking: may set Present or Absent, may replace a
/// close-backfilled AutoAbsent record, never a Redeemed or Manual one.
pub fn mark_manual(
    store: &Store,
    session_id: &str,
    student_id: &str,
    status: AttendanceStatus,
    now: DateTime<Utc>,
) -> Result<RecordOutcome, EngineError> {
    {
        let conn = store.conn()?;
        if session::load(&conn, session_id)?.is_none() {
            return Err(EngineError::NotFound("session"));
        }
        if !roster::student_exists(&conn, student_id)? {
            return Err(EngineError::NotFound("student"));
        }
    }
    let det = Determination {
        session_id,
        student_id,
        status,
        channel: Channel::Manual,
        recorded_at: now,
    };
    let outcome = ledger::record(store, &det, RecordPolicy::SupersedeAutoAbsent)?;
    debug!(
        session = %session_id,
        student = %student_id,
        status = status.as_str(),
        superseded = outcome == RecordOutcome::Superseded,
        "manual mark recorded"
    );
    Ok(outcome)
}

fn resolve(conn: &Connection, sql: &str, value: &str) -> Result<Option<Session>, EngineError> {
    let row: Option<(String, String, String, String, String, String, String, Option<String>)> =
        conn.query_row(sql, [value], |r| {
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
        })
        .optional()?;
    let Some((id, class_instance_id, token, code, state, created, expires, closed)) = row else {
        return Ok(None);
    };
    Ok(Some(session::from_columns(
        id,
        class_instance_id,
        token,
        code,
        &state,
        &created,
        &expires,
        closed.as_deref(),
    )?))
}
