use crate::db;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, Session};
use chrono::{DateTime, Utc};
use serde_json::json;

fn parse_now(req: &Request) -> Result<DateTime<Utc>, serde_json::Value> {
    match req.params.get("now") {
        None => Ok(Utc::now()),
        Some(v) if v.is_null() => Ok(Utc::now()),
        Some(v) => match v.as_str().map(db::parse_ts) {
            Some(Ok(dt)) => Ok(dt),
            _ => Err(err(
                &req.id,
                "bad_params",
                "now must be an RFC3339 timestamp",
                None,
            )),
        },
    }
}

fn session_json(session: &Session, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "sessionId": session.id,
        "classId": session.class_instance_id,
        "token": session.token,
        "code": session.code,
        "state": session.state.as_str(),
        "createdAt": db::ts(session.created_at),
        "expiresAt": db::ts(session.expires_at),
        "closedAt": session.closed_at.map(db::ts),
        "timeRemainingSeconds": session.time_remaining_seconds(now),
    })
}

fn handle_sessions_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match session::open(store, &class_id, now) {
        Ok(session) => ok(&req.id, session_json(&session, now)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_sessions_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match session::close(store, &session_id, now) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "sessionId": session_id,
                "present": summary.present,
                "absent": summary.absent,
                "autoAbsent": summary.auto_absent,
                "closedAt": db::ts(now),
            }),
        ),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_sessions_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match session::status(store, &session_id, now) {
        Ok(session) => ok(&req.id, session_json(&session, now)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_sessions_tick(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match session::tick(store, now) {
        Ok(ids) => ok(
            &req.id,
            json!({ "expired": ids.len(), "sessionIds": ids }),
        ),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.open" => Some(handle_sessions_open(state, req)),
        "sessions.close" => Some(handle_sessions_close(state, req)),
        "sessions.status" => Some(handle_sessions_status(state, req)),
        "sessions.tick" => Some(handle_sessions_tick(state, req)),
        _ => None,
    }
}
