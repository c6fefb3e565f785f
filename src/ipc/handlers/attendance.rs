use crate::db;
use crate::gateway;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, AttendanceStatus};
use crate::session;
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

fn get_required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn redemption_json(redemption: &gateway::Redemption, student_id: &str) -> serde_json::Value {
    json!({
        "sessionId": redemption.session_id,
        "classId": redemption.class_instance_id,
        "studentId": student_id,
        "status": "present",
        "channel": "redeemed",
        "recordedAt": db::ts(redemption.recorded_at),
    })
}

fn handle_redeem_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let token = match get_required_str(req, "token") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match get_required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match gateway::redeem_by_token(store, &token, &student_id, now) {
        Ok(redemption) => ok(&req.id, redemption_json(&redemption, &student_id)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_redeem_code(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let code = match get_required_str(req, "code") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match get_required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match gateway::redeem_by_code(store, &code, &student_id, now) {
        Ok(redemption) => ok(&req.id, redemption_json(&redemption, &student_id)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_mark_manual(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match get_required_str(req, "sessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match get_required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status_raw = match get_required_str(req, "status") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be present or absent",
            None,
        );
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match gateway::mark_manual(store, &session_id, &student_id, status, now) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "sessionId": session_id,
                "studentId": student_id,
                "status": status.as_str(),
                "channel": "manual",
                "superseded": outcome == ledger::RecordOutcome::Superseded,
                "recordedAt": db::ts(now),
            }),
        ),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match get_required_str(req, "sessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    match session::load(&conn, &session_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "session not found", None),
        Err(e) => return engine_err(&req.id, &e),
    }

    let rows = match ledger::list(&conn, &session_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "studentId": r.student_id,
                "status": r.status.as_str(),
                "channel": r.channel.as_str(),
                "recordedAt": r.recorded_at,
            })
        })
        .collect();

    ok(&req.id, json!({ "sessionId": session_id, "records": records }))
}

fn handle_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match get_required_str(req, "sessionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let found = match session::load(&conn, &session_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };
    let Some(session) = found else {
        return err(&req.id, "not_found", "session not found", None);
    };

    let tally = match ledger::count_by_status(&conn, &session_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };
    let enrolled: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE class_instance_id = ?",
        [&session.class_instance_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // Enrolled students with no determination yet. Counted directly so a
    // redemption from outside the roster never skews the number.
    let unmarked: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments e
         WHERE e.class_instance_id = ?
           AND NOT EXISTS (SELECT 1 FROM attendance_records ar
                           WHERE ar.session_id = ? AND ar.student_id = e.student_id)",
        (&session.class_instance_id, &session_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "sessionId": session_id,
            "state": session.state.as_str(),
            "present": tally.present,
            "absent": tally.absent,
            "unmarked": unmarked,
            "enrolled": enrolled,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.redeemToken" => Some(handle_redeem_token(state, req)),
        "attendance.redeemCode" => Some(handle_redeem_code(state, req)),
        "attendance.markManual" => Some(handle_mark_manual(state, req)),
        "attendance.list" => Some(handle_list(state, req)),
        "attendance.summary" => Some(handle_summary(state, req)),
        _ => None,
    }
}
