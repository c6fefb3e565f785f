use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use crate::schedule;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

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

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject = match req.params.get("subject").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing subject", None),
    };
    let section = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing section", None),
    };
    let room = req
        .params
        .get("room")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let scheduled_start = match req
        .params
        .get("scheduledStart")
        .and_then(|v| v.as_str())
        .map(db::parse_ts)
    {
        Some(Ok(dt)) => dt,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "scheduledStart must be an RFC3339 timestamp",
                None,
            )
        }
    };
    let scheduled_end = match req
        .params
        .get("scheduledEnd")
        .and_then(|v| v.as_str())
        .map(db::parse_ts)
    {
        Some(Ok(dt)) => dt,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "scheduledEnd must be an RFC3339 timestamp",
                None,
            )
        }
    };
    if scheduled_end <= scheduled_start {
        return err(
            &req.id,
            "bad_params",
            "scheduledEnd must be after scheduledStart",
            None,
        );
    }

    let late_threshold_minutes = match req.params.get("lateThresholdMinutes") {
        None => 10,
        Some(v) if v.is_null() => 10,
        Some(v) => match v.as_i64() {
            Some(n) if (0..=schedule::MAX_LATE_THRESHOLD_MINUTES).contains(&n) => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "lateThresholdMinutes must be an integer between 0 and {}",
                        schedule::MAX_LATE_THRESHOLD_MINUTES
                    ),
                    None,
                )
            }
        },
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_instances
         (id, subject, section, room, scheduled_start, scheduled_end, late_threshold_minutes)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &subject,
            &section,
            &room,
            db::ts(scheduled_start),
            db::ts(scheduled_end),
            late_threshold_minutes,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_instances" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    // Counts via correlated subqueries so the UI gets a dashboard row per
    // class without join fan-out.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id, c.subject, c.section, c.room, c.scheduled_start, c.scheduled_end,
           c.late_threshold_minutes,
           (SELECT COUNT(*) FROM enrollments e WHERE e.class_instance_id = c.id)
             AS enrolled_count,
           (SELECT COUNT(*) FROM sessions s WHERE s.class_instance_id = c.id)
             AS session_count
         FROM class_instances c
         ORDER BY c.scheduled_start, c.subject",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "subject": row.get::<_, String>(1)?,
                "section": row.get::<_, String>(2)?,
                "room": row.get::<_, Option<String>>(3)?,
                "scheduledStart": row.get::<_, String>(4)?,
                "scheduledEnd": row.get::<_, String>(5)?,
                "lateThresholdMinutes": row.get::<_, i64>(6)?,
                "enrolledCount": row.get::<_, i64>(7)?,
                "sessionCount": row.get::<_, i64>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_window(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    let class = match roster::get_class_instance(&conn, &class_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    let status = schedule::classify(
        now,
        class.scheduled_start,
        class.scheduled_end,
        class.late_threshold_minutes,
    );
    ok(
        &req.id,
        json!({
            "classId": class.id,
            "status": status.as_str(),
            "opensCollection": status.allows_opening()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.window" => Some(handle_classes_window(state, req)),
        _ => None,
    }
}
