use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use serde_json::json;

fn handle_roster_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    match roster::get_class_instance(&conn, &class_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    }
    match roster::student_exists(&conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO enrollments (class_instance_id, student_id) VALUES (?, ?)",
        (&class_id, &student_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    let already_enrolled = conn.changes() == 0;

    ok(&req.id, json!({ "ok": true, "alreadyEnrolled": already_enrolled }))
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };
    match roster::get_class_instance(&conn, &class_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.student_no
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.class_instance_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let display_name = format!("{}, {}", last, first);
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "lastName": last,
                "firstName": first,
                "displayName": display_name,
                "studentNo": row.get::<_, Option<String>>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "classId": class_id, "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.enroll" => Some(handle_roster_enroll(state, req)),
        "roster.list" => Some(handle_roster_list(state, req)),
        _ => None,
    }
}
