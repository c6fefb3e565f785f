use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollcalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollcalld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error payload")
}

fn seed_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({
            "subject": "Chemistry",
            "section": "2B",
            "scheduledStart": "2030-03-05T09:00:00Z",
            "scheduledEnd": "2030-03-05T10:30:00Z",
            "lateThresholdMinutes": 10
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let created = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        json!({ "lastName": "Okafor", "firstName": "Lena" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-enroll",
        "roster.enroll",
        json!({ "classId": class_id, "studentId": student_id }),
    );
    (class_id, student_id)
}

#[test]
fn deadline_enforced_without_timer_tick() {
    let workspace = temp_dir("rollcall-deadline");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (class_id, student_id) = seed_class(&mut stdin, &mut reader, &workspace);

    // Cap the collection window at ten minutes.
    let settings = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "settings.update",
        json!({ "windowMinutes": 10 }),
    );
    assert_eq!(
        settings.get("windowMinutes").and_then(|v| v.as_i64()),
        Some(10)
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sessions.open",
        json!({ "classId": class_id, "now": "2030-03-05T09:02:00Z" }),
    );
    let session_id = session
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let token = session
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    assert_eq!(
        session.get("expiresAt").and_then(|v| v.as_str()),
        Some("2030-03-05T09:12:00.000000Z")
    );

    // One minute past the deadline. No tick has run against these
    // future timestamps; the redemption check alone must refuse.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.redeemToken",
        json!({
            "token": token,
            "studentId": student_id,
            "now": "2030-03-05T09:13:00Z"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("window_closed")
    );

    // Reading the status at that time flips the stored state too.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.status",
        json!({ "sessionId": session_id, "now": "2030-03-05T09:13:00Z" }),
    );
    assert_eq!(status.get("state").and_then(|v| v.as_str()), Some("expired"));
    assert_eq!(
        status.get("timeRemainingSeconds").and_then(|v| v.as_i64()),
        Some(0)
    );

    // Expired only blocks self-serve scans; the teacher can still mark.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.markManual",
        json!({
            "sessionId": session_id,
            "studentId": student_id,
            "status": "present",
            "now": "2030-03-05T09:14:00Z"
        }),
    );
    assert_eq!(marked.get("channel").and_then(|v| v.as_str()), Some("manual"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_and_duplicate_credentials() {
    let workspace = temp_dir("rollcall-credentials");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (class_id, student_id) = seed_class(&mut stdin, &mut reader, &workspace);

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sessions.open",
        json!({ "classId": class_id, "now": "2030-03-05T09:02:00Z" }),
    );
    let code = session
        .get("code")
        .and_then(|v| v.as_str())
        .expect("code")
        .to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.redeemToken",
        json!({
            "token": "00000000-0000-0000-0000-000000000000",
            "studentId": student_id,
            "now": "2030-03-05T09:03:00Z"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("unknown_credential")
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.redeemCode",
        json!({
            "code": "ZZZZZZ",
            "studentId": student_id,
            "now": "2030-03-05T09:03:00Z"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("unknown_credential")
    );

    // Codes are compared after trimming and uppercasing.
    let padded = format!("  {}  ", code.to_lowercase());
    let redeemed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.redeemCode",
        json!({
            "code": padded,
            "studentId": student_id,
            "now": "2030-03-05T09:04:00Z"
        }),
    );
    assert_eq!(redeemed.get("status").and_then(|v| v.as_str()), Some("present"));

    // A second scan by the same student changes nothing.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.redeemCode",
        json!({
            "code": code,
            "studentId": student_id,
            "now": "2030-03-05T09:05:00Z"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("already_recorded")
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.redeemCode",
        json!({
            "code": code,
            "studentId": "not-a-student",
            "now": "2030-03-05T09:05:30Z"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn window_settings_roundtrip() {
    let workspace = temp_dir("rollcall-settings");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let settings = request_ok(&mut stdin, &mut reader, "2", "settings.get", json!({}));
    assert!(settings.get("windowMinutes").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        settings.get("fallbackMinutes").and_then(|v| v.as_i64()),
        Some(10)
    );

    let settings = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "settings.update",
        json!({ "windowMinutes": 15, "fallbackMinutes": 5 }),
    );
    assert_eq!(
        settings.get("windowMinutes").and_then(|v| v.as_i64()),
        Some(15)
    );
    assert_eq!(
        settings.get("fallbackMinutes").and_then(|v| v.as_i64()),
        Some(5)
    );

    // Null clears the cap back to running until the scheduled end.
    let settings = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "settings.update",
        json!({ "windowMinutes": null }),
    );
    assert!(settings.get("windowMinutes").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        settings.get("fallbackMinutes").and_then(|v| v.as_i64()),
        Some(5)
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "settings.update",
        json!({ "windowMinutes": 0 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // Values past a day are refused before they ever reach the clock math.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "settings.update",
        json!({ "windowMinutes": 100_000 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "settings.update",
        json!({ "fallbackMinutes": i64::MAX }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let _ = std::fs::remove_dir_all(workspace);
}
