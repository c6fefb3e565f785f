use serde_json::json;

use crate::error::EngineError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Stable mapping of every engine outcome onto the wire error shape.
pub fn engine_err(id: &str, e: &EngineError) -> serde_json::Value {
    let details = match e {
        EngineError::IneligibleWindow { status } => Some(json!({ "status": status.as_str() })),
        EngineError::AlreadyActive { session_id } => Some(json!({ "sessionId": session_id })),
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}
