use crate::db;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::{
    ExpiryConfig, MAX_WINDOW_MINUTES, SETTING_FALLBACK_MINUTES, SETTING_WINDOW_MINUTES,
};
use serde_json::json;

fn config_json(config: &ExpiryConfig) -> serde_json::Value {
    json!({
        "windowMinutes": config.window_minutes,
        "fallbackMinutes": config.fallback_minutes,
    })
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return engine_err(&req.id, &e),
    };
    match ExpiryConfig::load(&conn) {
        Ok(config) => ok(&req.id, config_json(&config)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let window = req.params.get("windowMinutes");
    let fallback = req.params.get("fallbackMinutes");
    if window.is_none() && fallback.is_none() {
        return err(
            &req.id,
            "bad_params",
            "provide windowMinutes and/or fallbackMinutes",
            None,
        );
    }

    // Validate both before writing either.
    let window_value = match window {
        None => None,
        Some(v) if v.is_null() => Some(serde_json::Value::Null),
        Some(v) => match v.as_i64() {
            Some(n) if (1..=MAX_WINDOW_MINUTES).contains(&n) => Some(json!(n)),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "windowMinutes must be an integer between 1 and {} or null",
                        MAX_WINDOW_MINUTES
                    ),
                    None,
                )
            }
        },
    };
    let fallback_value = match fallback {
        None => None,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=MAX_WINDOW_MINUTES).contains(&n) => Some(json!(n)),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "fallbackMinutes must be an integer between 1 and {}",
                        MAX_WINDOW_MINUTES
                    ),
                    None,
                )
            }
        },
    };

    let conn = match store.conn() {
        Ok(c) => c,
        Err(e) => return engine_err(&req.id, &e),
    };
    if let Some(value) = window_value {
        if let Err(e) = db::settings_set_json(&conn, SETTING_WINDOW_MINUTES, &value) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(value) = fallback_value {
        if let Err(e) = db::settings_set_json(&conn, SETTING_FALLBACK_MINUTES, &value) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    match ExpiryConfig::load(&conn) {
        Ok(config) => ok(&req.id, config_json(&config)),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
