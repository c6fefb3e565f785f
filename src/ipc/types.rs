use std::path::PathBuf;

use serde::Deserialize;

use crate::db::Store;
use crate::timer::ExpiryTimer;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<Store>,
    pub timer: ExpiryTimer,
}

impl AppState {
    pub fn new(timer: ExpiryTimer) -> Self {
        AppState {
            workspace: None,
            store: None,
            timer,
        }
    }
}
