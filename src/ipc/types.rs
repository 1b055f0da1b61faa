use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

/// Explicit request-scoped context: who is acting, in which organization,
/// with what role. Parsed once per request from `params.ctx` and passed
/// down; nothing is re-derived from ambient state.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub org_id: String,
    pub actor_id: String,
    pub role: String,
}
