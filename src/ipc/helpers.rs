use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::error::err;
use super::types::{AppState, Ctx, Request};

pub const ROLES: [&str; 3] = ["admin", "registrar", "teacher"];

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing numeric {}", key), None))
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing integer {}", key), None))
}

pub fn optional_bool(req: &Request, key: &str, default: bool) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

/// Parse `params.ctx` into the explicit request context.
pub fn request_ctx(req: &Request) -> Result<Ctx, serde_json::Value> {
    let Some(obj) = req.params.get("ctx").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "bad_params", "missing ctx object", None));
    };
    let field = |key: &str| -> Result<String, serde_json::Value> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| err(&req.id, "bad_params", format!("missing ctx.{}", key), None))
    };
    let org_id = field("orgId")?;
    let actor_id = field("actorId")?;
    let role = field("role")?;
    if !ROLES.contains(&role.as_str()) {
        return Err(err(
            &req.id,
            "bad_params",
            "ctx.role must be one of: admin, registrar, teacher",
            Some(json!({ "role": role })),
        ));
    }
    Ok(Ctx {
        org_id,
        actor_id,
        role,
    })
}

pub fn require_role(
    req: &Request,
    ctx: &Ctx,
    allowed: &[&str],
) -> Result<(), serde_json::Value> {
    if allowed.contains(&ctx.role.as_str()) {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "forbidden",
            format!("role '{}' may not perform {}", ctx.role, req.method),
            None,
        ))
    }
}

pub fn row_exists(
    conn: &Connection,
    req: &Request,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
    what: &str,
) -> Result<(), serde_json::Value> {
    let found = conn
        .query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_some() {
        Ok(())
    } else {
        Err(err(&req.id, "not_found", format!("{} not found", what), None))
    }
}

/// "HH:MM" -> minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn minutes_to_hhmm(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_days(req: &Request, key: &str) -> Result<Vec<u8>, serde_json::Value> {
    let Some(arr) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", format!("missing {} array", key), None));
    };
    let mut days: Vec<u8> = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(d) = v.as_u64().filter(|d| (1..=7).contains(d)) else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} entries must be weekday integers 1-7", key),
                None,
            ));
        };
        let d = d as u8;
        if !days.contains(&d) {
            days.push(d);
        }
    }
    Ok(days)
}
