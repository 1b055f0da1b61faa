use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_iso, request_ctx, require_role, required_f64, required_i64, required_str,
    row_exists,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

const GRADE_ROLES: [&str; 3] = ["admin", "registrar", "teacher"];
const SCORE_SET_MAX_EDITS: usize = 5000;

fn handle_item_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &GRADE_ROLES) {
        return e;
    }
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_i64(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_code = match required_str(req, "componentCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_points = match required_f64(req, "maxPoints") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if max_points < 0.0 {
        return err(&req.id, "bad_params", "maxPoints must be >= 0", None);
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM sections WHERE id = ? AND org_id = ?",
        &[&section_id, &ctx.org_id],
        "section",
    ) {
        return e;
    }

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO graded_items(id, org_id, section_id, term, component_code, title, max_points, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &item_id,
            &ctx.org_id,
            &section_id,
            term,
            &component_code,
            &title,
            max_points,
            &now_iso(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "itemId": item_id }))
}

fn handle_item_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_i64(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, component_code, title, max_points
         FROM graded_items
         WHERE section_id = ? AND org_id = ? AND term = ?
         ORDER BY component_code, created_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&section_id, &ctx.org_id, term), |row| {
            let id: String = row.get(0)?;
            let component_code: String = row.get(1)?;
            let title: String = row.get(2)?;
            let max_points: f64 = row.get(3)?;
            Ok(json!({
                "itemId": id,
                "componentCode": component_code,
                "title": title,
                "maxPoints": max_points
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(items) => ok(&req.id, json!({ "items": items })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_score_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &GRADE_ROLES) {
        return e;
    }
    let item_id = match required_str(req, "itemId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM graded_items WHERE id = ? AND org_id = ?",
        &[&item_id, &ctx.org_id],
        "graded item",
    ) {
        return e;
    }
    let Some(entries) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing scores array", None);
    };
    if entries.len() > SCORE_SET_MAX_EDITS {
        return err(
            &req.id,
            "bad_params",
            format!("too many score edits (max {})", SCORE_SET_MAX_EDITS),
            None,
        );
    }

    let mut parsed: Vec<(String, String, Option<f64>)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let Some(student_id) = student_id else {
            return err(&req.id, "bad_params", "score entries need studentId", None);
        };
        let status = entry
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.to_ascii_lowercase());
        let score = entry.get("score").and_then(|v| v.as_f64());
        match status.as_deref() {
            Some("present") => {
                let Some(v) = score else {
                    return err(
                        &req.id,
                        "bad_params",
                        "present scores need a numeric score",
                        None,
                    );
                };
                if v < 0.0 {
                    return err(&req.id, "bad_params", "scores must be >= 0", None);
                }
                parsed.push((student_id, "present".to_string(), Some(v)));
            }
            Some("missing") => parsed.push((student_id, "missing".to_string(), None)),
            Some("excused") => parsed.push((student_id, "excused".to_string(), None)),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: present, missing, excused",
                    None,
                )
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    let ts = now_iso();
    for (student_id, status, score) in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO item_scores(item_id, student_id, status, score, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(item_id, student_id) DO UPDATE SET
               status = excluded.status,
               score = excluded.score,
               updated_at = excluded.updated_at",
            (&item_id, student_id, status, score, &ts),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "itemId": item_id, "updated": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "item.create" => Some(handle_item_create(state, req)),
        "item.list" => Some(handle_item_list(state, req)),
        "score.set" => Some(handle_score_set(state, req)),
        _ => None,
    }
}
