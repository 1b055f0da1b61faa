use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_iso, optional_bool, optional_str, request_ctx, require_role, required_str,
    row_exists,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::scheme::{standard_k12_rows, BelowRangePolicy, RoundingMode, SchemeKind, WeightProfile};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const WRITE_ROLES: [&str; 2] = ["admin", "registrar"];

#[derive(Debug, Clone)]
struct SchemeRow {
    id: String,
    name: String,
    kind: SchemeKind,
    version: i64,
    status: String,
    rounding: RoundingMode,
    table_id: Option<String>,
}

fn load_scheme(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    scheme_id: &str,
) -> Result<SchemeRow, serde_json::Value> {
    let row: Option<(String, String, String, i64, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, name, kind, version, status, rounding, transmutation_table_id
             FROM grading_schemes WHERE id = ? AND org_id = ?",
            (scheme_id, &ctx.org_id),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((id, name, kind_raw, version, status, rounding_raw, table_id)) = row else {
        return Err(err(&req.id, "not_found", "scheme not found", None));
    };
    let kind = SchemeKind::parse(&kind_raw)
        .ok_or_else(|| err(&req.id, "db_query_failed", "unknown scheme kind", None))?;
    let rounding = RoundingMode::parse(&rounding_raw)
        .ok_or_else(|| err(&req.id, "db_query_failed", "unknown rounding mode", None))?;
    Ok(SchemeRow {
        id,
        name,
        kind,
        version,
        status,
        rounding,
        table_id,
    })
}

fn require_draft(req: &Request, scheme: &SchemeRow) -> Result<(), serde_json::Value> {
    if scheme.status == "draft" {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "scheme_published",
            "published schemes are immutable; create a new version",
            Some(json!({ "schemeId": scheme.id, "version": scheme.version })),
        ))
    }
}

pub fn load_profiles(
    conn: &Connection,
    scheme_id: &str,
) -> Result<Vec<WeightProfile>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, name, is_default FROM weight_profiles WHERE scheme_id = ? ORDER BY name",
    )?;
    let heads: Vec<(String, String, bool)> = stmt
        .query_map([scheme_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(heads.len());
    for (profile_id, name, is_default) in heads {
        let mut wstmt = conn.prepare(
            "SELECT component_code, weight_percent FROM component_weights WHERE profile_id = ?",
        )?;
        let weights: HashMap<String, f64> = wstmt
            .query_map([&profile_id], |r| Ok((r.get::<_, String>(0)?, r.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        out.push(WeightProfile {
            name,
            is_default,
            weights,
        });
    }
    Ok(out)
}

fn handle_scheme_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind_raw = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(kind) = SchemeKind::parse(&kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: generic, k12, higher_ed",
            None,
        );
    };
    let rounding = match optional_str(req, "rounding") {
        Some(raw) => match RoundingMode::parse(&raw) {
            Some(r) => r,
            None => {
                return err(&req.id, "bad_params", "rounding must be half_up or floor", None)
            }
        },
        None => RoundingMode::HalfUp,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM orgs WHERE id = ?",
        &[&ctx.org_id],
        "org",
    ) {
        return e;
    }

    let scheme_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO grading_schemes(id, org_id, name, kind, version, status, rounding, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, 'draft', ?, ?, ?)",
        (&scheme_id, &ctx.org_id, &name, kind.as_str(), rounding.as_str(), &ts, &ts),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schemeId": scheme_id, "version": 1 }))
}

fn handle_scheme_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, code, label, sort_order FROM scheme_components WHERE scheme_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let components = stmt
        .query_map([&scheme.id], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let label: String = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok(json!({ "componentId": id, "code": code, "label": label, "sortOrder": sort_order }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let components = match components {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let profiles = match load_profiles(conn, &scheme.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let profiles_json: Vec<serde_json::Value> = profiles
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "isDefault": p.is_default,
                "weights": p.weights,
                "weightSum": p.weight_sum()
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "schemeId": scheme.id,
            "name": scheme.name,
            "kind": scheme.kind.as_str(),
            "version": scheme.version,
            "status": scheme.status,
            "rounding": scheme.rounding.as_str(),
            "transmutationTableId": scheme.table_id,
            "components": components,
            "profiles": profiles_json
        }),
    )
}

fn handle_component_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM scheme_components WHERE scheme_id = ?",
        [&scheme.id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let component_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO scheme_components(id, scheme_id, code, label, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&component_id, &scheme.id, &code, &label, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "componentId": component_id, "sortOrder": sort_order }),
    )
}

fn handle_component_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }

    let label = optional_str(req, "label");
    let sort_order = req.params.get("sortOrder").and_then(|v| v.as_i64());
    if label.is_none() && sort_order.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let mut fields: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(label) = label {
        fields.push("label = ?".to_string());
        values.push(Value::Text(label));
    }
    if let Some(sort_order) = sort_order {
        fields.push("sort_order = ?".to_string());
        values.push(Value::Integer(sort_order));
    }
    values.push(Value::Text(component_id.clone()));
    values.push(Value::Text(scheme.id.clone()));

    let sql = format!(
        "UPDATE scheme_components SET {} WHERE id = ? AND scheme_id = ?",
        fields.join(", ")
    );
    let changed = match conn.execute(&sql, params_from_iter(values)) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "component not found", None);
    }
    ok(&req.id, json!({ "componentId": component_id }))
}

fn handle_component_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }

    let code: Option<String> = match conn
        .query_row(
            "SELECT code FROM scheme_components WHERE id = ? AND scheme_id = ?",
            (&component_id, &scheme.id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(code) = code else {
        return err(&req.id, "not_found", "component not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    // Orphaned weights would silently skew future sums; remove them with the component.
    if let Err(e) = tx.execute(
        "DELETE FROM component_weights
         WHERE component_code = ?
           AND profile_id IN (SELECT id FROM weight_profiles WHERE scheme_id = ?)",
        (&code, &scheme.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM scheme_components WHERE id = ? AND scheme_id = ?",
        (&component_id, &scheme.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "componentId": component_id }))
}

fn handle_profile_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let is_default = optional_bool(req, "isDefault", false);
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if is_default {
        // At most one default per scheme.
        if let Err(e) = tx.execute(
            "UPDATE weight_profiles SET is_default = 0 WHERE scheme_id = ?",
            [&scheme.id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    let profile_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO weight_profiles(id, scheme_id, name, is_default) VALUES(?, ?, ?, ?)",
        (&profile_id, &scheme.id, &name, is_default as i64),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "profileId": profile_id }))
}

fn handle_profile_set_weights(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let profile_id = match required_str(req, "profileId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM weight_profiles WHERE id = ? AND scheme_id = ?",
        &[&profile_id, &scheme.id],
        "weight profile",
    ) {
        return e;
    }

    let Some(weights_obj) = req.params.get("weights").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing weights object", None);
    };
    let mut weights: Vec<(String, f64)> = Vec::with_capacity(weights_obj.len());
    for (code, v) in weights_obj {
        let Some(w) = v.as_f64() else {
            return err(
                &req.id,
                "bad_params",
                format!("weight for '{}' must be numeric", code),
                None,
            );
        };
        if w < 0.0 {
            return err(
                &req.id,
                "bad_params",
                format!("weight for '{}' must be >= 0", code),
                None,
            );
        }
        let known: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM scheme_components WHERE scheme_id = ? AND code = ?",
                (&scheme.id, code),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if known.is_none() {
            return err(
                &req.id,
                "bad_params",
                format!("unknown component code '{}'", code),
                None,
            );
        }
        weights.push((code.clone(), w));
    }

    // Replace-all upsert: stale weights must not linger.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM component_weights WHERE profile_id = ?",
        [&profile_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    for (code, w) in &weights {
        if let Err(e) = tx.execute(
            "INSERT INTO component_weights(profile_id, component_code, weight_percent) VALUES(?, ?, ?)",
            (&profile_id, code, w),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let sum: f64 = weights.iter().map(|(_, w)| w).sum();
    ok(&req.id, json!({ "profileId": profile_id, "weightSum": sum }))
}

fn handle_scheme_attach_table(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let table_id = match required_str(req, "tableId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM transmutation_tables WHERE id = ? AND org_id = ?",
        &[&table_id, &ctx.org_id],
        "transmutation table",
    ) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE grading_schemes SET transmutation_table_id = ?, updated_at = ? WHERE id = ?",
        (&table_id, &now_iso(), &scheme.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schemeId": scheme.id, "tableId": table_id }))
}

fn handle_scheme_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = require_draft(req, &scheme) {
        return e;
    }

    let profiles = match load_profiles(conn, &scheme.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !profiles.iter().any(|p| p.is_default) {
        return err(
            &req.id,
            "no_default_profile",
            "scheme needs a default weight profile before publish",
            None,
        );
    }
    for p in &profiles {
        if !p.sums_to_100() {
            return err(
                &req.id,
                "weights_not_100",
                format!("profile '{}' sums to {:.2}, expected 100.00", p.name, p.weight_sum()),
                Some(json!({ "profile": p.name, "sum": p.weight_sum() })),
            );
        }
    }

    if scheme.kind.requires_transmutation() {
        let Some(table_id) = &scheme.table_id else {
            return err(
                &req.id,
                "missing_transmutation_table",
                format!("scheme kind '{}' requires an attached transmutation table", scheme.kind.as_str()),
                None,
            );
        };
        let status: Option<String> = match conn
            .query_row(
                "SELECT status FROM transmutation_tables WHERE id = ? AND org_id = ?",
                (table_id, &ctx.org_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if status.as_deref() != Some("published") {
            return err(
                &req.id,
                "missing_transmutation_table",
                "attached transmutation table must be published first",
                Some(json!({ "tableId": table_id })),
            );
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE grading_schemes SET status = 'published', published_at = ?, updated_at = ? WHERE id = ?",
        (&now_iso(), &now_iso(), &scheme.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schemeId": scheme.id, "status": "published" }))
}

fn handle_scheme_new_version(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheme = match load_scheme(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if scheme.status != "published" {
        return err(
            &req.id,
            "bad_params",
            "only published schemes take new versions; edit the draft directly",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let new_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = tx.execute(
        "INSERT INTO grading_schemes(id, org_id, name, kind, version, status, rounding, transmutation_table_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'draft', ?, ?, ?, ?)",
        (
            &new_id,
            &ctx.org_id,
            &scheme.name,
            scheme.kind.as_str(),
            scheme.version + 1,
            scheme.rounding.as_str(),
            &scheme.table_id,
            &ts,
            &ts,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Deep-copy components, profiles, and weights into the new draft.
    let comps: Result<Vec<(String, String, i64)>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT code, label, sort_order FROM scheme_components WHERE scheme_id = ? ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([&scheme.id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    let comps = match comps {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for (code, label, sort_order) in &comps {
        if let Err(e) = tx.execute(
            "INSERT INTO scheme_components(id, scheme_id, code, label, sort_order) VALUES(?, ?, ?, ?, ?)",
            (&Uuid::new_v4().to_string(), &new_id, code, label, sort_order),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    let heads: Result<Vec<(String, String, i64)>, rusqlite::Error> = (|| {
        let mut stmt =
            tx.prepare("SELECT id, name, is_default FROM weight_profiles WHERE scheme_id = ?")?;
        let rows = stmt
            .query_map([&scheme.id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    let heads = match heads {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for (old_profile_id, name, is_default) in &heads {
        let new_profile_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO weight_profiles(id, scheme_id, name, is_default) VALUES(?, ?, ?, ?)",
            (&new_profile_id, &new_id, name, is_default),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        if let Err(e) = tx.execute(
            "INSERT INTO component_weights(profile_id, component_code, weight_percent)
             SELECT ?, component_code, weight_percent FROM component_weights WHERE profile_id = ?",
            (&new_profile_id, old_profile_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "schemeId": new_id, "version": scheme.version + 1, "status": "draft" }),
    )
}

fn table_status(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    table_id: &str,
) -> Result<String, serde_json::Value> {
    conn.query_row(
        "SELECT status FROM transmutation_tables WHERE id = ? AND org_id = ?",
        (table_id, &ctx.org_id),
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "transmutation table not found", None))
}

fn require_table_draft(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    table_id: &str,
) -> Result<(), serde_json::Value> {
    let status = table_status(conn, req, ctx, table_id)?;
    if status == "draft" {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "table_published",
            "published transmutation tables are immutable",
            Some(json!({ "tableId": table_id })),
        ))
    }
}

fn handle_transmutation_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match optional_str(req, "belowRangePolicy") {
        Some(raw) => match BelowRangePolicy::parse(&raw) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "belowRangePolicy must be fail or pass_through",
                    None,
                )
            }
        },
        None => BelowRangePolicy::Fail,
    };

    let table_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO transmutation_tables(id, org_id, name, status, below_range_policy, created_at)
         VALUES(?, ?, ?, 'draft', ?, ?)",
        (&table_id, &ctx.org_id, &name, policy.as_str(), &now_iso()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "tableId": table_id }))
}

fn handle_transmutation_set_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let table_id = match required_str(req, "tableId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_table_draft(conn, req, &ctx, &table_id) {
        return e;
    }
    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing rows array", None);
    };
    let mut parsed: Vec<(f64, f64)> = Vec::with_capacity(rows.len());
    for row in rows {
        let input = row.get("inputGrade").and_then(|v| v.as_f64());
        let output = row.get("outputGrade").and_then(|v| v.as_f64());
        let (Some(input), Some(output)) = (input, output) else {
            return err(
                &req.id,
                "bad_params",
                "rows need numeric inputGrade and outputGrade",
                None,
            );
        };
        if parsed.iter().any(|(i, _)| *i == input) {
            return err(
                &req.id,
                "bad_params",
                format!("duplicate inputGrade {}", input),
                None,
            );
        }
        parsed.push((input, output));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM transmutation_rows WHERE table_id = ?", [&table_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    for (input, output) in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO transmutation_rows(table_id, input_grade, output_grade) VALUES(?, ?, ?)",
            (&table_id, input, output),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "tableId": table_id, "rowCount": parsed.len() }))
}

fn handle_transmutation_generate_standard(
    state: &mut AppState,
    req: &Request,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let table_id = match required_str(req, "tableId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_table_draft(conn, req, &ctx, &table_id) {
        return e;
    }

    let rows = standard_k12_rows();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM transmutation_rows WHERE table_id = ?", [&table_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    for row in &rows {
        if let Err(e) = tx.execute(
            "INSERT INTO transmutation_rows(table_id, input_grade, output_grade) VALUES(?, ?, ?)",
            (&table_id, row.input_grade, row.output_grade),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "tableId": table_id, "rowCount": rows.len() }))
}

fn handle_transmutation_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &WRITE_ROLES) {
        return e;
    }
    let table_id = match required_str(req, "tableId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_table_draft(conn, req, &ctx, &table_id) {
        return e;
    }

    let row_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM transmutation_rows WHERE table_id = ?",
        [&table_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if row_count == 0 {
        return err(&req.id, "bad_params", "cannot publish an empty table", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE transmutation_tables SET status = 'published', published_at = ? WHERE id = ?",
        (&now_iso(), &table_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "tableId": table_id, "status": "published" }))
}

fn handle_transmutation_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let table_id = match required_str(req, "tableId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let head: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT name, status, below_range_policy FROM transmutation_tables WHERE id = ? AND org_id = ?",
            (&table_id, &ctx.org_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, status, policy)) = head else {
        return err(&req.id, "not_found", "transmutation table not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT input_grade, output_grade FROM transmutation_rows WHERE table_id = ? ORDER BY input_grade",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&table_id], |row| {
            let input: f64 = row.get(0)?;
            let output: f64 = row.get(1)?;
            Ok(json!({ "inputGrade": input, "outputGrade": output }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "tableId": table_id,
            "name": name,
            "status": status,
            "belowRangePolicy": policy,
            "rows": rows
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scheme.create" => Some(handle_scheme_create(state, req)),
        "scheme.get" => Some(handle_scheme_get(state, req)),
        "scheme.attachTable" => Some(handle_scheme_attach_table(state, req)),
        "scheme.publish" => Some(handle_scheme_publish(state, req)),
        "scheme.newVersion" => Some(handle_scheme_new_version(state, req)),
        "component.add" => Some(handle_component_add(state, req)),
        "component.update" => Some(handle_component_update(state, req)),
        "component.remove" => Some(handle_component_remove(state, req)),
        "profile.create" => Some(handle_profile_create(state, req)),
        "profile.setWeights" => Some(handle_profile_set_weights(state, req)),
        "transmutation.create" => Some(handle_transmutation_create(state, req)),
        "transmutation.setRows" => Some(handle_transmutation_set_rows(state, req)),
        "transmutation.generateStandard" => Some(handle_transmutation_generate_standard(state, req)),
        "transmutation.publish" => Some(handle_transmutation_publish(state, req)),
        "transmutation.get" => Some(handle_transmutation_get(state, req)),
        _ => None,
    }
}
