use crate::gradecalc::{compute_grades, EngineScheme, ItemScore, ScoreState, StudentScores};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schemes::load_profiles;
use crate::ipc::helpers::{
    db_conn, now_iso, optional_str, request_ctx, require_role, required_i64, required_str,
    row_exists,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::scheme::{
    BelowRangePolicy, ComponentDef, RoundingMode, SchemeKind, TransmutationRow, TransmutationTable,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const RUN_ROLES: [&str; 3] = ["admin", "registrar", "teacher"];

struct SchemeSnapshot {
    engine: EngineScheme,
    status: String,
    table_id: Option<String>,
}

fn load_scheme_snapshot(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    scheme_id: &str,
) -> Result<SchemeSnapshot, serde_json::Value> {
    let row: Option<(String, i64, String, String, Option<String>)> = conn
        .query_row(
            "SELECT kind, version, status, rounding, transmutation_table_id
             FROM grading_schemes WHERE id = ? AND org_id = ?",
            (scheme_id, &ctx.org_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((kind_raw, version, status, rounding_raw, table_id)) = row else {
        return Err(err(&req.id, "not_found", "scheme not found", None));
    };
    let kind = SchemeKind::parse(&kind_raw)
        .ok_or_else(|| err(&req.id, "db_query_failed", "unknown scheme kind", None))?;
    let rounding = RoundingMode::parse(&rounding_raw)
        .ok_or_else(|| err(&req.id, "db_query_failed", "unknown rounding mode", None))?;

    let mut stmt = conn
        .prepare(
            "SELECT code, label, sort_order FROM scheme_components WHERE scheme_id = ? ORDER BY sort_order",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let components: Vec<ComponentDef> = stmt
        .query_map([scheme_id], |r| {
            Ok(ComponentDef {
                code: r.get(0)?,
                label: r.get(1)?,
                sort_order: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let profiles = load_profiles(conn, scheme_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    Ok(SchemeSnapshot {
        engine: EngineScheme {
            scheme_id: scheme_id.to_string(),
            version,
            kind,
            rounding,
            components,
            profiles,
        },
        status,
        table_id,
    })
}

/// Loads a table only if it is published; unpublished tables are treated
/// as absent so requiring schemes fail the run, not the request.
fn load_published_table(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    table_id: &str,
) -> Result<Option<TransmutationTable>, serde_json::Value> {
    let head: Option<(String, String)> = conn
        .query_row(
            "SELECT status, below_range_policy FROM transmutation_tables WHERE id = ? AND org_id = ?",
            (table_id, &ctx.org_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((status, policy_raw)) = head else {
        return Ok(None);
    };
    if status != "published" {
        return Ok(None);
    }
    let policy = BelowRangePolicy::parse(&policy_raw).unwrap_or(BelowRangePolicy::Fail);

    let mut stmt = conn
        .prepare(
            "SELECT input_grade, output_grade FROM transmutation_rows WHERE table_id = ? ORDER BY input_grade",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows: Vec<TransmutationRow> = stmt
        .query_map([table_id], |r| {
            Ok(TransmutationRow {
                input_grade: r.get(0)?,
                output_grade: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(TransmutationTable::new(table_id, policy, rows)))
}

/// Snapshot of every enrolled student's recorded scores, bucketed by
/// component code. Items with no recorded score are not yet graded and do
/// not enter the computation at all.
fn load_student_scores(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    section_id: &str,
    term: i64,
) -> Result<Vec<StudentScores>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.last_name, st.first_name
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.section_id = ? AND e.org_id = ? AND st.active = 1
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let students: Vec<(String, String)> = stmt
        .query_map((section_id, &ctx.org_id), |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((id, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let mut stmt = conn
        .prepare(
            "SELECT i.component_code, i.max_points, sc.student_id, sc.status, sc.score
             FROM graded_items i
             JOIN item_scores sc ON sc.item_id = i.id
             WHERE i.section_id = ? AND i.org_id = ? AND i.term = ?",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let score_rows: Vec<(String, f64, String, String, Option<f64>)> = stmt
        .query_map((section_id, &ctx.org_id, term), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let mut by_student: HashMap<String, HashMap<String, Vec<ItemScore>>> = HashMap::new();
    for (component_code, max_points, student_id, status, score) in score_rows {
        let state = match status.as_str() {
            "present" => ScoreState::Present(score.unwrap_or(0.0)),
            "missing" => ScoreState::Missing,
            "excused" => ScoreState::Excused,
            _ => continue,
        };
        by_student
            .entry(student_id)
            .or_default()
            .entry(component_code)
            .or_default()
            .push(ItemScore { max_points, state });
    }

    Ok(students
        .into_iter()
        .map(|(student_id, display_name)| {
            let by_component = by_student.remove(&student_id).unwrap_or_default();
            StudentScores {
                student_id,
                display_name,
                by_component,
            }
        })
        .collect())
}

fn handle_compute_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &RUN_ROLES) {
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
    let scheme_id = match required_str(req, "schemeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let profile_name = optional_str(req, "profileName");
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM sections WHERE id = ? AND org_id = ?",
        &[&section_id, &ctx.org_id],
        "section",
    ) {
        return e;
    }

    let snapshot = match load_scheme_snapshot(conn, req, &ctx, &scheme_id) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if snapshot.status != "published" {
        return err(
            &req.id,
            "scheme_not_published",
            "compute runs require a published scheme",
            Some(json!({ "schemeId": scheme_id, "status": snapshot.status })),
        );
    }

    let table_id = optional_str(req, "tableId").or(snapshot.table_id.clone());
    let table = if snapshot.engine.kind.requires_transmutation() {
        match &table_id {
            Some(id) => match load_published_table(conn, req, &ctx, id) {
                Ok(t) => t,
                Err(e) => return e,
            },
            None => None,
        }
    } else {
        None
    };

    let students = match load_student_scores(conn, req, &ctx, &section_id, term) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let run_id = Uuid::new_v4().to_string();
    let created_at = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO compute_runs(id, org_id, section_id, term, scheme_id, scheme_version, profile_name, table_id, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'created', ?)",
        (
            &run_id,
            &ctx.org_id,
            &section_id,
            term,
            &scheme_id,
            snapshot.engine.version,
            &profile_name,
            &table_id,
            &created_at,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let computed_at = now_iso();
    match compute_grades(
        &snapshot.engine,
        profile_name.as_deref(),
        table.as_ref(),
        &students,
        &computed_at,
    ) {
        Ok(grades) => {
            // All-or-nothing: grades and run completion commit together.
            let tx = match conn.unchecked_transaction() {
                Ok(t) => t,
                Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
            };
            for g in &grades {
                let breakdown = match serde_json::to_string(&g.breakdown) {
                    Ok(v) => v,
                    Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
                };
                if let Err(e) = tx.execute(
                    "INSERT INTO computed_grades(run_id, student_id, initial_grade, transmuted_grade, final_grade, breakdown_json)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        &run_id,
                        &g.student_id,
                        g.initial_grade,
                        g.transmuted_grade,
                        g.final_grade,
                        &breakdown,
                    ),
                ) {
                    return err(&req.id, "db_insert_failed", e.to_string(), None);
                }
            }
            if let Err(e) = tx.execute(
                "UPDATE compute_runs SET status = 'completed', completed_at = ? WHERE id = ?",
                (&computed_at, &run_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            if let Err(e) = tx.commit() {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            ok(
                &req.id,
                json!({
                    "runId": run_id,
                    "status": "completed",
                    "studentCount": grades.len()
                }),
            )
        }
        Err(engine_err) => {
            if let Err(e) = conn.execute(
                "UPDATE compute_runs SET status = 'failed', error_message = ? WHERE id = ?",
                (&engine_err.message, &run_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            err(
                &req.id,
                &engine_err.code,
                engine_err.message,
                Some(json!({ "runId": run_id })),
            )
        }
    }
}

fn handle_compute_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let run_id = match required_str(req, "runId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, i64, String, i64, Option<String>, Option<String>, String, Option<String>, String, Option<String>)> =
        match conn
            .query_row(
                "SELECT section_id, term, scheme_id, scheme_version, profile_name, table_id,
                        status, error_message, created_at, completed_at
                 FROM compute_runs WHERE id = ? AND org_id = ?",
                (&run_id, &ctx.org_id),
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                        r.get(9)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some((
        section_id,
        term,
        scheme_id,
        scheme_version,
        profile_name,
        table_id,
        status,
        error_message,
        created_at,
        completed_at,
    )) = row
    else {
        return err(&req.id, "not_found", "compute run not found", None);
    };

    ok(
        &req.id,
        json!({
            "runId": run_id,
            "sectionId": section_id,
            "term": term,
            "schemeId": scheme_id,
            "schemeVersion": scheme_version,
            "profileName": profile_name,
            "tableId": table_id,
            "status": status,
            "errorMessage": error_message,
            "createdAt": created_at,
            "completedAt": completed_at
        }),
    )
}

fn handle_compute_list_grades(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let run_id = match required_str(req, "runId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM compute_runs WHERE id = ? AND org_id = ?",
        &[&run_id, &ctx.org_id],
        "compute run",
    ) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT g.student_id, st.last_name, st.first_name, g.initial_grade, g.transmuted_grade,
                g.final_grade, g.breakdown_json
         FROM computed_grades g
         JOIN students st ON st.id = g.student_id
         WHERE g.run_id = ?
         ORDER BY st.last_name, st.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&run_id], |row| {
            let student_id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let initial: f64 = row.get(3)?;
            let transmuted: Option<f64> = row.get(4)?;
            let final_grade: f64 = row.get(5)?;
            let breakdown_raw: String = row.get(6)?;
            let breakdown: serde_json::Value =
                serde_json::from_str(&breakdown_raw).unwrap_or(serde_json::Value::Null);
            Ok(json!({
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "initialGrade": initial,
                "transmutedGrade": transmuted,
                "finalGrade": final_grade,
                "breakdown": breakdown
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "runId": run_id, "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "compute.run" => Some(handle_compute_run(state, req)),
        "compute.get" => Some(handle_compute_get(state, req)),
        "compute.listGrades" => Some(handle_compute_list_grades(state, req)),
        _ => None,
    }
}
