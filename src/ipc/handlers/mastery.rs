use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_iso, optional_bool, optional_str, request_ctx, require_role, required_str,
    row_exists,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::mastery::{apply_transition, ProposalStatus, Transition};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const REVIEW_ROLES: [&str; 2] = ["admin", "registrar"];

struct ProposalRow {
    status: ProposalStatus,
    archived_at: Option<String>,
    student_id: String,
    competency_code: String,
    proposed_level: String,
}

fn load_proposal(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    proposal_id: &str,
) -> Result<ProposalRow, serde_json::Value> {
    let row: Option<(String, Option<String>, String, String, String)> = conn
        .query_row(
            "SELECT status, archived_at, student_id, competency_code, proposed_level
             FROM mastery_proposals WHERE id = ? AND org_id = ?",
            (proposal_id, &ctx.org_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((status_raw, archived_at, student_id, competency_code, proposed_level)) = row else {
        return Err(err(&req.id, "not_found", "proposal not found", None));
    };
    let status = ProposalStatus::parse(&status_raw)
        .ok_or_else(|| err(&req.id, "db_query_failed", "unknown proposal status", None))?;
    Ok(ProposalRow {
        status,
        archived_at,
        student_id,
        competency_code,
        proposed_level,
    })
}

fn guard_not_archived(req: &Request, row: &ProposalRow) -> Result<(), serde_json::Value> {
    if row.archived_at.is_some() {
        Err(err(
            &req.id,
            "proposal_archived",
            "archived proposals cannot change state",
            None,
        ))
    } else {
        Ok(())
    }
}

fn transition_or_err(
    req: &Request,
    row: &ProposalRow,
    t: Transition,
) -> Result<ProposalStatus, serde_json::Value> {
    apply_transition(row.status, t).ok_or_else(|| {
        err(
            &req.id,
            "invalid_transition",
            format!("cannot {:?} a {} proposal", t, row.status.as_str()),
            Some(json!({ "currentStatus": row.status.as_str() })),
        )
    })
}

fn handle_propose(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let competency_code = match required_str(req, "competencyCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let proposed_level = match required_str(req, "proposedLevel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM sections WHERE id = ? AND org_id = ?",
        &[&section_id, &ctx.org_id],
        "section",
    ) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM students WHERE id = ? AND org_id = ?",
        &[&student_id, &ctx.org_id],
        "student",
    ) {
        return e;
    }

    let proposal_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO mastery_proposals(
            id, org_id, section_id, student_id, competency_code, proposed_level,
            status, notes, archived_at, created_by, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, 'draft', NULL, NULL, ?, ?, ?)",
        (
            &proposal_id,
            &ctx.org_id,
            &section_id,
            &student_id,
            &competency_code,
            &proposed_level,
            &ctx.actor_id,
            &ts,
            &ts,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "proposalId": proposal_id, "status": "draft" }))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let proposal_id = match required_str(req, "proposalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_proposal(conn, req, &ctx, &proposal_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = guard_not_archived(req, &row) {
        return e;
    }
    let next = match transition_or_err(req, &row, Transition::Submit) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE mastery_proposals SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &now_iso(), &proposal_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "proposalId": proposal_id, "status": next.as_str() }),
    )
}

fn handle_approve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &REVIEW_ROLES) {
        return e;
    }
    let proposal_id = match required_str(req, "proposalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_proposal(conn, req, &ctx, &proposal_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = guard_not_archived(req, &row) {
        return e;
    }
    let next = match transition_or_err(req, &row, Transition::Approve) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Approval both advances the workflow and records the judgment.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    let ts = now_iso();
    if let Err(e) = tx.execute(
        "UPDATE mastery_proposals SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &ts, &proposal_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let snapshot_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO mastery_snapshots(id, org_id, student_id, competency_code, level, proposal_id, recorded_by, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &snapshot_id,
            &ctx.org_id,
            &row.student_id,
            &row.competency_code,
            &row.proposed_level,
            &proposal_id,
            &ctx.actor_id,
            &ts,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "proposalId": proposal_id,
            "status": next.as_str(),
            "snapshotId": snapshot_id
        }),
    )
}

fn handle_request_changes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &REVIEW_ROLES) {
        return e;
    }
    let proposal_id = match required_str(req, "proposalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let notes = match required_str(req, "notes") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_proposal(conn, req, &ctx, &proposal_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = guard_not_archived(req, &row) {
        return e;
    }
    let next = match transition_or_err(req, &row, Transition::RequestChanges) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE mastery_proposals SET status = ?, notes = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &notes, &now_iso(), &proposal_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "proposalId": proposal_id, "status": next.as_str(), "notes": notes }),
    )
}

fn handle_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &ctx, &REVIEW_ROLES) {
        return e;
    }
    let proposal_id = match required_str(req, "proposalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match load_proposal(conn, req, &ctx, &proposal_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if row.archived_at.is_some() {
        return ok(&req.id, json!({ "proposalId": proposal_id, "archived": true }));
    }

    if let Err(e) = conn.execute(
        "UPDATE mastery_proposals SET archived_at = ?, updated_at = ? WHERE id = ?",
        (&now_iso(), &now_iso(), &proposal_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "proposalId": proposal_id, "archived": true }))
}

fn handle_list_proposals(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let include_archived = optional_bool(req, "includeArchived", false);

    let sql = if include_archived {
        "SELECT id, student_id, competency_code, proposed_level, status, notes, archived_at
         FROM mastery_proposals WHERE section_id = ? AND org_id = ? ORDER BY created_at"
    } else {
        "SELECT id, student_id, competency_code, proposed_level, status, notes, archived_at
         FROM mastery_proposals WHERE section_id = ? AND org_id = ? AND archived_at IS NULL
         ORDER BY created_at"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&section_id, &ctx.org_id), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let competency_code: String = row.get(2)?;
            let proposed_level: String = row.get(3)?;
            let status: String = row.get(4)?;
            let notes: Option<String> = row.get(5)?;
            let archived_at: Option<String> = row.get(6)?;
            Ok(json!({
                "proposalId": id,
                "studentId": student_id,
                "competencyCode": competency_code,
                "proposedLevel": proposed_level,
                "status": status,
                "notes": notes,
                "archivedAt": archived_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(proposals) => ok(&req.id, json!({ "proposals": proposals })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_snapshots(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let competency = optional_str(req, "competencyCode");

    let mut stmt = match conn.prepare(
        "SELECT id, competency_code, level, proposal_id, recorded_by, recorded_at
         FROM mastery_snapshots
         WHERE student_id = ? AND org_id = ? AND (?3 IS NULL OR competency_code = ?3)
         ORDER BY recorded_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &ctx.org_id, &competency), |row| {
            let id: String = row.get(0)?;
            let competency_code: String = row.get(1)?;
            let level: String = row.get(2)?;
            let proposal_id: Option<String> = row.get(3)?;
            let recorded_by: String = row.get(4)?;
            let recorded_at: String = row.get(5)?;
            Ok(json!({
                "snapshotId": id,
                "competencyCode": competency_code,
                "level": level,
                "proposalId": proposal_id,
                "recordedBy": recorded_by,
                "recordedAt": recorded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(snapshots) => ok(&req.id, json!({ "snapshots": snapshots })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "mastery.propose" => Some(handle_propose(state, req)),
        "mastery.submit" => Some(handle_submit(state, req)),
        "mastery.approve" => Some(handle_approve(state, req)),
        "mastery.requestChanges" => Some(handle_request_changes(state, req)),
        "mastery.archive" => Some(handle_archive(state, req)),
        "mastery.listProposals" => Some(handle_list_proposals(state, req)),
        "mastery.listSnapshots" => Some(handle_list_snapshots(state, req)),
        _ => None,
    }
}
