use crate::conflicts::{
    check_conflicts, CandidateMeeting, Conflict, ScheduledMeeting, TeacherRef,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, minutes_to_hhmm, now_iso, optional_bool, optional_str, parse_days, parse_hhmm,
    request_ctx, require_role, required_str, row_exists,
};
use crate::ipc::types::{AppState, Ctx, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const WRITE_ROLES: [&str; 2] = ["admin", "registrar"];

fn days_to_json(days: &[u8]) -> String {
    serde_json::to_string(days).unwrap_or_else(|_| "[]".to_string())
}

fn days_from_json(raw: &str) -> Vec<u8> {
    serde_json::from_str::<Vec<u8>>(raw).unwrap_or_default()
}

fn section_school_year(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    section_id: &str,
) -> Result<String, serde_json::Value> {
    conn.query_row(
        "SELECT school_year_id FROM sections WHERE id = ? AND org_id = ?",
        (section_id, &ctx.org_id),
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "section not found", None))
}

/// Active meetings in one school-year, with section labels for conflict
/// messages. The detector receives exactly this snapshot.
fn load_active_meetings(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    school_year_id: &str,
) -> Result<Vec<ScheduledMeeting>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT m.id, m.section_id, s.code, m.days_json, m.start_time, m.end_time, m.room_id
             FROM meetings m
             JOIN sections s ON s.id = m.section_id
             WHERE m.school_year_id = ? AND m.org_id = ? AND m.active = 1",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows = stmt
        .query_map((school_year_id, &ctx.org_id), |row| {
            let id: String = row.get(0)?;
            let section_id: String = row.get(1)?;
            let section_label: String = row.get(2)?;
            let days_raw: String = row.get(3)?;
            let start: String = row.get(4)?;
            let end: String = row.get(5)?;
            let room_id: Option<String> = row.get(6)?;
            Ok((id, section_id, section_label, days_raw, start, end, room_id))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let meetings = rows
        .into_iter()
        .filter_map(|(id, section_id, section_label, days_raw, start, end, room_id)| {
            let start_minute = parse_hhmm(&start)?;
            let end_minute = parse_hhmm(&end)?;
            Some(ScheduledMeeting {
                meeting_id: id,
                section_id,
                section_label,
                days: days_from_json(&days_raw),
                start_minute,
                end_minute,
                room_id,
            })
        })
        .collect();
    Ok(meetings)
}

fn load_teachers_by_section(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
) -> Result<std::collections::HashMap<String, Vec<TeacherRef>>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT ta.section_id, ta.staff_id, s.last_name, s.first_name
             FROM teacher_assignments ta
             JOIN staff s ON s.id = ta.staff_id
             WHERE ta.org_id = ?",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows = stmt
        .query_map([&ctx.org_id], |row| {
            let section_id: String = row.get(0)?;
            let staff_id: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            Ok((section_id, staff_id, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let mut map: std::collections::HashMap<String, Vec<TeacherRef>> =
        std::collections::HashMap::new();
    for (section_id, staff_id, display_name) in rows {
        map.entry(section_id).or_default().push(TeacherRef {
            staff_id,
            display_name,
        });
    }
    Ok(map)
}

struct CandidateInput {
    section_id: String,
    school_year_id: String,
    days: Vec<u8>,
    start_minute: u16,
    end_minute: u16,
    start_time: String,
    end_time: String,
    room_id: Option<String>,
    period_label: Option<String>,
}

fn parse_candidate(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
) -> Result<CandidateInput, serde_json::Value> {
    let section_id = required_str(req, "sectionId")?;
    let school_year_id = section_school_year(conn, req, ctx, &section_id)?;
    let days = parse_days(req, "days")?;
    let start_time = required_str(req, "startTime")?;
    let end_time = required_str(req, "endTime")?;
    let start_minute = parse_hhmm(&start_time)
        .ok_or_else(|| err(&req.id, "bad_params", "startTime must be HH:MM", None))?;
    let end_minute = parse_hhmm(&end_time)
        .ok_or_else(|| err(&req.id, "bad_params", "endTime must be HH:MM", None))?;
    if start_minute >= end_minute {
        return Err(err(
            &req.id,
            "bad_params",
            "startTime must be before endTime",
            None,
        ));
    }
    let room_id = optional_str(req, "roomId");
    if let Some(room) = &room_id {
        row_exists(
            conn,
            req,
            "SELECT 1 FROM rooms WHERE id = ? AND org_id = ?",
            &[room, &ctx.org_id],
            "room",
        )?;
    }
    Ok(CandidateInput {
        section_id,
        school_year_id,
        days,
        start_minute,
        end_minute,
        start_time: minutes_to_hhmm(start_minute),
        end_time: minutes_to_hhmm(end_minute),
        room_id,
        period_label: optional_str(req, "periodLabel"),
    })
}

fn run_check(
    conn: &Connection,
    req: &Request,
    ctx: &Ctx,
    input: &CandidateInput,
    exclude_meeting_id: Option<&str>,
) -> Result<Vec<Conflict>, serde_json::Value> {
    let existing = load_active_meetings(conn, req, ctx, &input.school_year_id)?;
    let teachers = load_teachers_by_section(conn, req, ctx)?;
    let candidate = CandidateMeeting {
        meeting_id: exclude_meeting_id.map(|s| s.to_string()),
        section_id: input.section_id.clone(),
        days: input.days.clone(),
        start_minute: input.start_minute,
        end_minute: input.end_minute,
        room_id: input.room_id.clone(),
    };
    Ok(check_conflicts(&candidate, &existing, &teachers))
}

fn conflicts_json(conflicts: &[Conflict]) -> serde_json::Value {
    serde_json::to_value(conflicts).unwrap_or_else(|_| json!([]))
}

fn handle_check_conflicts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ctx = match request_ctx(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match parse_candidate(conn, req, &ctx) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exclude = optional_str(req, "meetingId");
    match run_check(conn, req, &ctx, &input, exclude.as_deref()) {
        Ok(conflicts) => ok(&req.id, json!({ "conflicts": conflicts_json(&conflicts) })),
        Err(e) => e,
    }
}

fn handle_meeting_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let input = match parse_candidate(conn, req, &ctx) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let conflicts = match run_check(conn, req, &ctx, &input, None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Blocking is caller policy; the default only surfaces warnings.
    if optional_bool(req, "blockOnConflict", false) && !conflicts.is_empty() {
        return err(
            &req.id,
            "schedule_conflict",
            format!("{} conflict(s) found", conflicts.len()),
            Some(json!({ "conflicts": conflicts_json(&conflicts) })),
        );
    }

    let meeting_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO meetings(
            id, org_id, school_year_id, section_id, days_json, start_time, end_time,
            room_id, period_label, active, archived_at, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)",
        (
            &meeting_id,
            &ctx.org_id,
            &input.school_year_id,
            &input.section_id,
            &days_to_json(&input.days),
            &input.start_time,
            &input.end_time,
            &input.room_id,
            &input.period_label,
            &ts,
            &ts,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "meetingId": meeting_id, "conflicts": conflicts_json(&conflicts) }),
    )
}

fn handle_meeting_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let meeting_id = match required_str(req, "meetingId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM meetings WHERE id = ? AND org_id = ? AND active = 1",
        &[&meeting_id, &ctx.org_id],
        "meeting",
    ) {
        return e;
    }
    let input = match parse_candidate(conn, req, &ctx) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let conflicts = match run_check(conn, req, &ctx, &input, Some(&meeting_id)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if optional_bool(req, "blockOnConflict", false) && !conflicts.is_empty() {
        return err(
            &req.id,
            "schedule_conflict",
            format!("{} conflict(s) found", conflicts.len()),
            Some(json!({ "conflicts": conflicts_json(&conflicts) })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE meetings
         SET section_id = ?, school_year_id = ?, days_json = ?, start_time = ?, end_time = ?,
             room_id = ?, period_label = ?, updated_at = ?
         WHERE id = ? AND org_id = ?",
        (
            &input.section_id,
            &input.school_year_id,
            &days_to_json(&input.days),
            &input.start_time,
            &input.end_time,
            &input.room_id,
            &input.period_label,
            &now_iso(),
            &meeting_id,
            &ctx.org_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "meetingId": meeting_id, "conflicts": conflicts_json(&conflicts) }),
    )
}

fn handle_meeting_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let meeting_id = match required_str(req, "meetingId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let changed = match conn.execute(
        "UPDATE meetings SET active = 0, archived_at = ?, updated_at = ? WHERE id = ? AND org_id = ?",
        (&now_iso(), &now_iso(), &meeting_id, &ctx.org_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "meeting not found", None);
    }
    ok(&req.id, json!({ "meetingId": meeting_id }))
}

fn handle_meeting_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        "SELECT id, days_json, start_time, end_time, room_id, period_label, active, archived_at
         FROM meetings WHERE section_id = ? AND org_id = ? ORDER BY start_time"
    } else {
        "SELECT id, days_json, start_time, end_time, room_id, period_label, active, archived_at
         FROM meetings WHERE section_id = ? AND org_id = ? AND active = 1 ORDER BY start_time"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&section_id, &ctx.org_id), |row| {
            let id: String = row.get(0)?;
            let days_raw: String = row.get(1)?;
            let start: String = row.get(2)?;
            let end: String = row.get(3)?;
            let room_id: Option<String> = row.get(4)?;
            let period_label: Option<String> = row.get(5)?;
            let active: i64 = row.get(6)?;
            let archived_at: Option<String> = row.get(7)?;
            Ok(json!({
                "meetingId": id,
                "days": days_from_json(&days_raw),
                "startTime": start,
                "endTime": end,
                "roomId": room_id,
                "periodLabel": period_label,
                "active": active != 0,
                "archivedAt": archived_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(meetings) => ok(&req.id, json!({ "meetings": meetings })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "meeting.checkConflicts" => Some(handle_check_conflicts(state, req)),
        "meeting.create" => Some(handle_meeting_create(state, req)),
        "meeting.update" => Some(handle_meeting_update(state, req)),
        "meeting.archive" => Some(handle_meeting_archive(state, req)),
        "meeting.list" => Some(handle_meeting_list(state, req)),
        _ => None,
    }
}
