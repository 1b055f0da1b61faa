use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_iso, optional_str, request_ctx, require_role, required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

const WRITE_ROLES: [&str; 2] = ["admin", "registrar"];

fn handle_org_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let org_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO orgs(id, name, created_at) VALUES(?, ?, ?)",
        (&org_id, &name, &now_iso()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "orgId": org_id }))
}

fn handle_school_year_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
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

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_years(id, org_id, label, start_date, end_date) VALUES(?, ?, ?, ?, ?)",
        (
            &year_id,
            &ctx.org_id,
            &label,
            &optional_str(req, "startDate"),
            &optional_str(req, "endDate"),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schoolYearId": year_id }))
}

fn handle_room_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let room_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO rooms(id, org_id, name) VALUES(?, ?, ?)",
        (&room_id, &ctx.org_id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "roomId": room_id }))
}

fn handle_staff_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let staff_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO staff(id, org_id, last_name, first_name, active) VALUES(?, ?, ?, ?, 1)",
        (&staff_id, &ctx.org_id, &last_name, &first_name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "staffId": staff_id }))
}

fn handle_section_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let school_year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM school_years WHERE id = ? AND org_id = ?",
        &[&school_year_id, &ctx.org_id],
        "school year",
    ) {
        return e;
    }

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, org_id, school_year_id, code, title) VALUES(?, ?, ?, ?, ?)",
        (&section_id, &ctx.org_id, &school_year_id, &code, &title),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_assign_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let staff_id = match required_str(req, "staffId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = optional_str(req, "teacherRole").unwrap_or_else(|| "primary".to_string());
    if role != "primary" && role != "co" {
        return err(&req.id, "bad_params", "teacherRole must be primary or co", None);
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
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM staff WHERE id = ? AND org_id = ?",
        &[&staff_id, &ctx.org_id],
        "staff member",
    ) {
        return e;
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teacher_assignments(id, org_id, section_id, staff_id, role)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(section_id, staff_id) DO UPDATE SET role = excluded.role",
        (&assignment_id, &ctx.org_id, &section_id, &staff_id, &role),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_list_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT ta.staff_id, s.last_name, s.first_name, ta.role
         FROM teacher_assignments ta
         JOIN staff s ON s.id = ta.staff_id
         WHERE ta.section_id = ? AND ta.org_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&section_id, &ctx.org_id), |row| {
            let staff_id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let role: String = row.get(3)?;
            Ok(json!({
                "staffId": staff_id,
                "displayName": format!("{}, {}", last, first),
                "role": role
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_student_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, org_id, last_name, first_name, active) VALUES(?, ?, ?, ?, 1)",
        (&student_id, &ctx.org_id, &last_name, &first_name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
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

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, org_id, section_id, student_id)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(section_id, student_id) DO NOTHING",
        (&enrollment_id, &ctx.org_id, &section_id, &student_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_list_students(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT st.id, st.last_name, st.first_name, st.active
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         WHERE e.section_id = ? AND e.org_id = ?
         ORDER BY st.last_name, st.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&section_id, &ctx.org_id), |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let active: i64 = row.get(3)?;
            Ok(json!({
                "studentId": id,
                "displayName": format!("{}, {}", last, first),
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "org.create" => Some(handle_org_create(state, req)),
        "schoolYear.create" => Some(handle_school_year_create(state, req)),
        "room.create" => Some(handle_room_create(state, req)),
        "staff.create" => Some(handle_staff_create(state, req)),
        "section.create" => Some(handle_section_create(state, req)),
        "section.assignTeacher" => Some(handle_assign_teacher(state, req)),
        "section.listTeachers" => Some(handle_list_teachers(state, req)),
        "student.create" => Some(handle_student_create(state, req)),
        "section.enroll" => Some(handle_enroll(state, req)),
        "section.listStudents" => Some(handle_list_students(state, req)),
        _ => None,
    }
}
