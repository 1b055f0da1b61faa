mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{ctx, request_err, request_ok, setup_org, spawn_sidecar};

struct Classroom {
    org_id: String,
    section_id: String,
}

fn setup_classroom(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> Classroom {
    let org_id = setup_org(stdin, reader, prefix);
    let year_id = request_ok(
        stdin,
        reader,
        "y",
        "schoolYear.create",
        json!({ "ctx": ctx(&org_id), "label": "2026-2027" }),
    )["schoolYearId"]
        .as_str()
        .expect("schoolYearId")
        .to_string();
    let section_id = request_ok(
        stdin,
        reader,
        "sec",
        "section.create",
        json!({ "ctx": ctx(&org_id), "schoolYearId": year_id, "code": "FIL-9A", "title": "Filipino 9A" }),
    )["sectionId"]
        .as_str()
        .expect("sectionId")
        .to_string();
    let student_id = request_ok(
        stdin,
        reader,
        "st",
        "student.create",
        json!({ "ctx": ctx(&org_id), "lastName": "Lim", "firstName": "Paolo" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    request_ok(
        stdin,
        reader,
        "en",
        "section.enroll",
        json!({ "ctx": ctx(&org_id), "sectionId": section_id, "studentId": student_id }),
    );
    Classroom { org_id, section_id }
}

/// Published k12 scheme (single WW component at 100) attached to the
/// given published table, plus one graded item scoring `raw` out of 100.
fn publish_k12_with_score(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    room: &Classroom,
    table_id: &str,
    raw: f64,
) -> String {
    let org_id = &room.org_id;
    let scheme_id = request_ok(
        stdin,
        reader,
        "sch",
        "scheme.create",
        json!({ "ctx": ctx(org_id), "name": "K12 Grades", "kind": "k12" }),
    )["schemeId"]
        .as_str()
        .expect("schemeId")
        .to_string();
    request_ok(
        stdin,
        reader,
        "c1",
        "component.add",
        json!({ "ctx": ctx(org_id), "schemeId": scheme_id, "code": "WW", "label": "Written Works" }),
    );
    let profile_id = request_ok(
        stdin,
        reader,
        "pr",
        "profile.create",
        json!({ "ctx": ctx(org_id), "schemeId": scheme_id, "name": "default", "isDefault": true }),
    )["profileId"]
        .as_str()
        .expect("profileId")
        .to_string();
    request_ok(
        stdin,
        reader,
        "pw",
        "profile.setWeights",
        json!({
            "ctx": ctx(org_id),
            "schemeId": scheme_id,
            "profileId": profile_id,
            "weights": { "WW": 100.0 }
        }),
    );
    request_ok(
        stdin,
        reader,
        "at",
        "scheme.attachTable",
        json!({ "ctx": ctx(org_id), "schemeId": scheme_id, "tableId": table_id }),
    );
    request_ok(
        stdin,
        reader,
        "pub",
        "scheme.publish",
        json!({ "ctx": ctx(org_id), "schemeId": scheme_id }),
    );

    let item_id = request_ok(
        stdin,
        reader,
        "it",
        "item.create",
        json!({
            "ctx": ctx(org_id),
            "sectionId": room.section_id,
            "term": 1,
            "componentCode": "WW",
            "title": "Long quiz",
            "maxPoints": 100.0
        }),
    )["itemId"]
        .as_str()
        .expect("itemId")
        .to_string();
    let students = request_ok(
        stdin,
        reader,
        "ls",
        "section.listStudents",
        json!({ "ctx": ctx(org_id), "sectionId": room.section_id }),
    );
    let student_id = students["students"].as_array().expect("students")[0]["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    request_ok(
        stdin,
        reader,
        "sc",
        "score.set",
        json!({
            "ctx": ctx(org_id),
            "itemId": item_id,
            "scores": [{ "studentId": student_id, "status": "present", "score": raw }]
        }),
    );
    scheme_id
}

fn published_table(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    org_id: &str,
    policy: Option<&str>,
    rows: serde_json::Value,
) -> String {
    let mut params = json!({ "ctx": ctx(org_id), "name": "Custom Table" });
    if let Some(p) = policy {
        params["belowRangePolicy"] = json!(p);
    }
    let table_id = request_ok(stdin, reader, "tc", "transmutation.create", params)["tableId"]
        .as_str()
        .expect("tableId")
        .to_string();
    request_ok(
        stdin,
        reader,
        "tr",
        "transmutation.setRows",
        json!({ "ctx": ctx(org_id), "tableId": table_id, "rows": rows }),
    );
    request_ok(
        stdin,
        reader,
        "tp",
        "transmutation.publish",
        json!({ "ctx": ctx(org_id), "tableId": table_id }),
    );
    table_id
}

const CUSTOM_ROWS: &str = r#"[
    { "inputGrade": 75.0, "outputGrade": 80.0 },
    { "inputGrade": 80.0, "outputGrade": 85.0 },
    { "inputGrade": 85.0, "outputGrade": 90.0 }
]"#;

fn custom_rows() -> serde_json::Value {
    serde_json::from_str(CUSTOM_ROWS).expect("rows json")
}

#[test]
fn lookup_matches_the_closest_lower_bound() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let room = setup_classroom(&mut stdin, &mut reader, "campusd-lowerbound");
    let table_id = published_table(&mut stdin, &mut reader, &room.org_id, None, custom_rows());
    let scheme_id = publish_k12_with_score(&mut stdin, &mut reader, &room, &table_id, 83.0);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "run",
        "compute.run",
        json!({ "ctx": ctx(&room.org_id), "sectionId": room.section_id, "term": 1, "schemeId": scheme_id }),
    );
    assert_eq!(run["status"], "completed");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "lg",
        "compute.listGrades",
        json!({ "ctx": ctx(&room.org_id), "runId": run["runId"].as_str().expect("runId") }),
    );
    let row = &grades["grades"].as_array().expect("grades")[0];
    assert!((row["initialGrade"].as_f64().expect("initial") - 83.0).abs() < 1e-9);
    assert_eq!(row["transmutedGrade"].as_f64(), Some(85.0));
    assert_eq!(row["finalGrade"].as_f64(), Some(85.0));
    assert_eq!(row["breakdown"]["matchedTableKey"].as_f64(), Some(80.0));

    let _ = child.kill();
}

#[test]
fn below_range_fails_the_run_under_the_default_policy() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let room = setup_classroom(&mut stdin, &mut reader, "campusd-belowfail");
    let table_id = published_table(&mut stdin, &mut reader, &room.org_id, None, custom_rows());
    let scheme_id = publish_k12_with_score(&mut stdin, &mut reader, &room, &table_id, 15.0);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "run",
        "compute.run",
        json!({ "ctx": ctx(&room.org_id), "sectionId": room.section_id, "term": 1, "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "below_table_range");

    let run_id = error["details"]["runId"].as_str().expect("runId").to_string();
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "compute.get",
        json!({ "ctx": ctx(&room.org_id), "runId": run_id }),
    );
    assert_eq!(detail["status"], "failed");

    let _ = child.kill();
}

#[test]
fn pass_through_policy_keeps_the_raw_grade() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let room = setup_classroom(&mut stdin, &mut reader, "campusd-passthrough");
    let table_id = published_table(
        &mut stdin,
        &mut reader,
        &room.org_id,
        Some("pass_through"),
        custom_rows(),
    );
    let scheme_id = publish_k12_with_score(&mut stdin, &mut reader, &room, &table_id, 15.0);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "run",
        "compute.run",
        json!({ "ctx": ctx(&room.org_id), "sectionId": room.section_id, "term": 1, "schemeId": scheme_id }),
    );
    assert_eq!(run["status"], "completed");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "lg",
        "compute.listGrades",
        json!({ "ctx": ctx(&room.org_id), "runId": run["runId"].as_str().expect("runId") }),
    );
    let row = &grades["grades"].as_array().expect("grades")[0];
    assert!(row["transmutedGrade"].is_null());
    assert_eq!(row["finalGrade"].as_f64(), Some(15.0));

    let _ = child.kill();
}

#[test]
fn generate_standard_produces_the_full_band() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org_id = setup_org(&mut stdin, &mut reader, "campusd-standard");

    let table_id = request_ok(
        &mut stdin,
        &mut reader,
        "tc",
        "transmutation.create",
        json!({ "ctx": ctx(&org_id), "name": "Standard 75-100" }),
    )["tableId"]
        .as_str()
        .expect("tableId")
        .to_string();
    let gen = request_ok(
        &mut stdin,
        &mut reader,
        "tg",
        "transmutation.generateStandard",
        json!({ "ctx": ctx(&org_id), "tableId": table_id }),
    );
    assert_eq!(gen["rowCount"], 26);

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "td",
        "transmutation.get",
        json!({ "ctx": ctx(&org_id), "tableId": table_id }),
    );
    let rows = detail["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 26);
    let at = |input: f64| {
        rows.iter()
            .find(|r| r["inputGrade"].as_f64() == Some(input))
            .and_then(|r| r["outputGrade"].as_f64())
    };
    assert_eq!(at(75.0), Some(80.0));
    assert_eq!(at(82.0), Some(87.0));
    assert_eq!(at(96.0), Some(100.0));
    assert_eq!(at(100.0), Some(100.0));

    let _ = child.kill();
}

#[test]
fn standard_table_lifts_an_82_to_87() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let room = setup_classroom(&mut stdin, &mut reader, "campusd-dep82");

    let table_id = request_ok(
        &mut stdin,
        &mut reader,
        "tc",
        "transmutation.create",
        json!({ "ctx": ctx(&room.org_id), "name": "Standard 75-100" }),
    )["tableId"]
        .as_str()
        .expect("tableId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "tg",
        "transmutation.generateStandard",
        json!({ "ctx": ctx(&room.org_id), "tableId": table_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "tp",
        "transmutation.publish",
        json!({ "ctx": ctx(&room.org_id), "tableId": table_id }),
    );
    let scheme_id = publish_k12_with_score(&mut stdin, &mut reader, &room, &table_id, 82.0);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "run",
        "compute.run",
        json!({ "ctx": ctx(&room.org_id), "sectionId": room.section_id, "term": 1, "schemeId": scheme_id }),
    );
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "lg",
        "compute.listGrades",
        json!({ "ctx": ctx(&room.org_id), "runId": run["runId"].as_str().expect("runId") }),
    );
    let row = &grades["grades"].as_array().expect("grades")[0];
    assert!((row["initialGrade"].as_f64().expect("initial") - 82.0).abs() < 1e-9);
    assert_eq!(row["breakdown"]["matchedTableKey"].as_f64(), Some(82.0));
    assert_eq!(row["finalGrade"].as_f64(), Some(87.0));

    let _ = child.kill();
}
