mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{ctx, request_err, request_ok, setup_org, spawn_sidecar};

/// Draft scheme with WW/PT/QA components and one default profile holding
/// the given weights.
fn setup_scheme(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    org_id: &str,
    kind: &str,
    weights: serde_json::Value,
) -> (String, String) {
    let scheme_id = request_ok(
        stdin,
        reader,
        "s",
        "scheme.create",
        json!({ "ctx": ctx(org_id), "name": "Quarterly Grades", "kind": kind }),
    )["schemeId"]
        .as_str()
        .expect("schemeId")
        .to_string();
    for (id, code, label) in [
        ("cw", "WW", "Written Works"),
        ("cp", "PT", "Performance Tasks"),
        ("cq", "QA", "Quarterly Assessment"),
    ] {
        request_ok(
            stdin,
            reader,
            id,
            "component.add",
            json!({ "ctx": ctx(org_id), "schemeId": scheme_id, "code": code, "label": label }),
        );
    }
    let profile_id = request_ok(
        stdin,
        reader,
        "p",
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
        json!({ "ctx": ctx(org_id), "schemeId": scheme_id, "profileId": profile_id, "weights": weights }),
    );
    (scheme_id, profile_id)
}

#[test]
fn publish_enforces_the_weight_sum_invariant() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org = setup_org(&mut stdin, &mut reader, "campusd-weights");
    let (scheme_id, profile_id) = setup_scheme(
        &mut stdin,
        &mut reader,
        &org,
        "generic",
        json!({ "WW": 30.0, "PT": 50.0, "QA": 20.02 }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "p1",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "weights_not_100");

    request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "profile.setWeights",
        json!({
            "ctx": ctx(&org),
            "schemeId": scheme_id,
            "profileId": profile_id,
            "weights": { "WW": 30.0, "PT": 50.0, "QA": 19.5 }
        }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "p3",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "weights_not_100");

    request_ok(
        &mut stdin,
        &mut reader,
        "p4",
        "profile.setWeights",
        json!({
            "ctx": ctx(&org),
            "schemeId": scheme_id,
            "profileId": profile_id,
            "weights": { "WW": 30.0, "PT": 50.0, "QA": 20.0 }
        }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "p5",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(result["status"], "published");

    let _ = child.kill();
}

#[test]
fn published_schemes_reject_structural_edits() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org = setup_org(&mut stdin, &mut reader, "campusd-frozen");
    let (scheme_id, profile_id) = setup_scheme(
        &mut stdin,
        &mut reader,
        &org,
        "generic",
        json!({ "WW": 30.0, "PT": 50.0, "QA": 20.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "p",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e1",
        "component.add",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id, "code": "HW", "label": "Homework" }),
    );
    assert_eq!(error["code"], "scheme_published");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e2",
        "profile.setWeights",
        json!({
            "ctx": ctx(&org),
            "schemeId": scheme_id,
            "profileId": profile_id,
            "weights": { "WW": 100.0 }
        }),
    );
    assert_eq!(error["code"], "scheme_published");

    let _ = child.kill();
}

#[test]
fn scheme_without_default_profile_cannot_publish() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org = setup_org(&mut stdin, &mut reader, "campusd-nodefault");
    let scheme_id = request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "scheme.create",
        json!({ "ctx": ctx(&org), "name": "Sparse", "kind": "generic" }),
    )["schemeId"]
        .as_str()
        .expect("schemeId")
        .to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "p",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "no_default_profile");

    let _ = child.kill();
}

#[test]
fn k12_publish_requires_a_published_transmutation_table() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org = setup_org(&mut stdin, &mut reader, "campusd-k12");
    let (scheme_id, _) = setup_scheme(
        &mut stdin,
        &mut reader,
        &org,
        "k12",
        json!({ "WW": 30.0, "PT": 50.0, "QA": 20.0 }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "p1",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "missing_transmutation_table");

    let table_id = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "transmutation.create",
        json!({ "ctx": ctx(&org), "name": "Standard 75-100" }),
    )["tableId"]
        .as_str()
        .expect("tableId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "scheme.attachTable",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id, "tableId": table_id }),
    );

    // Attached but still draft: publish keeps failing.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "p2",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(error["code"], "missing_transmutation_table");

    request_ok(
        &mut stdin,
        &mut reader,
        "t3",
        "transmutation.generateStandard",
        json!({ "ctx": ctx(&org), "tableId": table_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "t4",
        "transmutation.publish",
        json!({ "ctx": ctx(&org), "tableId": table_id }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    assert_eq!(result["status"], "published");

    // Table rows are frozen once published.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "t5",
        "transmutation.setRows",
        json!({
            "ctx": ctx(&org),
            "tableId": table_id,
            "rows": [{ "inputGrade": 0.0, "outputGrade": 60.0 }]
        }),
    );
    assert_eq!(error["code"], "table_published");

    let _ = child.kill();
}

#[test]
fn new_version_clones_a_published_scheme_into_an_editable_draft() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let org = setup_org(&mut stdin, &mut reader, "campusd-version");
    let (scheme_id, _) = setup_scheme(
        &mut stdin,
        &mut reader,
        &org,
        "generic",
        json!({ "WW": 30.0, "PT": 50.0, "QA": 20.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "p",
        "scheme.publish",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "scheme.newVersion",
        json!({ "ctx": ctx(&org), "schemeId": scheme_id }),
    );
    let new_id = result["schemeId"].as_str().expect("schemeId").to_string();
    assert_ne!(new_id, scheme_id);
    assert_eq!(result["version"], 2);
    assert_eq!(result["status"], "draft");

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "scheme.get",
        json!({ "ctx": ctx(&org), "schemeId": new_id }),
    );
    assert_eq!(detail["components"].as_array().expect("components").len(), 3);
    let profiles = detail["profiles"].as_array().expect("profiles");
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["weightSum"].as_f64().expect("sum"), 100.0);

    // The clone is a draft, so edits are allowed again.
    request_ok(
        &mut stdin,
        &mut reader,
        "v3",
        "component.add",
        json!({ "ctx": ctx(&org), "schemeId": new_id, "code": "HW", "label": "Homework" }),
    );

    let _ = child.kill();
}
