use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schooldeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schooldeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn raw_request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = raw_request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = raw_request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded",
        method
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn write_export(dir: &std::path::Path) -> PathBuf {
    let export = json!({
        "app": "schooldesk-dashboard",
        "classes": [
            { "id": "c5a", "name": "Class 5", "section": "A", "classTeacherId": "t-9" }
        ],
        "students": [
            {
                "id": "s1", "classId": "c5a", "firstName": "Asha", "lastName": "Rao",
                "admissionNo": "ADM-101", "rollNo": 1, "pincode": "560034",
                "admittedOn": "10/06/2025"
            },
            {
                "id": "s2", "classId": "c5a", "firstName": "Bilal", "lastName": "Khan",
                "rollNo": 2
            },
            { "id": "s9", "classId": "missing-class", "firstName": "Orphan" }
        ],
        "classFees": [
            {
                "classId": "c5a",
                "heads": [
                    { "name": "Tuition", "amount": 1200.0 },
                    { "name": "Exam", "amount": 300.0 }
                ]
            }
        ],
        "feePayments": [
            { "classId": "c5a", "studentId": "s1", "amount": 500.0, "paidOn": "2025-07-01" },
            { "classId": "c5a", "studentId": "s9", "amount": 100.0, "paidOn": "2025-07-01" }
        ],
        "attendance": [
            {
                "classId": "c5a", "date": "2025-07-01", "classTeacherId": "t-9", "locked": true,
                "marks": [
                    { "studentId": "s1", "rollNo": 1, "status": "P" },
                    { "studentId": "s2", "rollNo": 2, "status": "A" }
                ]
            }
        ],
        "transportRoutes": [
            {
                "id": "r1", "name": "North Loop", "vehicleNo": "KA-05-1234",
                "stops": [ { "name": "Temple Gate", "monthlyFee": 300.0 } ]
            }
        ],
        "transportAssignments": [
            { "studentId": "s1", "routeId": "r1", "stopName": "Temple Gate" }
        ],
        "notices": [
            { "title": "Reopening day", "body": "School reopens June 10th", "postedOn": "2025-06-01" }
        ],
        "settings": {
            "school": { "name": "Green Valley Public School" }
        }
    });
    let path = dir.join("dashboard-export.json");
    std::fs::write(&path, serde_json::to_string_pretty(&export).expect("serialize"))
        .expect("write export file");
    path
}

#[test]
fn dashboard_export_lands_in_every_table() {
    let workspace = temp_dir("schooldesk-import-dash");
    let export_path = write_export(&workspace);
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.importDashboard",
        json!({ "exportPath": export_path.to_string_lossy() }),
    );

    assert_eq!(summary.get("classesImported").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("studentsImported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("feeHeadsImported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("paymentsImported").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        summary.get("attendanceDaysImported").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(summary.get("marksImported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("routesImported").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        summary.get("assignmentsImported").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(summary.get("noticesImported").and_then(|v| v.as_u64()), Some(1));
    // The orphan student and their payment were dropped, not imported.
    let skipped = summary.get("skipped").expect("skipped counts");
    assert_eq!(skipped.get("students").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(skipped.get("payments").and_then(|v| v.as_u64()), Some(1));

    // Classes and students came through with fresh ids.
    let classes = request_ok(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    let class_row = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .and_then(|c| c.first())
        .expect("imported class");
    assert_eq!(class_row.get("name").and_then(|v| v.as_str()), Some("Class 5"));
    assert_eq!(class_row.get("studentCount").and_then(|v| v.as_i64()), Some(2));
    let class_id = class_row
        .get("id")
        .and_then(|v| v.as_str())
        .expect("class id")
        .to_string();

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "classId": class_id }),
    );
    let asha = students
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|s| s.first())
        .expect("first student");
    assert_eq!(asha.get("firstName").and_then(|v| v.as_str()), Some("Asha"));
    // The DD/MM/YYYY admission date was normalized on the way in, and the
    // PIN filled in the district.
    assert_eq!(
        asha.get("admittedOn").and_then(|v| v.as_str()),
        Some("2025-06-10")
    );
    assert_eq!(
        asha.get("district").and_then(|v| v.as_str()),
        Some("Bengaluru")
    );
    let asha_id = asha
        .get("id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();

    // The imported roll call is sealed: it reads back as stored and
    // refuses edits.
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": "2025-07-01" }),
    );
    assert_eq!(
        sheet
            .get("sheet")
            .and_then(|s| s.get("locked"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        sheet
            .get("summary")
            .and_then(|s| s.get("present"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );
    let refused = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.toggle",
        json!({ "classId": class_id, "date": "2025-07-01", "studentId": asha_id }),
    );
    assert_eq!(refused.get("code").and_then(|v| v.as_str()), Some("day_locked"));

    // Asha's ledger covers the plan, her bus stop, and the payment.
    // April session start (default) and an August as-of date bill 5 months.
    let ledger = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.ledger",
        json!({ "studentId": asha_id, "asOf": "2025-08-15" }),
    );
    assert_eq!(ledger.get("planTotal").and_then(|v| v.as_f64()), Some(1500.0));
    assert_eq!(
        ledger.get("transportMonthly").and_then(|v| v.as_f64()),
        Some(300.0)
    );
    assert_eq!(ledger.get("monthsBilled").and_then(|v| v.as_u64()), Some(5));
    let totals = ledger.get("totals").expect("totals");
    assert_eq!(totals.get("charged").and_then(|v| v.as_f64()), Some(3000.0));
    assert_eq!(totals.get("paid").and_then(|v| v.as_f64()), Some(500.0));
    assert_eq!(totals.get("balance").and_then(|v| v.as_f64()), Some(2500.0));

    let routes = request_ok(&mut stdin, &mut reader, "8", "transport.routesList", json!({}));
    let route = routes
        .get("routes")
        .and_then(|v| v.as_array())
        .and_then(|r| r.first())
        .expect("imported route");
    assert_eq!(route.get("name").and_then(|v| v.as_str()), Some("North Loop"));
    assert_eq!(route.get("riderCount").and_then(|v| v.as_i64()), Some(1));

    let setup = request_ok(&mut stdin, &mut reader, "9", "setup.get", json!({}));
    assert_eq!(
        setup
            .get("school")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("Green Valley Public School")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unreadable_or_foreign_files_are_rejected() {
    let workspace = temp_dir("schooldesk-import-reject");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.importDashboard",
        json!({ "exportPath": workspace.join("nope.json").to_string_lossy() }),
    );
    assert_eq!(
        missing.get("code").and_then(|v| v.as_str()),
        Some("import_read_failed")
    );

    let foreign = workspace.join("foreign.json");
    std::fs::write(&foreign, r#"{ "totallyUnrelated": true }"#).expect("write foreign file");
    let rejected = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.importDashboard",
        json!({ "exportPath": foreign.to_string_lossy() }),
    );
    assert_eq!(
        rejected.get("code").and_then(|v| v.as_str()),
        Some("import_parse_failed")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
