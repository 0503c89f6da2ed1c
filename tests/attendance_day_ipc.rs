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

fn statuses(sheet: &serde_json::Value) -> Vec<String> {
    sheet
        .get("marks")
        .and_then(|v| v.as_array())
        .expect("sheet marks")
        .iter()
        .map(|m| {
            m.get("status")
                .and_then(|v| v.as_str())
                .expect("mark status")
                .to_string()
        })
        .collect()
}

#[test]
fn roll_call_lifecycle_from_open_to_lock_and_reset() {
    let workspace = temp_dir("schooldesk-attendance-day");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let date = "2025-06-10";

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Class 5", "section": "A" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();

    let mut student_ids = Vec::new();
    for (i, name) in ["Asha", "Bilal", "Chitra"].iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("adm-{}", i),
            "students.admit",
            json!({ "classId": class_id, "firstName": name }),
        );
        assert_eq!(
            res.get("rollNo").and_then(|v| v.as_i64()),
            Some(i as i64 + 1)
        );
        student_ids.push(
            res.get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }

    // A never-recorded day opens as a fresh all-Absent sheet.
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(opened.get("stored").and_then(|v| v.as_bool()), Some(false));
    let sheet = opened.get("sheet").expect("sheet");
    assert_eq!(sheet.get("locked").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(statuses(sheet), vec!["A", "A", "A"]);
    let summary = opened.get("summary").expect("summary");
    assert_eq!(summary.get("marked").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(summary.get("absent").and_then(|v| v.as_u64()), Some(3));

    // Roll-call entry: junk tokens and 0 are dropped.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.markPresentRolls",
        json!({ "classId": class_id, "date": date, "rolls": " 1,, 3 , x, 0 " }),
    );
    assert_eq!(
        marked.get("presentRolls").cloned(),
        Some(json!([1, 3])),
    );
    assert_eq!(statuses(marked.get("sheet").expect("sheet")), vec!["P", "A", "P"]);

    let toggled = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.toggle",
        json!({ "classId": class_id, "date": date, "studentId": student_ids[1] }),
    );
    assert_eq!(statuses(toggled.get("sheet").expect("sheet")), vec!["P", "P", "P"]);

    let half = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.setStatus",
        json!({ "classId": class_id, "date": date, "studentId": student_ids[0], "status": "H" }),
    );
    assert_eq!(statuses(half.get("sheet").expect("sheet")), vec!["H", "P", "P"]);
    let medical = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.setStatus",
        json!({ "classId": class_id, "date": date, "studentId": student_ids[2], "status": "m" }),
    );
    let summary = medical.get("summary").expect("summary");
    assert_eq!(summary.get("present").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("halfDay").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.get("medical").and_then(|v| v.as_u64()), Some(1));
    // (1 + 0.5) of 2 counted students; medical is excused.
    assert_eq!(
        summary.get("presentPercent").and_then(|v| v.as_f64()),
        Some(75.0)
    );

    let bad_status = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.setStatus",
        json!({ "classId": class_id, "date": date, "studentId": student_ids[0], "status": "L" }),
    );
    assert_eq!(
        bad_status.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let locked = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.lockDay",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(
        locked
            .get("sheet")
            .and_then(|s| s.get("locked"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    // Every mutator refuses a sealed day.
    for (id, method, params) in [
        (
            "10",
            "attendance.setStatus",
            json!({ "classId": class_id, "date": date, "studentId": student_ids[0], "status": "P" }),
        ),
        (
            "11",
            "attendance.toggle",
            json!({ "classId": class_id, "date": date, "studentId": student_ids[0] }),
        ),
        (
            "12",
            "attendance.markPresentRolls",
            json!({ "classId": class_id, "date": date, "rolls": "1,2,3" }),
        ),
    ] {
        let error = request_err(&mut stdin, &mut reader, id, method, params);
        assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("day_locked"));
        assert_eq!(
            error
                .get("details")
                .and_then(|d| d.get("reason"))
                .and_then(|v| v.as_str()),
            Some("locked")
        );
    }

    // Locking again is a no-op, not an error.
    let relocked = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.lockDay",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(
        statuses(relocked.get("sheet").expect("sheet")),
        vec!["H", "P", "M"]
    );

    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(reopened.get("stored").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        statuses(reopened.get("sheet").expect("sheet")),
        vec!["H", "P", "M"]
    );

    let month = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.monthSummary",
        json!({ "classId": class_id, "month": "2025-06" }),
    );
    let days = month.get("days").and_then(|v| v.as_array()).expect("days");
    assert_eq!(days.len(), 1);
    assert_eq!(
        days[0].get("locked").and_then(|v| v.as_bool()),
        Some(true)
    );
    let students = month
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 3);
    // Roll 1 took a half day: 0.5 of 1 counted day, under the 75% default.
    assert_eq!(
        students[0].get("presentPercent").and_then(|v| v.as_f64()),
        Some(50.0)
    );
    assert_eq!(
        students[0].get("belowWarning").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        students[1].get("belowWarning").and_then(|v| v.as_bool()),
        Some(false)
    );
    // Roll 3 was on medical leave all month: no counted days, no warning.
    assert_eq!(
        students[2].get("presentPercent").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        students[2].get("belowWarning").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Reset discards the record entirely; the next open starts fresh.
    let reset = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.resetDay",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(reset.get("existed").and_then(|v| v.as_bool()), Some(true));

    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(fresh.get("stored").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(statuses(fresh.get("sheet").expect("sheet")), vec!["A", "A", "A"]);

    let reset_again = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.resetDay",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(
        reset_again.get("existed").and_then(|v| v.as_bool()),
        Some(false)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn open_sheet_picks_up_late_admissions_but_locked_sheet_is_frozen() {
    let workspace = temp_dir("schooldesk-attendance-roster");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let date = "2025-07-01";

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Class 6" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.admit",
        json!({ "classId": class_id, "firstName": "Devi" }),
    );
    let first_id = first
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // Store the day with a single mark.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.setStatus",
        json!({ "classId": class_id, "date": date, "studentId": first_id, "status": "P" }),
    );

    // A student admitted after the sheet was stored joins the open sheet
    // as Absent.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.admit",
        json!({ "classId": class_id, "firstName": "Esha" }),
    );
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(statuses(reopened.get("sheet").expect("sheet")), vec!["P", "A"]);

    // After lock, the sheet is history: a third admission does not appear.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.lockDay",
        json!({ "classId": class_id, "date": date }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.admit",
        json!({ "classId": class_id, "firstName": "Farid" }),
    );
    let frozen = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.sheetOpen",
        json!({ "classId": class_id, "date": date }),
    );
    assert_eq!(
        frozen
            .get("sheet")
            .and_then(|s| s.get("marks"))
            .and_then(|v| v.as_array())
            .map(|m| m.len()),
        Some(2)
    );
    // The roster listing still shows all three for the picker.
    assert_eq!(
        frozen
            .get("students")
            .and_then(|v| v.as_array())
            .map(|s| s.len()),
        Some(3)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn open_sheet_tracks_renumbered_rolls_for_roll_call() {
    let workspace = temp_dir("schooldesk-attendance-renumber");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let date = "2025-07-02";

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Class 7" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();

    // Admission rolls came in with gaps.
    for (i, (name, roll)) in [("Gauri", 10), ("Harsh", 20), ("Indu", 30)]
        .iter()
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("adm-{}", i),
            "students.admit",
            json!({ "classId": class_id, "firstName": name, "rollNo": roll }),
        );
    }

    // Store the day, then compact the rolls to 1..3.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.markPresentRolls",
        json!({ "classId": class_id, "date": date, "rolls": "10" }),
    );
    let renumbered = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.renumberRolls",
        json!({ "classId": class_id }),
    );
    assert_eq!(renumbered.get("assigned").and_then(|v| v.as_u64()), Some(3));

    // Roll call against the new numbering hits the right student.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.markPresentRolls",
        json!({ "classId": class_id, "date": date, "rolls": "2" }),
    );
    let sheet = marked.get("sheet").expect("sheet");
    assert_eq!(statuses(sheet), vec!["A", "P", "A"]);
    let rolls: Vec<u64> = sheet
        .get("marks")
        .and_then(|v| v.as_array())
        .expect("sheet marks")
        .iter()
        .map(|m| m.get("rollNo").and_then(|v| v.as_u64()).expect("rollNo"))
        .collect();
    assert_eq!(rolls, vec![1, 2, 3]);

    let _ = std::fs::remove_dir_all(workspace);
}
