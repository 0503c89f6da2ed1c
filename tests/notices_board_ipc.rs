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

fn titles(listed: &serde_json::Value) -> Vec<String> {
    listed
        .get("notices")
        .and_then(|v| v.as_array())
        .expect("notices array")
        .iter()
        .filter_map(|n| n.get("title").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

#[test]
fn class_board_shows_its_own_posts_alongside_school_wide_ones() {
    let workspace = temp_dir("schooldesk-notices-board");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_5a = request_ok(
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
    let class_6b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Class 6", "section": "B" }),
    )
    .get("classId")
    .and_then(|v| v.as_str())
    .expect("classId")
    .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "notices.post",
        json!({
            "title": "Sports day",
            "body": "Ground at 9am",
            "postedOn": "2025-07-10"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "notices.post",
        json!({
            "title": "Unit test Friday",
            "body": "Maths, chapters 1-3",
            "audience": "class",
            "classId": class_5a,
            "postedOn": "2025-07-12"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "notices.post",
        json!({
            "title": "Science fair",
            "body": "Projects due",
            "audience": "class",
            "classId": class_6b,
            "postedOn": "2025-07-11"
        }),
    );

    // No filter: everything, newest first.
    let all = request_ok(&mut stdin, &mut reader, "7", "notices.list", json!({}));
    assert_eq!(
        titles(&all),
        vec!["Unit test Friday", "Science fair", "Sports day"]
    );

    // 5A's board: its own post plus the school-wide one, not 6B's.
    let board_5a = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "notices.list",
        json!({ "classId": class_5a }),
    );
    assert_eq!(titles(&board_5a), vec!["Unit test Friday", "Sports day"]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn posting_validates_audience_and_delete_is_final() {
    let workspace = temp_dir("schooldesk-notices-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_title = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "notices.post",
        json!({ "title": "  ", "body": "text" }),
    );
    assert_eq!(
        no_title.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let bad_audience = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "notices.post",
        json!({ "title": "T", "body": "B", "audience": "teachers" }),
    );
    assert_eq!(
        bad_audience.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let orphan_class = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "notices.post",
        json!({ "title": "T", "body": "B", "audience": "class", "classId": "ghost" }),
    );
    assert_eq!(
        orphan_class.get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let notice_id = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "notices.post",
        json!({ "title": "Fee reminder", "body": "Clear dues by the 15th" }),
    )
    .get("noticeId")
    .and_then(|v| v.as_str())
    .expect("noticeId")
    .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "notices.delete",
        json!({ "noticeId": notice_id }),
    );
    let again = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "notices.delete",
        json!({ "noticeId": notice_id }),
    );
    assert_eq!(again.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let listed = request_ok(&mut stdin, &mut reader, "8", "notices.list", json!({}));
    assert!(titles(&listed).is_empty());

    let _ = std::fs::remove_dir_all(workspace);
}
