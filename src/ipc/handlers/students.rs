use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::pincode;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn db_failed(code: &'static str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_failed("db_query_failed", e))
}

fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

/// District/state autofill for an admission form. Empty pin clears both;
/// a pin outside the directory keeps the pin and leaves them null.
fn resolve_pin(raw: &str) -> Result<(Option<String>, Option<String>, Option<String>), HandlerErr> {
    let t = raw.trim();
    if t.is_empty() {
        return Ok((None, None, None));
    }
    if !pincode::is_valid_pin(t) {
        return Err(bad_params("pincode must be a 6-digit PIN"));
    }
    let area = pincode::lookup(t);
    Ok((
        Some(t.to_string()),
        area.as_ref().map(|a| a.district.clone()),
        area.map(|a| a.state),
    ))
}

fn parse_admitted_on(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| bad_params("admittedOn must be YYYY-MM-DD"))
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let id: String = r.get("id")?;
    let class_id: String = r.get("class_id")?;
    let admission_no: Option<String> = r.get("admission_no")?;
    let roll_no: i64 = r.get("roll_no")?;
    let first_name: String = r.get("first_name")?;
    let last_name: String = r.get("last_name")?;
    let guardian_name: Option<String> = r.get("guardian_name")?;
    let phone: Option<String> = r.get("phone")?;
    let address_line: Option<String> = r.get("address_line")?;
    let pin: Option<String> = r.get("pincode")?;
    let district: Option<String> = r.get("district")?;
    let state: Option<String> = r.get("state")?;
    let admitted_on: Option<String> = r.get("admitted_on")?;
    let active: i64 = r.get("active")?;
    Ok(json!({
        "id": id,
        "classId": class_id,
        "admissionNo": admission_no,
        "rollNo": roll_no,
        "firstName": first_name,
        "lastName": last_name,
        "guardianName": guardian_name,
        "phone": phone,
        "addressLine": address_line,
        "pincode": pin,
        "district": district,
        "state": state,
        "admittedOn": admitted_on,
        "active": active != 0
    }))
}

const STUDENT_COLUMNS: &str = "id, class_id, admission_no, roll_no, first_name, last_name,
     guardian_name, phone, address_line, pincode, district, state,
     admitted_on, active, sort_order";

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let sql = format!(
        "SELECT {} FROM students WHERE class_id = ?{} ORDER BY roll_no, sort_order, last_name, first_name",
        STUDENT_COLUMNS,
        if include_inactive { "" } else { " AND active = 1" }
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| db_failed("db_query_failed", e))?;
    let students = stmt
        .query_map([&class_id], |r| student_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn next_admission_no(conn: &Connection) -> Result<String, HandlerErr> {
    // Numeric tail of the highest ADM-xxxx already issued; CAST of a
    // non-numeric tail is 0 in SQLite, which is what we want.
    let max: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(CAST(SUBSTR(admission_no, 5) AS INTEGER)), 0)
             FROM students WHERE admission_no LIKE 'ADM-%'",
            [],
            |r| r.get(0),
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    Ok(format!("ADM-{:04}", max + 1))
}

fn students_admit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if first_name.is_empty() {
        return Err(bad_params("firstName must not be empty"));
    }
    let last_name = params
        .get("lastName")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let guardian_name = params.get("guardianName").and_then(|v| v.as_str());
    let phone = params.get("phone").and_then(|v| v.as_str());
    let address_line = params.get("addressLine").and_then(|v| v.as_str());

    let (pin, district, state) =
        resolve_pin(params.get("pincode").and_then(|v| v.as_str()).unwrap_or(""))?;

    let admitted_on = match params.get("admittedOn").and_then(|v| v.as_str()) {
        Some(raw) => parse_admitted_on(raw)?,
        None => today(),
    };

    let admission_no = match params.get("admissionNo").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => next_admission_no(conn)?,
    };

    let roll_no: i64 = match params.get("rollNo").and_then(|v| v.as_u64()) {
        Some(n) => n as i64,
        None => conn
            .query_row(
                "SELECT COALESCE(MAX(roll_no), 0) + 1 FROM students WHERE class_id = ?",
                [&class_id],
                |r| r.get(0),
            )
            .map_err(|e| db_failed("db_query_failed", e))?,
    };
    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| db_failed("db_query_failed", e))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, class_id, admission_no, roll_no, first_name, last_name,
            guardian_name, phone, address_line, pincode, district, state,
            admitted_on, active, sort_order, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        rusqlite::params![
            &student_id,
            &class_id,
            &admission_no,
            roll_no,
            &first_name,
            &last_name,
            guardian_name.map(str::trim),
            phone.map(str::trim),
            address_line.map(str::trim),
            pin.as_deref(),
            district.as_deref(),
            state.as_deref(),
            &admitted_on,
            sort_order,
            today(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "admissionNo": admission_no,
        "rollNo": roll_no,
        "district": district,
        "state": state
    }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    let existing = conn
        .query_row(&sql, [&student_id], |r| student_row_json(r))
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    let Some(mut row) = existing else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    let obj = row.as_object_mut().ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: "student row did not map to an object".to_string(),
        details: None,
    })?;

    if let Some(v) = params.get("firstName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(bad_params("firstName must not be empty"));
        }
        obj.insert("firstName".into(), json!(v));
    }
    if let Some(v) = params.get("lastName").and_then(|v| v.as_str()) {
        obj.insert("lastName".into(), json!(v.trim()));
    }
    for (param, field) in [
        ("guardianName", "guardianName"),
        ("phone", "phone"),
        ("addressLine", "addressLine"),
        ("admissionNo", "admissionNo"),
    ] {
        if let Some(v) = params.get(param).and_then(|v| v.as_str()) {
            let t = v.trim();
            obj.insert(
                field.into(),
                if t.is_empty() { Value::Null } else { json!(t) },
            );
        }
    }
    if let Some(v) = params.get("pincode").and_then(|v| v.as_str()) {
        let (pin, district, state) = resolve_pin(v)?;
        obj.insert("pincode".into(), json!(pin));
        obj.insert("district".into(), json!(district));
        obj.insert("state".into(), json!(state));
    }
    if let Some(v) = params.get("admittedOn").and_then(|v| v.as_str()) {
        obj.insert("admittedOn".into(), json!(parse_admitted_on(v)?));
    }
    if let Some(v) = params.get("rollNo").and_then(|v| v.as_u64()) {
        obj.insert("rollNo".into(), json!(v));
    }
    if let Some(v) = params.get("active").and_then(|v| v.as_bool()) {
        obj.insert("active".into(), json!(v));
    }

    let as_str = |k: &str| obj.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());
    conn.execute(
        "UPDATE students SET
            admission_no = ?, roll_no = ?, first_name = ?, last_name = ?,
            guardian_name = ?, phone = ?, address_line = ?, pincode = ?,
            district = ?, state = ?, admitted_on = ?, active = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            as_str("admissionNo"),
            obj.get("rollNo").and_then(|v| v.as_i64()).unwrap_or(0),
            as_str("firstName"),
            as_str("lastName"),
            as_str("guardianName"),
            as_str("phone"),
            as_str("addressLine"),
            as_str("pincode"),
            as_str("district"),
            as_str("state"),
            as_str("admittedOn"),
            if obj.get("active").and_then(|v| v.as_bool()).unwrap_or(true) {
                1i64
            } else {
                0i64
            },
            today(),
            &student_id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "student": row }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    for (sql, table) in [
        (
            "DELETE FROM attendance_marks WHERE student_id = ?",
            "attendance_marks",
        ),
        (
            "DELETE FROM transport_assignments WHERE student_id = ?",
            "transport_assignments",
        ),
        (
            "DELETE FROM fee_payments WHERE student_id = ?",
            "fee_payments",
        ),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn students_renumber_rolls(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY roll_no, sort_order, last_name, first_name",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let ids: Vec<String> = stmt
        .query_map([&class_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    // Rolls are 1-based; students who have left the register drop to 0 so
    // the next renumber never resurrects their slot.
    tx.execute(
        "UPDATE students SET roll_no = 0 WHERE class_id = ? AND active = 0",
        [&class_id],
    )
    .map_err(|e| db_failed("db_update_failed", e))?;
    for (i, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE students SET roll_no = ?, updated_at = ? WHERE id = ?",
            rusqlite::params![(i + 1) as i64, today(), id],
        )
        .map_err(|e| db_failed("db_update_failed", e))?;
    }
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;
    Ok(json!({ "assigned": ids.len() }))
}

fn pincode_lookup(params: &Value) -> Result<Value, HandlerErr> {
    let pin = get_required_str(params, "pincode")?;
    let valid = pincode::is_valid_pin(&pin);
    let area = pincode::lookup(&pin);
    Ok(json!({
        "pincode": pin.trim(),
        "valid": valid,
        "district": area.as_ref().map(|a| a.district.clone()),
        "state": area.as_ref().map(|a| a.state.clone()),
        "region": pincode::postal_region(&pin)
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.admit" => Some(with_conn(state, req, students_admit)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        "students.renumberRolls" => Some(with_conn(state, req, students_renumber_rolls)),
        // Form-side helper; needs no workspace.
        "admissions.pincodeLookup" => Some(match pincode_lookup(&req.params) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        _ => None,
    }
}
