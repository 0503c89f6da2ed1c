use crate::attendance::Status;
use crate::db;
use crate::import;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::pincode;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
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

fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn handle_health(state: &mut AppState, req: &Request) -> Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

/// Track how many rows each section dropped because a reference could not
/// be resolved against what was imported before it.
#[derive(Default)]
struct SkipCounts {
    students: usize,
    fee_heads: usize,
    payments: usize,
    attendance_days: usize,
    marks: usize,
    assignments: usize,
}

fn import_dashboard(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let export_path = params
        .get("exportPath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing exportPath".to_string(),
            details: None,
        })?;

    let text = std::fs::read_to_string(&export_path).map_err(|e| HandlerErr {
        code: "import_read_failed",
        message: e.to_string(),
        details: Some(json!({ "exportPath": export_path.to_string_lossy() })),
    })?;
    let export = import::parse_dashboard_export(&text).map_err(|e| HandlerErr {
        code: "import_parse_failed",
        message: e.to_string(),
        details: Some(json!({ "exportPath": export_path.to_string_lossy() })),
    })?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let now_date = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
    let mut skipped = SkipCounts::default();

    // The old app keyed rows by whatever id it had, sometimes none. Every
    // imported row gets a fresh uuid; these maps carry old key -> new id.
    let mut class_ids: HashMap<String, String> = HashMap::new();
    for c in &export.classes {
        let new_id = Uuid::new_v4().to_string();
        let old_key = c.id.clone().unwrap_or_else(|| c.name.clone());
        tx.execute(
            "INSERT INTO classes(id, name, section, class_teacher_id) VALUES(?, ?, ?, ?)",
            (&new_id, &c.name, &c.section, &c.class_teacher_id),
        )
        .map_err(db_err("db_insert_failed"))?;
        class_ids.insert(old_key, new_id);
    }

    let mut student_ids: HashMap<String, String> = HashMap::new();
    let mut students_imported = 0usize;
    for (sort_order, s) in export.students.iter().enumerate() {
        let Some(class_id) = class_ids.get(&s.class_id) else {
            skipped.students += 1;
            continue;
        };
        let new_id = Uuid::new_v4().to_string();
        let pin = s.pincode.as_deref().unwrap_or("").trim().to_string();
        let area = pincode::lookup(&pin);
        let admitted_on = s
            .admitted_on
            .as_deref()
            .and_then(import::normalize_date);
        tx.execute(
            "INSERT INTO students(
                id, class_id, admission_no, roll_no, first_name, last_name,
                guardian_name, phone, address_line, pincode, district, state,
                admitted_on, active, sort_order, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &new_id,
                class_id,
                s.admission_no.as_deref(),
                s.roll_no as i64,
                &s.first_name,
                &s.last_name,
                s.guardian_name.as_deref(),
                s.phone.as_deref(),
                s.address_line.as_deref(),
                if pin.is_empty() { None } else { Some(pin.as_str()) },
                area.as_ref().map(|a| a.district.as_str()),
                area.as_ref().map(|a| a.state.as_str()),
                admitted_on.as_deref(),
                if s.active { 1i64 } else { 0i64 },
                sort_order as i64,
                &now_date,
            ],
        )
        .map_err(db_err("db_insert_failed"))?;
        if let Some(old_id) = &s.id {
            student_ids.insert(old_id.clone(), new_id);
        }
        students_imported += 1;
    }

    let mut fee_heads_imported = 0usize;
    for plan in &export.class_fees {
        let Some(class_id) = class_ids.get(&plan.class_id) else {
            skipped.fee_heads += plan.heads.len();
            continue;
        };
        for (sort_order, h) in plan.heads.iter().enumerate() {
            tx.execute(
                "INSERT INTO fee_heads(id, class_id, name, amount, sort_order) VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    class_id,
                    &h.name,
                    h.amount,
                    sort_order as i64,
                ),
            )
            .map_err(db_err("db_insert_failed"))?;
            fee_heads_imported += 1;
        }
    }

    let mut next_receipt: i64 = tx
        .query_row("SELECT COALESCE(MAX(receipt_no), 0) FROM fee_payments", [], |r| {
            r.get(0)
        })
        .map_err(db_err("db_query_failed"))?;
    let mut payments_imported = 0usize;
    for p in &export.fee_payments {
        let (Some(class_id), Some(student_id)) =
            (class_ids.get(&p.class_id), student_ids.get(&p.student_id))
        else {
            skipped.payments += 1;
            continue;
        };
        let Some(paid_on) = p.paid_on.as_deref().and_then(import::normalize_date) else {
            skipped.payments += 1;
            continue;
        };
        let receipt_no = match p.receipt_no {
            Some(n) if n > 0 => {
                next_receipt = next_receipt.max(n);
                n
            }
            _ => {
                next_receipt += 1;
                next_receipt
            }
        };
        tx.execute(
            "INSERT INTO fee_payments(id, class_id, student_id, receipt_no, amount, method, note, paid_on)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                class_id,
                student_id,
                receipt_no,
                p.amount,
                p.method.as_deref().unwrap_or("cash"),
                p.note.as_deref(),
                &paid_on,
            ],
        )
        .map_err(db_err("db_insert_failed"))?;
        payments_imported += 1;
    }

    let mut days_imported = 0usize;
    let mut marks_imported = 0usize;
    for day in &export.attendance_days {
        let Some(class_id) = class_ids.get(&day.class_id) else {
            skipped.attendance_days += 1;
            continue;
        };
        let Some(date) = import::normalize_date(&day.date) else {
            skipped.attendance_days += 1;
            continue;
        };
        tx.execute(
            "INSERT INTO attendance_days(class_id, date, class_teacher_id, locked)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(class_id, date) DO UPDATE SET
               class_teacher_id = excluded.class_teacher_id,
               locked = excluded.locked",
            (class_id, &date, &day.class_teacher_id, if day.locked { 1i64 } else { 0i64 }),
        )
        .map_err(db_err("db_insert_failed"))?;
        for m in &day.marks {
            let Some(student_id) = student_ids.get(&m.student_id) else {
                skipped.marks += 1;
                continue;
            };
            let Some(status) = Status::parse_code(&m.status) else {
                skipped.marks += 1;
                continue;
            };
            tx.execute(
                "INSERT INTO attendance_marks(class_id, date, student_id, roll_no, status)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(class_id, date, student_id) DO UPDATE SET
                   roll_no = excluded.roll_no,
                   status = excluded.status",
                (class_id, &date, student_id, m.roll_no as i64, status.as_code()),
            )
            .map_err(db_err("db_insert_failed"))?;
            marks_imported += 1;
        }
        days_imported += 1;
    }

    let mut route_ids: HashMap<String, String> = HashMap::new();
    let mut stop_ids: HashMap<(String, String), String> = HashMap::new();
    for r in &export.transport_routes {
        let new_id = Uuid::new_v4().to_string();
        let old_key = r.id.clone().unwrap_or_else(|| r.name.clone());
        tx.execute(
            "INSERT INTO transport_routes(id, name, vehicle_no) VALUES(?, ?, ?)",
            (&new_id, &r.name, r.vehicle_no.as_deref()),
        )
        .map_err(db_err("db_insert_failed"))?;
        for (sort_order, stop) in r.stops.iter().enumerate() {
            let sid = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO transport_stops(id, route_id, name, monthly_fee, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (&sid, &new_id, &stop.name, stop.monthly_fee, sort_order as i64),
            )
            .map_err(db_err("db_insert_failed"))?;
            stop_ids.insert((old_key.clone(), stop.name.clone()), sid);
        }
        route_ids.insert(old_key, new_id);
    }

    let mut assignments_imported = 0usize;
    for a in &export.transport_assignments {
        let (Some(student_id), Some(route_id), Some(stop_id)) = (
            student_ids.get(&a.student_id),
            route_ids.get(&a.route_id),
            stop_ids.get(&(a.route_id.clone(), a.stop_name.clone())),
        ) else {
            skipped.assignments += 1;
            continue;
        };
        tx.execute(
            "INSERT INTO transport_assignments(student_id, route_id, stop_id)
             VALUES(?, ?, ?)
             ON CONFLICT(student_id) DO UPDATE SET
               route_id = excluded.route_id,
               stop_id = excluded.stop_id",
            (student_id, route_id, stop_id),
        )
        .map_err(db_err("db_insert_failed"))?;
        assignments_imported += 1;
    }

    let mut notices_imported = 0usize;
    for n in &export.notices {
        let class_id = n.class_id.as_ref().and_then(|old| class_ids.get(old));
        let posted_on = n
            .posted_on
            .as_deref()
            .and_then(import::normalize_date)
            .unwrap_or_else(|| now_date.clone());
        tx.execute(
            "INSERT INTO notices(id, title, body, audience, class_id, posted_on)
             VALUES(?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &n.title,
                &n.body,
                n.audience.as_deref().unwrap_or("all"),
                class_id,
                &posted_on,
            ],
        )
        .map_err(db_err("db_insert_failed"))?;
        notices_imported += 1;
    }

    // Settings sections land raw; setup.get merges them against defaults
    // and drops fields it does not recognize.
    let mut settings_imported: Vec<&'static str> = Vec::new();
    if let Some(settings) = export.settings.as_object() {
        for section in ["school", "attendance", "fees", "transport"] {
            if let Some(v) = settings.get(section).filter(|v| v.is_object()) {
                db::settings_set_json(&tx, &format!("setup.{}", section), v).map_err(|e| {
                    HandlerErr {
                        code: "db_update_failed",
                        message: e.to_string(),
                        details: Some(json!({ "table": "settings" })),
                    }
                })?;
                settings_imported.push(section);
            }
        }
    }

    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({
        "classesImported": export.classes.len(),
        "studentsImported": students_imported,
        "feeHeadsImported": fee_heads_imported,
        "paymentsImported": payments_imported,
        "attendanceDaysImported": days_imported,
        "marksImported": marks_imported,
        "routesImported": export.transport_routes.len(),
        "assignmentsImported": assignments_imported,
        "noticesImported": notices_imported,
        "settingsSections": settings_imported,
        "malformedRows": export.skipped_rows,
        "skipped": {
            "students": skipped.students,
            "feeHeads": skipped.fee_heads,
            "payments": skipped.payments,
            "attendanceDays": skipped.attendance_days,
            "marks": skipped.marks,
            "assignments": skipped.assignments
        }
    }))
}

fn handle_workspace_import_dashboard(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match import_dashboard(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "workspace.importDashboard" => Some(handle_workspace_import_dashboard(state, req)),
        _ => None,
    }
}
