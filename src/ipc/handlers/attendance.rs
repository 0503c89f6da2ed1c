use crate::attendance::{parse_roll_list, round1, summarize, DayRecord, Status, StudentMark};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;

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

fn day_locked(reason: &'static str) -> HandlerErr {
    HandlerErr {
        code: "day_locked",
        message: match reason {
            "auto" => "day is past the editing window".to_string(),
            _ => "day is locked".to_string(),
        },
        details: Some(json!({ "reason": reason })),
    }
}

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params("date must be YYYY-MM-DD"))
}

fn required_date(params: &Value) -> Result<(String, NaiveDate), HandlerErr> {
    let raw = get_required_str(params, "date")?;
    let d = parse_date(&raw)?;
    Ok((d.format("%Y-%m-%d").to_string(), d))
}

/// Workspace policy knobs for attendance, with the shipped defaults when
/// the section was never saved.
fn attendance_policy(conn: &Connection) -> (i64, f64) {
    let section = db::settings_get_json(conn, "setup.attendance")
        .ok()
        .flatten()
        .unwrap_or(Value::Null);
    let auto_lock_after_days = section
        .get("autoLockAfterDays")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let warn_percent = section
        .get("minPresentPercentWarning")
        .and_then(|v| v.as_f64())
        .unwrap_or(75.0);
    (auto_lock_after_days, warn_percent)
}

struct SheetStudent {
    id: String,
    display_name: String,
    roll_no: u32,
}

fn class_teacher(conn: &Connection, class_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_teacher_id FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| db_failed("db_query_failed", e))?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "class not found".to_string(),
        details: None,
    })
}

fn roster(conn: &Connection, class_id: &str) -> Result<Vec<SheetStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, first_name, last_name, roll_no
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY roll_no, sort_order, last_name, first_name",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    stmt.query_map([class_id], |r| {
        let first: String = r.get(1)?;
        let last: String = r.get(2)?;
        let roll: i64 = r.get(3)?;
        Ok(SheetStudent {
            id: r.get(0)?,
            display_name: if last.is_empty() {
                first.clone()
            } else {
                format!("{} {}", first, last)
            },
            roll_no: roll.max(0) as u32,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_failed("db_query_failed", e))
}

/// Load the stored sheet for a day, or build a fresh all-Absent one from
/// the roster when nothing was recorded yet. An open stored sheet picks up
/// students admitted after it was first saved; a locked sheet is history
/// and shows exactly what was stored.
fn load_day(
    conn: &Connection,
    class_id: &str,
    date: &str,
) -> Result<(DayRecord, bool), HandlerErr> {
    let day_row: Option<(String, i64)> = conn
        .query_row(
            "SELECT class_teacher_id, locked FROM attendance_days
             WHERE class_id = ? AND date = ?",
            (class_id, date),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;

    let Some((teacher_id, locked)) = day_row else {
        let teacher_id = class_teacher(conn, class_id)?;
        let roster_marks: Vec<StudentMark> = roster(conn, class_id)?
            .into_iter()
            .map(|s| StudentMark {
                student_id: s.id,
                roll_no: s.roll_no,
                status: Status::Absent,
            })
            .collect();
        return Ok((
            DayRecord::build(date, class_id, &teacher_id, &roster_marks),
            false,
        ));
    };

    let mut stmt = conn
        .prepare(
            "SELECT student_id, roll_no, status FROM attendance_marks
             WHERE class_id = ? AND date = ?
             ORDER BY roll_no, student_id",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let mut marks: Vec<StudentMark> = stmt
        .query_map((class_id, date), |r| {
            let roll: i64 = r.get(1)?;
            let status_code: String = r.get(2)?;
            Ok((r.get::<_, String>(0)?, roll.max(0) as u32, status_code))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?
        .into_iter()
        .map(|(student_id, roll_no, status_code)| StudentMark {
            student_id,
            roll_no,
            // Unreadable historical codes degrade to Absent rather than
            // poisoning the whole sheet.
            status: Status::parse_code(&status_code).unwrap_or(Status::Absent),
        })
        .collect();

    let locked = locked != 0;
    if !locked {
        // An open sheet tracks the live roster: newcomers join as absent
        // and renumbered students carry their current roll.
        let mut current: std::collections::HashMap<String, u32> = roster(conn, class_id)?
            .into_iter()
            .map(|s| (s.id, s.roll_no))
            .collect();
        for mark in marks.iter_mut() {
            if let Some(roll) = current.remove(&mark.student_id) {
                mark.roll_no = roll;
            }
        }
        for (student_id, roll_no) in current {
            marks.push(StudentMark {
                student_id,
                roll_no,
                status: Status::Absent,
            });
        }
        marks.sort_by(|a, b| {
            (a.roll_no, a.student_id.as_str()).cmp(&(b.roll_no, b.student_id.as_str()))
        });
    }

    Ok((
        DayRecord {
            date: date.to_string(),
            class_id: class_id.to_string(),
            class_teacher_id: teacher_id,
            locked,
            marks,
        },
        true,
    ))
}

fn save_day(conn: &Connection, record: &DayRecord) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO attendance_days(class_id, date, class_teacher_id, locked)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, date) DO UPDATE SET
           class_teacher_id = excluded.class_teacher_id,
           locked = excluded.locked",
        (
            &record.class_id,
            &record.date,
            &record.class_teacher_id,
            if record.locked { 1i64 } else { 0i64 },
        ),
    )
    .map_err(|e| db_failed("db_insert_failed", e))?;
    tx.execute(
        "DELETE FROM attendance_marks WHERE class_id = ? AND date = ?",
        (&record.class_id, &record.date),
    )
    .map_err(|e| db_failed("db_delete_failed", e))?;
    for m in &record.marks {
        tx.execute(
            "INSERT INTO attendance_marks(class_id, date, student_id, roll_no, status)
             VALUES(?, ?, ?, ?, ?)",
            (
                &record.class_id,
                &record.date,
                &m.student_id,
                m.roll_no as i64,
                m.status.as_code(),
            ),
        )
        .map_err(|e| db_failed("db_insert_failed", e))?;
    }
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))
}

/// Refuse edits to a sealed day, and to any day that has aged out of the
/// editing window when the workspace sets one.
fn guard_editable(
    conn: &Connection,
    class_id: &str,
    date: &str,
    day: NaiveDate,
) -> Result<(), HandlerErr> {
    let locked: Option<i64> = conn
        .query_row(
            "SELECT locked FROM attendance_days WHERE class_id = ? AND date = ?",
            (class_id, date),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    if locked == Some(1) {
        return Err(day_locked("locked"));
    }
    let (auto_lock_after_days, _) = attendance_policy(conn);
    if auto_lock_after_days > 0 {
        let age = (chrono::Local::now().date_naive() - day).num_days();
        if age > auto_lock_after_days {
            return Err(day_locked("auto"));
        }
    }
    Ok(())
}

fn sheet_response(record: &DayRecord) -> Value {
    json!({
        "sheet": record,
        "summary": summarize(record)
    })
}

fn attendance_sheet_open(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    // Opening without a date is the "take today's roll call" path.
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => parse_date(raw)?.format("%Y-%m-%d").to_string(),
        None => chrono::Local::now().date_naive().format("%Y-%m-%d").to_string(),
    };
    let (record, stored) = load_day(conn, &class_id, &date)?;
    let students: Vec<Value> = roster(conn, &class_id)?
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "displayName": s.display_name,
                "rollNo": s.roll_no
            })
        })
        .collect();
    Ok(json!({
        "sheet": record,
        "summary": summarize(&record),
        "stored": stored,
        "students": students
    }))
}

fn attendance_set_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date, day) = required_date(params)?;
    let student_id = get_required_str(params, "studentId")?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = Status::parse_code(&status_raw) else {
        return Err(bad_params("status must be one of P, A, H, M"));
    };

    guard_editable(conn, &class_id, &date, day)?;
    let (record, _) = load_day(conn, &class_id, &date)?;
    if !record.marks.iter().any(|m| m.student_id == student_id) {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not on this sheet".to_string(),
            details: None,
        });
    }
    let updated = record.set_status(&student_id, status);
    save_day(conn, &updated)?;
    Ok(sheet_response(&updated))
}

fn attendance_toggle(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date, day) = required_date(params)?;
    let student_id = get_required_str(params, "studentId")?;

    guard_editable(conn, &class_id, &date, day)?;
    let (record, _) = load_day(conn, &class_id, &date)?;
    if !record.marks.iter().any(|m| m.student_id == student_id) {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not on this sheet".to_string(),
            details: None,
        });
    }
    let updated = record.toggle(&student_id);
    save_day(conn, &updated)?;
    Ok(sheet_response(&updated))
}

fn attendance_mark_present_rolls(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date, day) = required_date(params)?;
    let rolls = get_required_str(params, "rolls")?;

    guard_editable(conn, &class_id, &date, day)?;
    let (record, _) = load_day(conn, &class_id, &date)?;
    let updated = record.mark_present_rolls(&rolls);
    save_day(conn, &updated)?;
    let present: Vec<u32> = parse_roll_list(&rolls).into_iter().collect();
    let mut out = sheet_response(&updated);
    if let Some(obj) = out.as_object_mut() {
        obj.insert("presentRolls".to_string(), json!(present));
    }
    Ok(out)
}

fn attendance_lock_day(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date, _) = required_date(params)?;

    let (record, _) = load_day(conn, &class_id, &date)?;
    let sealed = record.lock();
    save_day(conn, &sealed)?;
    Ok(sheet_response(&sealed))
}

fn attendance_reset_day(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date, _) = required_date(params)?;

    let existed: bool = conn
        .query_row(
            "SELECT 1 FROM attendance_days WHERE class_id = ? AND date = ?",
            (&class_id, &date),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .is_some();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM attendance_marks WHERE class_id = ? AND date = ?",
        (&class_id, &date),
    )
    .map_err(|e| db_failed("db_delete_failed", e))?;
    tx.execute(
        "DELETE FROM attendance_days WHERE class_id = ? AND date = ?",
        (&class_id, &date),
    )
    .map_err(|e| db_failed("db_delete_failed", e))?;
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;

    Ok(json!({ "ok": true, "existed": existed }))
}

fn parse_month_key(month: &str) -> Result<String, HandlerErr> {
    let t = month.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(bad_params("month must be YYYY-MM"));
    };
    let year = y
        .parse::<i32>()
        .map_err(|_| bad_params("month year must be numeric"))?;
    let month_num = m
        .parse::<u32>()
        .map_err(|_| bad_params("month must be YYYY-MM"))?;
    if !(1..=12).contains(&month_num) {
        return Err(bad_params("month must be between 01 and 12"));
    }
    Ok(format!("{:04}-{:02}", year, month_num))
}

fn attendance_month_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month = parse_month_key(&get_required_str(params, "month")?)?;
    let prefix = format!("{}-%", month);

    let mut day_stmt = conn
        .prepare(
            "SELECT date, locked FROM attendance_days
             WHERE class_id = ? AND date LIKE ?
             ORDER BY date",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let day_rows: Vec<(String, bool)> = day_stmt
        .query_map((&class_id, &prefix), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let mut mark_stmt = conn
        .prepare(
            "SELECT date, student_id, roll_no, status FROM attendance_marks
             WHERE class_id = ? AND date LIKE ?
             ORDER BY date, roll_no",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let mark_rows: Vec<(String, String, u32, Status)> = mark_stmt
        .query_map((&class_id, &prefix), |r| {
            let roll: i64 = r.get(2)?;
            let code: String = r.get(3)?;
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, roll.max(0) as u32, code))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?
        .into_iter()
        .map(|(date, student_id, roll_no, code)| {
            (
                date,
                student_id,
                roll_no,
                Status::parse_code(&code).unwrap_or(Status::Absent),
            )
        })
        .collect();

    // Per-day sheets, rebuilt from the stored marks.
    let mut marks_by_day: HashMap<String, Vec<StudentMark>> = HashMap::new();
    for (date, student_id, roll_no, status) in &mark_rows {
        marks_by_day.entry(date.clone()).or_default().push(StudentMark {
            student_id: student_id.clone(),
            roll_no: *roll_no,
            status: *status,
        });
    }
    let days_json: Vec<Value> = day_rows
        .iter()
        .map(|(date, locked)| {
            let record = DayRecord {
                date: date.clone(),
                class_id: class_id.clone(),
                class_teacher_id: String::new(),
                locked: *locked,
                marks: marks_by_day.get(date).cloned().unwrap_or_default(),
            };
            json!({
                "date": date,
                "locked": locked,
                "summary": summarize(&record)
            })
        })
        .collect();

    // Per-student tallies across the month. The percentage follows the
    // daily rule: half days count 0.5, medical days leave the denominator.
    #[derive(Default)]
    struct Tally {
        roll_no: u32,
        present: usize,
        absent: usize,
        half_day: usize,
        medical: usize,
    }
    let mut tallies: HashMap<String, Tally> = HashMap::new();
    for (_, student_id, roll_no, status) in &mark_rows {
        let t = tallies.entry(student_id.clone()).or_default();
        t.roll_no = *roll_no;
        match status {
            Status::Present => t.present += 1,
            Status::Absent => t.absent += 1,
            Status::HalfDay => t.half_day += 1,
            Status::Medical => t.medical += 1,
        }
    }

    let mut name_stmt = conn
        .prepare("SELECT id, first_name, last_name FROM students WHERE class_id = ?")
        .map_err(|e| db_failed("db_query_failed", e))?;
    let names: HashMap<String, String> = name_stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            let name = if last.is_empty() {
                first
            } else {
                format!("{} {}", first, last)
            };
            Ok((id, name))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let (_, warn_percent) = attendance_policy(conn);
    let mut students_json: Vec<Value> = tallies
        .into_iter()
        .map(|(student_id, t)| {
            let marked = t.present + t.absent + t.half_day + t.medical;
            let denom = marked - t.medical;
            let percent = if denom > 0 {
                round1(100.0 * (t.present as f64 + 0.5 * t.half_day as f64) / denom as f64)
            } else {
                0.0
            };
            json!({
                "studentId": student_id,
                "displayName": names.get(&student_id).cloned().unwrap_or_else(|| student_id.clone()),
                "rollNo": t.roll_no,
                "present": t.present,
                "absent": t.absent,
                "halfDay": t.half_day,
                "medical": t.medical,
                "daysMarked": marked,
                "presentPercent": percent,
                "belowWarning": denom > 0 && percent < warn_percent
            })
        })
        .collect();
    students_json.sort_by(|a, b| {
        let ra = a.get("rollNo").and_then(|v| v.as_u64()).unwrap_or(0);
        let rb = b.get("rollNo").and_then(|v| v.as_u64()).unwrap_or(0);
        ra.cmp(&rb).then_with(|| {
            let na = a.get("displayName").and_then(|v| v.as_str()).unwrap_or("");
            let nb = b.get("displayName").and_then(|v| v.as_str()).unwrap_or("");
            na.cmp(nb)
        })
    });

    Ok(json!({
        "month": month,
        "days": days_json,
        "students": students_json
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
        "attendance.sheetOpen" => Some(with_conn(state, req, attendance_sheet_open)),
        "attendance.setStatus" => Some(with_conn(state, req, attendance_set_status)),
        "attendance.toggle" => Some(with_conn(state, req, attendance_toggle)),
        "attendance.markPresentRolls" => {
            Some(with_conn(state, req, attendance_mark_present_rolls))
        }
        "attendance.lockDay" => Some(with_conn(state, req, attendance_lock_day)),
        "attendance.resetDay" => Some(with_conn(state, req, attendance_reset_day)),
        "attendance.monthSummary" => Some(with_conn(state, req, attendance_month_summary)),
        _ => None,
    }
}
