use crate::db;
use crate::fees::{ledger_totals, months_billed, plan_total, rank_defaulters, DefaulterRow, FeeHead, LedgerTotals};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
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

fn not_found(message: &str) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.to_string(),
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

const PAYMENT_METHODS: &[&str] = &["cash", "upi", "cheque", "bank"];

/// Billing knobs from setup.fees, with shipped defaults: April session
/// start, RCP receipt series, cash counter.
fn fees_policy(conn: &Connection) -> (u32, String, String) {
    let section = db::settings_get_json(conn, "setup.fees")
        .ok()
        .flatten()
        .unwrap_or(Value::Null);
    let year_start_month = section
        .get("yearStartMonth")
        .and_then(|v| v.as_u64())
        .filter(|m| (1..=12).contains(m))
        .unwrap_or(4) as u32;
    let receipt_prefix = section
        .get("receiptPrefix")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("RCP")
        .trim()
        .to_string();
    let default_method = section
        .get("defaultMethod")
        .and_then(|v| v.as_str())
        .filter(|s| PAYMENT_METHODS.contains(s))
        .unwrap_or("cash")
        .to_string();
    (year_start_month, receipt_prefix, default_method)
}

fn as_of_date(params: &Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| bad_params("asOf must be YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn load_heads(conn: &Connection, class_id: &str) -> Result<Vec<FeeHead>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT name, amount FROM fee_heads WHERE class_id = ? ORDER BY sort_order")
        .map_err(|e| db_failed("db_query_failed", e))?;
    stmt.query_map([class_id], |r| {
        Ok(FeeHead {
            name: r.get(0)?,
            amount: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_failed("db_query_failed", e))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRow {
    receipt_no: i64,
    amount: f64,
    method: String,
    note: Option<String>,
    paid_on: String,
}

struct StudentLedger {
    student_id: String,
    student_name: String,
    class_id: String,
    class_name: String,
    roll_no: u32,
    plan_total: f64,
    transport_monthly: f64,
    months: u32,
    payments: Vec<PaymentRow>,
    totals: LedgerTotals,
}

fn compute_ledger(
    conn: &Connection,
    student_id: &str,
    as_of: NaiveDate,
) -> Result<Option<StudentLedger>, HandlerErr> {
    let row: Option<(String, String, i64, String, String, String)> = conn
        .query_row(
            "SELECT s.first_name, s.last_name, s.roll_no, s.class_id, c.name, c.section
             FROM students s JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    let Some((first, last, roll, class_id, class_name, section)) = row else {
        return Ok(None);
    };

    let heads = load_heads(conn, &class_id)?;
    let plan = plan_total(&heads);

    let transport_monthly: f64 = conn
        .query_row(
            "SELECT ts.monthly_fee
             FROM transport_assignments ta
             JOIN transport_stops ts ON ts.id = ta.stop_id
             WHERE ta.student_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .unwrap_or(0.0);

    let (year_start_month, _, _) = fees_policy(conn);
    let months = months_billed(year_start_month, as_of);

    let mut stmt = conn
        .prepare(
            "SELECT receipt_no, amount, method, note, paid_on
             FROM fee_payments
             WHERE student_id = ?
             ORDER BY paid_on, receipt_no",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let payments: Vec<PaymentRow> = stmt
        .query_map([student_id], |r| {
            Ok(PaymentRow {
                receipt_no: r.get(0)?,
                amount: r.get(1)?,
                method: r.get(2)?,
                note: r.get(3)?,
                paid_on: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let amounts: Vec<f64> = payments.iter().map(|p| p.amount).collect();
    let totals = ledger_totals(plan, transport_monthly, months, &amounts);

    Ok(Some(StudentLedger {
        student_id: student_id.to_string(),
        student_name: if last.is_empty() {
            first
        } else {
            format!("{} {}", first, last)
        },
        class_id,
        class_name: if section.is_empty() {
            class_name
        } else {
            format!("{} {}", class_name, section)
        },
        roll_no: roll.max(0) as u32,
        plan_total: plan,
        transport_monthly,
        months,
        payments,
        totals,
    }))
}

fn fees_plan_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(not_found("class not found"));
    }
    let heads = load_heads(conn, &class_id)?;
    let total = plan_total(&heads);
    Ok(json!({ "classId": class_id, "heads": heads, "total": total }))
}

fn fees_plan_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(not_found("class not found"));
    }

    let Some(heads_json) = params.get("heads").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing heads"));
    };
    let mut heads: Vec<FeeHead> = Vec::with_capacity(heads_json.len());
    for h in heads_json {
        let name = h
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_params("each head needs a non-empty name"))?;
        let amount = h
            .get("amount")
            .and_then(|v| v.as_f64())
            .filter(|a| *a >= 0.0)
            .ok_or_else(|| bad_params("each head needs a non-negative amount"))?;
        heads.push(FeeHead {
            name: name.to_string(),
            amount,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    tx.execute("DELETE FROM fee_heads WHERE class_id = ?", [&class_id])
        .map_err(|e| db_failed("db_delete_failed", e))?;
    for (sort_order, h) in heads.iter().enumerate() {
        tx.execute(
            "INSERT INTO fee_heads(id, class_id, name, amount, sort_order) VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &class_id,
                &h.name,
                h.amount,
                sort_order as i64,
            ),
        )
        .map_err(|e| db_failed("db_insert_failed", e))?;
    }
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;

    let total = plan_total(&heads);
    Ok(json!({ "classId": class_id, "heads": heads, "total": total }))
}

fn fees_record_payment(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let amount = params
        .get("amount")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| bad_params("missing amount"))?;
    if amount <= 0.0 {
        return Err(bad_params("amount must be positive"));
    }

    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    let Some(class_id) = class_id else {
        return Err(not_found("student not found"));
    };

    let (_, receipt_prefix, default_method) = fees_policy(conn);
    let method = match params.get("method").and_then(|v| v.as_str()) {
        Some(m) => {
            let m = m.trim().to_ascii_lowercase();
            if !PAYMENT_METHODS.contains(&m.as_str()) {
                return Err(bad_params("method must be one of: cash, upi, cheque, bank"));
            }
            m
        }
        None => default_method,
    };
    let note = params
        .get("note")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let paid_on = match params.get("paidOn").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| bad_params("paidOn must be YYYY-MM-DD"))?
            .format("%Y-%m-%d")
            .to_string(),
        None => chrono::Local::now().date_naive().format("%Y-%m-%d").to_string(),
    };

    let receipt_no: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(receipt_no), 0) + 1 FROM fee_payments",
            [],
            |r| r.get(0),
        )
        .map_err(|e| db_failed("db_query_failed", e))?;

    conn.execute(
        "INSERT INTO fee_payments(id, class_id, student_id, receipt_no, amount, method, note, paid_on)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            &class_id,
            &student_id,
            receipt_no,
            amount,
            &method,
            note,
            &paid_on,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "fee_payments" })),
    })?;

    let balance_after = compute_ledger(conn, &student_id, chrono::Local::now().date_naive())?
        .map(|l| l.totals.balance);

    Ok(json!({
        "receiptNo": receipt_no,
        "receiptLabel": format!("{}-{:04}", receipt_prefix, receipt_no),
        "amount": amount,
        "method": method,
        "paidOn": paid_on,
        "balanceAfter": balance_after
    }))
}

fn fees_ledger(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let as_of = as_of_date(params)?;
    let Some(ledger) = compute_ledger(conn, &student_id, as_of)? else {
        return Err(not_found("student not found"));
    };
    Ok(json!({
        "studentId": ledger.student_id,
        "studentName": ledger.student_name,
        "classId": ledger.class_id,
        "className": ledger.class_name,
        "rollNo": ledger.roll_no,
        "planTotal": ledger.plan_total,
        "transportMonthly": ledger.transport_monthly,
        "monthsBilled": ledger.months,
        "payments": ledger.payments,
        "totals": ledger.totals
    }))
}

fn fees_defaulters(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = as_of_date(params)?;
    let class_filter = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut rows: Vec<DefaulterRow> = Vec::new();
    let ids: Vec<String> = match &class_filter {
        Some(class_id) => {
            let mut stmt = conn
                .prepare("SELECT id FROM students WHERE class_id = ? AND active = 1")
                .map_err(|e| db_failed("db_query_failed", e))?;
            stmt.query_map([class_id], |r| r.get(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| db_failed("db_query_failed", e))?
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id FROM students WHERE active = 1")
                .map_err(|e| db_failed("db_query_failed", e))?;
            stmt.query_map([], |r| r.get(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| db_failed("db_query_failed", e))?
        }
    };

    for student_id in ids {
        if let Some(l) = compute_ledger(conn, &student_id, as_of)? {
            rows.push(DefaulterRow {
                student_id: l.student_id,
                student_name: l.student_name,
                class_id: l.class_id,
                class_name: l.class_name,
                roll_no: l.roll_no,
                charged: l.totals.charged,
                paid: l.totals.paid,
                balance: l.totals.balance,
            });
        }
    }

    let ranked = rank_defaulters(rows);
    Ok(json!({
        "asOf": as_of.format("%Y-%m-%d").to_string(),
        "defaulters": ranked
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
        "fees.planGet" => Some(with_conn(state, req, fees_plan_get)),
        "fees.planSave" => Some(with_conn(state, req, fees_plan_save)),
        "fees.recordPayment" => Some(with_conn(state, req, fees_record_payment)),
        "fees.ledger" => Some(with_conn(state, req, fees_ledger)),
        "fees.defaulters" => Some(with_conn(state, req, fees_defaulters)),
        _ => None,
    }
}
