use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::pincode;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Attendance,
    Fees,
    Transport,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "attendance" => Some(Self::Attendance),
            "fees" => Some(Self::Fees),
            "transport" => Some(Self::Transport),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Attendance => "setup.attendance",
            Self::Fees => "setup.fees",
            Self::Transport => "setup.transport",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "addressLine": "",
            "pincode": "",
            "phone": "",
            "email": "",
            "academicYearLabel": ""
        }),
        SetupSection::Attendance => json!({
            "autoLockAfterDays": 0,
            "minPresentPercentWarning": 75.0
        }),
        SetupSection::Fees => json!({
            "yearStartMonth": 4,
            "receiptPrefix": "RCP",
            "defaultMethod": "cash"
        }),
        SetupSection::Transport => json!({
            "capacityWarning": 50,
            "defaultMonthlyFee": 0.0
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "addressLine" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "pincode" => {
                    let s = parse_string_max(v, k, 6)?;
                    if !s.is_empty() && !pincode::is_valid_pin(&s) {
                        return Err("pincode must be a 6-digit PIN".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 20)?));
                }
                "email" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "academicYearLabel" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 40)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "autoLockAfterDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
                }
                "minPresentPercentWarning" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Fees => match k.as_str() {
                "yearStartMonth" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
                }
                "receiptPrefix" => {
                    let s = parse_string_max(v, k, 8)?;
                    if s.is_empty() {
                        return Err("receiptPrefix must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s.to_ascii_uppercase()));
                }
                "defaultMethod" => {
                    let m = parse_string_max(v, k, 8)?.to_ascii_lowercase();
                    if m != "cash" && m != "upi" && m != "cheque" && m != "bank" {
                        return Err("defaultMethod must be one of: cash, upi, cheque, bank".into());
                    }
                    obj.insert(k.clone(), Value::String(m));
                }
                _ => return Err(format!("unknown fees field: {}", k)),
            },
            SetupSection::Transport => match k.as_str() {
                "capacityWarning" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 500)?));
                }
                "defaultMonthlyFee" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_f64_range(v, k, 0.0, 1_000_000.0)?),
                    );
                }
                _ => return Err(format!("unknown transport field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let school = match load_section(conn, SetupSection::School) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let attendance = match load_section(conn, SetupSection::Attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fees = match load_section(conn, SetupSection::Fees) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let transport = match load_section(conn, SetupSection::Transport) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "school": school,
            "attendance": attendance,
            "fees": fees,
            "transport": transport
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
