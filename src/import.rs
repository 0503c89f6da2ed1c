use anyhow::Context;
use chrono::{DateTime, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

// Models for the export file the previous browser dashboard produced from
// its local storage. Field coverage is deliberately loose: anything the
// old app never filled in arrives as null or is missing entirely.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportClass {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub class_teacher_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStudent {
    #[serde(default)]
    pub id: Option<String>,
    pub class_id: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub admission_no: Option<String>,
    #[serde(default)]
    pub roll_no: u32,
    #[serde(default)]
    pub guardian_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address_line: Option<String>,
    #[serde(default)]
    pub pincode: Option<String>,
    #[serde(default)]
    pub admitted_on: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFeeHead {
    pub name: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportClassFees {
    pub class_id: String,
    #[serde(default)]
    pub heads: Vec<ExportFeeHead>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayment {
    pub class_id: String,
    pub student_id: String,
    pub amount: f64,
    #[serde(default)]
    pub receipt_no: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub paid_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMark {
    pub student_id: String,
    #[serde(default)]
    pub roll_no: u32,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAttendanceDay {
    pub class_id: String,
    pub date: String,
    #[serde(default)]
    pub class_teacher_id: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub marks: Vec<ExportMark>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStop {
    pub name: String,
    #[serde(default)]
    pub monthly_fee: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRoute {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub vehicle_no: Option<String>,
    #[serde(default)]
    pub stops: Vec<ExportStop>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAssignment {
    pub student_id: String,
    pub route_id: String,
    pub stop_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNotice {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub class_id: Option<String>,
    #[serde(default)]
    pub posted_on: Option<String>,
}

#[derive(Debug, Default)]
pub struct DashboardExport {
    pub classes: Vec<ExportClass>,
    pub students: Vec<ExportStudent>,
    pub class_fees: Vec<ExportClassFees>,
    pub fee_payments: Vec<ExportPayment>,
    pub attendance_days: Vec<ExportAttendanceDay>,
    pub transport_routes: Vec<ExportRoute>,
    pub transport_assignments: Vec<ExportAssignment>,
    pub notices: Vec<ExportNotice>,
    pub settings: Value,
    pub skipped_rows: usize,
}

const SECTION_KEYS: &[&str] = &[
    "classes",
    "students",
    "classFees",
    "feePayments",
    "attendance",
    "transportRoutes",
    "transportAssignments",
    "notices",
];

/// Parse the dashboard's export file. One bad row is skipped and counted,
/// not fatal; a file with none of the known sections is rejected outright.
pub fn parse_dashboard_export(text: &str) -> anyhow::Result<DashboardExport> {
    let root: Value = serde_json::from_str(text).context("export is not valid JSON")?;
    let obj = root
        .as_object()
        .context("export must be a JSON object")?;

    if !SECTION_KEYS.iter().any(|k| obj.contains_key(*k)) {
        anyhow::bail!("file has none of the dashboard export sections");
    }

    let mut out = DashboardExport {
        settings: obj.get("settings").cloned().unwrap_or(Value::Null),
        ..DashboardExport::default()
    };
    out.classes = take_rows(obj, "classes", &mut out.skipped_rows);
    out.students = take_rows(obj, "students", &mut out.skipped_rows);
    out.class_fees = take_rows(obj, "classFees", &mut out.skipped_rows);
    out.fee_payments = take_rows(obj, "feePayments", &mut out.skipped_rows);
    out.attendance_days = take_rows(obj, "attendance", &mut out.skipped_rows);
    out.transport_routes = take_rows(obj, "transportRoutes", &mut out.skipped_rows);
    out.transport_assignments = take_rows(obj, "transportAssignments", &mut out.skipped_rows);
    out.notices = take_rows(obj, "notices", &mut out.skipped_rows);
    Ok(out)
}

fn take_rows<T: DeserializeOwned>(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    skipped: &mut usize,
) -> Vec<T> {
    let Some(arr) = obj.get(key).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|v| match serde_json::from_value(v.clone()) {
            Ok(t) => Some(t),
            Err(_) => {
                *skipped += 1;
                None
            }
        })
        .collect()
}

/// Bring the dashboard's date spellings down to YYYY-MM-DD. The old UI
/// wrote plain dates, RFC 3339 timestamps, or DD/MM/YYYY depending on the
/// screen.
pub fn normalize_date(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%d/%m/%Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    None
}

fn default_true() -> bool {
    true
}
