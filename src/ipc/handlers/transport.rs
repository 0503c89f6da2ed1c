use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
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

/// Fleet knobs from setup.transport: when a route's rider count crosses
/// capacityWarning the roster flags it, and stops saved without a fee
/// pick up defaultMonthlyFee.
fn transport_policy(conn: &Connection) -> (u64, f64) {
    let section = db::settings_get_json(conn, "setup.transport")
        .ok()
        .flatten()
        .unwrap_or(Value::Null);
    let capacity_warning = section
        .get("capacityWarning")
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .unwrap_or(50);
    let default_monthly_fee = section
        .get("defaultMonthlyFee")
        .and_then(|v| v.as_f64())
        .filter(|f| *f >= 0.0)
        .unwrap_or(0.0);
    (capacity_warning, default_monthly_fee)
}

fn route_exists(conn: &Connection, route_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM transport_routes WHERE id = ?",
        [route_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_failed("db_query_failed", e))
}

fn stops_for_route(conn: &Connection, route_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, monthly_fee,
                    (SELECT COUNT(*) FROM transport_assignments ta WHERE ta.stop_id = transport_stops.id) AS assigned
             FROM transport_stops WHERE route_id = ? ORDER BY sort_order",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    stmt.query_map([route_id], |r| {
        Ok(json!({
            "stopId": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "monthlyFee": r.get::<_, f64>(2)?,
            "assignedCount": r.get::<_, i64>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_failed("db_query_failed", e))
}

fn transport_routes_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, vehicle_no,
                    (SELECT COUNT(*) FROM transport_assignments ta WHERE ta.route_id = transport_routes.id) AS riders
             FROM transport_routes ORDER BY name",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    let routes: Vec<(String, String, Option<String>, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let mut out = Vec::with_capacity(routes.len());
    for (id, name, vehicle_no, riders) in routes {
        let stops = stops_for_route(conn, &id)?;
        out.push(json!({
            "routeId": id,
            "name": name,
            "vehicleNo": vehicle_no,
            "riderCount": riders,
            "stops": stops,
        }));
    }
    Ok(json!({ "routes": out }))
}

fn transport_route_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(bad_params("name must not be empty"));
    }
    let vehicle_no = params
        .get("vehicleNo")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let Some(stops_json) = params.get("stops").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing stops"));
    };
    let (_, default_monthly_fee) = transport_policy(conn);

    struct IncomingStop {
        id: Option<String>,
        name: String,
        monthly_fee: f64,
    }
    let mut incoming: Vec<IncomingStop> = Vec::with_capacity(stops_json.len());
    for s in stops_json {
        let stop_name = s
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| bad_params("each stop needs a non-empty name"))?;
        let monthly_fee = match s.get("monthlyFee") {
            Some(v) => v
                .as_f64()
                .filter(|f| *f >= 0.0)
                .ok_or_else(|| bad_params("monthlyFee must be a non-negative number"))?,
            None => default_monthly_fee,
        };
        incoming.push(IncomingStop {
            id: s
                .get("stopId")
                .and_then(|v| v.as_str())
                .map(|x| x.to_string()),
            name: stop_name.to_string(),
            monthly_fee,
        });
    }

    let route_id = match params.get("routeId").and_then(|v| v.as_str()) {
        Some(id) => {
            if !route_exists(conn, id)? {
                return Err(not_found("route not found"));
            }
            id.to_string()
        }
        None => Uuid::new_v4().to_string(),
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO transport_routes(id, name, vehicle_no) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, vehicle_no = excluded.vehicle_no",
        (&route_id, name, vehicle_no),
    )
    .map_err(|e| db_failed("db_update_failed", e))?;

    // Stops keep their ids when the caller sends them back, so existing
    // student assignments survive a rename or fee change. Stops dropped
    // from the list take their assignments with them.
    let mut kept: HashSet<String> = HashSet::new();
    for (sort_order, stop) in incoming.iter().enumerate() {
        let stop_id = match &stop.id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        tx.execute(
            "INSERT INTO transport_stops(id, route_id, name, monthly_fee, sort_order)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                route_id = excluded.route_id,
                name = excluded.name,
                monthly_fee = excluded.monthly_fee,
                sort_order = excluded.sort_order",
            (
                &stop_id,
                &route_id,
                &stop.name,
                stop.monthly_fee,
                sort_order as i64,
            ),
        )
        .map_err(|e| db_failed("db_update_failed", e))?;
        kept.insert(stop_id);
    }

    let existing: Vec<String> = {
        let mut stmt = tx
            .prepare("SELECT id FROM transport_stops WHERE route_id = ?")
            .map_err(|e| db_failed("db_query_failed", e))?;
        stmt.query_map([&route_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| db_failed("db_query_failed", e))?
    };
    for stop_id in existing.iter().filter(|id| !kept.contains(*id)) {
        tx.execute(
            "DELETE FROM transport_assignments WHERE stop_id = ?",
            [stop_id],
        )
        .map_err(|e| db_failed("db_delete_failed", e))?;
        tx.execute("DELETE FROM transport_stops WHERE id = ?", [stop_id])
            .map_err(|e| db_failed("db_delete_failed", e))?;
    }
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;

    let stops = stops_for_route(conn, &route_id)?;
    Ok(json!({
        "routeId": route_id,
        "name": name,
        "vehicleNo": vehicle_no,
        "stops": stops,
    }))
}

fn transport_route_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let route_id = get_required_str(params, "routeId")?;
    if !route_exists(conn, &route_id)? {
        return Err(not_found("route not found"));
    }
    let riders: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM transport_assignments WHERE route_id = ?",
            [&route_id],
            |r| r.get(0),
        )
        .map_err(|e| db_failed("db_query_failed", e))?;
    if riders > 0 {
        return Err(HandlerErr {
            code: "route_in_use",
            message: format!("{} students are still assigned to this route", riders),
            details: Some(json!({ "riderCount": riders })),
        });
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_failed("db_tx_failed", e))?;
    tx.execute("DELETE FROM transport_stops WHERE route_id = ?", [&route_id])
        .map_err(|e| db_failed("db_delete_failed", e))?;
    tx.execute("DELETE FROM transport_routes WHERE id = ?", [&route_id])
        .map_err(|e| db_failed("db_delete_failed", e))?;
    tx.commit().map_err(|e| db_failed("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn transport_assign(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let route_id = get_required_str(params, "routeId")?;
    let stop_id = get_required_str(params, "stopId")?;

    let student_exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?
        .is_some();
    if !student_exists {
        return Err(not_found("student not found"));
    }
    if !route_exists(conn, &route_id)? {
        return Err(not_found("route not found"));
    }
    let monthly_fee: Option<f64> = conn
        .query_row(
            "SELECT monthly_fee FROM transport_stops WHERE id = ? AND route_id = ?",
            [&stop_id, &route_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    let Some(monthly_fee) = monthly_fee else {
        return Err(bad_params("stop does not belong to this route"));
    };

    // One seat per student: re-assigning moves them off their old stop.
    conn.execute(
        "INSERT INTO transport_assignments(student_id, route_id, stop_id) VALUES(?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
            route_id = excluded.route_id,
            stop_id = excluded.stop_id",
        (&student_id, &route_id, &stop_id),
    )
    .map_err(|e| db_failed("db_update_failed", e))?;

    Ok(json!({
        "studentId": student_id,
        "routeId": route_id,
        "stopId": stop_id,
        "monthlyFee": monthly_fee,
    }))
}

fn transport_unassign(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let removed = conn
        .execute(
            "DELETE FROM transport_assignments WHERE student_id = ?",
            [&student_id],
        )
        .map_err(|e| db_failed("db_delete_failed", e))?;
    Ok(json!({ "ok": true, "existed": removed > 0 }))
}

fn transport_roster(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let route_id = get_required_str(params, "routeId")?;
    let route: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, vehicle_no FROM transport_routes WHERE id = ?",
            [&route_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| db_failed("db_query_failed", e))?;
    let Some((route_name, vehicle_no)) = route else {
        return Err(not_found("route not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT ts.id, ts.name, ts.monthly_fee,
                    s.id, s.first_name, s.last_name, s.roll_no, s.class_id, c.name, c.section
             FROM transport_stops ts
             LEFT JOIN transport_assignments ta ON ta.stop_id = ts.id
             LEFT JOIN students s ON s.id = ta.student_id AND s.active = 1
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE ts.route_id = ?
             ORDER BY ts.sort_order, s.roll_no, s.first_name",
        )
        .map_err(|e| db_failed("db_query_failed", e))?;

    struct RosterRow {
        stop_id: String,
        stop_name: String,
        monthly_fee: f64,
        student: Option<(String, String, String, i64, String, String, String)>,
    }
    let rows: Vec<RosterRow> = stmt
        .query_map([&route_id], |r| {
            let student_id: Option<String> = r.get(3)?;
            let student = match student_id {
                Some(id) => Some((
                    id,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                )),
                None => None,
            };
            Ok(RosterRow {
                stop_id: r.get(0)?,
                stop_name: r.get(1)?,
                monthly_fee: r.get(2)?,
                student,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_failed("db_query_failed", e))?;

    let mut stops: Vec<Value> = Vec::new();
    let mut riders = 0u64;
    for row in rows {
        let needs_new = stops
            .last()
            .and_then(|s| s.get("stopId"))
            .and_then(|v| v.as_str())
            != Some(row.stop_id.as_str());
        if needs_new {
            stops.push(json!({
                "stopId": row.stop_id,
                "name": row.stop_name,
                "monthlyFee": row.monthly_fee,
                "students": [],
            }));
        }
        if let Some((id, first, last, roll, class_id, class_name, section)) = row.student {
            riders += 1;
            let display_name = if last.is_empty() {
                first
            } else {
                format!("{} {}", first, last)
            };
            let class_label = if section.is_empty() {
                class_name
            } else {
                format!("{} {}", class_name, section)
            };
            if let Some(list) = stops
                .last_mut()
                .and_then(|s| s.get_mut("students"))
                .and_then(|v| v.as_array_mut())
            {
                list.push(json!({
                    "studentId": id,
                    "displayName": display_name,
                    "rollNo": roll,
                    "classId": class_id,
                    "className": class_label,
                }));
            }
        }
    }

    let (capacity_warning, _) = transport_policy(conn);
    Ok(json!({
        "routeId": route_id,
        "name": route_name,
        "vehicleNo": vehicle_no,
        "riderCount": riders,
        "capacityWarning": capacity_warning,
        "overCapacity": riders > capacity_warning,
        "stops": stops,
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
        "transport.routesList" => Some(with_conn(state, req, transport_routes_list)),
        "transport.routeSave" => Some(with_conn(state, req, transport_route_save)),
        "transport.routeDelete" => Some(with_conn(state, req, transport_route_delete)),
        "transport.assign" => Some(with_conn(state, req, transport_assign)),
        "transport.unassign" => Some(with_conn(state, req, transport_unassign)),
        "transport.rosterForRoute" => Some(with_conn(state, req, transport_roster)),
        _ => None,
    }
}
