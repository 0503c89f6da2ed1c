use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

fn handle_notices_post(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(title) = req
        .params
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing title", None);
    };
    let Some(body) = req
        .params
        .get("body")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return err(&req.id, "bad_params", "missing body", None);
    };

    let audience = req
        .params
        .get("audience")
        .and_then(|v| v.as_str())
        .unwrap_or("all");
    let class_id = match audience {
        "all" => None,
        "class" => {
            let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) else {
                return err(
                    &req.id,
                    "bad_params",
                    "audience \"class\" needs a classId",
                    None,
                );
            };
            let exists = match conn
                .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                    r.get::<_, i64>(0)
                })
                .optional()
            {
                Ok(v) => v.is_some(),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if !exists {
                return err(&req.id, "not_found", "class not found", None);
            }
            Some(class_id.to_string())
        }
        _ => {
            return err(
                &req.id,
                "bad_params",
                "audience must be \"all\" or \"class\"",
                None,
            )
        }
    };

    let posted_on = match req.params.get("postedOn").and_then(|v| v.as_str()) {
        Some(raw) => match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(d) => d.format("%Y-%m-%d").to_string(),
            Err(_) => return err(&req.id, "bad_params", "postedOn must be YYYY-MM-DD", None),
        },
        None => chrono::Local::now().date_naive().format("%Y-%m-%d").to_string(),
    };

    let notice_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO notices(id, title, body, audience, class_id, posted_on) VALUES(?, ?, ?, ?, ?, ?)",
        (&notice_id, title, body, audience, &class_id, &posted_on),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "noticeId": notice_id, "audience": audience, "postedOn": posted_on }),
    )
}

fn handle_notices_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // A class noticeboard shows school-wide posts alongside its own.
    let class_filter = req.params.get("classId").and_then(|v| v.as_str());
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<Value> {
        Ok(json!({
            "noticeId": r.get::<_, String>(0)?,
            "title": r.get::<_, String>(1)?,
            "body": r.get::<_, String>(2)?,
            "audience": r.get::<_, String>(3)?,
            "classId": r.get::<_, Option<String>>(4)?,
            "postedOn": r.get::<_, String>(5)?,
        }))
    };
    let listed = match class_filter {
        Some(class_id) => conn
            .prepare(
                "SELECT id, title, body, audience, class_id, posted_on FROM notices
                 WHERE audience = 'all' OR class_id = ?
                 ORDER BY posted_on DESC, title",
            )
            .and_then(|mut stmt| {
                stmt.query_map([class_id], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            }),
        None => conn
            .prepare(
                "SELECT id, title, body, audience, class_id, posted_on FROM notices
                 ORDER BY posted_on DESC, title",
            )
            .and_then(|mut stmt| {
                stmt.query_map([], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            }),
    };
    match listed {
        Ok(notices) => ok(&req.id, json!({ "notices": notices })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_notices_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(notice_id) = req.params.get("noticeId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing noticeId", None);
    };
    match conn.execute("DELETE FROM notices WHERE id = ?", [notice_id]) {
        Ok(0) => err(&req.id, "not_found", "notice not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "notices.post" => Some(handle_notices_post(state, req)),
        "notices.list" => Some(handle_notices_list(state, req)),
        "notices.delete" => Some(handle_notices_delete(state, req)),
        _ => None,
    }
}
