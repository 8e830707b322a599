use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Outbox reads only. The daemon records what is owed; sending mail is the
/// host application's job.
fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let status = match optional_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let base = "SELECT id, kind, recipient, subject, body, created_at, status
                FROM notifications";
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "kind": r.get::<_, String>(1)?,
            "recipient": r.get::<_, Option<String>>(2)?,
            "subject": r.get::<_, String>(3)?,
            "body": r.get::<_, String>(4)?,
            "createdAt": r.get::<_, String>(5)?,
            "status": r.get::<_, String>(6)?,
        }))
    };

    let rows = match status {
        Some(st) => {
            let sql = format!("{} WHERE status = ? ORDER BY created_at", base);
            match conn.prepare(&sql) {
                Ok(mut stmt) => stmt
                    .query_map([&st], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        None => {
            let sql = format!("{} ORDER BY created_at", base);
            match conn.prepare(&sql) {
                Ok(mut stmt) => stmt
                    .query_map([], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };
    match rows {
        Ok(v) => ok(&req.id, json!({ "notifications": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}
