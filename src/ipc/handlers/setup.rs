use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn insert_err(req: &Request, what: &str, e: rusqlite::Error) -> serde_json::Value {
    // Unique-constraint hits surface as conflicts, everything else as a db error.
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return err(&req.id, "conflict", format!("{} already exists", what), None);
        }
    }
    err(&req.id, "db_query_failed", e.to_string(), None)
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // sortOrder defaults to one past the current maximum.
    let sort_order = match req.params.get("sortOrder").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => {
            match conn.query_row(
                "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM academic_years",
                [],
                |r| r.get::<_, i64>(0),
            ) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };
    let id = db::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, name, sort_order) VALUES(?, ?, ?)",
        (&id, &name, sort_order),
    ) {
        return insert_err(req, "academic year", e);
    }
    ok(&req.id, json!({ "yearId": id, "name": name, "sortOrder": sort_order }))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let rows = list_rows(
        conn,
        "SELECT id, name, sort_order FROM academic_years ORDER BY sort_order",
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "sortOrder": r.get::<_, i64>(2)?,
            }))
        },
    );
    match rows {
        Ok(v) => ok(&req.id, json!({ "years": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_i64(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if level < 0 {
        return err(&req.id, "bad_params", "level must be >= 0", None);
    }
    let id = db::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO grade_levels(id, name, level) VALUES(?, ?, ?)",
        (&id, &name, level),
    ) {
        return insert_err(req, "grade level", e);
    }
    ok(&req.id, json!({ "gradeId": id, "name": name, "level": level }))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let rows = list_rows(
        conn,
        "SELECT id, name, level FROM grade_levels ORDER BY level",
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, i64>(2)?,
            }))
        },
    );
    match rows {
        Ok(v) => ok(&req.id, json!({ "grades": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM grade_levels WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if grade_exists.is_none() {
        return err(&req.id, "not_found", "grade level not found", None);
    }
    let id = db::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, grade_id, name) VALUES(?, ?, ?)",
        (&id, &grade_id, &name),
    ) {
        return insert_err(req, "section", e);
    }
    ok(&req.id, json!({ "sectionId": id, "gradeId": grade_id, "name": name }))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_filter = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result = match grade_filter {
        Some(gid) => {
            let mut stmt = match conn.prepare(
                "SELECT id, grade_id, name FROM sections WHERE grade_id = ? ORDER BY name",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([&gid], section_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
        None => {
            let mut stmt = match conn
                .prepare("SELECT id, grade_id, name FROM sections ORDER BY grade_id, name")
            {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([], section_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
    };
    match result {
        Ok(v) => ok(&req.id, json!({ "sections": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn section_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "gradeId": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
    }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = db::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&id, &code, &name),
    ) {
        return insert_err(req, "subject", e);
    }
    ok(&req.id, json!({ "subjectId": id, "code": code, "name": name }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let rows = list_rows(
        conn,
        "SELECT id, code, name FROM subjects ORDER BY code",
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        },
    );
    match rows {
        Ok(v) => ok(&req.id, json!({ "subjects": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn list_rows<F>(conn: &Connection, sql: &str, map: F) -> rusqlite::Result<Vec<serde_json::Value>>
where
    F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], map)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
