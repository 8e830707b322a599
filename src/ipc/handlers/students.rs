use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_no = match required_str(req, "studentNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = match optional_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let guardian_name = match optional_str(req, "guardianName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let guardian_email = match optional_str(req, "guardianEmail") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM grade_levels WHERE id = ?",
        &grade_id,
        "grade level",
    ) {
        return e;
    }
    if let Some(sid) = &section_id {
        // The section must belong to the enrolling grade.
        let belongs: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM sections WHERE id = ? AND grade_id = ?",
                (sid, &grade_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if belongs.is_none() {
            return err(&req.id, "not_found", "section not found in grade", None);
        }
    }

    let id = db::new_id();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, last_name, student_no, grade_id, section_id,
                              guardian_name, guardian_email, status, enrolled_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'enrolled', ?)",
        (
            &id,
            &first_name,
            &last_name,
            &student_no,
            &grade_id,
            &section_id,
            &guardian_name,
            &guardian_email,
            &now,
        ),
    ) {
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                return err(
                    &req.id,
                    "conflict",
                    "studentNo already enrolled",
                    Some(json!({ "studentNo": student_no })),
                );
            }
        }
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    // New account owes a notification; delivery is the host's job.
    let _ = db::notifications_enqueue(
        conn,
        "student.enrolled",
        guardian_email.as_deref(),
        "Enrollment confirmed",
        &format!("{} {} ({}) has been enrolled.", first_name, last_name, student_no),
    );

    ok(&req.id, json!({ "studentId": id, "studentNo": student_no }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = match optional_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match optional_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut sql = String::from(
        "SELECT id, first_name, last_name, student_no, grade_id, section_id,
                guardian_name, guardian_email, status, enrolled_at, updated_at
         FROM students WHERE 1=1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(g) = &grade_id {
        sql.push_str(" AND grade_id = ?");
        binds.push(g.clone());
    }
    if let Some(s) = &section_id {
        sql.push_str(" AND section_id = ?");
        binds.push(s.clone());
    }
    if let Some(st) = &status {
        sql.push_str(" AND status = ?");
        binds.push(st.clone());
    }
    sql.push_str(" ORDER BY last_name, first_name, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "studentNo": r.get::<_, String>(3)?,
                "gradeId": r.get::<_, String>(4)?,
                "sectionId": r.get::<_, Option<String>>(5)?,
                "guardianName": r.get::<_, Option<String>>(6)?,
                "guardianEmail": r.get::<_, Option<String>>(7)?,
                "status": r.get::<_, String>(8)?,
                "enrolledAt": r.get::<_, String>(9)?,
                "updatedAt": r.get::<_, Option<String>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(v) => ok(&req.id, json!({ "students": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id: Option<String> = match conn
        .query_row("SELECT grade_id FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(grade_id) = grade_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let section_id = match optional_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let guardian_name = match optional_str(req, "guardianName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let guardian_email = match optional_str(req, "guardianEmail") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Some(sid) = &section_id {
        let belongs: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM sections WHERE id = ? AND grade_id = ?",
                (sid, &grade_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if belongs.is_none() {
            return err(&req.id, "not_found", "section not found in grade", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET section_id = ?, updated_at = ? WHERE id = ?",
            (sid, db::now_iso(), &student_id),
        ) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    if let Some(name) = &guardian_name {
        if let Err(e) = conn.execute(
            "UPDATE students SET guardian_name = ?, updated_at = ? WHERE id = ?",
            (name, db::now_iso(), &student_id),
        ) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    if let Some(email) = &guardian_email {
        if let Err(e) = conn.execute(
            "UPDATE students SET guardian_email = ?, updated_at = ? WHERE id = ?",
            (email, db::now_iso(), &student_id),
        ) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}
