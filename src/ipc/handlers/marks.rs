use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, required_f64, required_i64, required_semester, required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_marks_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_semester(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_type = match required_str(req, "assessmentType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=100.0).contains(&score) {
        return err(
            &req.id,
            "bad_params",
            "score must be in [0,100]",
            Some(json!({ "score": score })),
        );
    }

    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM students WHERE id = ?",
        &student_id,
        "student",
    ) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM subjects WHERE id = ?",
        &subject_id,
        "subject",
    ) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM academic_years WHERE id = ?",
        &year_id,
        "academic year",
    ) {
        return e;
    }

    // At most one mark per identifying tuple; a locked mark is immutable.
    let existing: Option<(String, i64)> = match conn
        .query_row(
            "SELECT id, locked FROM marks
             WHERE student_id = ? AND subject_id = ? AND academic_year_id = ?
               AND semester = ? AND assessment_type = ?",
            (&student_id, &subject_id, &year_id, semester, &assessment_type),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some((_, locked)) if locked != 0 => err(
            &req.id,
            "locked",
            "mark is locked and cannot be changed",
            None,
        ),
        Some((mark_id, _)) => {
            if let Err(e) = conn.execute(
                "UPDATE marks SET score = ?, updated_at = ? WHERE id = ?",
                (score, db::now_iso(), &mark_id),
            ) {
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "markId": mark_id, "updated": true }))
        }
        None => {
            let mark_id = db::new_id();
            if let Err(e) = conn.execute(
                "INSERT INTO marks(id, student_id, subject_id, academic_year_id, semester,
                                   assessment_type, score, locked, recorded_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
                (
                    &mark_id,
                    &student_id,
                    &subject_id,
                    &year_id,
                    semester,
                    &assessment_type,
                    score,
                    db::now_iso(),
                ),
            ) {
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "markId": mark_id, "updated": false }))
        }
    }
}

fn handle_marks_lock(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_semester(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match optional_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let locked = match student_id {
        Some(sid) => conn.execute(
            "UPDATE marks SET locked = 1
             WHERE student_id = ? AND subject_id = ? AND academic_year_id = ? AND semester = ?",
            (&sid, &subject_id, &year_id, semester),
        ),
        None => conn.execute(
            "UPDATE marks SET locked = 1
             WHERE subject_id = ? AND academic_year_id = ? AND semester = ?",
            (&subject_id, &year_id, semester),
        ),
    };
    match locked {
        Ok(n) => ok(&req.id, json!({ "lockedCount": n })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match optional_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match optional_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match req.params.get("semester") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(_) => match required_semester(req, "semester") {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
    };

    let mut sql = String::from(
        "SELECT id, student_id, subject_id, academic_year_id, semester, assessment_type,
                score, locked, recorded_at, updated_at
         FROM marks WHERE academic_year_id = ?",
    );
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(year_id.clone())];
    if let Some(s) = &student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(rusqlite::types::Value::Text(s.clone()));
    }
    if let Some(s) = &subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(rusqlite::types::Value::Text(s.clone()));
    }
    if let Some(sem) = semester {
        sql.push_str(" AND semester = ?");
        binds.push(rusqlite::types::Value::Integer(sem));
    }
    sql.push_str(" ORDER BY student_id, subject_id, semester, assessment_type");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "academicYearId": r.get::<_, String>(3)?,
                "semester": r.get::<_, i64>(4)?,
                "assessmentType": r.get::<_, String>(5)?,
                "score": r.get::<_, f64>(6)?,
                "locked": r.get::<_, i64>(7)? != 0,
                "recordedAt": r.get::<_, String>(8)?,
                "updatedAt": r.get::<_, Option<String>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(v) => ok(&req.id, json!({ "marks": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_attendance_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_semester(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let present_days = match required_i64(req, "presentDays") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total_days = match required_i64(req, "totalDays") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if present_days < 0 || total_days < 0 || present_days > total_days {
        return err(
            &req.id,
            "bad_params",
            "presentDays must be within [0, totalDays]",
            None,
        );
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM students WHERE id = ?",
        &student_id,
        "student",
    ) {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM academic_years WHERE id = ?",
        &year_id,
        "academic year",
    ) {
        return e;
    }

    if let Err(e) = conn.execute(
        "INSERT INTO attendance_totals(student_id, academic_year_id, semester, present_days, total_days)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, academic_year_id, semester)
         DO UPDATE SET present_days = excluded.present_days, total_days = excluded.total_days",
        (&student_id, &year_id, semester, present_days, total_days),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id, "semester": semester }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enter" => Some(handle_marks_enter(state, req)),
        "marks.lock" => Some(handle_marks_lock(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        "attendance.set" => Some(handle_attendance_set(state, req)),
        _ => None,
    }
}
