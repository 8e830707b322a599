use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_f64, required_semester, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

struct RankingScope {
    grade_id: String,
    section_id: String,
    subject_id: String,
    year_id: String,
    semester: i64,
}

fn parse_scope(
    conn: &Connection,
    req: &Request,
) -> Result<RankingScope, serde_json::Value> {
    // Shape checks first, then existence; nothing is read or written on failure.
    let semester = required_semester(req, "semester")?;
    let grade_id = required_str(req, "gradeId")?;
    let section_id = required_str(req, "sectionId")?;
    let subject_id = required_str(req, "subjectId")?;
    let year_id = required_str(req, "academicYearId")?;

    row_exists(
        conn,
        req,
        "SELECT 1 FROM grade_levels WHERE id = ?",
        &grade_id,
        "grade level",
    )?;
    row_exists(
        conn,
        req,
        "SELECT 1 FROM subjects WHERE id = ?",
        &subject_id,
        "subject",
    )?;
    row_exists(
        conn,
        req,
        "SELECT 1 FROM academic_years WHERE id = ?",
        &year_id,
        "academic year",
    )?;
    let section_in_grade: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sections WHERE id = ? AND grade_id = ?",
            (&section_id, &grade_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if section_in_grade.is_none() {
        return Err(err(&req.id, "not_found", "section not found in grade", None));
    }

    Ok(RankingScope {
        grade_id,
        section_id,
        subject_id,
        year_id,
        semester,
    })
}

fn fetch_scope_marks(
    conn: &Connection,
    scope: &RankingScope,
) -> Result<Vec<calc::MarkRow>, calc::CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT m.student_id, m.score
             FROM marks m
             JOIN students s ON s.id = m.student_id
             WHERE s.grade_id = ? AND s.section_id = ? AND s.status = 'enrolled'
               AND m.subject_id = ? AND m.academic_year_id = ? AND m.semester = ?",
        )
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map(
        (
            &scope.grade_id,
            &scope.section_id,
            &scope.subject_id,
            &scope.year_id,
            scope.semester,
        ),
        |r| {
            Ok(calc::MarkRow {
                student_id: r.get(0)?,
                score: r.get(1)?,
            })
        },
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))
}

/// The period immediately before (year, semester): semester 2 looks back to
/// semester 1 of the same year; semester 1 looks back to semester 2 of the
/// year with the next-lower sort_order, when one exists.
fn prior_period(
    conn: &Connection,
    year_id: &str,
    semester: i64,
) -> Result<Option<(String, i64)>, calc::CalcError> {
    if semester == 2 {
        return Ok(Some((year_id.to_string(), 1)));
    }
    let prev: Option<String> = conn
        .query_row(
            "SELECT id FROM academic_years
             WHERE sort_order < (SELECT sort_order FROM academic_years WHERE id = ?)
             ORDER BY sort_order DESC LIMIT 1",
            [year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    Ok(prev.map(|id| (id, 2)))
}

fn prior_averages(
    conn: &Connection,
    subject_id: &str,
    period: Option<&(String, i64)>,
) -> Result<HashMap<String, f64>, calc::CalcError> {
    let Some((year_id, semester)) = period else {
        return Ok(HashMap::new());
    };
    let mut stmt = conn
        .prepare(
            "SELECT student_id, AVG(score)
             FROM marks
             WHERE subject_id = ? AND academic_year_id = ? AND semester = ?
             GROUP BY student_id",
        )
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((subject_id, year_id, semester), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    Ok(rows.into_iter().collect())
}

fn attendance_percentages(
    conn: &Connection,
    year_id: &str,
    semester: i64,
) -> Result<HashMap<String, f64>, calc::CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, present_days, total_days
             FROM attendance_totals
             WHERE academic_year_id = ? AND semester = ?",
        )
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((year_id, semester), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    Ok(rows
        .into_iter()
        .filter(|(_, _, total)| *total > 0)
        .map(|(sid, present, total)| (sid, 100.0 * (present as f64) / (total as f64)))
        .collect())
}

fn handle_rankings_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match parse_scope(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let pass_threshold = match optional_f64(req, "passThreshold") {
        Ok(v) => v.unwrap_or(calc::DEFAULT_PASS_THRESHOLD),
        Err(e) => return e,
    };

    let marks = match fetch_scope_marks(conn, &scope) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let ranked = calc::rank_students(calc::student_averages(&marks));
    let summary = calc::class_summary(&ranked, pass_threshold);

    let prior = match prior_period(conn, &scope.year_id, scope.semester) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let prior_avgs = match prior_averages(conn, &scope.subject_id, prior.as_ref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let attendance = match attendance_percentages(conn, &scope.year_id, scope.semester) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };

    let published_at = db::now_iso();
    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(ranked.len());

    // Replace the snapshot for this scope+period as one transaction so readers
    // never see a half-updated ranking table.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "tx_failed", e.to_string(), None),
    };
    let wiped = tx.execute(
        "DELETE FROM rankings
         WHERE grade_id = ? AND section_id = ? AND subject_id = ?
           AND academic_year_id = ? AND semester = ?",
        (
            &scope.grade_id,
            &scope.section_id,
            &scope.subject_id,
            &scope.year_id,
            scope.semester,
        ),
    );
    if let Err(e) = wiped {
        return err(&req.id, "tx_failed", e.to_string(), None);
    }
    for r in &ranked {
        let trend =
            calc::trend_against_prior(r.average_score, prior_avgs.get(&r.student_id).copied());
        let attendance_pct = attendance.get(&r.student_id).copied();
        let inserted = tx.execute(
            "INSERT INTO rankings(id, grade_id, section_id, subject_id, academic_year_id,
                                  semester, student_id, rank_position, average_score,
                                  total_marks, attendance_percentage, trend, published_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                db::new_id(),
                &scope.grade_id,
                &scope.section_id,
                &scope.subject_id,
                &scope.year_id,
                scope.semester,
                &r.student_id,
                r.rank_position as i64,
                r.average_score,
                r.total_marks as i64,
                attendance_pct,
                trend.as_str(),
                &published_at,
            ),
        );
        if let Err(e) = inserted {
            return err(&req.id, "tx_failed", e.to_string(), None);
        }
        rows.push(json!({
            "studentId": r.student_id,
            "rankPosition": r.rank_position,
            "averageScore": r.average_score,
            "totalMarks": r.total_marks,
            "attendancePercentage": attendance_pct,
            "trend": trend.as_str(),
        }));
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "summary": summary,
            "rows": rows,
            "publishedAt": published_at,
        }),
    )
}

fn handle_rankings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match parse_scope(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT student_id, rank_position, average_score, total_marks,
                attendance_percentage, trend, published_at
         FROM rankings
         WHERE grade_id = ? AND section_id = ? AND subject_id = ?
           AND academic_year_id = ? AND semester = ?
         ORDER BY rank_position",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(
            (
                &scope.grade_id,
                &scope.section_id,
                &scope.subject_id,
                &scope.year_id,
                scope.semester,
            ),
            |r| {
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "rankPosition": r.get::<_, i64>(1)?,
                    "averageScore": r.get::<_, f64>(2)?,
                    "totalMarks": r.get::<_, i64>(3)?,
                    "attendancePercentage": r.get::<_, Option<f64>>(4)?,
                    "trend": r.get::<_, String>(5)?,
                    "publishedAt": r.get::<_, String>(6)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(v) => ok(&req.id, json!({ "rows": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_rankings_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let semester = match required_semester(req, "semester") {
        Ok(v) => v,
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
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM students WHERE id = ?",
        &student_id,
        "student",
    ) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT r.subject_id, sub.code, r.rank_position, r.average_score, r.total_marks,
                r.attendance_percentage, r.trend, r.published_at
         FROM rankings r
         JOIN subjects sub ON sub.id = r.subject_id
         WHERE r.student_id = ? AND r.academic_year_id = ? AND r.semester = ?
         ORDER BY sub.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &year_id, semester), |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
                "rankPosition": r.get::<_, i64>(2)?,
                "averageScore": r.get::<_, f64>(3)?,
                "totalMarks": r.get::<_, i64>(4)?,
                "attendancePercentage": r.get::<_, Option<f64>>(5)?,
                "trend": r.get::<_, String>(6)?,
                "publishedAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(v) => ok(&req.id, json!({ "studentId": student_id, "rows": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rankings.compute" => Some(handle_rankings_compute(state, req)),
        "rankings.get" => Some(handle_rankings_get(state, req)),
        "rankings.student" => Some(handle_rankings_student(state, req)),
        _ => None,
    }
}
