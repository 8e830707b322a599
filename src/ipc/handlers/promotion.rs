use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct GradeInfo {
    id: String,
    name: String,
    level: i64,
}

#[derive(Debug, Clone)]
struct ClassifiedStudent {
    student_id: String,
    grade_id: String,
    status: calc::PromotionStatus,
}

struct Classification {
    grades: Vec<GradeInfo>,
    students: Vec<ClassifiedStudent>,
    tallies: BTreeMap<i64, calc::GradeTally>,
}

fn parse_thresholds(req: &Request) -> Result<calc::PromotionThresholds, serde_json::Value> {
    let mut thresholds = calc::PromotionThresholds::default();
    if let Some(v) = optional_f64(req, "promoteMin")? {
        thresholds.promote_min = v;
    }
    if let Some(v) = optional_f64(req, "borderlineMin")? {
        thresholds.borderline_min = v;
    }
    thresholds
        .validate()
        .map_err(|e| err(&req.id, &e.code, e.message, None))?;
    Ok(thresholds)
}

/// Classify every enrolled student by year average across all subjects and
/// semesters. A student with no marks for the year has an undefined average
/// and is classified borderline for manual review.
fn classify_year(
    conn: &Connection,
    year_id: &str,
    thresholds: calc::PromotionThresholds,
) -> Result<Classification, calc::CalcError> {
    let mut grades_stmt = conn
        .prepare("SELECT id, name, level FROM grade_levels ORDER BY level")
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    let grades: Vec<GradeInfo> = grades_stmt
        .query_map([], |r| {
            Ok(GradeInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                level: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.grade_id, AVG(m.score)
             FROM students s
             LEFT JOIN marks m ON m.student_id = s.id AND m.academic_year_id = ?
             WHERE s.status = 'enrolled'
             GROUP BY s.id
             ORDER BY s.id",
        )
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([year_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| calc::CalcError::new("db_query_failed", e.to_string()))?;

    let mut tallies: BTreeMap<i64, calc::GradeTally> = BTreeMap::new();
    let level_by_grade: BTreeMap<&str, i64> =
        grades.iter().map(|g| (g.id.as_str(), g.level)).collect();
    let mut students = Vec::with_capacity(rows.len());
    for (student_id, grade_id, average) in rows {
        let status = calc::classify_average(average, thresholds);
        if let Some(level) = level_by_grade.get(grade_id.as_str()) {
            tallies.entry(*level).or_default().add(status);
        }
        students.push(ClassifiedStudent {
            student_id,
            grade_id,
            status,
        });
    }

    Ok(Classification {
        grades,
        students,
        tallies,
    })
}

fn report_json(classification: &Classification) -> serde_json::Value {
    let mut per_grade = Vec::new();
    let mut totals = calc::GradeTally::default();
    for g in &classification.grades {
        let tally = classification
            .tallies
            .get(&g.level)
            .cloned()
            .unwrap_or_default();
        totals.eligible += tally.eligible;
        totals.borderline += tally.borderline;
        totals.repeat_count += tally.repeat_count;
        per_grade.push(json!({
            "gradeId": g.id,
            "gradeName": g.name,
            "level": g.level,
            "tally": tally,
        }));
    }
    json!({ "perGrade": per_grade, "totals": totals })
}

fn handle_promotion_dry_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let thresholds = match parse_thresholds(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM academic_years WHERE id = ?",
        &year_id,
        "academic year",
    ) {
        return e;
    }

    match classify_year(conn, &year_id, thresholds) {
        Ok(c) => {
            let mut result = report_json(&c);
            result["dryRun"] = json!(true);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_promotion_execute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let thresholds = match parse_thresholds(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let expected_eligible = match req.params.get("expectedEligible") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n as usize),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "expectedEligible must be a non-negative integer",
                    None,
                )
            }
        },
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM academic_years WHERE id = ?",
        &year_id,
        "academic year",
    ) {
        return e;
    }

    // The marker commits on its own, before the batch. A crash mid-batch
    // leaves it in place, and further executes for the year are rejected
    // until a registrar releases it with promotion.abort.
    let run_id = db::new_id();
    let marker = conn.execute(
        "INSERT INTO promotion_runs(id, academic_year_id, status, promote_min,
                                    borderline_min, started_at)
         VALUES(?, ?, 'in_progress', ?, ?, ?)",
        (
            &run_id,
            &year_id,
            thresholds.promote_min,
            thresholds.borderline_min,
            db::now_iso(),
        ),
    );
    if let Err(e) = marker {
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                return err(
                    &req.id,
                    "conflict",
                    "a promotion run is already in progress for this year",
                    Some(json!({ "academicYearId": year_id })),
                );
            }
        }
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    match execute_batch(conn, req, &run_id, &year_id, thresholds, expected_eligible) {
        Ok(resp) => resp,
        Err(failure) => {
            // Batch rolled back; record the failure on the still-live marker.
            let _ = conn.execute(
                "UPDATE promotion_runs SET error = ? WHERE id = ?",
                (&failure.message, &run_id),
            );
            err(
                &req.id,
                "tx_failed",
                failure.message,
                Some(json!({
                    "runId": run_id,
                    "attemptedCount": failure.attempted,
                })),
            )
        }
    }
}

struct BatchFailure {
    message: String,
    attempted: usize,
}

impl BatchFailure {
    fn new(message: impl Into<String>, attempted: usize) -> Self {
        Self {
            message: message.into(),
            attempted,
        }
    }
}

/// One transaction for the whole batch: every eligible student moves to the
/// next grade (or graduates from the top grade) or none do.
fn execute_batch(
    conn: &Connection,
    req: &Request,
    run_id: &str,
    year_id: &str,
    thresholds: calc::PromotionThresholds,
    expected_eligible: Option<usize>,
) -> Result<serde_json::Value, BatchFailure> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| BatchFailure::new(e.to_string(), 0))?;

    let classification = classify_year(&tx, year_id, thresholds)
        .map_err(|e| BatchFailure::new(e.message, 0))?;

    let grade_by_level: BTreeMap<i64, &GradeInfo> = classification
        .grades
        .iter()
        .map(|g| (g.level, g))
        .collect();
    let level_by_grade: BTreeMap<&str, i64> = classification
        .grades
        .iter()
        .map(|g| (g.id.as_str(), g.level))
        .collect();

    let eligible: Vec<&ClassifiedStudent> = classification
        .students
        .iter()
        .filter(|s| s.status == calc::PromotionStatus::Eligible)
        .collect();
    let attempted = eligible.len();

    let mut promoted = 0usize;
    let mut graduated = 0usize;
    let now = db::now_iso();
    for s in &eligible {
        let Some(level) = level_by_grade.get(s.grade_id.as_str()) else {
            return Err(BatchFailure::new(
                format!("student {} has an unknown grade", s.student_id),
                attempted,
            ));
        };
        match grade_by_level.get(&(level + 1)) {
            Some(next) => {
                tx.execute(
                    "UPDATE students SET grade_id = ?, section_id = NULL, updated_at = ?
                     WHERE id = ?",
                    (&next.id, &now, &s.student_id),
                )
                .map_err(|e| BatchFailure::new(e.to_string(), attempted))?;
                promoted += 1;
            }
            None => {
                // Top of the ladder: the student graduates out.
                tx.execute(
                    "UPDATE students SET status = 'graduated', updated_at = ? WHERE id = ?",
                    (&now, &s.student_id),
                )
                .map_err(|e| BatchFailure::new(e.to_string(), attempted))?;
                graduated += 1;
            }
        }
    }

    // Dry-run confirmation contract: the caller approved a specific eligible
    // count; any drift since then voids the batch.
    if let Some(expected) = expected_eligible {
        if expected != attempted {
            return Err(BatchFailure::new(
                format!(
                    "eligible count changed since dry run: expected {}, found {}",
                    expected, attempted
                ),
                attempted,
            ));
        }
    }

    let mut totals = calc::GradeTally::default();
    for tally in classification.tallies.values() {
        totals.eligible += tally.eligible;
        totals.borderline += tally.borderline;
        totals.repeat_count += tally.repeat_count;
    }

    tx.execute(
        "UPDATE promotion_runs
         SET status = 'committed', eligible_count = ?, borderline_count = ?,
             repeat_count = ?, promoted_count = ?, graduated_count = ?, finished_at = ?
         WHERE id = ?",
        (
            totals.eligible as i64,
            totals.borderline as i64,
            totals.repeat_count as i64,
            promoted as i64,
            graduated as i64,
            &now,
            run_id,
        ),
    )
    .map_err(|e| BatchFailure::new(e.to_string(), attempted))?;

    tx.execute(
        "INSERT INTO notifications(id, kind, recipient, subject, body, created_at, status)
         VALUES(?, 'promotion.completed', NULL, 'Promotion completed', ?, ?, 'pending')",
        (
            db::new_id(),
            format!(
                "Promotion run {}: {} promoted, {} graduated, {} held for review, {} repeating.",
                run_id, promoted, graduated, totals.borderline, totals.repeat_count
            ),
            &now,
        ),
    )
    .map_err(|e| BatchFailure::new(e.to_string(), attempted))?;

    tx.commit()
        .map_err(|e| BatchFailure::new(e.to_string(), attempted))?;

    let mut result = report_json(&classification);
    result["dryRun"] = json!(false);
    result["runId"] = json!(run_id);
    result["promotedCount"] = json!(promoted);
    result["graduatedCount"] = json!(graduated);
    Ok(ok(&req.id, result))
}

fn handle_promotion_runs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_filter = match optional_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let base = "SELECT id, academic_year_id, status, promote_min, borderline_min,
                       eligible_count, borderline_count, repeat_count, promoted_count,
                       graduated_count, started_at, finished_at, error
                FROM promotion_runs";
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "academicYearId": r.get::<_, String>(1)?,
            "status": r.get::<_, String>(2)?,
            "promoteMin": r.get::<_, f64>(3)?,
            "borderlineMin": r.get::<_, f64>(4)?,
            "eligibleCount": r.get::<_, i64>(5)?,
            "borderlineCount": r.get::<_, i64>(6)?,
            "repeatCount": r.get::<_, i64>(7)?,
            "promotedCount": r.get::<_, i64>(8)?,
            "graduatedCount": r.get::<_, i64>(9)?,
            "startedAt": r.get::<_, String>(10)?,
            "finishedAt": r.get::<_, Option<String>>(11)?,
            "error": r.get::<_, Option<String>>(12)?,
        }))
    };

    let rows = match year_filter {
        Some(yid) => {
            let sql = format!("{} WHERE academic_year_id = ? ORDER BY started_at DESC", base);
            match conn.prepare(&sql) {
                Ok(mut stmt) => stmt
                    .query_map([&yid], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        None => {
            let sql = format!("{} ORDER BY started_at DESC", base);
            match conn.prepare(&sql) {
                Ok(mut stmt) => stmt
                    .query_map([], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };
    match rows {
        Ok(v) => ok(&req.id, json!({ "runs": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_promotion_abort(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let run_id = match required_str(req, "runId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status: Option<String> = match conn
        .query_row(
            "SELECT status FROM promotion_runs WHERE id = ?",
            [&run_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "promotion run not found", None);
    };
    if status != "in_progress" {
        return err(
            &req.id,
            "conflict",
            format!("run is {}, only in_progress runs can be aborted", status),
            None,
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE promotion_runs SET status = 'aborted', finished_at = ? WHERE id = ?",
        (db::now_iso(), &run_id),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "runId": run_id, "status": "aborted" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.dryRun" => Some(handle_promotion_dry_run(state, req)),
        "promotion.execute" => Some(handle_promotion_execute(state, req)),
        "promotion.runs" => Some(handle_promotion_runs(state, req)),
        "promotion.abort" => Some(handle_promotion_abort(state, req)),
        _ => None,
    }
}
