use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("school.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_levels(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            level INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grade_levels(id),
            UNIQUE(grade_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_grade ON sections(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            student_no TEXT NOT NULL UNIQUE,
            grade_id TEXT NOT NULL,
            section_id TEXT,
            guardian_name TEXT,
            guardian_email TEXT,
            status TEXT NOT NULL DEFAULT 'enrolled',
            enrolled_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(grade_id) REFERENCES grade_levels(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            assessment_type TEXT NOT NULL,
            score REAL NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(student_id, subject_id, academic_year_id, semester, assessment_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_scope ON marks(subject_id, academic_year_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_year ON marks(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_totals(
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            present_days INTEGER NOT NULL,
            total_days INTEGER NOT NULL,
            PRIMARY KEY(student_id, academic_year_id, semester),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rankings(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            student_id TEXT NOT NULL,
            rank_position INTEGER NOT NULL,
            average_score REAL NOT NULL,
            total_marks INTEGER NOT NULL,
            attendance_percentage REAL,
            trend TEXT NOT NULL,
            published_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grade_levels(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, subject_id, academic_year_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rankings_scope
         ON rankings(grade_id, section_id, subject_id, academic_year_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rankings_student ON rankings(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_runs(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            status TEXT NOT NULL,
            promote_min REAL NOT NULL,
            borderline_min REAL NOT NULL,
            eligible_count INTEGER NOT NULL DEFAULT 0,
            borderline_count INTEGER NOT NULL DEFAULT 0,
            repeat_count INTEGER NOT NULL DEFAULT 0,
            promoted_count INTEGER NOT NULL DEFAULT 0,
            graduated_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            error TEXT,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    // Serializes promotion: at most one live run per year. A stale marker must
    // be released via promotion.abort before another execute is accepted.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_promotion_runs_in_progress
         ON promotion_runs(academic_year_id) WHERE status = 'in_progress'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_promotion_runs_year ON promotion_runs(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            recipient TEXT,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status)",
        [],
    )?;

    Ok(conn)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Queue an outbox row. Delivery belongs to the host application; the daemon
/// only records that a notification is owed.
pub fn notifications_enqueue(
    conn: &Connection,
    kind: &str,
    recipient: Option<&str>,
    subject: &str,
    body: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO notifications(id, kind, recipient, subject, body, created_at, status)
         VALUES(?, ?, ?, ?, ?, ?, 'pending')",
        (new_id(), kind, recipient, subject, body, now_iso()),
    )?;
    Ok(())
}
