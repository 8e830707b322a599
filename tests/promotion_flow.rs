
use serde_json::json;
use test_support::{
    enroll_student, enter_mark, request_ok, seed_workspace, spawn_sidecar, temp_dir,
};

fn grade_tally(report: &serde_json::Value, grade_id: &str) -> serde_json::Value {
    report
        .get("perGrade")
        .and_then(|v| v.as_array())
        .expect("perGrade")
        .iter()
        .find(|g| g.get("gradeId").and_then(|v| v.as_str()) == Some(grade_id))
        .and_then(|g| g.get("tally"))
        .cloned()
        .expect("tally")
}

fn student_field(students: &serde_json::Value, student_id: &str, field: &str) -> serde_json::Value {
    students
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(student_id))
        .and_then(|s| s.get(field))
        .cloned()
        .expect("field")
}

#[test]
fn dry_run_classifies_and_execute_moves_only_eligible() {
    let workspace = temp_dir("schoold-promotion-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace, 9);
    let grade10 = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.create",
        json!({ "name": "Grade 10", "level": 10 }),
    );
    let grade10_id = grade10
        .get("gradeId")
        .and_then(|v| v.as_str())
        .expect("gradeId")
        .to_string();

    let passing = enroll_student(&mut stdin, &mut reader, "2", &seed, "Pass", "High", "S001");
    let border = enroll_student(&mut stdin, &mut reader, "3", &seed, "Border", "Line", "S002");
    let repeating = enroll_student(&mut stdin, &mut reader, "4", &seed, "Re", "Peat", "S003");

    // Year averages 72 / 48 / 30 against thresholds (50, 45).
    enter_mark(&mut stdin, &mut reader, "5", &seed, &passing, 1, "final", 72.0);
    enter_mark(&mut stdin, &mut reader, "6", &seed, &border, 1, "final", 48.0);
    enter_mark(&mut stdin, &mut reader, "7", &seed, &repeating, 1, "final", 30.0);

    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "promotion.dryRun",
        json!({ "academicYearId": seed.year_id }),
    );
    assert_eq!(dry.get("dryRun").and_then(|v| v.as_bool()), Some(true));
    let tally = grade_tally(&dry, &seed.grade_id);
    assert_eq!(tally.get("eligible").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(tally.get("borderline").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(tally.get("repeat").and_then(|v| v.as_u64()), Some(1));

    // A student with no marks for the year is borderline, never auto-decided.
    let unmarked = enroll_student(&mut stdin, &mut reader, "9", &seed, "No", "Marks", "S004");
    let dry2 = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "promotion.dryRun",
        json!({ "academicYearId": seed.year_id }),
    );
    let tally2 = grade_tally(&dry2, &seed.grade_id);
    assert_eq!(tally2.get("borderline").and_then(|v| v.as_u64()), Some(2));

    // Dry run changed nothing.
    let before = request_ok(&mut stdin, &mut reader, "11", "students.list", json!({}));
    for sid in [&passing, &border, &repeating, &unmarked] {
        assert_eq!(
            student_field(&before, sid, "gradeId").as_str(),
            Some(seed.grade_id.as_str())
        );
    }

    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "promotion.execute",
        json!({ "academicYearId": seed.year_id, "expectedEligible": 1 }),
    );
    assert_eq!(executed.get("promotedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(executed.get("graduatedCount").and_then(|v| v.as_u64()), Some(0));

    let after = request_ok(&mut stdin, &mut reader, "13", "students.list", json!({}));
    assert_eq!(
        student_field(&after, &passing, "gradeId").as_str(),
        Some(grade10_id.as_str())
    );
    // Promotion clears the section pending registrar assignment.
    assert!(student_field(&after, &passing, "sectionId").is_null());
    for sid in [&border, &repeating, &unmarked] {
        assert_eq!(
            student_field(&after, sid, "gradeId").as_str(),
            Some(seed.grade_id.as_str())
        );
    }

    // A committed run releases the marker; the promotion emits a notification.
    let runs = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "promotion.runs",
        json!({ "academicYearId": seed.year_id }),
    );
    let run_statuses: Vec<&str> = runs
        .get("runs")
        .and_then(|v| v.as_array())
        .expect("runs")
        .iter()
        .map(|r| r.get("status").and_then(|v| v.as_str()).expect("status"))
        .collect();
    assert_eq!(run_statuses, vec!["committed"]);

    let notifications = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "notifications.list",
        json!({ "status": "pending" }),
    );
    let kinds: Vec<&str> = notifications
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications")
        .iter()
        .map(|n| n.get("kind").and_then(|v| v.as_str()).expect("kind"))
        .collect();
    assert!(kinds.contains(&"promotion.completed"));
    assert!(kinds.contains(&"student.enrolled"));
}

#[test]
fn eligible_students_at_top_grade_graduate() {
    let workspace = temp_dir("schoold-promotion-graduate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    // Only one grade exists, so there is no level above it.
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace, 12);

    let finishing = enroll_student(&mut stdin, &mut reader, "1", &seed, "Grad", "Uate", "S001");
    enter_mark(&mut stdin, &mut reader, "2", &seed, &finishing, 1, "final", 85.0);
    enter_mark(&mut stdin, &mut reader, "3", &seed, &finishing, 2, "final", 90.0);

    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "promotion.execute",
        json!({ "academicYearId": seed.year_id }),
    );
    assert_eq!(executed.get("promotedCount").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(executed.get("graduatedCount").and_then(|v| v.as_u64()), Some(1));

    let students = request_ok(&mut stdin, &mut reader, "5", "students.list", json!({}));
    assert_eq!(
        student_field(&students, &finishing, "status").as_str(),
        Some("graduated")
    );

    // Graduated students leave the enrolled pool for future runs.
    let dry = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "promotion.dryRun",
        json!({ "academicYearId": seed.year_id }),
    );
    let totals = dry.get("totals").expect("totals");
    assert_eq!(totals.get("eligible").and_then(|v| v.as_u64()), Some(0));
}
