
use serde_json::json;
use test_support::{enroll_student, enter_mark, request_ok, seed_workspace, spawn_sidecar, temp_dir};

#[test]
fn ranks_are_total_order_with_student_id_tiebreak() {
    let workspace = temp_dir("schoold-rank-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace, 9);

    let s1 = enroll_student(&mut stdin, &mut reader, "1", &seed, "Amal", "Abebe", "S001");
    let s2 = enroll_student(&mut stdin, &mut reader, "2", &seed, "Binta", "Bekele", "S002");
    let s3 = enroll_student(&mut stdin, &mut reader, "3", &seed, "Chala", "Chane", "S003");

    // s1 and s2 both average exactly 75.0; s3 averages 60.
    enter_mark(&mut stdin, &mut reader, "4", &seed, &s1, 1, "midterm", 80.0);
    enter_mark(&mut stdin, &mut reader, "5", &seed, &s1, 1, "final", 70.0);
    enter_mark(&mut stdin, &mut reader, "6", &seed, &s2, 1, "midterm", 75.0);
    enter_mark(&mut stdin, &mut reader, "7", &seed, &s2, 1, "final", 75.0);
    enter_mark(&mut stdin, &mut reader, "8", &seed, &s3, 1, "midterm", 60.0);

    let scope = json!({
        "gradeId": seed.grade_id,
        "sectionId": seed.section_id,
        "subjectId": seed.subject_id,
        "academicYearId": seed.year_id,
        "semester": 1,
    });
    let computed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "rankings.compute",
        scope.clone(),
    );
    let rows = computed
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows");
    assert_eq!(rows.len(), 3);

    let positions: Vec<i64> = rows
        .iter()
        .map(|r| r.get("rankPosition").and_then(|v| v.as_i64()).expect("rank"))
        .collect();
    assert_eq!(positions, vec![1, 2, 3]);

    // The 75.0 tie must resolve by ascending student id, never a shared rank.
    let mut tied = vec![s1.clone(), s2.clone()];
    tied.sort();
    assert_eq!(rows[0].get("studentId").and_then(|v| v.as_str()), Some(tied[0].as_str()));
    assert_eq!(rows[1].get("studentId").and_then(|v| v.as_str()), Some(tied[1].as_str()));
    assert_eq!(rows[2].get("studentId").and_then(|v| v.as_str()), Some(s3.as_str()));

    let summary = computed.get("summary").expect("summary");
    assert_eq!(summary.get("studentCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(summary.get("highestScore").and_then(|v| v.as_f64()), Some(75.0));
    let histogram_total: u64 = summary
        .get("histogram")
        .and_then(|v| v.as_array())
        .expect("histogram")
        .iter()
        .map(|b| b.get("count").and_then(|v| v.as_u64()).expect("count"))
        .sum();
    assert_eq!(histogram_total, 3);

    // Recomputing with unchanged marks must reproduce the snapshot exactly.
    let recomputed = request_ok(&mut stdin, &mut reader, "10", "rankings.compute", scope.clone());
    let strip = |rows: &[serde_json::Value]| -> Vec<(String, i64, f64, i64, String)> {
        rows.iter()
            .map(|r| {
                (
                    r.get("studentId").and_then(|v| v.as_str()).unwrap().to_string(),
                    r.get("rankPosition").and_then(|v| v.as_i64()).unwrap(),
                    r.get("averageScore").and_then(|v| v.as_f64()).unwrap(),
                    r.get("totalMarks").and_then(|v| v.as_i64()).unwrap(),
                    r.get("trend").and_then(|v| v.as_str()).unwrap().to_string(),
                )
            })
            .collect()
    };
    let rows2 = recomputed
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows");
    assert_eq!(strip(&rows), strip(&rows2));
    assert_eq!(computed.get("summary"), recomputed.get("summary"));

    // The snapshot was replaced, not appended: the read-back has exactly 3 rows.
    let persisted = request_ok(&mut stdin, &mut reader, "11", "rankings.get", scope);
    let persisted_rows = persisted
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows");
    assert_eq!(persisted_rows.len(), 3);
    assert_eq!(strip(&rows), strip(&persisted_rows));
}
