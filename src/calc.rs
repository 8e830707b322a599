use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Trend comparisons ignore average movements at or below this epsilon.
pub const TREND_EPSILON: f64 = 0.01;

/// Default class pass threshold (percent average).
pub const DEFAULT_PASS_THRESHOLD: f64 = 50.0;

/// Histogram bucket labels, low bound inclusive, high bound inclusive.
/// Scores live in [0,100] so the last bucket closes at 100.
pub const HISTOGRAM_BUCKETS: [(&str, f64, f64); 6] = [
    ("0-49", 0.0, 49.0),
    ("50-59", 50.0, 59.0),
    ("60-69", 60.0, 69.0),
    ("70-79", 70.0, 79.0),
    ("80-89", 80.0, 89.0),
    ("90-100", 90.0, 100.0),
];

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One stored mark, reduced to what the aggregations need.
#[derive(Debug, Clone)]
pub struct MarkRow {
    pub student_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentAverage {
    pub student_id: String,
    pub average_score: f64,
    pub total_marks: usize,
}

/// Group marks by student and take the mean score per group.
/// Output is keyed order (student id ascending) before ranking sorts it.
pub fn student_averages(rows: &[MarkRow]) -> Vec<StudentAverage> {
    let mut by_student: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let entry = by_student.entry(row.student_id.as_str()).or_insert((0.0, 0));
        entry.0 += row.score;
        entry.1 += 1;
    }
    by_student
        .into_iter()
        .map(|(student_id, (sum, count))| StudentAverage {
            student_id: student_id.to_string(),
            average_score: sum / (count as f64),
            total_marks: count,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Stable,
    Down,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Stable => "stable",
            Trend::Down => "down",
        }
    }
}

/// Direction of a student's average against the immediately preceding period.
/// Missing prior data reads as stable, never as movement.
pub fn trend_against_prior(current: f64, prior: Option<f64>) -> Trend {
    let Some(prior) = prior else {
        return Trend::Stable;
    };
    let delta = current - prior;
    if delta > TREND_EPSILON {
        Trend::Up
    } else if delta < -TREND_EPSILON {
        Trend::Down
    } else {
        Trend::Stable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedStudent {
    pub student_id: String,
    pub rank_position: usize,
    pub average_score: f64,
    pub total_marks: usize,
}

/// Assign rank positions 1..N: average descending, equal averages broken by
/// student id ascending so the ordering is total and reproducible.
pub fn rank_students(mut averages: Vec<StudentAverage>) -> Vec<RankedStudent> {
    averages.sort_by(|a, b| {
        b.average_score
            .partial_cmp(&a.average_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    averages
        .into_iter()
        .enumerate()
        .map(|(i, s)| RankedStudent {
            student_id: s.student_id,
            rank_position: i + 1,
            average_score: s.average_score,
            total_marks: s.total_marks,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketCount {
    pub range: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub student_count: usize,
    pub class_average: f64,
    pub highest_score: Option<f64>,
    pub pass_rate: f64,
    pub histogram: Vec<BucketCount>,
}

fn bucket_index(average: f64) -> usize {
    for (i, (_, low, high)) in HISTOGRAM_BUCKETS.iter().enumerate() {
        if average >= *low && average <= *high {
            return i;
        }
    }
    // Averages of in-range scores land between bucket closes (e.g. 49.5);
    // they belong to the bucket whose low bound they clear.
    HISTOGRAM_BUCKETS
        .iter()
        .rposition(|(_, low, _)| average >= *low)
        .unwrap_or(0)
}

/// Class-level rollup over ranked students. An empty ranking yields a zeroed
/// summary with a null highest score; that is a valid result, not an error.
pub fn class_summary(ranked: &[RankedStudent], pass_threshold: f64) -> ClassSummary {
    let mut histogram: Vec<BucketCount> = HISTOGRAM_BUCKETS
        .iter()
        .map(|(range, _, _)| BucketCount {
            range: range.to_string(),
            count: 0,
        })
        .collect();

    if ranked.is_empty() {
        return ClassSummary {
            student_count: 0,
            class_average: 0.0,
            highest_score: None,
            pass_rate: 0.0,
            histogram,
        };
    }

    let mut sum = 0.0;
    let mut highest = f64::MIN;
    let mut passed = 0usize;
    for s in ranked {
        sum += s.average_score;
        if s.average_score > highest {
            highest = s.average_score;
        }
        // Pass rate is the direct threshold count over the class; the legacy
        // bucket-residual formula is not reproduced.
        if s.average_score >= pass_threshold {
            passed += 1;
        }
        histogram[bucket_index(s.average_score)].count += 1;
    }

    let n = ranked.len();
    ClassSummary {
        student_count: n,
        class_average: sum / (n as f64),
        highest_score: Some(highest),
        pass_rate: (passed as f64) / (n as f64),
        histogram,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionThresholds {
    pub promote_min: f64,
    pub borderline_min: f64,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self {
            promote_min: 50.0,
            borderline_min: 45.0,
        }
    }
}

impl PromotionThresholds {
    pub fn validate(&self) -> Result<(), CalcError> {
        if !self.promote_min.is_finite() || !self.borderline_min.is_finite() {
            return Err(CalcError::new("bad_params", "thresholds must be finite"));
        }
        if self.borderline_min > self.promote_min {
            return Err(CalcError::new(
                "bad_params",
                "borderlineMin must not exceed promoteMin",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionStatus {
    Eligible,
    Borderline,
    Repeat,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Eligible => "eligible",
            PromotionStatus::Borderline => "borderline",
            PromotionStatus::Repeat => "repeat",
        }
    }
}

/// Classify a year average against the threshold band. A student with no
/// marks has an undefined average and always lands in borderline: promotion
/// and retention both require marks or a human decision.
pub fn classify_average(
    average: Option<f64>,
    thresholds: PromotionThresholds,
) -> PromotionStatus {
    match average {
        None => PromotionStatus::Borderline,
        Some(avg) if avg >= thresholds.promote_min => PromotionStatus::Eligible,
        Some(avg) if avg >= thresholds.borderline_min => PromotionStatus::Borderline,
        Some(_) => PromotionStatus::Repeat,
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeTally {
    pub eligible: usize,
    pub borderline: usize,
    #[serde(rename = "repeat")]
    pub repeat_count: usize,
}

impl GradeTally {
    pub fn add(&mut self, status: PromotionStatus) {
        match status {
            PromotionStatus::Eligible => self.eligible += 1,
            PromotionStatus::Borderline => self.borderline += 1,
            PromotionStatus::Repeat => self.repeat_count += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(student: &str, score: f64) -> MarkRow {
        MarkRow {
            student_id: student.to_string(),
            score,
        }
    }

    #[test]
    fn averages_group_per_student() {
        let rows = vec![
            mark("s1", 80.0),
            mark("s2", 40.0),
            mark("s1", 60.0),
            mark("s2", 50.0),
            mark("s1", 70.0),
        ];
        let avgs = student_averages(&rows);
        assert_eq!(avgs.len(), 2);
        assert_eq!(avgs[0].student_id, "s1");
        assert!((avgs[0].average_score - 70.0).abs() < 1e-9);
        assert_eq!(avgs[0].total_marks, 3);
        assert!((avgs[1].average_score - 45.0).abs() < 1e-9);
        assert_eq!(avgs[1].total_marks, 2);
    }

    #[test]
    fn rank_positions_are_one_to_n_with_id_tiebreak() {
        let ranked = rank_students(vec![
            StudentAverage {
                student_id: "s-b".to_string(),
                average_score: 75.0,
                total_marks: 2,
            },
            StudentAverage {
                student_id: "s-c".to_string(),
                average_score: 60.0,
                total_marks: 2,
            },
            StudentAverage {
                student_id: "s-a".to_string(),
                average_score: 75.0,
                total_marks: 2,
            },
        ]);
        let order: Vec<(&str, usize)> = ranked
            .iter()
            .map(|r| (r.student_id.as_str(), r.rank_position))
            .collect();
        // Exactly equal averages share nothing: id ascending breaks the tie.
        assert_eq!(order, vec![("s-a", 1), ("s-b", 2), ("s-c", 3)]);
    }

    #[test]
    fn ranking_is_deterministic_across_input_orders() {
        let a = vec![
            StudentAverage {
                student_id: "x".to_string(),
                average_score: 50.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "y".to_string(),
                average_score: 50.0,
                total_marks: 1,
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(rank_students(a), rank_students(b));
    }

    #[test]
    fn trend_respects_epsilon() {
        assert_eq!(trend_against_prior(70.0, None), Trend::Stable);
        assert_eq!(trend_against_prior(70.0, Some(70.0)), Trend::Stable);
        assert_eq!(trend_against_prior(70.005, Some(70.0)), Trend::Stable);
        assert_eq!(trend_against_prior(70.02, Some(70.0)), Trend::Up);
        assert_eq!(trend_against_prior(69.98, Some(70.0)), Trend::Down);
    }

    #[test]
    fn summary_counts_pass_rate_directly() {
        let ranked = rank_students(vec![
            StudentAverage {
                student_id: "a".to_string(),
                average_score: 92.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "b".to_string(),
                average_score: 50.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "c".to_string(),
                average_score: 49.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "d".to_string(),
                average_score: 31.0,
                total_marks: 1,
            },
        ]);
        let summary = class_summary(&ranked, DEFAULT_PASS_THRESHOLD);
        assert_eq!(summary.student_count, 4);
        assert!((summary.pass_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.highest_score, Some(92.0));
        assert!((summary.class_average - 55.5).abs() < 1e-9);
    }

    #[test]
    fn histogram_buckets_cover_all_students() {
        let ranked = rank_students(vec![
            StudentAverage {
                student_id: "a".to_string(),
                average_score: 0.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "b".to_string(),
                average_score: 49.5,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "c".to_string(),
                average_score: 50.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "d".to_string(),
                average_score: 89.0,
                total_marks: 1,
            },
            StudentAverage {
                student_id: "e".to_string(),
                average_score: 100.0,
                total_marks: 1,
            },
        ]);
        let summary = class_summary(&ranked, DEFAULT_PASS_THRESHOLD);
        let total: usize = summary.histogram.iter().map(|b| b.count).sum();
        assert_eq!(total, summary.student_count);
        assert_eq!(summary.histogram[0].count, 2); // 0.0 and 49.5
        assert_eq!(summary.histogram[1].count, 1); // 50.0
        assert_eq!(summary.histogram[4].count, 1); // 89.0
        assert_eq!(summary.histogram[5].count, 1); // 100.0
    }

    #[test]
    fn empty_summary_is_zeroed_not_an_error() {
        let summary = class_summary(&[], DEFAULT_PASS_THRESHOLD);
        assert_eq!(summary.student_count, 0);
        assert_eq!(summary.class_average, 0.0);
        assert_eq!(summary.highest_score, None);
        assert_eq!(summary.pass_rate, 0.0);
        let total: usize = summary.histogram.iter().map(|b| b.count).sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn classification_band_edges() {
        let t = PromotionThresholds::default();
        assert_eq!(classify_average(Some(72.0), t), PromotionStatus::Eligible);
        assert_eq!(classify_average(Some(50.0), t), PromotionStatus::Eligible);
        assert_eq!(classify_average(Some(49.99), t), PromotionStatus::Borderline);
        assert_eq!(classify_average(Some(48.0), t), PromotionStatus::Borderline);
        assert_eq!(classify_average(Some(45.0), t), PromotionStatus::Borderline);
        assert_eq!(classify_average(Some(44.99), t), PromotionStatus::Repeat);
        assert_eq!(classify_average(Some(30.0), t), PromotionStatus::Repeat);
        // Undefined average requires review, never a silent decision.
        assert_eq!(classify_average(None, t), PromotionStatus::Borderline);
    }

    #[test]
    fn thresholds_reject_inverted_band() {
        let t = PromotionThresholds {
            promote_min: 45.0,
            borderline_min: 50.0,
        };
        assert!(t.validate().is_err());
        assert!(PromotionThresholds::default().validate().is_ok());
    }
}
