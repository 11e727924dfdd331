use serde::Serialize;
use std::collections::BTreeMap;

/// Scale ceiling for a subject whose term-end exam has not been recorded yet.
pub const INTERNAL_SCALE_MAX: f64 = 30.0;
/// Scale ceiling once a term-end score is present.
pub const FINAL_SCALE_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LetterGrade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D")]
    D,
}

impl LetterGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterGrade::APlus => "A+",
            LetterGrade::A => "A",
            LetterGrade::AMinus => "A-",
            LetterGrade::BPlus => "B+",
            LetterGrade::B => "B",
            LetterGrade::C => "C",
            LetterGrade::D => "D",
        }
    }
}

/// Raw score components for one student+subject+semester, already merged
/// from the internal and external record (if any). Absent internal fields
/// default to 0; `term_end` stays `None` until the external record exists.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubjectScores {
    pub sessional1: f64,
    pub sessional2: f64,
    pub attendance: f64,
    pub assignments: f64,
    pub term_end: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputedGrade {
    pub internal_marks: f64,
    pub final_marks: f64,
    pub out_of: f64,
    pub has_term_end: bool,
    pub letter: LetterGrade,
}

fn assert_domain(value: f64, max: f64, what: &str) {
    debug_assert!(
        (0.0..=max).contains(&value),
        "{} out of range: {} (max {})",
        what,
        value,
        max
    );
}

/// Internal marks out of 30: the better sessional weighted 0.7, the worse
/// 0.3, scaled from its 10-point basis to 15, plus attendance (0-5) and
/// assignments (0-5) unscaled.
///
/// Inputs are preconditions, validated at the grade-entry boundary; this is
/// pure arithmetic and monotonic non-decreasing in every argument.
pub fn internal_marks(sessional1: f64, sessional2: f64, attendance: f64, assignments: f64) -> f64 {
    assert_domain(sessional1, 10.0, "sessional1");
    assert_domain(sessional2, 10.0, "sessional2");
    assert_domain(attendance, 5.0, "attendance");
    assert_domain(assignments, 5.0, "assignments");

    let higher = sessional1.max(sessional2);
    let lower = sessional1.min(sessional2);
    let weighted_sessional = 0.7 * higher + 0.3 * lower;
    weighted_sessional * (15.0 / 10.0) + attendance + assignments
}

/// Final marks. Without a term-end score this is just the internal marks on
/// the provisional 30-point scale; with one, internal marks plus a
/// 70%-weighted term-end component out of 100. The presence of `term_end`
/// is the only thing that switches the scale.
pub fn final_marks(
    sessional1: f64,
    sessional2: f64,
    attendance: f64,
    assignments: f64,
    term_end: Option<f64>,
) -> f64 {
    let internal = internal_marks(sessional1, sessional2, attendance, assignments);
    match term_end {
        None => internal,
        Some(te) => {
            assert_domain(te, 100.0, "termEnd");
            internal + (te / 100.0) * 70.0
        }
    }
}

/// Inclusive-lower-bound bands, highest first. Two disjoint tables because
/// the scale differs (30-point provisional vs 100-point final).
pub fn letter_grade(final_marks: f64, has_term_end: bool) -> LetterGrade {
    let bands: [(f64, LetterGrade); 6] = if has_term_end {
        [
            (90.0, LetterGrade::APlus),
            (85.0, LetterGrade::A),
            (80.0, LetterGrade::AMinus),
            (75.0, LetterGrade::BPlus),
            (70.0, LetterGrade::B),
            (60.0, LetterGrade::C),
        ]
    } else {
        [
            (27.0, LetterGrade::APlus),
            (25.5, LetterGrade::A),
            (24.0, LetterGrade::AMinus),
            (22.5, LetterGrade::BPlus),
            (21.0, LetterGrade::B),
            (18.0, LetterGrade::C),
        ]
    };
    for (floor, letter) in bands {
        if final_marks >= floor {
            return letter;
        }
    }
    LetterGrade::D
}

pub fn compute_subject(scores: &SubjectScores) -> ComputedGrade {
    let internal = internal_marks(
        scores.sessional1,
        scores.sessional2,
        scores.attendance,
        scores.assignments,
    );
    let has_term_end = scores.term_end.is_some();
    let finals = final_marks(
        scores.sessional1,
        scores.sessional2,
        scores.attendance,
        scores.assignments,
        scores.term_end,
    );
    ComputedGrade {
        internal_marks: internal,
        final_marks: finals,
        out_of: if has_term_end {
            FINAL_SCALE_MAX
        } else {
            INTERNAL_SCALE_MAX
        },
        has_term_end,
        letter: letter_grade(finals, has_term_end),
    }
}

/// Overall GPA out of 10: each subject contributes its final marks as a
/// fraction of that subject's own scale, averaged. An empty subject set is
/// a defined state (mid-semester, nothing graded) and yields 0.
pub fn aggregate_gpa<I>(subjects: I) -> f64
where
    I: IntoIterator<Item = (f64, bool)>,
{
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for (final_marks, has_term_end) in subjects {
        let scale_max = if has_term_end {
            FINAL_SCALE_MAX
        } else {
            INTERNAL_SCALE_MAX
        };
        sum += (final_marks / scale_max) * 10.0;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / (count as f64)
    }
}

/// Which half of a subject's marks a raw record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCategory {
    Internal,
    External,
}

impl RecordCategory {
    pub fn parse(s: &str) -> Option<RecordCategory> {
        match s {
            "internal" => Some(RecordCategory::Internal),
            "external" => Some(RecordCategory::External),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordCategory::Internal => "internal",
            RecordCategory::External => "external",
        }
    }
}

/// One raw persisted score record, as fetched for a fixed student+semester.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub subject_id: String,
    pub category: RecordCategory,
    pub sessional1: Option<f64>,
    pub sessional2: Option<f64>,
    pub attendance: Option<f64>,
    pub assignments: Option<f64>,
    pub term_end: Option<f64>,
}

/// Merge raw internal/external records into one `SubjectScores` per subject.
///
/// Internal components come from the record tagged internal, defaulting to 0
/// when the record or field is missing; term-end comes from the external
/// record when it carries a value. This is the single merge point: every
/// gradebook view goes through here, never re-deriving the pairing itself.
pub fn merge_records(records: &[RawRecord]) -> BTreeMap<String, SubjectScores> {
    let mut merged: BTreeMap<String, SubjectScores> = BTreeMap::new();
    for rec in records {
        let entry = merged.entry(rec.subject_id.clone()).or_default();
        match rec.category {
            RecordCategory::Internal => {
                entry.sessional1 = rec.sessional1.unwrap_or(0.0);
                entry.sessional2 = rec.sessional2.unwrap_or(0.0);
                entry.attendance = rec.attendance.unwrap_or(0.0);
                entry.assignments = rec.assignments.unwrap_or(0.0);
            }
            RecordCategory::External => {
                if rec.term_end.is_some() {
                    entry.term_end = rec.term_end;
                }
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal_only(subject: &str, s1: f64, s2: f64, att: f64, asg: f64) -> RawRecord {
        RawRecord {
            subject_id: subject.to_string(),
            category: RecordCategory::Internal,
            sessional1: Some(s1),
            sessional2: Some(s2),
            attendance: Some(att),
            assignments: Some(asg),
            term_end: None,
        }
    }

    fn external_only(subject: &str, term_end: f64) -> RawRecord {
        RawRecord {
            subject_id: subject.to_string(),
            category: RecordCategory::External,
            sessional1: None,
            sessional2: None,
            attendance: None,
            assignments: None,
            term_end: Some(term_end),
        }
    }

    #[test]
    fn internal_marks_symmetric_in_sessionals() {
        let cases = [(8.0, 6.0), (0.0, 10.0), (7.5, 7.5), (3.2, 9.9)];
        for (a, b) in cases {
            assert_eq!(internal_marks(a, b, 3.0, 4.0), internal_marks(b, a, 3.0, 4.0));
        }
    }

    #[test]
    fn internal_marks_extremes() {
        assert_eq!(internal_marks(10.0, 10.0, 5.0, 5.0), 30.0);
        assert_eq!(internal_marks(0.0, 0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn internal_marks_weights_better_attempt() {
        // 0.7*8 + 0.3*6 = 7.4, scaled to 15-point basis => 11.1, plus 4 + 5.
        let v = internal_marks(8.0, 6.0, 4.0, 5.0);
        assert!((v - 20.1).abs() < 1e-9);
    }

    #[test]
    fn internal_marks_monotonic_in_each_input() {
        let base = internal_marks(5.0, 4.0, 2.0, 2.0);
        assert!(internal_marks(6.0, 4.0, 2.0, 2.0) >= base);
        assert!(internal_marks(5.0, 5.0, 2.0, 2.0) >= base);
        assert!(internal_marks(5.0, 4.0, 3.0, 2.0) >= base);
        assert!(internal_marks(5.0, 4.0, 2.0, 3.0) >= base);
    }

    #[test]
    fn final_marks_without_term_end_equals_internal() {
        assert_eq!(
            final_marks(8.0, 6.0, 4.0, 5.0, None),
            internal_marks(8.0, 6.0, 4.0, 5.0)
        );
    }

    #[test]
    fn final_marks_full_score_is_100() {
        assert_eq!(final_marks(10.0, 10.0, 5.0, 5.0, Some(100.0)), 100.0);
    }

    #[test]
    fn letter_bands_provisional_scale() {
        assert_eq!(letter_grade(27.0, false), LetterGrade::APlus);
        assert_eq!(letter_grade(26.9, false), LetterGrade::A);
        assert_eq!(letter_grade(25.5, false), LetterGrade::A);
        assert_eq!(letter_grade(24.0, false), LetterGrade::AMinus);
        assert_eq!(letter_grade(22.5, false), LetterGrade::BPlus);
        assert_eq!(letter_grade(21.0, false), LetterGrade::B);
        assert_eq!(letter_grade(18.0, false), LetterGrade::C);
        assert_eq!(letter_grade(17.9, false), LetterGrade::D);
        assert_eq!(letter_grade(0.0, false), LetterGrade::D);
    }

    #[test]
    fn letter_bands_final_scale() {
        assert_eq!(letter_grade(90.0, true), LetterGrade::APlus);
        assert_eq!(letter_grade(89.9, true), LetterGrade::A);
        assert_eq!(letter_grade(85.0, true), LetterGrade::A);
        assert_eq!(letter_grade(80.0, true), LetterGrade::AMinus);
        assert_eq!(letter_grade(75.0, true), LetterGrade::BPlus);
        assert_eq!(letter_grade(70.0, true), LetterGrade::B);
        assert_eq!(letter_grade(60.0, true), LetterGrade::C);
        assert_eq!(letter_grade(59.9, true), LetterGrade::D);
    }

    #[test]
    fn gpa_empty_subject_set_is_zero() {
        assert_eq!(aggregate_gpa(Vec::new()), 0.0);
    }

    #[test]
    fn gpa_single_max_internal_subject_is_ten() {
        assert_eq!(aggregate_gpa(vec![(30.0, false)]), 10.0);
    }

    #[test]
    fn gpa_mixes_scales_per_subject() {
        // 15/30 => 5.0 and 80/100 => 8.0, mean 6.5.
        let gpa = aggregate_gpa(vec![(15.0, false), (80.0, true)]);
        assert!((gpa - 6.5).abs() < 1e-9);
    }

    #[test]
    fn merge_pairs_internal_and_external_by_subject() {
        let records = vec![
            internal_only("sub-1", 8.0, 6.0, 4.0, 5.0),
            external_only("sub-1", 75.0),
        ];
        let merged = merge_records(&records);
        let scores = merged.get("sub-1").expect("merged subject");
        let grade = compute_subject(scores);
        assert_eq!(
            grade.final_marks,
            final_marks(8.0, 6.0, 4.0, 5.0, Some(75.0))
        );
        assert!(grade.has_term_end);
        assert_eq!(grade.out_of, 100.0);
    }

    #[test]
    fn merge_missing_internal_record_yields_zero_components() {
        let records = vec![external_only("sub-2", 60.0)];
        let merged = merge_records(&records);
        let scores = merged.get("sub-2").expect("merged subject");
        assert_eq!(scores.sessional1, 0.0);
        assert_eq!(scores.assignments, 0.0);
        let grade = compute_subject(scores);
        assert_eq!(grade.internal_marks, 0.0);
        assert!((grade.final_marks - 42.0).abs() < 1e-9);
    }

    #[test]
    fn merge_missing_external_record_stays_provisional() {
        let records = vec![internal_only("sub-3", 9.0, 9.0, 5.0, 4.0)];
        let merged = merge_records(&records);
        let grade = compute_subject(merged.get("sub-3").expect("merged subject"));
        assert!(!grade.has_term_end);
        assert_eq!(grade.out_of, 30.0);
        assert_eq!(grade.final_marks, grade.internal_marks);
    }

    #[test]
    fn merge_ignores_external_record_without_value() {
        let records = vec![
            internal_only("sub-4", 5.0, 5.0, 3.0, 3.0),
            RawRecord {
                subject_id: "sub-4".to_string(),
                category: RecordCategory::External,
                sessional1: None,
                sessional2: None,
                attendance: None,
                assignments: None,
                term_end: None,
            },
        ];
        let merged = merge_records(&records);
        assert!(merged.get("sub-4").expect("merged subject").term_end.is_none());
    }
}
