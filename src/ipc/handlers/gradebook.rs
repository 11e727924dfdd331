use crate::grade::{self, ComputedGrade, RawRecord, RecordCategory, SubjectScores};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "no workspace selected".to_string(),
        details: None,
    })
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

#[derive(Debug, Clone)]
pub struct SubjectGradeRow {
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub grade: ComputedGrade,
}

#[derive(Debug, Clone)]
pub struct StudentRoster {
    pub student_id: String,
    pub enrollment_no: String,
    pub display_name: String,
    pub active: bool,
}

fn raw_record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, RawRecord)> {
    let student_id: String = r.get(0)?;
    let category: String = r.get(2)?;
    Ok((
        student_id,
        RawRecord {
            subject_id: r.get(1)?,
            // Unknown tags are treated as internal rows with no marks.
            category: RecordCategory::parse(&category).unwrap_or(RecordCategory::Internal),
            sessional1: r.get(3)?,
            sessional2: r.get(4)?,
            attendance: r.get(5)?,
            assignments: r.get(6)?,
            term_end: r.get(7)?,
        },
    ))
}

const RAW_COLUMNS: &str = "student_id, subject_id, category,
     sessional1, sessional2, attendance, assignments, term_end";

fn fetch_student_records(
    conn: &Connection,
    student_id: &str,
    semester_id: &str,
) -> anyhow::Result<Vec<RawRecord>> {
    let sql = format!(
        "SELECT {} FROM score_records WHERE student_id = ? AND semester_id = ?",
        RAW_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id, semester_id], raw_record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|(_, rec)| rec).collect())
}

fn fetch_batch_records(
    conn: &Connection,
    batch_id: &str,
    semester_id: &str,
    subject_id: Option<&str>,
) -> anyhow::Result<HashMap<String, Vec<RawRecord>>> {
    let mut sql = format!(
        "SELECT {} FROM score_records WHERE batch_id = ? AND semester_id = ?",
        RAW_COLUMNS
    );
    if subject_id.is_some() {
        sql.push_str(" AND subject_id = ?");
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = match subject_id {
        Some(subject_id) => stmt
            .query_map(
                rusqlite::params![batch_id, semester_id, subject_id],
                raw_record_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(rusqlite::params![batch_id, semester_id], raw_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    let mut by_student: HashMap<String, Vec<RawRecord>> = HashMap::new();
    for (student_id, rec) in rows {
        by_student.entry(student_id).or_default().push(rec);
    }
    Ok(by_student)
}

fn subject_meta(conn: &Connection) -> anyhow::Result<HashMap<String, (String, String)>> {
    let mut stmt = conn.prepare("SELECT id, code, name FROM subjects")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, String>(1)?, r.get::<_, String>(2)?),
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn roster_for_batch(conn: &Connection, batch_id: &str) -> anyhow::Result<Vec<StudentRoster>> {
    let mut stmt = conn.prepare(
        "SELECT id, enrollment_no, last_name, first_name, active
         FROM students
         WHERE batch_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([batch_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentRoster {
                student_id: r.get(0)?,
                enrollment_no: r.get(1)?,
                display_name: format!("{}, {}", last, first),
                active: r.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn grade_rows(
    merged: &BTreeMap<String, SubjectScores>,
    meta: &HashMap<String, (String, String)>,
) -> Vec<SubjectGradeRow> {
    let mut rows: Vec<SubjectGradeRow> = merged
        .iter()
        .map(|(subject_id, scores)| {
            let (code, name) = meta
                .get(subject_id)
                .cloned()
                .unwrap_or_else(|| (subject_id.clone(), String::new()));
            SubjectGradeRow {
                subject_id: subject_id.clone(),
                subject_code: code,
                subject_name: name,
                grade: grade::compute_subject(scores),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.subject_code.cmp(&b.subject_code));
    rows
}

/// Per-subject computed grades for one student+semester. Every surface that
/// shows a student's marks (student view, faculty view, admin view, CSV
/// export) comes through here or `grade_rows`, so they cannot diverge.
pub fn computed_subjects_for_student(
    conn: &Connection,
    student_id: &str,
    semester_id: &str,
) -> anyhow::Result<Vec<SubjectGradeRow>> {
    let records = fetch_student_records(conn, student_id, semester_id)?;
    let merged = grade::merge_records(&records);
    let meta = subject_meta(conn)?;
    Ok(grade_rows(&merged, &meta))
}

pub fn overall_gpa(rows: &[SubjectGradeRow]) -> f64 {
    grade::aggregate_gpa(
        rows.iter()
            .map(|r| (r.grade.final_marks, r.grade.has_term_end)),
    )
}

fn subject_row_json(row: &SubjectGradeRow) -> serde_json::Value {
    json!({
        "subjectId": row.subject_id,
        "subjectCode": row.subject_code,
        "subjectName": row.subject_name,
        "internalMarks": row.grade.internal_marks,
        "finalMarks": row.grade.final_marks,
        "outOf": row.grade.out_of,
        "hasTermEnd": row.grade.has_term_end,
        "letterGrade": row.grade.letter.as_str(),
    })
}

fn student_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;

    let rows =
        computed_subjects_for_student(conn, &student_id, &semester_id).map_err(HandlerErr::db)?;
    let gpa = overall_gpa(&rows);
    let subjects: Vec<serde_json::Value> = rows.iter().map(subject_row_json).collect();
    Ok(ok(
        &req.id,
        json!({
            "studentId": student_id,
            "semesterId": semester_id,
            "subjects": subjects,
            "overallGpa": gpa,
        }),
    ))
}

fn faculty_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;

    let roster = roster_for_batch(conn, &batch_id).map_err(HandlerErr::db)?;
    let by_student = fetch_batch_records(conn, &batch_id, &semester_id, Some(&subject_id))
        .map_err(HandlerErr::db)?;

    let mut students: Vec<serde_json::Value> = Vec::new();
    for s in &roster {
        let records = by_student.get(&s.student_id).map(Vec::as_slice).unwrap_or(&[]);
        let merged = grade::merge_records(records);
        // A student with no records yet is a defined mid-semester state:
        // all-zero internal components on the provisional scale.
        let scores = merged.get(&subject_id).copied().unwrap_or_default();
        let grade = grade::compute_subject(&scores);
        students.push(json!({
            "studentId": s.student_id,
            "enrollmentNo": s.enrollment_no,
            "displayName": s.display_name,
            "active": s.active,
            "internalMarks": grade.internal_marks,
            "finalMarks": grade.final_marks,
            "outOf": grade.out_of,
            "hasTermEnd": grade.has_term_end,
            "letterGrade": grade.letter.as_str(),
        }));
    }

    Ok(ok(
        &req.id,
        json!({
            "batchId": batch_id,
            "subjectId": subject_id,
            "semesterId": semester_id,
            "students": students,
        }),
    ))
}

fn admin_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;

    let roster = roster_for_batch(conn, &batch_id).map_err(HandlerErr::db)?;
    let by_student =
        fetch_batch_records(conn, &batch_id, &semester_id, None).map_err(HandlerErr::db)?;
    let meta = subject_meta(conn).map_err(HandlerErr::db)?;

    let mut students: Vec<serde_json::Value> = Vec::new();
    for s in &roster {
        let records = by_student.get(&s.student_id).map(Vec::as_slice).unwrap_or(&[]);
        let merged = grade::merge_records(records);
        let rows = grade_rows(&merged, &meta);
        let gpa = overall_gpa(&rows);
        let subjects: Vec<serde_json::Value> = rows.iter().map(subject_row_json).collect();
        students.push(json!({
            "studentId": s.student_id,
            "enrollmentNo": s.enrollment_no,
            "displayName": s.display_name,
            "active": s.active,
            "subjects": subjects,
            "overallGpa": gpa,
        }));
    }

    Ok(ok(
        &req.id,
        json!({
            "batchId": batch_id,
            "semesterId": semester_id,
            "students": students,
        }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "gradebook.studentOpen" => student_open(state, req),
        "gradebook.facultyOpen" => faculty_open(state, req),
        "gradebook.adminOpen" => admin_open(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| e.response(&req.id)))
}
