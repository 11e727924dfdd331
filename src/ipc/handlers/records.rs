use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_INTERNAL_MAX_ROWS: usize = 2000;

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

    fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
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
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing numeric {}", key)))
}

/// Score domains are enforced here, at the entry API, so the grade engine
/// only ever sees validated input.
fn check_range(field: &str, value: f64, max: f64) -> Result<(), HandlerErr> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be between 0 and {}", field, max),
            details: Some(json!({ "field": field, "value": value, "max": max })),
        });
    }
    Ok(())
}

struct StudentContext {
    batch_id: String,
    course_id: String,
}

fn resolve_student(conn: &Connection, student_id: &str) -> Result<StudentContext, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT s.batch_id, b.course_id
             FROM students s JOIN batches b ON b.id = s.batch_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    row.map(|(batch_id, course_id)| StudentContext {
        batch_id,
        course_id,
    })
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: Some(json!({ "studentId": student_id })),
    })
}

fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        });
    }
    Ok(())
}

fn require_batch(conn: &Connection, batch_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [batch_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "batch not found".to_string(),
            details: Some(json!({ "batchId": batch_id })),
        });
    }
    Ok(())
}

fn require_semester(conn: &Connection, semester_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM semesters WHERE id = ?", [semester_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "semester not found".to_string(),
            details: Some(json!({ "semesterId": semester_id })),
        });
    }
    Ok(())
}

struct InternalMarks {
    sessional1: f64,
    sessional2: f64,
    attendance: f64,
    assignments: f64,
}

fn parse_internal_marks(params: &serde_json::Value) -> Result<InternalMarks, HandlerErr> {
    let sessional1 = get_required_f64(params, "sessional1")?;
    let sessional2 = get_required_f64(params, "sessional2")?;
    let attendance = get_required_f64(params, "attendance")?;
    let assignments = get_required_f64(params, "assignments")?;
    check_range("sessional1", sessional1, 10.0)?;
    check_range("sessional2", sessional2, 10.0)?;
    check_range("attendance", attendance, 5.0)?;
    check_range("assignments", assignments, 5.0)?;
    Ok(InternalMarks {
        sessional1,
        sessional2,
        attendance,
        assignments,
    })
}

fn upsert_internal_record(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    semester_id: &str,
    batch_id: &str,
    course_id: &str,
    marks: &InternalMarks,
) -> Result<(), HandlerErr> {
    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO score_records(
            id, student_id, subject_id, semester_id, batch_id, course_id,
            category, sessional1, sessional2, attendance, assignments, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 'internal', ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, semester_id, category) DO UPDATE SET
           sessional1 = excluded.sessional1,
           sessional2 = excluded.sessional2,
           attendance = excluded.attendance,
           assignments = excluded.assignments,
           updated_at = excluded.updated_at",
        (
            &record_id,
            student_id,
            subject_id,
            semester_id,
            batch_id,
            course_id,
            marks.sessional1,
            marks.sessional2,
            marks.attendance,
            marks.assignments,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db)?;
    Ok(())
}

fn records_upsert_internal(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let marks = parse_internal_marks(&req.params)?;

    let student = resolve_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;
    require_semester(conn, &semester_id)?;

    upsert_internal_record(
        conn,
        &student_id,
        &subject_id,
        &semester_id,
        &student.batch_id,
        &student.course_id,
        &marks,
    )?;
    Ok(ok(&req.id, json!({ "updated": true })))
}

fn records_upsert_external(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let term_end = get_required_f64(&req.params, "termEnd")?;
    check_range("termEnd", term_end, 100.0)?;

    let student = resolve_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;
    require_semester(conn, &semester_id)?;

    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO score_records(
            id, student_id, subject_id, semester_id, batch_id, course_id,
            category, term_end, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 'external', ?, ?)
         ON CONFLICT(student_id, subject_id, semester_id, category) DO UPDATE SET
           term_end = excluded.term_end,
           updated_at = excluded.updated_at",
        (
            &record_id,
            &student_id,
            &subject_id,
            &semester_id,
            &student.batch_id,
            &student.course_id,
            term_end,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "updated": true })))
}

/// Faculty bulk entry for one batch+subject+semester. Rows validate
/// independently; a bad row is reported with the offending field and value
/// and does not block the rest. Assignments validate on the same 0-5 scale
/// as single entry, so bulk and manual producers can no longer diverge.
fn records_bulk_internal(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let rows = req
        .params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing rows array"))?;
    if rows.len() > BULK_INTERNAL_MAX_ROWS {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("too many rows (max {})", BULK_INTERNAL_MAX_ROWS),
            details: Some(json!({ "rowCount": rows.len() })),
        });
    }

    require_batch(conn, &batch_id)?;
    require_subject(conn, &subject_id)?;
    require_semester(conn, &semester_id)?;

    let mut accepted: Vec<serde_json::Value> = Vec::new();
    let mut rejected: Vec<serde_json::Value> = Vec::new();

    for (idx, row) in rows.iter().enumerate() {
        let outcome = (|| -> Result<String, HandlerErr> {
            let student_id = get_required_str(row, "studentId")?;
            let marks = parse_internal_marks(row)?;
            let student = resolve_student(conn, &student_id)?;
            if student.batch_id != batch_id {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "student does not belong to the batch".to_string(),
                    details: Some(json!({
                        "studentId": student_id,
                        "batchId": batch_id,
                    })),
                });
            }
            upsert_internal_record(
                conn,
                &student_id,
                &subject_id,
                &semester_id,
                &student.batch_id,
                &student.course_id,
                &marks,
            )?;
            Ok(student_id)
        })();
        match outcome {
            Ok(student_id) => accepted.push(json!({ "row": idx, "studentId": student_id })),
            Err(e) => rejected.push(json!({
                "row": idx,
                "code": e.code,
                "message": e.message,
                "details": e.details,
            })),
        }
    }

    Ok(ok(
        &req.id,
        json!({
            "acceptedCount": accepted.len(),
            "rejectedCount": rejected.len(),
            "accepted": accepted,
            "rejected": rejected,
        }),
    ))
}

fn record_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "recordId": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "subjectId": r.get::<_, String>(2)?,
        "semesterId": r.get::<_, String>(3)?,
        "batchId": r.get::<_, String>(4)?,
        "courseId": r.get::<_, String>(5)?,
        "category": r.get::<_, String>(6)?,
        "sessional1": r.get::<_, Option<f64>>(7)?,
        "sessional2": r.get::<_, Option<f64>>(8)?,
        "attendance": r.get::<_, Option<f64>>(9)?,
        "assignments": r.get::<_, Option<f64>>(10)?,
        "termEnd": r.get::<_, Option<f64>>(11)?,
        "updatedAt": r.get::<_, Option<String>>(12)?,
    }))
}

const RECORD_COLUMNS: &str = "id, student_id, subject_id, semester_id, batch_id, course_id,
     category, sessional1, sessional2, attendance, assignments, term_end, updated_at";

fn records_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let student_id = req.params.get("studentId").and_then(|v| v.as_str());
    let batch_id = req.params.get("batchId").and_then(|v| v.as_str());
    let subject_id = req.params.get("subjectId").and_then(|v| v.as_str());

    let records: Vec<serde_json::Value> = if let Some(student_id) = student_id {
        let sql = format!(
            "SELECT {} FROM score_records
             WHERE semester_id = ? AND student_id = ?
             ORDER BY subject_id, category",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map(rusqlite::params![semester_id, student_id], record_to_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?
    } else if let (Some(batch_id), Some(subject_id)) = (batch_id, subject_id) {
        let sql = format!(
            "SELECT {} FROM score_records
             WHERE semester_id = ? AND batch_id = ? AND subject_id = ?
             ORDER BY student_id, category",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map(
            rusqlite::params![semester_id, batch_id, subject_id],
            record_to_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    } else {
        return Err(HandlerErr::bad_params(
            "provide studentId, or batchId and subjectId",
        ));
    };

    Ok(ok(&req.id, json!({ "records": records })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "records.upsertInternal" => records_upsert_internal(state, req),
        "records.upsertExternal" => records_upsert_external(state, req),
        "records.bulkInternal" => records_bulk_internal(state, req),
        "records.list" => records_list(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| e.response(&req.id)))
}
