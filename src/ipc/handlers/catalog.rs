use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db)
}

fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        return Ok(());
    }
    Err(HandlerErr {
        code: "not_found",
        message: format!("{} not found", what),
        details: Some(json!({ "id": id })),
    })
}

fn courses_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let name = get_required_str(&req.params, "name")?;
    let code = get_required_str(&req.params, "code")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, code) VALUES(?, ?, ?)",
        (&id, &name, &code),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "courseId": id })))
}

fn courses_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name, code FROM courses ORDER BY code")
        .map_err(HandlerErr::db)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "courseId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "courses": rows })))
}

fn batches_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let name = get_required_str(&req.params, "name")?;
    let start_year = get_required_i64(&req.params, "startYear")?;
    require_row(conn, "courses", &course_id, "course")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, course_id, name, start_year) VALUES(?, ?, ?, ?)",
        (&id, &course_id, &name, start_year),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "batchId": id })))
}

fn batches_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_year FROM batches
             WHERE course_id = ? ORDER BY start_year, name",
        )
        .map_err(HandlerErr::db)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&course_id], |r| {
            Ok(json!({
                "batchId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startYear": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "batches": rows })))
}

fn semesters_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let number = get_required_i64(&req.params, "number")?;
    if !(1..=12).contains(&number) {
        return Err(HandlerErr::bad_params("semester number must be 1..=12"));
    }
    require_row(conn, "batches", &batch_id, "batch")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, batch_id, number) VALUES(?, ?, ?)",
        (&id, &batch_id, number),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "semesterId": id })))
}

fn semesters_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let mut stmt = conn
        .prepare("SELECT id, number FROM semesters WHERE batch_id = ? ORDER BY number")
        .map_err(HandlerErr::db)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&batch_id], |r| {
            Ok(json!({
                "semesterId": r.get::<_, String>(0)?,
                "number": r.get::<_, i64>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "semesters": rows })))
}

fn subjects_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let code = get_required_str(&req.params, "code")?;
    let name = get_required_str(&req.params, "name")?;
    let semester_number = get_required_i64(&req.params, "semesterNumber")?;
    require_row(conn, "courses", &course_id, "course")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, course_id, code, name, semester_number)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &course_id, &code, &name, semester_number),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "subjectId": id })))
}

fn subjects_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let semester_number = req.params.get("semesterNumber").and_then(|v| v.as_i64());
    let mut sql = String::from(
        "SELECT id, code, name, semester_number FROM subjects WHERE course_id = ?",
    );
    if semester_number.is_some() {
        sql.push_str(" AND semester_number = ?");
    }
    sql.push_str(" ORDER BY semester_number, code");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(json!({
            "subjectId": r.get::<_, String>(0)?,
            "code": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "semesterNumber": r.get::<_, i64>(3)?,
        }))
    };
    let rows: Vec<serde_json::Value> = match semester_number {
        Some(n) => stmt
            .query_map(rusqlite::params![course_id, n], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?,
        None => stmt
            .query_map([&course_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?,
    };
    Ok(ok(&req.id, json!({ "subjects": rows })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.create" => courses_create(state, req),
        "courses.list" => courses_list(state, req),
        "batches.create" => batches_create(state, req),
        "batches.list" => batches_list(state, req),
        "semesters.create" => semesters_create(state, req),
        "semesters.list" => semesters_list(state, req),
        "subjects.create" => subjects_create(state, req),
        "subjects.list" => subjects_list(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| e.response(&req.id)))
}
