use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
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

fn batch_exists(conn: &Connection, batch_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM batches WHERE id = ?", [batch_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn next_sort_order(conn: &Connection, batch_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE batch_id = ?",
        [batch_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

fn students_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let enrollment_no = get_required_str(&req.params, "enrollmentNo")?;
    let last_name = get_required_str(&req.params, "lastName")?;
    let first_name = get_required_str(&req.params, "firstName")?;
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "batch not found".to_string(),
            details: Some(json!({ "batchId": batch_id })),
        });
    }

    let sort_order = next_sort_order(conn, &batch_id)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, batch_id, enrollment_no, last_name, first_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &batch_id,
            &enrollment_no,
            &last_name,
            &first_name,
            active as i64,
            sort_order,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "studentId": id })))
}

fn students_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let batch_id = get_required_str(&req.params, "batchId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, enrollment_no, last_name, first_name, active, sort_order
             FROM students
             WHERE batch_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&batch_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "enrollmentNo": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "students": rows })))
}

fn students_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let patch = req
        .params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch object"))?;

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        sets.push("last_name = ?");
        values.push(rusqlite::types::Value::Text(v.to_string()));
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        sets.push("first_name = ?");
        values.push(rusqlite::types::Value::Text(v.to_string()));
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        sets.push("active = ?");
        values.push(rusqlite::types::Value::Integer(v as i64));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no recognized fields"));
    }
    sets.push("updated_at = ?");
    values.push(rusqlite::types::Value::Text(Utc::now().to_rfc3339()));
    values.push(rusqlite::types::Value::Text(student_id.clone()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(HandlerErr::db)?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    }
    Ok(ok(&req.id, json!({ "updated": true })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => students_create(state, req),
        "students.list" => students_list(state, req),
        "students.update" => students_update(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| e.response(&req.id)))
}
