use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::gradebook;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

fn get_required_path(params: &serde_json::Value, key: &str) -> Result<PathBuf, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn export_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let workspace = match req.params.get("workspacePath").and_then(|v| v.as_str()) {
        Some(p) => PathBuf::from(p),
        None => state
            .workspace
            .clone()
            .ok_or_else(|| HandlerErr::bad_params("missing workspacePath"))?,
    };
    let out_path = get_required_path(&req.params, "outPath")?;
    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => Ok(ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy(),
            }),
        )),
        Err(e) => Err(HandlerErr {
            code: "backup_export_failed",
            message: format!("{e:?}"),
            details: None,
        }),
    }
}

fn import_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let workspace = get_required_path(&req.params, "workspacePath")?;
    let in_path = get_required_path(&req.params, "inPath")?;

    // Drop the open handle so the db file can be replaced underneath.
    if state.workspace.as_deref() == Some(workspace.as_path()) {
        state.db = None;
    }

    match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(summary) => {
            if state.workspace.as_deref() == Some(workspace.as_path()) {
                match crate::db::open_db(&workspace) {
                    Ok(conn) => state.db = Some(conn),
                    Err(e) => {
                        return Err(HandlerErr {
                            code: "db_open_failed",
                            message: format!("{e:?}"),
                            details: None,
                        })
                    }
                }
            }
            Ok(ok(
                &req.id,
                json!({ "bundleFormatDetected": summary.bundle_format_detected }),
            ))
        }
        Err(e) => Err(HandlerErr {
            code: "backup_import_failed",
            message: format!("{e:?}"),
            details: None,
        }),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// One CSV row per student+subject, figures computed through the same
/// engine path as the gradebook views.
fn export_gradebook_csv(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(&req.params, "batchId")?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let out_path = get_required_path(&req.params, "outPath")?;

    let conn = state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "no workspace selected".to_string(),
        details: None,
    })?;

    let roster = gradebook::roster_for_batch(conn, &batch_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut out = String::new();
    out.push_str(
        "enrollmentNo,studentName,subjectCode,internalMarks,finalMarks,outOf,letterGrade,overallGpa\n",
    );
    let mut row_count = 0_usize;
    for s in &roster {
        let rows = gradebook::computed_subjects_for_student(conn, &s.student_id, &semester_id)
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        let gpa = gradebook::overall_gpa(&rows);
        for row in &rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                csv_escape(&s.enrollment_no),
                csv_escape(&s.display_name),
                csv_escape(&row.subject_code),
                row.grade.internal_marks,
                row.grade.final_marks,
                row.grade.out_of,
                row.grade.letter.as_str(),
                gpa,
            ));
            row_count += 1;
        }
    }

    let write_result = (|| -> anyhow::Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&out_path)?;
        f.write_all(out.as_bytes())?;
        Ok(())
    })();
    if let Err(e) = write_result {
        return Err(HandlerErr {
            code: "export_failed",
            message: format!("{e:?}"),
            details: None,
        });
    }

    Ok(ok(
        &req.id,
        json!({
            "outPath": out_path.to_string_lossy(),
            "rowCount": row_count,
        }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, req),
        "backup.importWorkspaceBundle" => import_bundle(state, req),
        "exchange.exportGradebookCsv" => export_gradebook_csv(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| e.response(&req.id)))
}
