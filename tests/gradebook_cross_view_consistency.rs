use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_colleged");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn colleged");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn result_str(result: &serde_json::Value, key: &str) -> String {
    result
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, result))
        .to_string()
}

struct Seed {
    batch_id: String,
    semester_id: String,
    subject_id: String,
    student_id: String,
}

fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Seed {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "s2",
        "courses.create",
        json!({ "name": "Computer Engineering", "code": "CE" }),
    );
    let course_id = result_str(&course, "courseId");
    let batch = request_ok(
        stdin,
        reader,
        "s3",
        "batches.create",
        json!({ "courseId": course_id, "name": "CE-A", "startYear": 2024 }),
    );
    let batch_id = result_str(&batch, "batchId");
    let semester = request_ok(
        stdin,
        reader,
        "s4",
        "semesters.create",
        json!({ "batchId": batch_id, "number": 3 }),
    );
    let semester_id = result_str(&semester, "semesterId");
    let subject = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "courseId": course_id,
            "code": "CE301",
            "name": "Operating Systems",
            "semesterNumber": 3
        }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let student = request_ok(
        stdin,
        reader,
        "s6",
        "students.create",
        json!({
            "batchId": batch_id,
            "enrollmentNo": "CE2024001",
            "lastName": "Rao",
            "firstName": "Asha",
            "active": true
        }),
    );
    let student_id = result_str(&student, "studentId");
    Seed {
        batch_id,
        semester_id,
        subject_id,
        student_id,
    }
}

fn approx(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {} to be close to {}",
        actual,
        expected
    );
}

/// Internal {8, 6, 4, 5} merged with term-end 75 must produce the same
/// figures in every view that displays the mark:
/// internal = (0.7*8 + 0.3*6) * 1.5 + 4 + 5 = 20.1
/// final    = 20.1 + 75/100 * 70          = 72.6, letter B.
#[test]
fn same_marks_compute_identically_in_all_views() {
    let workspace = temp_dir("colleged-cross-view");
    let csv_out = workspace.join("gradebook.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.upsertInternal",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.subject_id,
            "semesterId": seed.semester_id,
            "sessional1": 8.0,
            "sessional2": 6.0,
            "attendance": 4.0,
            "assignments": 5.0
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.upsertExternal",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.subject_id,
            "semesterId": seed.semester_id,
            "termEnd": 75.0
        }),
    );

    let student_view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradebook.studentOpen",
        json!({ "studentId": seed.student_id, "semesterId": seed.semester_id }),
    );
    let subject = &student_view["subjects"][0];
    approx(subject["internalMarks"].as_f64().expect("internalMarks"), 20.1);
    approx(subject["finalMarks"].as_f64().expect("finalMarks"), 72.6);
    assert_eq!(subject["outOf"].as_f64(), Some(100.0));
    assert_eq!(subject["hasTermEnd"].as_bool(), Some(true));
    assert_eq!(subject["letterGrade"].as_str(), Some("B"));
    let student_final = subject["finalMarks"].as_f64().expect("finalMarks");

    let faculty_view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "gradebook.facultyOpen",
        json!({
            "batchId": seed.batch_id,
            "subjectId": seed.subject_id,
            "semesterId": seed.semester_id
        }),
    );
    let faculty_row = &faculty_view["students"][0];
    assert_eq!(faculty_row["finalMarks"].as_f64(), Some(student_final));
    assert_eq!(faculty_row["letterGrade"].as_str(), Some("B"));

    let admin_view = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "gradebook.adminOpen",
        json!({ "batchId": seed.batch_id, "semesterId": seed.semester_id }),
    );
    let admin_subject = &admin_view["students"][0]["subjects"][0];
    assert_eq!(admin_subject["finalMarks"].as_f64(), Some(student_final));
    assert_eq!(admin_subject["letterGrade"].as_str(), Some("B"));

    // GPA for one subject at 72.6/100.
    approx(
        student_view["overallGpa"].as_f64().expect("overallGpa"),
        7.26,
    );
    assert_eq!(
        admin_view["students"][0]["overallGpa"].as_f64(),
        student_view["overallGpa"].as_f64()
    );

    // The CSV export runs through the same engine path.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exchange.exportGradebookCsv",
        json!({
            "batchId": seed.batch_id,
            "semesterId": seed.semester_id,
            "outPath": csv_out.to_string_lossy()
        }),
    );
    let csv = std::fs::read_to_string(&csv_out).expect("read csv");
    let data_line = csv.lines().nth(1).expect("csv data row");
    // The student name field is quoted and may hold commas; count from the
    // tail where fields are plain numerics.
    let fields: Vec<&str> = data_line.split(',').collect();
    let n = fields.len();
    assert_eq!(fields[n - 6], "CE301");
    approx(fields[n - 4].parse::<f64>().expect("finalMarks field"), 72.6);
    assert_eq!(fields[n - 2], "B");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

/// Full marks everywhere is the scale ceiling: final 100, letter A+, GPA 10.
#[test]
fn full_marks_reach_scale_ceiling_in_every_view() {
    let workspace = temp_dir("colleged-full-marks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.upsertInternal",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.subject_id,
            "semesterId": seed.semester_id,
            "sessional1": 10.0,
            "sessional2": 10.0,
            "attendance": 5.0,
            "assignments": 5.0
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.upsertExternal",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.subject_id,
            "semesterId": seed.semester_id,
            "termEnd": 100.0
        }),
    );

    let student_view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradebook.studentOpen",
        json!({ "studentId": seed.student_id, "semesterId": seed.semester_id }),
    );
    let subject = &student_view["subjects"][0];
    approx(subject["finalMarks"].as_f64().expect("finalMarks"), 100.0);
    assert_eq!(subject["letterGrade"].as_str(), Some("A+"));
    approx(
        student_view["overallGpa"].as_f64().expect("overallGpa"),
        10.0,
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
