use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "college.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_year INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_course ON batches(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id),
            UNIQUE(batch_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semesters_batch ON semesters(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            semester_number INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_course ON subjects(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            enrollment_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch_sort ON students(batch_id, sort_order)",
        [],
    )?;

    // One row per (student, subject, semester, category). The internal row
    // carries sessional/attendance/assignments marks; the external row
    // carries only the term-end score.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            category TEXT NOT NULL,
            sessional1 REAL,
            sessional2 REAL,
            attendance REAL,
            assignments REAL,
            term_end REAL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, subject_id, semester_id, category)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_student_sem
         ON score_records(student_id, semester_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_batch_subject_sem
         ON score_records(batch_id, subject_id, semester_id)",
        [],
    )?;

    migrate_legacy_assignment_column(&conn)?;

    Ok(conn)
}

/// Older workspaces stored the bulk-entered assignment mark in a separate
/// `assignment` column whose producer did not enforce the canonical 0-5
/// scale. Such tables predate the canonical column entirely, so add it if
/// needed, then backfill from the legacy column (clamping anything above 5)
/// wherever the canonical column is still empty. The legacy column stays in
/// place but is never read again.
fn migrate_legacy_assignment_column(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "score_records", "assignment")? {
        return Ok(());
    }
    if !table_has_column(conn, "score_records", "assignments")? {
        conn.execute("ALTER TABLE score_records ADD COLUMN assignments REAL", [])?;
    }
    conn.execute(
        "UPDATE score_records
         SET assignments = MIN(assignment, 5.0)
         WHERE category = 'internal'
           AND assignments IS NULL
           AND assignment IS NOT NULL",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
