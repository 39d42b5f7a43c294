use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("scheduler.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scheduling_entitled INTEGER NOT NULL DEFAULT 1,
            entitlement_reason TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            timezone TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_teacher ON classrooms(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_classroom ON students(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            weekdays TEXT NOT NULL,
            local_time TEXT NOT NULL,
            window_minutes INTEGER NOT NULL,
            target_kind TEXT NOT NULL,
            assessment_type TEXT,
            num_questions INTEGER,
            duration_minutes INTEGER,
            recipient_rule TEXT NOT NULL DEFAULT 'ALL',
            depends_on_schedule_id TEXT,
            offset_minutes INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_classroom ON schedules(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_active ON schedules(is_active)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_recipients(
            schedule_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(schedule_id, student_id),
            FOREIGN KEY(schedule_id) REFERENCES schedules(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    // The run ledger. The composite primary key is the idempotency anchor:
    // all materialization goes through an upsert on (schedule_id, run_date).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_runs(
            schedule_id TEXT NOT NULL,
            run_date TEXT NOT NULL,
            assignment_id TEXT,
            is_skipped INTEGER NOT NULL DEFAULT 0,
            skipped_at TEXT,
            skip_reason TEXT,
            PRIMARY KEY(schedule_id, run_date),
            FOREIGN KEY(schedule_id) REFERENCES schedules(id)
        )",
        [],
    )?;

    // schedule_id/run_date intentionally carry no FK: assignments outlive
    // their schedule when the schedule is deleted.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            schedule_id TEXT,
            run_date TEXT,
            opens_at TEXT NOT NULL,
            closes_at TEXT NOT NULL,
            window_minutes INTEGER NOT NULL,
            target_kind TEXT NOT NULL,
            assessment_type TEXT,
            num_questions INTEGER,
            duration_minutes INTEGER,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_classroom ON assignments(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_natural_key ON assignments(schedule_id, run_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_recipients(
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(assignment_id, student_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_assignment ON attempts(assignment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_track_levels(
            student_id TEXT NOT NULL,
            track TEXT NOT NULL,
            level INTEGER NOT NULL,
            PRIMARY KEY(student_id, track),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}
