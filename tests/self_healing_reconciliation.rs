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
    let exe = env!("CARGO_BIN_EXE_schedulerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schedulerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn setup_schedule(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(stdin, reader, "t1", "teachers.create", json!({ "name": "T" }));
    let teacher_id = teacher.get("teacherId").and_then(|v| v.as_str()).unwrap();
    let classroom = request_ok(
        stdin,
        reader,
        "c1",
        "classrooms.create",
        json!({ "teacherId": &teacher_id, "name": "Room", "timezone": "UTC" }),
    );
    let classroom_id = classroom
        .get("classroomId")
        .and_then(|v| v.as_str())
        .unwrap();
    let schedule = request_ok(
        stdin,
        reader,
        "s1",
        "schedules.create",
        json!({
            "classroomId": &classroom_id,
            "weekdays": ["Friday"],
            "localTime": "09:00",
            "windowMinutes": 30,
            "targetKind": "ASSESSMENT",
            "assessmentType": "TEST",
            "numQuestions": 10
        }),
    );
    schedule
        .get("schedule")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string()
}

fn open_workspace_db(workspace: &PathBuf) -> rusqlite::Connection {
    rusqlite::Connection::open(workspace.join("scheduler.sqlite3")).expect("open workspace db")
}

#[test]
fn dangling_pointer_re_materializes() {
    let workspace = temp_dir("schedulerd-heal-dangling");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let schedule_id = setup_schedule(&mut stdin, &mut reader, &workspace);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    let first_id = run
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // Simulate a partial failure that removed the assignment but left the
    // ledger pointer behind.
    {
        let db = open_workspace_db(&workspace);
        db.execute("DELETE FROM assignments WHERE id = ?", [&first_id])
            .expect("delete assignment");
    }

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(run.get("created").and_then(|v| v.as_bool()), Some(true));
    let second_id = run
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .unwrap();
    assert_ne!(second_id, first_id, "a fresh assignment replaces the lost one");
}

#[test]
fn orphan_assignment_is_adopted_not_duplicated() {
    let workspace = temp_dir("schedulerd-heal-orphan");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let schedule_id = setup_schedule(&mut stdin, &mut reader, &workspace);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    let first_id = run
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // Simulate a crash between the assignment insert and the pointer
    // write: the assignment row exists, the ledger pointer does not.
    {
        let db = open_workspace_db(&workspace);
        db.execute(
            "UPDATE schedule_runs SET assignment_id = NULL WHERE schedule_id = ?",
            [&schedule_id],
        )
        .expect("clear pointer");
    }

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(run.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        run.get("assignment")
            .and_then(|a| a.get("id"))
            .and_then(|v| v.as_str()),
        Some(first_id.as_str()),
        "the orphan is adopted, not duplicated"
    );

    // The pointer is restored.
    let db = open_workspace_db(&workspace);
    let pointer: Option<String> = db
        .query_row(
            "SELECT assignment_id FROM schedule_runs WHERE schedule_id = ?",
            [&schedule_id],
            |r| r.get(0),
        )
        .expect("read pointer");
    assert_eq!(pointer.as_deref(), Some(first_id.as_str()));
}
