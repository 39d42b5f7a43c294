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
) -> (String, String) {
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
        .unwrap()
        .to_string();
    let schedule = request_ok(
        stdin,
        reader,
        "s1",
        "schedules.create",
        json!({
            "classroomId": &classroom_id,
            "weekdays": ["Friday"],
            "localTime": "09:00",
            "windowMinutes": 10,
            "targetKind": "ASSESSMENT",
            "assessmentType": "TEST",
            "numQuestions": 6
        }),
    );
    let schedule_id = schedule
        .get("schedule")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    (classroom_id, schedule_id)
}

#[test]
fn cancelled_occurrence_stays_cancelled() {
    let workspace = temp_dir("schedulerd-cancel");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (classroom_id, schedule_id) = setup_schedule(&mut stdin, &mut reader, &workspace);

    // Cancel before anything was materialized.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "x1",
        "schedules.cancelOccurrence",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01", "reason": "spring break" }),
    );

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(run.get("skipped").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        run.get("reason").and_then(|v| v.as_str()),
        Some("spring break")
    );

    // The sweep treats the skip as benign and creates nothing.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "sw1",
        "sweep.run",
        json!({ "now": "2024-02-28T12:00:00Z" }),
    );
    assert_eq!(
        report.get("created").and_then(|v| v.as_array()).unwrap().len(),
        0
    );
    assert_eq!(report.get("runSkipped").and_then(|v| v.as_i64()), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "assignments.list",
        json!({ "classroomId": &classroom_id }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .unwrap()
            .len(),
        0
    );

    // The ledger records the skip.
    let runs = request_ok(
        &mut stdin,
        &mut reader,
        "lr1",
        "schedules.listRuns",
        json!({ "scheduleId": &schedule_id }),
    );
    let runs = runs.get("runs").and_then(|v| v.as_array()).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].get("isSkipped").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        runs[0].get("skipReason").and_then(|v| v.as_str()),
        Some("spring break")
    );
    assert!(runs[0].get("assignmentId").is_none());
}

#[test]
fn cancelling_a_materialized_occurrence_deletes_it() {
    let workspace = temp_dir("schedulerd-cancel-mat");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (classroom_id, schedule_id) = setup_schedule(&mut stdin, &mut reader, &workspace);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(run.get("created").and_then(|v| v.as_bool()), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "x1",
        "schedules.cancelOccurrence",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );

    // Gone, and not coming back.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "assignments.list",
        json!({ "classroomId": &classroom_id }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .unwrap()
            .len(),
        0
    );
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(run.get("skipped").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn deleting_a_schedule_produced_assignment_skips_its_run() {
    let workspace = temp_dir("schedulerd-delete-skips");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (classroom_id, schedule_id) = setup_schedule(&mut stdin, &mut reader, &workspace);

    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-08" }),
    );
    let assignment_id = run
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "assignments.delete",
        json!({ "assignmentId": &assignment_id }),
    );

    // The sweep for that Friday must not resurrect the deleted occurrence.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "sw1",
        "sweep.run",
        json!({ "now": "2024-03-06T12:00:00Z" }),
    );
    assert_eq!(
        report.get("created").and_then(|v| v.as_array()).unwrap().len(),
        0
    );
    assert_eq!(report.get("runSkipped").and_then(|v| v.as_i64()), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "assignments.list",
        json!({ "classroomId": &classroom_id }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .unwrap()
            .len(),
        0
    );
}
