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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn attempted_assignments_are_frozen() {
    let workspace = temp_dir("schedulerd-immutability");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "teachers.create",
        json!({ "name": "T" }),
    );
    let teacher_id = teacher.get("teacherId").and_then(|v| v.as_str()).unwrap();
    let classroom = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classrooms.create",
        json!({ "teacherId": &teacher_id, "name": "Room", "timezone": "UTC" }),
    );
    let classroom_id = classroom
        .get("classroomId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "st1",
        "students.add",
        json!({ "classroomId": &classroom_id, "name": "Ada" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let schedule = request_ok(
        &mut stdin,
        &mut reader,
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
    let schedule_id = schedule
        .get("schedule")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "schedules.runNow",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
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
        "a1",
        "attempts.record",
        json!({ "assignmentId": &assignment_id, "studentId": &student_id }),
    );

    // Rescheduling, deleting, and cancelling all hit the conflict wall.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "u1",
        "assignments.update",
        json!({
            "assignmentId": &assignment_id,
            "opensAt": "2024-03-02T09:00:00Z",
            "closesAt": "2024-03-02T09:30:00Z"
        }),
    );
    assert_eq!(code, "conflict");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "d1",
        "assignments.delete",
        json!({ "assignmentId": &assignment_id }),
    );
    assert_eq!(code, "conflict");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "x1",
        "schedules.cancelOccurrence",
        json!({ "scheduleId": &schedule_id, "runDate": "2024-03-01" }),
    );
    assert_eq!(code, "conflict");

    // Still exactly one assignment, untouched.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "assignments.list",
        json!({ "classroomId": &classroom_id }),
    );
    let assignments = listed.get("assignments").and_then(|v| v.as_array()).unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(
        assignments[0].get("opensAt").and_then(|v| v.as_str()),
        Some("2024-03-01T09:00:00Z")
    );
}

#[test]
fn unattempted_assignments_can_still_be_rescheduled() {
    let workspace = temp_dir("schedulerd-reschedule");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "teachers.create",
        json!({ "name": "T" }),
    );
    let teacher_id = teacher.get("teacherId").and_then(|v| v.as_str()).unwrap();
    let classroom = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classrooms.create",
        json!({ "teacherId": &teacher_id, "name": "Room", "timezone": "UTC" }),
    );
    let classroom_id = classroom
        .get("classroomId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "assignments.createDirect",
        json!({
            "classroomId": &classroom_id,
            "targetKind": "ASSESSMENT",
            "assessmentType": "TEST",
            "numQuestions": 4,
            "opensAt": "2024-03-05T14:00:00Z",
            "closesAt": "2024-03-05T14:30:00Z"
        }),
    );
    let assignment_id = created
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "assignments.update",
        json!({
            "assignmentId": &assignment_id,
            "opensAt": "2024-03-06T14:00:00Z",
            "closesAt": "2024-03-06T15:00:00Z"
        }),
    );
    let a = updated.get("assignment").unwrap();
    assert_eq!(
        a.get("opensAt").and_then(|v| v.as_str()),
        Some("2024-03-06T14:00:00Z")
    );
    assert_eq!(a.get("windowMinutes").and_then(|v| v.as_i64()), Some(60));
}
