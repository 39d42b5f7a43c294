use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::timeutil;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn require_db<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name) VALUES(?, ?)",
        (&teacher_id, &name),
    ) {
        return err(&req.id, "db_error", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_teachers_set_entitlement(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let Some(entitled) = req.params.get("entitled").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing entitled", None);
    };
    let reason = req.params.get("reason").and_then(|v| v.as_str());

    let updated = match conn.execute(
        "UPDATE teachers SET scheduling_entitled = ?, entitlement_reason = ? WHERE id = ?",
        (entitled as i64, reason, teacher_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id, "entitled": entitled }))
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let timezone = req
        .params
        .get("timezone")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if let Some(tz) = &timezone {
        if let Err(e) = timeutil::parse_timezone(tz) {
            return err(&req.id, e.code(), e.to_string(), None);
        }
    }

    let teacher_exists: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM teachers WHERE id = ?",
        [teacher_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    if teacher_exists == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let classroom_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classrooms(id, teacher_id, name, timezone) VALUES(?, ?, ?, ?)",
        (&classroom_id, teacher_id, &name, &timezone),
    ) {
        return err(&req.id, "db_error", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "classroomId": classroom_id, "name": name, "timezone": timezone }),
    )
}

fn handle_classrooms_set_timezone(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(classroom_id) = req.params.get("classroomId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classroomId", None);
    };
    // An explicit null unsets the zone; the next sweep then deactivates
    // the classroom's schedules.
    let timezone = req
        .params
        .get("timezone")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if let Some(tz) = &timezone {
        if let Err(e) = timeutil::parse_timezone(tz) {
            return err(&req.id, e.code(), e.to_string(), None);
        }
    }

    let updated = match conn.execute(
        "UPDATE classrooms SET timezone = ? WHERE id = ?",
        (&timezone, classroom_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "classroom not found", None);
    }
    ok(
        &req.id,
        json!({ "classroomId": classroom_id, "timezone": timezone }),
    )
}

fn handle_students_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(classroom_id) = req.params.get("classroomId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classroomId", None);
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    let classroom_exists: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM classrooms WHERE id = ?",
        [classroom_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    if classroom_exists == 0 {
        return err(&req.id, "not_found", "classroom not found", None);
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, classroom_id, name) VALUES(?, ?, ?)",
        (&student_id, classroom_id, &name),
    ) {
        return err(&req.id, "db_error", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.setEntitlement" => Some(handle_teachers_set_entitlement(state, req)),
        "classrooms.create" => Some(handle_classrooms_create(state, req)),
        "classrooms.setTimezone" => Some(handle_classrooms_set_timezone(state, req)),
        "students.add" => Some(handle_students_add(state, req)),
        _ => None,
    }
}
