use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::materialize::{self, DirectSpec};
use crate::store::{self, TargetKind};
use crate::timeutil;

fn require_db(state: &AppState) -> Result<&Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| SchedulerError::validation("select a workspace first"))
}

fn parse_now(req: &Request) -> Result<DateTime<Utc>> {
    match req.params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => timeutil::parse_instant(raw),
        None => Ok(Utc::now()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectParams {
    classroom_id: String,
    target_kind: String,
    #[serde(default)]
    assessment_type: Option<String>,
    #[serde(default)]
    num_questions: Option<i64>,
    #[serde(default)]
    duration_minutes: Option<i64>,
    opens_at: String,
    #[serde(default)]
    closes_at: Option<String>,
    #[serde(default)]
    recipient_ids: Option<Vec<String>>,
}

fn handle_create_direct(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let params: DirectParams = serde_json::from_value(req.params.clone())
            .map_err(|e| SchedulerError::validation(format!("bad params: {e}")))?;

        let opens_at = timeutil::parse_instant(&params.opens_at)?;
        let closes_at = params
            .closes_at
            .as_deref()
            .map(timeutil::parse_instant)
            .transpose()?;

        let spec = DirectSpec {
            classroom_id: params.classroom_id,
            target_kind: TargetKind::parse(&params.target_kind)?,
            assessment_type: params.assessment_type,
            num_questions: params.num_questions,
            duration_minutes: params.duration_minutes,
            opens_at,
            closes_at,
        };
        materialize::create_direct(conn, spec, params.recipient_ids.as_deref())
    })();
    match result {
        Ok(assignment) => ok(&req.id, json!({ "assignment": assignment })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let assignment_id = req
            .params
            .get("assignmentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing assignmentId"))?;
        let opens_at = req
            .params
            .get("opensAt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing opensAt"))?;
        let closes_at = req
            .params
            .get("closesAt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing closesAt"))?;
        let now = parse_now(req)?;

        materialize::reschedule_assignment(
            conn,
            assignment_id,
            timeutil::parse_instant(opens_at)?,
            timeutil::parse_instant(closes_at)?,
            now,
        )
    })();
    match result {
        Ok(assignment) => ok(&req.id, json!({ "assignment": assignment })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let assignment_id = req
            .params
            .get("assignmentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing assignmentId"))?;
        let now = parse_now(req)?;
        materialize::delete_assignment(conn, assignment_id, now)?;
        Ok(assignment_id.to_string())
    })();
    match result {
        Ok(assignment_id) => ok(
            &req.id,
            json!({ "assignmentId": assignment_id, "deleted": true }),
        ),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let classroom_id = req
            .params
            .get("classroomId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing classroomId"))?;
        let from = req.params.get("from").and_then(|v| v.as_str());
        let to = req.params.get("to").and_then(|v| v.as_str());
        let assignments = store::list_assignments(conn, classroom_id, from, to)?;

        // Attach the explicit target set where one exists; an absent list
        // means the whole classroom.
        let mut out = Vec::with_capacity(assignments.len());
        for a in assignments {
            let recipients = store::assignment_recipient_ids(conn, &a.id)?;
            let mut item = serde_json::to_value(&a)
                .map_err(|e| SchedulerError::validation(e.to_string()))?;
            if !recipients.is_empty() {
                item["recipientIds"] = json!(recipients);
            }
            out.push(item);
        }
        Ok(out)
    })();
    match result {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_record_attempt(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let assignment_id = req
            .params
            .get("assignmentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing assignmentId"))?;
        let student_id = req
            .params
            .get("studentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing studentId"))?;
        let started_at = match req.params.get("startedAt").and_then(|v| v.as_str()) {
            Some(raw) => timeutil::fmt_instant(timeutil::parse_instant(raw)?),
            None => timeutil::fmt_instant(Utc::now()),
        };
        store::record_attempt(conn, assignment_id, student_id, &started_at)
    })();
    match result {
        Ok(attempt_id) => ok(&req.id, json!({ "attemptId": attempt_id })),
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.createDirect" => Some(handle_create_direct(state, req)),
        "assignments.update" => Some(handle_update(state, req)),
        "assignments.delete" => Some(handle_delete(state, req)),
        "assignments.list" => Some(handle_list(state, req)),
        "attempts.record" => Some(handle_record_attempt(state, req)),
        _ => None,
    }
}
