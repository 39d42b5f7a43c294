use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::materialize::{self, ComputedWindow};
use crate::store::{self, RecipientRule, Schedule, ScheduleSpec, TargetKind};
use crate::timeutil;

fn require_db(state: &AppState) -> Result<&Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| SchedulerError::validation("select a workspace first"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScheduleParams {
    #[serde(default)]
    classroom_id: Option<String>,
    #[serde(default)]
    schedule_id: Option<String>,
    weekdays: Vec<String>,
    local_time: String,
    #[serde(default)]
    window_minutes: i64,
    target_kind: String,
    #[serde(default)]
    assessment_type: Option<String>,
    #[serde(default)]
    num_questions: Option<i64>,
    #[serde(default)]
    duration_minutes: Option<i64>,
    #[serde(default)]
    recipient_rule: Option<String>,
    #[serde(default)]
    recipient_ids: Vec<String>,
    #[serde(default)]
    depends_on_schedule_id: Option<String>,
    #[serde(default)]
    offset_minutes: Option<i64>,
}

impl ScheduleParams {
    fn into_spec(self, classroom_id: String) -> Result<(ScheduleSpec, Vec<String>)> {
        let target_kind = TargetKind::parse(&self.target_kind)?;
        let recipient_rule = match self.recipient_rule.as_deref() {
            Some(rule) => RecipientRule::parse(rule)?,
            None => RecipientRule::All,
        };
        let spec = ScheduleSpec {
            classroom_id,
            weekdays: self.weekdays,
            local_time: self.local_time,
            window_minutes: self.window_minutes,
            target_kind,
            assessment_type: self.assessment_type,
            num_questions: self.num_questions,
            duration_minutes: self.duration_minutes,
            recipient_rule,
            depends_on_schedule_id: self.depends_on_schedule_id,
            offset_minutes: self.offset_minutes,
        };
        Ok((spec, self.recipient_ids))
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let params: ScheduleParams = serde_json::from_value(req.params.clone())
            .map_err(|e| SchedulerError::validation(format!("bad params: {e}")))?;
        let classroom_id = params
            .classroom_id
            .clone()
            .ok_or_else(|| SchedulerError::validation("missing classroomId"))?;
        let (spec, recipient_ids) = params.into_spec(classroom_id)?;
        store::create_schedule(conn, spec, &recipient_ids)
    })();
    match result {
        Ok(schedule) => ok(&req.id, json!({ "schedule": schedule })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let params: ScheduleParams = serde_json::from_value(req.params.clone())
            .map_err(|e| SchedulerError::validation(format!("bad params: {e}")))?;
        let schedule_id = params
            .schedule_id
            .clone()
            .ok_or_else(|| SchedulerError::validation("missing scheduleId"))?;
        // classroom is fixed; update_schedule pins it from the existing row
        let (spec, recipient_ids) = params.into_spec(String::new())?;
        store::update_schedule(conn, &schedule_id, spec, &recipient_ids)
    })();
    match result {
        Ok(schedule) => ok(&req.id, json!({ "schedule": schedule })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let schedule_id = req
            .params
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing scheduleId"))?;
        store::delete_schedule(conn, schedule_id)?;
        Ok(schedule_id.to_string())
    })();
    match result {
        Ok(schedule_id) => ok(&req.id, json!({ "scheduleId": schedule_id, "deleted": true })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let classroom_id = req.params.get("classroomId").and_then(|v| v.as_str());
        store::list_schedules(conn, classroom_id)
    })();
    match result {
        Ok(schedules) => ok(&req.id, json!({ "schedules": schedules })),
        Err(e) => fail(&req.id, &e),
    }
}

/// Resolve the classroom zone for a schedule, failing like the sweep would
/// when it is unset.
fn schedule_timezone(conn: &Connection, schedule: &Schedule) -> Result<chrono_tz::Tz> {
    let tz_name = store::classroom_timezone(conn, &schedule.classroom_id)?
        .ok_or_else(|| SchedulerError::validation("classroom timezone unset"))?;
    timeutil::parse_timezone(&tz_name)
}

/// Accepts either a plain local date (`YYYY-MM-DD`) or an RFC3339 instant;
/// both normalize to the canonical local-midnight run date.
fn resolve_run_date(
    raw: &str,
    tz: chrono_tz::Tz,
) -> Result<(chrono::NaiveDate, String)> {
    let local_date = if raw.contains('T') {
        timeutil::parse_instant(raw)?.with_timezone(&tz).date_naive()
    } else {
        timeutil::parse_local_date(raw)?
    };
    let canonical = timeutil::fmt_instant(timeutil::local_date_to_utc_midnight(local_date, tz)?);
    Ok((local_date, canonical))
}

fn parse_now(req: &Request) -> Result<DateTime<Utc>> {
    match req.params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => timeutil::parse_instant(raw),
        None => Ok(Utc::now()),
    }
}

fn handle_run_now(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let schedule_id = req
            .params
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing scheduleId"))?;
        let schedule = store::get_schedule(conn, schedule_id)?;
        let tz = schedule_timezone(conn, &schedule)?;

        let local_date = match req.params.get("runDate").and_then(|v| v.as_str()) {
            Some(raw) => resolve_run_date(raw, tz)?.0,
            None => {
                let now = parse_now(req)?;
                timeutil::next_matching_local_date(now, &schedule.weekdays, tz)?
            }
        };

        let window_minutes = match schedule.target_kind {
            TargetKind::PracticeTime => schedule.duration_minutes.ok_or_else(|| {
                SchedulerError::validation("practice schedule missing durationMinutes")
            })?,
            TargetKind::Assessment => schedule.window_minutes,
        };
        let (opens_at, closes_at) = timeutil::local_datetime_to_utc_range(
            local_date,
            &schedule.local_time,
            window_minutes,
            tz,
        )?;
        let run_date =
            timeutil::fmt_instant(timeutil::local_date_to_utc_midnight(local_date, tz)?);

        let recipients = materialize::resolve_schedule_recipients(conn, &schedule)?;
        let outcome = materialize::materialize(
            conn,
            &schedule,
            &run_date,
            &ComputedWindow {
                opens_at,
                closes_at,
                window_minutes,
            },
            recipients.as_deref(),
        );

        match outcome {
            Ok(o) => Ok(json!({ "assignment": o.assignment, "created": o.created })),
            Err(SchedulerError::RunSkipped { .. }) => {
                let reason = store::get_run(conn, &schedule.id, &run_date)?
                    .and_then(|r| r.skip_reason);
                Ok(json!({ "skipped": true, "reason": reason }))
            }
            Err(e) => Err(e),
        }
    })();
    match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_list_runs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let schedule_id = req
            .params
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing scheduleId"))?;
        store::get_schedule(conn, schedule_id)?;
        store::list_runs(conn, schedule_id)
    })();
    match result {
        Ok(runs) => ok(&req.id, json!({ "runs": runs })),
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_cancel_occurrence(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let schedule_id = req
            .params
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing scheduleId"))?;
        let raw_run_date = req
            .params
            .get("runDate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing runDate"))?;
        let reason = req.params.get("reason").and_then(|v| v.as_str());

        let schedule = store::get_schedule(conn, schedule_id)?;
        let tz = schedule_timezone(conn, &schedule)?;
        let (_, run_date) = resolve_run_date(raw_run_date, tz)?;
        let now = parse_now(req)?;

        materialize::cancel_occurrence(conn, schedule_id, &run_date, reason, now)?;
        Ok(run_date)
    })();
    match result {
        Ok(run_date) => ok(&req.id, json!({ "cancelled": true, "runDate": run_date })),
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedules.create" => Some(handle_create(state, req)),
        "schedules.update" => Some(handle_update(state, req)),
        "schedules.delete" => Some(handle_delete(state, req)),
        "schedules.list" => Some(handle_list(state, req)),
        "schedules.listRuns" => Some(handle_list_runs(state, req)),
        "schedules.runNow" => Some(handle_run_now(state, req)),
        "schedules.cancelOccurrence" => Some(handle_cancel_occurrence(state, req)),
        _ => None,
    }
}
