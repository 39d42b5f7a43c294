use chrono::Duration;
use rusqlite::Connection;
use serde_json::json;

use crate::calendar;
use crate::error::{Result, SchedulerError};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use crate::timeutil;

fn require_db(state: &AppState) -> Result<&Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| SchedulerError::validation("select a workspace first"))
}

fn handle_project_month(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let classroom_id = req
            .params
            .get("classroomId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing classroomId"))?;
        let month_start = req
            .params
            .get("monthStart")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing monthStart"))?;
        let month_end = req
            .params
            .get("monthEnd")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchedulerError::validation("missing monthEnd"))?;

        let range_start = timeutil::parse_local_date(month_start)?;
        let range_end = timeutil::parse_local_date(month_end)?;

        // Without a zone there is nothing to project; the materialized
        // instants are still real and get returned on their own.
        let tz = match store::classroom_timezone(conn, classroom_id)? {
            Some(name) => Some(timeutil::parse_timezone(&name)?),
            None => None,
        };

        let (from, to) = match tz {
            Some(tz) => (
                timeutil::local_date_to_utc_midnight(range_start, tz)?,
                timeutil::local_date_to_utc_midnight(range_end, tz)? + Duration::days(1),
            ),
            None => (
                timeutil::local_date_to_utc_midnight(range_start, chrono_tz::UTC)?,
                timeutil::local_date_to_utc_midnight(range_end, chrono_tz::UTC)? + Duration::days(1),
            ),
        };
        let materialized = store::list_assignments(
            conn,
            classroom_id,
            Some(&timeutil::fmt_instant(from)),
            Some(&timeutil::fmt_instant(to)),
        )?;

        let mut projected = Vec::new();
        if let Some(tz) = tz {
            for schedule in store::list_schedules(conn, Some(classroom_id))? {
                if !schedule.is_active {
                    continue;
                }
                projected.extend(calendar::project(&schedule, range_start, range_end, tz)?);
            }
        }

        Ok(calendar::merge(materialized, projected))
    })();
    match result {
        Ok(items) => ok(&req.id, json!({ "items": items })),
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.projectMonth" => Some(handle_project_month(state, req)),
        _ => None,
    }
}
