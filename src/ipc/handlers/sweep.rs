use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep::{self, SweepReport};
use crate::timeutil;

fn require_db(state: &AppState) -> Result<&Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| SchedulerError::validation("select a workspace first"))
}

fn handle_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let now: DateTime<Utc> = match req.params.get("now").and_then(|v| v.as_str()) {
            Some(raw) => timeutil::parse_instant(raw)?,
            None => Utc::now(),
        };
        let outcomes = sweep::run_active_schedules(conn, now)?;
        Ok(SweepReport::from_outcomes(outcomes))
    })();
    match result {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sweep.run" => Some(handle_run(state, req)),
        _ => None,
    }
}
