use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::ipc::error::{fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::progression;

fn require_db(state: &AppState) -> Result<&Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| SchedulerError::validation("select a workspace first"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributeParams {
    operation_order: Vec<String>,
    primary_track: String,
    level_amount: i64,
    max_number: i64,
    #[serde(default)]
    student_id: Option<String>,
}

fn handle_distribute(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let params: DistributeParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => {
            return fail(
                &req.id,
                &SchedulerError::validation(format!("bad params: {e}")),
            )
        }
    };
    let levels = progression::distribute(
        &params.operation_order,
        &params.primary_track,
        params.level_amount,
        params.max_number,
    );
    ok(&req.id, json!({ "levels": levels }))
}

fn handle_apply_level(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let conn = require_db(state)?;
        let params: DistributeParams = serde_json::from_value(req.params.clone())
            .map_err(|e| SchedulerError::validation(format!("bad params: {e}")))?;
        let student_id = params
            .student_id
            .clone()
            .ok_or_else(|| SchedulerError::validation("missing studentId"))?;
        progression::apply_level(
            conn,
            &student_id,
            &params.operation_order,
            &params.primary_track,
            params.level_amount,
            params.max_number,
        )
    })();
    match result {
        Ok(levels) => ok(&req.id, json!({ "levels": levels })),
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "progression.distribute" => Some(handle_distribute(state, req)),
        "progression.applyLevel" => Some(handle_apply_level(state, req)),
        _ => None,
    }
}
