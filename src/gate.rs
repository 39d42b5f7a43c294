use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, SchedulerError};

/// Outcome of the entitlement check. A denial is a normal result, not an
/// error; the sweep reacts by deactivating the offending schedule.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Read-only billing gate: may this teacher run schedules right now?
/// The billing collaborator maintains the underlying flag from outside.
pub fn scheduling_allowed(conn: &Connection, teacher_id: &str) -> Result<GateDecision> {
    let row = conn
        .query_row(
            "SELECT scheduling_entitled, entitlement_reason FROM teachers WHERE id = ?",
            [teacher_id],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    match row {
        None => Err(SchedulerError::not_found(format!(
            "teacher not found: {teacher_id}"
        ))),
        Some((entitled, _)) if entitled != 0 => Ok(GateDecision {
            allowed: true,
            reason: None,
        }),
        Some((_, reason)) => Ok(GateDecision {
            allowed: false,
            reason: reason.or_else(|| Some("subscription lapsed".to_string())),
        }),
    }
}
