use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::gate;
use crate::materialize::{self, ComputedWindow};
use crate::store::{self, Assignment, SweepCandidate, TargetKind};
use crate::timeutil;

/// Per-schedule result of one sweep pass. Failures are values, not
/// unwound exceptions; one schedule can never abort the batch.
#[derive(Debug, Clone)]
pub enum SweepOutcome {
    Created(Assignment),
    AlreadyMaterialized(Assignment),
    RunSkipped { schedule_id: String },
    Deactivated { schedule_id: String, reason: String },
    Failed { schedule_id: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivatedSchedule {
    pub schedule_id: String,
    pub reason: String,
}

/// Aggregate view returned to callers: created instances plus counts for
/// everything that was benign or swallowed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub created: Vec<Assignment>,
    pub already_materialized: usize,
    pub run_skipped: usize,
    pub deactivated: Vec<DeactivatedSchedule>,
    pub failed: usize,
}

impl SweepReport {
    pub fn from_outcomes(outcomes: Vec<SweepOutcome>) -> Self {
        let mut report = SweepReport {
            created: Vec::new(),
            already_materialized: 0,
            run_skipped: 0,
            deactivated: Vec::new(),
            failed: 0,
        };
        for outcome in outcomes {
            match outcome {
                SweepOutcome::Created(a) => report.created.push(a),
                SweepOutcome::AlreadyMaterialized(_) => report.already_materialized += 1,
                SweepOutcome::RunSkipped { .. } => report.run_skipped += 1,
                SweepOutcome::Deactivated {
                    schedule_id,
                    reason,
                } => report.deactivated.push(DeactivatedSchedule {
                    schedule_id,
                    reason,
                }),
                SweepOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report
    }
}

/// Run every active schedule for the occurrence nearest to `now`. The
/// clock is an explicit input; nothing here reads system time.
pub fn run_active_schedules(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<SweepOutcome>> {
    let candidates = store::active_schedules_with_timezone(conn)?;
    info!(count = candidates.len(), "sweep: starting");

    let mut outcomes = Vec::with_capacity(candidates.len());
    for cand in candidates {
        let schedule_id = cand.schedule.id.clone();
        match sweep_one(conn, &cand, now) {
            Ok(outcome) => {
                if let SweepOutcome::Deactivated { reason, .. } = &outcome {
                    warn!(schedule_id = %schedule_id, reason = %reason, "sweep: schedule deactivated");
                }
                outcomes.push(outcome);
            }
            Err(SchedulerError::RunSkipped { .. }) => {
                outcomes.push(SweepOutcome::RunSkipped { schedule_id });
            }
            Err(e) => {
                // Transient failures skip this cycle only; the schedule
                // stays active for the next sweep.
                warn!(schedule_id = %schedule_id, error = %e, "sweep: schedule failed, continuing");
                outcomes.push(SweepOutcome::Failed {
                    schedule_id,
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(outcomes)
}

fn deactivate(conn: &Connection, schedule_id: &str, reason: &str) -> Result<SweepOutcome> {
    store::deactivate_schedule(conn, schedule_id)?;
    Ok(SweepOutcome::Deactivated {
        schedule_id: schedule_id.to_string(),
        reason: reason.to_string(),
    })
}

fn sweep_one(conn: &Connection, cand: &SweepCandidate, now: DateTime<Utc>) -> Result<SweepOutcome> {
    let schedule = &cand.schedule;

    let Some(tz_name) = cand.timezone.as_deref() else {
        return deactivate(conn, &schedule.id, "classroom timezone unset");
    };
    let tz = match timeutil::parse_timezone(tz_name) {
        Ok(tz) => tz,
        // A bad zone name never heals on its own; turn the schedule off.
        Err(_) => return deactivate(conn, &schedule.id, "classroom timezone invalid"),
    };

    let decision = gate::scheduling_allowed(conn, &cand.teacher_id)?;
    if !decision.allowed {
        let reason = decision
            .reason
            .unwrap_or_else(|| "scheduling not permitted".to_string());
        return deactivate(conn, &schedule.id, &reason);
    }

    // Internal consistency; stale rows can predate the creation-time checks.
    let window_minutes = match schedule.target_kind {
        TargetKind::Assessment => {
            if schedule
                .assessment_type
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
            {
                return deactivate(conn, &schedule.id, "assessment schedule missing a subtype");
            }
            schedule.window_minutes
        }
        TargetKind::PracticeTime => match schedule.duration_minutes {
            Some(n) if n > 0 => n,
            _ => {
                return deactivate(
                    conn,
                    &schedule.id,
                    "practice schedule missing durationMinutes",
                )
            }
        },
    };

    let local_date = timeutil::next_matching_local_date(now, &schedule.weekdays, tz)?;
    let (opens_at, closes_at) =
        timeutil::local_datetime_to_utc_range(local_date, &schedule.local_time, window_minutes, tz)?;
    let run_date = timeutil::fmt_instant(timeutil::local_date_to_utc_midnight(local_date, tz)?);

    let recipients = materialize::resolve_schedule_recipients(conn, schedule)?;
    let outcome = materialize::materialize(
        conn,
        schedule,
        &run_date,
        &ComputedWindow {
            opens_at,
            closes_at,
            window_minutes,
        },
        recipients.as_deref(),
    )?;

    Ok(if outcome.created {
        SweepOutcome::Created(outcome.assignment)
    } else {
        SweepOutcome::AlreadyMaterialized(outcome.assignment)
    })
}
