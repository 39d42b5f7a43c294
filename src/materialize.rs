use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::store::{self, Assignment, RecipientRule, Schedule, TargetKind};
use crate::timeutil;

/// Open/close instants computed by the resolver for one occurrence.
#[derive(Debug, Clone, Copy)]
pub struct ComputedWindow {
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub window_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct MaterializeOutcome {
    pub assignment: Assignment,
    /// False on the idempotent fast path (the occurrence already existed).
    pub created: bool,
}

/// Recipient set for one occurrence. `None` means the whole classroom.
pub fn resolve_schedule_recipients(
    conn: &Connection,
    schedule: &Schedule,
) -> Result<Option<Vec<String>>> {
    match schedule.recipient_rule {
        RecipientRule::All => Ok(None),
        RecipientRule::Targeted => {
            Ok(Some(store::schedule_recipient_ids(conn, &schedule.id)?))
        }
    }
}

fn check_recipients(
    conn: &Connection,
    classroom_id: &str,
    recipients: &[String],
) -> Result<Vec<String>> {
    let mut deduped: Vec<String> = Vec::with_capacity(recipients.len());
    for sid in recipients {
        if !deduped.contains(sid) {
            deduped.push(sid.clone());
        }
    }
    if !store::validate_membership(conn, classroom_id, &deduped)? {
        return Err(SchedulerError::validation(
            "recipients must all belong to the classroom",
        ));
    }
    if deduped.is_empty() {
        return Err(SchedulerError::conflict(
            "assignment must target at least one student",
        ));
    }
    Ok(deduped)
}

/// Create-or-fetch the single assignment for `(schedule, run_date)`.
///
/// The ledger upsert, the assignment insert, and the pointer write share one
/// transaction; the orphan lookup before creation reconciles any earlier
/// crash between insert and pointer write.
pub fn materialize(
    conn: &Connection,
    schedule: &Schedule,
    run_date: &str,
    window: &ComputedWindow,
    recipients: Option<&[String]>,
) -> Result<MaterializeOutcome> {
    if window.closes_at <= window.opens_at {
        return Err(SchedulerError::conflict("closesAt must be after opensAt"));
    }

    let tx = conn.unchecked_transaction()?;

    let run = store::upsert_run(&tx, &schedule.id, run_date)?;
    if run.is_skipped {
        return Err(SchedulerError::RunSkipped {
            schedule_id: schedule.id.clone(),
            run_date: run_date.to_string(),
        });
    }

    if let Some(assignment_id) = &run.assignment_id {
        match store::get_assignment(&tx, assignment_id)? {
            Some(existing) => {
                tx.commit()?;
                return Ok(MaterializeOutcome {
                    assignment: existing,
                    created: false,
                });
            }
            None => {
                // Pointer to a deleted assignment; clear it and re-materialize.
                store::set_run_assignment(&tx, &schedule.id, run_date, None)?;
            }
        }
    }

    // A crash after insert but before the pointer write leaves an orphan
    // sharing the natural key; adopt it instead of duplicating.
    if let Some(orphan) = store::find_assignment_by_natural_key(&tx, &schedule.id, run_date)? {
        store::set_run_assignment(&tx, &schedule.id, run_date, Some(&orphan.id))?;
        tx.commit()?;
        return Ok(MaterializeOutcome {
            assignment: orphan,
            created: false,
        });
    }

    let recipient_rows = match recipients {
        Some(ids) => Some(check_recipients(&tx, &schedule.classroom_id, ids)?),
        None => None,
    };

    let assignment = Assignment {
        id: Uuid::new_v4().to_string(),
        classroom_id: schedule.classroom_id.clone(),
        schedule_id: Some(schedule.id.clone()),
        run_date: Some(run_date.to_string()),
        opens_at: timeutil::fmt_instant(window.opens_at),
        closes_at: timeutil::fmt_instant(window.closes_at),
        window_minutes: window.window_minutes,
        target_kind: schedule.target_kind,
        assessment_type: schedule.assessment_type.clone(),
        num_questions: schedule.num_questions,
        duration_minutes: schedule.duration_minutes,
    };
    store::insert_assignment(&tx, &assignment)?;
    if let Some(ids) = &recipient_rows {
        store::insert_assignment_recipients(&tx, &assignment.id, ids)?;
    }
    store::set_run_assignment(&tx, &schedule.id, run_date, Some(&assignment.id))?;
    tx.commit()?;

    Ok(MaterializeOutcome {
        assignment,
        created: true,
    })
}

/// Input for the manual/makeup creation path.
#[derive(Debug, Clone)]
pub struct DirectSpec {
    pub classroom_id: String,
    pub target_kind: TargetKind,
    pub assessment_type: Option<String>,
    pub num_questions: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub opens_at: DateTime<Utc>,
    pub closes_at: Option<DateTime<Utc>>,
}

/// Manual creation: same shape and instant rules as the schedule path, no
/// run ledger involved.
pub fn create_direct(
    conn: &Connection,
    spec: DirectSpec,
    recipients: Option<&[String]>,
) -> Result<Assignment> {
    // Errors with not_found if the classroom is missing.
    store::classroom_timezone(conn, &spec.classroom_id)?;

    store::validate_target_shape(
        spec.target_kind,
        spec.assessment_type.as_deref(),
        spec.num_questions,
        spec.duration_minutes,
    )?;

    let closes_at = match (spec.target_kind, spec.closes_at) {
        (_, Some(closes)) => closes,
        (TargetKind::PracticeTime, None) => {
            // durationMinutes is guaranteed by the shape check.
            let minutes = spec.duration_minutes.unwrap_or(0);
            spec.opens_at + chrono::Duration::minutes(minutes)
        }
        (TargetKind::Assessment, None) => {
            return Err(SchedulerError::validation(
                "assessments require an explicit closesAt",
            ));
        }
    };
    if closes_at <= spec.opens_at {
        return Err(SchedulerError::conflict("closesAt must be after opensAt"));
    }

    let tx = conn.unchecked_transaction()?;
    let recipient_rows = match recipients {
        Some(ids) => Some(check_recipients(&tx, &spec.classroom_id, ids)?),
        None => None,
    };

    let assignment = Assignment {
        id: Uuid::new_v4().to_string(),
        classroom_id: spec.classroom_id,
        schedule_id: None,
        run_date: None,
        opens_at: timeutil::fmt_instant(spec.opens_at),
        closes_at: timeutil::fmt_instant(closes_at),
        window_minutes: (closes_at - spec.opens_at).num_minutes(),
        target_kind: spec.target_kind,
        assessment_type: spec.assessment_type,
        num_questions: spec.num_questions,
        duration_minutes: spec.duration_minutes,
    };
    store::insert_assignment(&tx, &assignment)?;
    if let Some(ids) = &recipient_rows {
        store::insert_assignment_recipients(&tx, &assignment.id, ids)?;
    }
    tx.commit()?;
    Ok(assignment)
}

/// Skip an occurrence so future sweeps leave it alone. Deletes the
/// materialized assignment when one exists and nobody has attempted it.
pub fn cancel_occurrence(
    conn: &Connection,
    schedule_id: &str,
    run_date: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    store::get_schedule(conn, schedule_id)?;

    let tx = conn.unchecked_transaction()?;
    if let Some(run) = store::get_run(&tx, schedule_id, run_date)? {
        if let Some(assignment_id) = &run.assignment_id {
            if store::count_attempts(&tx, assignment_id)? > 0 {
                return Err(SchedulerError::conflict(
                    "occurrence already has student attempts",
                ));
            }
            store::delete_assignment_rows(&tx, assignment_id)?;
        }
    }
    store::mark_run_skipped(
        &tx,
        schedule_id,
        run_date,
        &timeutil::fmt_instant(now),
        reason,
    )?;
    tx.commit()?;
    Ok(())
}

/// Move an assignment's window. Attempted assignments are frozen; a
/// schedule-produced one detaches from its run so the sweep cannot
/// resurrect the original slot.
pub fn reschedule_assignment(
    conn: &Connection,
    assignment_id: &str,
    opens_at: DateTime<Utc>,
    closes_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Assignment> {
    let assignment = store::get_assignment(conn, assignment_id)?.ok_or_else(|| {
        SchedulerError::not_found(format!("assignment not found: {assignment_id}"))
    })?;
    if store::count_attempts(conn, assignment_id)? > 0 {
        return Err(SchedulerError::conflict(
            "assignment already has student attempts",
        ));
    }
    if closes_at <= opens_at {
        return Err(SchedulerError::conflict("closesAt must be after opensAt"));
    }

    let tx = conn.unchecked_transaction()?;
    store::update_assignment_window(
        &tx,
        assignment_id,
        &timeutil::fmt_instant(opens_at),
        &timeutil::fmt_instant(closes_at),
        (closes_at - opens_at).num_minutes(),
    )?;
    if let (Some(schedule_id), Some(run_date)) = (&assignment.schedule_id, &assignment.run_date) {
        // The schedule may be gone already; its ledger went with it.
        if store::schedule_exists(&tx, schedule_id)? {
            store::mark_run_skipped(
                &tx,
                schedule_id,
                run_date,
                &timeutil::fmt_instant(now),
                Some("rescheduled by teacher"),
            )?;
        }
    }
    tx.commit()?;

    store::get_assignment(conn, assignment_id)?.ok_or_else(|| {
        SchedulerError::not_found(format!("assignment not found: {assignment_id}"))
    })
}

/// Delete an assignment. Attempted assignments are frozen; a
/// schedule-produced one marks its run skipped so the occurrence stays
/// cancelled.
pub fn delete_assignment(conn: &Connection, assignment_id: &str, now: DateTime<Utc>) -> Result<()> {
    let assignment = store::get_assignment(conn, assignment_id)?.ok_or_else(|| {
        SchedulerError::not_found(format!("assignment not found: {assignment_id}"))
    })?;
    if store::count_attempts(conn, assignment_id)? > 0 {
        return Err(SchedulerError::conflict(
            "assignment already has student attempts",
        ));
    }

    let tx = conn.unchecked_transaction()?;
    store::delete_assignment_rows(&tx, assignment_id)?;
    if let (Some(schedule_id), Some(run_date)) = (&assignment.schedule_id, &assignment.run_date) {
        // The schedule may be gone already; its ledger went with it.
        if store::schedule_exists(&tx, schedule_id)? {
            store::mark_run_skipped(
                &tx,
                schedule_id,
                run_date,
                &timeutil::fmt_instant(now),
                Some("deleted by teacher"),
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}
