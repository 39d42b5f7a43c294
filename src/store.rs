use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::timeutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "ASSESSMENT")]
    Assessment,
    #[serde(rename = "PRACTICE_TIME")]
    PracticeTime,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assessment => "ASSESSMENT",
            Self::PracticeTime => "PRACTICE_TIME",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ASSESSMENT" => Ok(Self::Assessment),
            "PRACTICE_TIME" => Ok(Self::PracticeTime),
            _ => Err(SchedulerError::validation(format!(
                "unknown targetKind: {s:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientRule {
    #[serde(rename = "ALL")]
    All,
    #[serde(rename = "TARGETED")]
    Targeted,
}

impl RecipientRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Targeted => "TARGETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ALL" => Ok(Self::All),
            "TARGETED" => Ok(Self::Targeted),
            _ => Err(SchedulerError::validation(format!(
                "unknown recipientRule: {s:?}"
            ))),
        }
    }
}

/// Recurring schedule template. `weekdays` holds canonical day names;
/// instants never appear here, only local wall-clock components.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub classroom_id: String,
    pub weekdays: Vec<String>,
    pub local_time: String,
    pub window_minutes: i64,
    pub target_kind: TargetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_questions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    pub recipient_rule: RecipientRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on_schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_minutes: Option<i64>,
    pub is_active: bool,
}

/// One ledger row per occurrence; the `(schedule_id, run_date)` key is the
/// sole synchronization point between overlapping sweeps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRun {
    pub schedule_id: String,
    pub run_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    pub is_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// Materialized, student-facing assignment. All instants are canonical
/// RFC3339 UTC strings; schedule_id/run_date are NULL for manual creations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub classroom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_date: Option<String>,
    pub opens_at: String,
    pub closes_at: String,
    pub window_minutes: i64,
    pub target_kind: TargetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_questions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

/// Validated input for schedule create/update.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub classroom_id: String,
    pub weekdays: Vec<String>,
    pub local_time: String,
    pub window_minutes: i64,
    pub target_kind: TargetKind,
    pub assessment_type: Option<String>,
    pub num_questions: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub recipient_rule: RecipientRule,
    pub depends_on_schedule_id: Option<String>,
    pub offset_minutes: Option<i64>,
}

/// Raw TEXT columns that need decoding after the rusqlite row closure.
struct RawSchedule {
    schedule: Schedule,
    weekdays_json: String,
    target_kind: String,
    recipient_rule: String,
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<RawSchedule> {
    Ok(RawSchedule {
        schedule: Schedule {
            id: row.get(0)?,
            classroom_id: row.get(1)?,
            weekdays: Vec::new(),
            local_time: row.get(3)?,
            window_minutes: row.get(4)?,
            target_kind: TargetKind::Assessment,
            assessment_type: row.get(6)?,
            num_questions: row.get(7)?,
            duration_minutes: row.get(8)?,
            recipient_rule: RecipientRule::All,
            depends_on_schedule_id: row.get(10)?,
            offset_minutes: row.get(11)?,
            is_active: row.get::<_, i64>(12)? != 0,
        },
        weekdays_json: row.get(2)?,
        target_kind: row.get(5)?,
        recipient_rule: row.get(9)?,
    })
}

fn decode_schedule(raw: RawSchedule) -> Result<Schedule> {
    let mut sched = raw.schedule;
    sched.weekdays = serde_json::from_str(&raw.weekdays_json)
        .map_err(|e| SchedulerError::validation(format!("corrupt weekdays column: {e}")))?;
    sched.target_kind = TargetKind::parse(&raw.target_kind)?;
    sched.recipient_rule = RecipientRule::parse(&raw.recipient_rule)?;
    Ok(sched)
}

const SCHEDULE_COLUMNS: &str = "id, classroom_id, weekdays, local_time, window_minutes, \
     target_kind, assessment_type, num_questions, duration_minutes, recipient_rule, \
     depends_on_schedule_id, offset_minutes, is_active";

/// Field rules for the ASSESSMENT / PRACTICE_TIME discriminator, shared by
/// the schedule and direct creation paths.
pub fn validate_target_shape(
    target_kind: TargetKind,
    assessment_type: Option<&str>,
    num_questions: Option<i64>,
    duration_minutes: Option<i64>,
) -> Result<()> {
    match target_kind {
        TargetKind::Assessment => {
            if assessment_type.map(str::trim).unwrap_or("").is_empty() {
                return Err(SchedulerError::validation(
                    "assessments require assessmentType",
                ));
            }
            match num_questions {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(SchedulerError::validation(
                        "assessments require a positive numQuestions",
                    ))
                }
            }
            if duration_minutes.is_some() {
                return Err(SchedulerError::validation(
                    "durationMinutes is not valid for assessments",
                ));
            }
        }
        TargetKind::PracticeTime => {
            match duration_minutes {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(SchedulerError::validation(
                        "practice time requires a positive durationMinutes",
                    ))
                }
            }
            // Question counts are meaningless for practice time.
            if matches!(num_questions, Some(n) if n != 0) {
                return Err(SchedulerError::validation(
                    "numQuestions is not valid for practice time",
                ));
            }
            if assessment_type.is_some() {
                return Err(SchedulerError::validation(
                    "assessmentType is not valid for practice time",
                ));
            }
        }
    }
    Ok(())
}

/// Canonicalize and validate a spec against the rules of its target shape.
pub fn validate_spec(conn: &Connection, spec: &mut ScheduleSpec) -> Result<()> {
    if spec.weekdays.is_empty() {
        return Err(SchedulerError::validation(
            "schedule must include at least one weekday",
        ));
    }
    let mut canonical: Vec<String> = Vec::with_capacity(spec.weekdays.len());
    for token in &spec.weekdays {
        let name = timeutil::weekday_name(timeutil::parse_weekday(token)?).to_string();
        if !canonical.contains(&name) {
            canonical.push(name);
        }
    }
    spec.weekdays = canonical;

    timeutil::parse_local_time(&spec.local_time)?;

    validate_target_shape(
        spec.target_kind,
        spec.assessment_type.as_deref(),
        spec.num_questions,
        spec.duration_minutes,
    )?;
    match spec.target_kind {
        TargetKind::Assessment => {
            if spec.window_minutes <= 0 {
                return Err(SchedulerError::validation("windowMinutes must be positive"));
            }
        }
        TargetKind::PracticeTime => {
            // The practice duration IS the window; shape check guarantees
            // it is positive. A zero question count normalizes away.
            spec.window_minutes = spec.duration_minutes.unwrap_or(0);
            spec.num_questions = None;
        }
    }

    if spec.offset_minutes.is_some() && spec.depends_on_schedule_id.is_none() {
        return Err(SchedulerError::validation(
            "offsetMinutes requires dependsOnScheduleId",
        ));
    }
    if let Some(dep) = &spec.depends_on_schedule_id {
        if !schedule_exists(conn, dep)? {
            return Err(SchedulerError::not_found(format!(
                "dependsOnScheduleId not found: {dep}"
            )));
        }
    }

    Ok(())
}

pub fn create_schedule(
    conn: &Connection,
    mut spec: ScheduleSpec,
    recipient_ids: &[String],
) -> Result<Schedule> {
    let classroom_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM classrooms WHERE id = ?",
        [&spec.classroom_id],
        |r| r.get(0),
    )?;
    if classroom_exists == 0 {
        return Err(SchedulerError::not_found(format!(
            "classroom not found: {}",
            spec.classroom_id
        )));
    }

    validate_spec(conn, &mut spec)?;
    check_recipient_rule(conn, &spec.classroom_id, spec.recipient_rule, recipient_ids)?;

    let schedule_id = Uuid::new_v4().to_string();
    let weekdays_json = serde_json::to_string(&spec.weekdays)
        .map_err(|e| SchedulerError::validation(e.to_string()))?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO schedules(
            id, classroom_id, weekdays, local_time, window_minutes,
            target_kind, assessment_type, num_questions, duration_minutes,
            recipient_rule, depends_on_schedule_id, offset_minutes, is_active
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &schedule_id,
            &spec.classroom_id,
            &weekdays_json,
            &spec.local_time,
            spec.window_minutes,
            spec.target_kind.as_str(),
            &spec.assessment_type,
            spec.num_questions,
            spec.duration_minutes,
            spec.recipient_rule.as_str(),
            &spec.depends_on_schedule_id,
            spec.offset_minutes,
        ),
    )?;
    for sid in recipient_ids {
        tx.execute(
            "INSERT INTO schedule_recipients(schedule_id, student_id) VALUES(?, ?)
             ON CONFLICT(schedule_id, student_id) DO NOTHING",
            (&schedule_id, sid),
        )?;
    }
    tx.commit()?;

    get_schedule(conn, &schedule_id)
}

pub fn update_schedule(
    conn: &Connection,
    schedule_id: &str,
    mut spec: ScheduleSpec,
    recipient_ids: &[String],
) -> Result<Schedule> {
    let existing = get_schedule(conn, schedule_id)?;
    // Schedules never move between classrooms.
    spec.classroom_id = existing.classroom_id.clone();

    validate_spec(conn, &mut spec)?;
    check_recipient_rule(conn, &spec.classroom_id, spec.recipient_rule, recipient_ids)?;
    if spec.depends_on_schedule_id.as_deref() == Some(schedule_id) {
        return Err(SchedulerError::validation(
            "a schedule cannot depend on itself",
        ));
    }

    let weekdays_json = serde_json::to_string(&spec.weekdays)
        .map_err(|e| SchedulerError::validation(e.to_string()))?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE schedules SET
            weekdays = ?, local_time = ?, window_minutes = ?,
            target_kind = ?, assessment_type = ?, num_questions = ?,
            duration_minutes = ?, recipient_rule = ?,
            depends_on_schedule_id = ?, offset_minutes = ?
         WHERE id = ?",
        (
            &weekdays_json,
            &spec.local_time,
            spec.window_minutes,
            spec.target_kind.as_str(),
            &spec.assessment_type,
            spec.num_questions,
            spec.duration_minutes,
            spec.recipient_rule.as_str(),
            &spec.depends_on_schedule_id,
            spec.offset_minutes,
            schedule_id,
        ),
    )?;
    tx.execute(
        "DELETE FROM schedule_recipients WHERE schedule_id = ?",
        [schedule_id],
    )?;
    for sid in recipient_ids {
        tx.execute(
            "INSERT INTO schedule_recipients(schedule_id, student_id) VALUES(?, ?)
             ON CONFLICT(schedule_id, student_id) DO NOTHING",
            (&schedule_id, sid),
        )?;
    }
    tx.commit()?;

    get_schedule(conn, schedule_id)
}

fn check_recipient_rule(
    conn: &Connection,
    classroom_id: &str,
    rule: RecipientRule,
    recipient_ids: &[String],
) -> Result<()> {
    match rule {
        RecipientRule::All => {
            if !recipient_ids.is_empty() {
                return Err(SchedulerError::validation(
                    "recipientIds are only valid with recipientRule TARGETED",
                ));
            }
        }
        RecipientRule::Targeted => {
            if recipient_ids.is_empty() {
                return Err(SchedulerError::validation(
                    "targeted schedules must name at least one student",
                ));
            }
            if !validate_membership(conn, classroom_id, recipient_ids)? {
                return Err(SchedulerError::validation(
                    "recipientIds must all belong to the classroom",
                ));
            }
        }
    }
    Ok(())
}

pub fn schedule_exists(conn: &Connection, schedule_id: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schedules WHERE id = ?",
        [schedule_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn get_schedule(conn: &Connection, schedule_id: &str) -> Result<Schedule> {
    let raw = conn
        .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"),
            [schedule_id],
            schedule_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => decode_schedule(raw),
        None => Err(SchedulerError::not_found(format!(
            "schedule not found: {schedule_id}"
        ))),
    }
}

pub fn list_schedules(conn: &Connection, classroom_id: Option<&str>) -> Result<Vec<Schedule>> {
    let mut out = Vec::new();
    match classroom_id {
        Some(cid) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE classroom_id = ? ORDER BY id"
            ))?;
            let rows = stmt.query_map([cid], schedule_from_row)?;
            for raw in rows {
                out.push(decode_schedule(raw?)?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY id"
            ))?;
            let rows = stmt.query_map([], schedule_from_row)?;
            for raw in rows {
                out.push(decode_schedule(raw?)?);
            }
        }
    }
    Ok(out)
}

/// Active schedules joined with the owning classroom's timezone and
/// teacher, the unit of work for one sweep pass.
#[derive(Debug, Clone)]
pub struct SweepCandidate {
    pub schedule: Schedule,
    pub teacher_id: String,
    pub timezone: Option<String>,
}

pub fn active_schedules_with_timezone(conn: &Connection) -> Result<Vec<SweepCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.classroom_id, s.weekdays, s.local_time, s.window_minutes,
                s.target_kind, s.assessment_type, s.num_questions, s.duration_minutes,
                s.recipient_rule, s.depends_on_schedule_id, s.offset_minutes, s.is_active,
                c.teacher_id, c.timezone
         FROM schedules s
         JOIN classrooms c ON c.id = s.classroom_id
         WHERE s.is_active = 1
         ORDER BY s.id",
    )?;
    let rows = stmt.query_map([], |row| {
        let raw = schedule_from_row(row)?;
        let teacher_id: String = row.get(13)?;
        let timezone: Option<String> = row.get(14)?;
        Ok((raw, teacher_id, timezone))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (raw, teacher_id, timezone) = row?;
        out.push(SweepCandidate {
            schedule: decode_schedule(raw)?,
            teacher_id,
            timezone,
        });
    }
    Ok(out)
}

pub fn deactivate_schedule(conn: &Connection, schedule_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE schedules SET is_active = 0 WHERE id = ?",
        [schedule_id],
    )?;
    Ok(())
}

/// Deletes the schedule and its dependent rows. Materialized assignments
/// survive; only the template and its ledger go away.
pub fn delete_schedule(conn: &Connection, schedule_id: &str) -> Result<()> {
    // Existence check first so callers get not_found instead of a silent no-op.
    get_schedule(conn, schedule_id)?;

    let tx = conn.unchecked_transaction()?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    tx.execute(
        "DELETE FROM schedule_recipients WHERE schedule_id = ?",
        [schedule_id],
    )?;
    tx.execute(
        "DELETE FROM schedule_runs WHERE schedule_id = ?",
        [schedule_id],
    )?;
    tx.execute(
        "UPDATE schedules SET depends_on_schedule_id = NULL, offset_minutes = NULL
         WHERE depends_on_schedule_id = ?",
        [schedule_id],
    )?;
    tx.execute("DELETE FROM schedules WHERE id = ?", [schedule_id])?;
    tx.commit()?;
    Ok(())
}

pub fn schedule_recipient_ids(conn: &Connection, schedule_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM schedule_recipients WHERE schedule_id = ? ORDER BY student_id",
    )?;
    let rows = stmt.query_map([schedule_id], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn run_from_row(row: &Row) -> rusqlite::Result<ScheduleRun> {
    Ok(ScheduleRun {
        schedule_id: row.get(0)?,
        run_date: row.get(1)?,
        assignment_id: row.get(2)?,
        is_skipped: row.get::<_, i64>(3)? != 0,
        skipped_at: row.get(4)?,
        skip_reason: row.get(5)?,
    })
}

/// Upsert-by-natural-key: a single conditional write, never check-then-insert.
/// Concurrent callers both land on the same row.
pub fn upsert_run(conn: &Connection, schedule_id: &str, run_date: &str) -> Result<ScheduleRun> {
    conn.execute(
        "INSERT INTO schedule_runs(schedule_id, run_date) VALUES(?, ?)
         ON CONFLICT(schedule_id, run_date) DO NOTHING",
        (schedule_id, run_date),
    )?;
    get_run(conn, schedule_id, run_date)?.ok_or_else(|| {
        SchedulerError::not_found(format!("run vanished after upsert: {schedule_id} @ {run_date}"))
    })
}

pub fn get_run(
    conn: &Connection,
    schedule_id: &str,
    run_date: &str,
) -> Result<Option<ScheduleRun>> {
    let run = conn
        .query_row(
            "SELECT schedule_id, run_date, assignment_id, is_skipped, skipped_at, skip_reason
             FROM schedule_runs WHERE schedule_id = ? AND run_date = ?",
            (schedule_id, run_date),
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

/// Ledger view for one schedule, oldest occurrence first.
pub fn list_runs(conn: &Connection, schedule_id: &str) -> Result<Vec<ScheduleRun>> {
    let mut stmt = conn.prepare(
        "SELECT schedule_id, run_date, assignment_id, is_skipped, skipped_at, skip_reason
         FROM schedule_runs WHERE schedule_id = ? ORDER BY run_date",
    )?;
    let rows = stmt.query_map([schedule_id], run_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn set_run_assignment(
    conn: &Connection,
    schedule_id: &str,
    run_date: &str,
    assignment_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE schedule_runs SET assignment_id = ? WHERE schedule_id = ? AND run_date = ?",
        (assignment_id, schedule_id, run_date),
    )?;
    Ok(())
}

pub fn mark_run_skipped(
    conn: &Connection,
    schedule_id: &str,
    run_date: &str,
    skipped_at: &str,
    reason: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO schedule_runs(schedule_id, run_date, assignment_id, is_skipped, skipped_at, skip_reason)
         VALUES(?, ?, NULL, 1, ?, ?)
         ON CONFLICT(schedule_id, run_date) DO UPDATE SET
           assignment_id = NULL,
           is_skipped = 1,
           skipped_at = excluded.skipped_at,
           skip_reason = excluded.skip_reason",
        (schedule_id, run_date, skipped_at, reason),
    )?;
    Ok(())
}

fn assignment_from_row(row: &Row) -> rusqlite::Result<(Assignment, String)> {
    let target_kind: String = row.get(7)?;
    let a = Assignment {
        id: row.get(0)?,
        classroom_id: row.get(1)?,
        schedule_id: row.get(2)?,
        run_date: row.get(3)?,
        opens_at: row.get(4)?,
        closes_at: row.get(5)?,
        window_minutes: row.get(6)?,
        target_kind: TargetKind::Assessment,
        assessment_type: row.get(8)?,
        num_questions: row.get(9)?,
        duration_minutes: row.get(10)?,
    };
    Ok((a, target_kind))
}

fn decode_assignment(raw: (Assignment, String)) -> Result<Assignment> {
    let (mut a, kind) = raw;
    a.target_kind = TargetKind::parse(&kind)?;
    Ok(a)
}

const ASSIGNMENT_COLUMNS: &str = "id, classroom_id, schedule_id, run_date, opens_at, closes_at, \
     window_minutes, target_kind, assessment_type, num_questions, duration_minutes";

pub fn insert_assignment(conn: &Connection, a: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments(
            id, classroom_id, schedule_id, run_date, opens_at, closes_at,
            window_minutes, target_kind, assessment_type, num_questions, duration_minutes
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &a.id,
            &a.classroom_id,
            &a.schedule_id,
            &a.run_date,
            &a.opens_at,
            &a.closes_at,
            a.window_minutes,
            a.target_kind.as_str(),
            &a.assessment_type,
            a.num_questions,
            a.duration_minutes,
        ),
    )?;
    Ok(())
}

pub fn get_assignment(conn: &Connection, assignment_id: &str) -> Result<Option<Assignment>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?"),
            [assignment_id],
            assignment_from_row,
        )
        .optional()?;
    raw.map(decode_assignment).transpose()
}

pub fn find_assignment_by_natural_key(
    conn: &Connection,
    schedule_id: &str,
    run_date: &str,
) -> Result<Option<Assignment>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
                 WHERE schedule_id = ? AND run_date = ?"
            ),
            (schedule_id, run_date),
            assignment_from_row,
        )
        .optional()?;
    raw.map(decode_assignment).transpose()
}

pub fn update_assignment_window(
    conn: &Connection,
    assignment_id: &str,
    opens_at: &str,
    closes_at: &str,
    window_minutes: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE assignments SET opens_at = ?, closes_at = ?, window_minutes = ? WHERE id = ?",
        (opens_at, closes_at, window_minutes, assignment_id),
    )?;
    Ok(())
}

pub fn delete_assignment_rows(conn: &Connection, assignment_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM assignment_recipients WHERE assignment_id = ?",
        [assignment_id],
    )?;
    conn.execute("DELETE FROM assignments WHERE id = ?", [assignment_id])?;
    Ok(())
}

pub fn list_assignments(
    conn: &Connection,
    classroom_id: &str,
    opens_from: Option<&str>,
    opens_to: Option<&str>,
) -> Result<Vec<Assignment>> {
    // RFC3339 UTC strings sort chronologically, so TEXT comparison is safe.
    let mut sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE classroom_id = ?"
    );
    let mut params: Vec<Value> = vec![Value::Text(classroom_id.to_string())];
    if let Some(from) = opens_from {
        sql.push_str(" AND opens_at >= ?");
        params.push(Value::Text(from.to_string()));
    }
    if let Some(to) = opens_to {
        sql.push_str(" AND opens_at < ?");
        params.push(Value::Text(to.to_string()));
    }
    sql.push_str(" ORDER BY opens_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), assignment_from_row)?;
    let mut out = Vec::new();
    for raw in rows {
        out.push(decode_assignment(raw?)?);
    }
    Ok(out)
}

pub fn insert_assignment_recipients(
    conn: &Connection,
    assignment_id: &str,
    student_ids: &[String],
) -> Result<()> {
    for sid in student_ids {
        conn.execute(
            "INSERT INTO assignment_recipients(assignment_id, student_id) VALUES(?, ?)
             ON CONFLICT(assignment_id, student_id) DO NOTHING",
            (assignment_id, sid),
        )?;
    }
    Ok(())
}

pub fn assignment_recipient_ids(conn: &Connection, assignment_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM assignment_recipients WHERE assignment_id = ? ORDER BY student_id",
    )?;
    let rows = stmt.query_map([assignment_id], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Record a student attempt. From here on the assignment's scheduling
/// fields are frozen.
pub fn record_attempt(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
    started_at: &str,
) -> Result<String> {
    let assignment = get_assignment(conn, assignment_id)?.ok_or_else(|| {
        SchedulerError::not_found(format!("assignment not found: {assignment_id}"))
    })?;
    if !validate_membership(conn, &assignment.classroom_id, &[student_id.to_string()])? {
        return Err(SchedulerError::validation(
            "student does not belong to the assignment's classroom",
        ));
    }
    let attempt_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attempts(id, assignment_id, student_id, started_at) VALUES(?, ?, ?, ?)",
        (&attempt_id, assignment_id, student_id, started_at),
    )?;
    Ok(attempt_id)
}

pub fn count_attempts(conn: &Connection, assignment_id: &str) -> Result<i64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attempts WHERE assignment_id = ?",
        [assignment_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// True when every id names a student of the classroom.
pub fn validate_membership(
    conn: &Connection,
    classroom_id: &str,
    student_ids: &[String],
) -> Result<bool> {
    if student_ids.is_empty() {
        return Ok(true);
    }
    let placeholders = vec!["?"; student_ids.len()].join(", ");
    let sql = format!(
        "SELECT COUNT(DISTINCT id) FROM students WHERE classroom_id = ? AND id IN ({placeholders})"
    );
    let mut params: Vec<Value> = vec![Value::Text(classroom_id.to_string())];
    params.extend(student_ids.iter().map(|s| Value::Text(s.clone())));

    let matched: i64 = conn.query_row(&sql, params_from_iter(params), |r| r.get(0))?;
    let distinct: std::collections::HashSet<&String> = student_ids.iter().collect();
    Ok(matched as usize == distinct.len())
}

pub fn classroom_timezone(conn: &Connection, classroom_id: &str) -> Result<Option<String>> {
    let row = conn
        .query_row(
            "SELECT timezone FROM classrooms WHERE id = ?",
            [classroom_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?;
    match row {
        Some(tz) => Ok(tz),
        None => Err(SchedulerError::not_found(format!(
            "classroom not found: {classroom_id}"
        ))),
    }
}
