use chrono::{Datelike, Duration, NaiveDate};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;

use crate::error::Result;
use crate::store::{Assignment, Schedule, TargetKind};
use crate::timeutil;

/// A future occurrence that has no ledger row yet. Derived on every read,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedOccurrence {
    pub schedule_id: String,
    pub run_date: String,
    pub opens_at: String,
    pub closes_at: String,
    pub target_kind: TargetKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CalendarItem {
    Materialized(Assignment),
    Projected(ProjectedOccurrence),
}

/// Enumerate every local date in `[range_start, range_end]` matching the
/// schedule's weekday set and compute each occurrence's window. An inverted
/// range yields nothing.
pub fn project(
    schedule: &Schedule,
    range_start: NaiveDate,
    range_end: NaiveDate,
    tz: Tz,
) -> Result<Vec<ProjectedOccurrence>> {
    let mut wanted = HashSet::new();
    for token in &schedule.weekdays {
        wanted.insert(timeutil::parse_weekday(token)?);
    }

    let window_minutes = match schedule.target_kind {
        TargetKind::PracticeTime => schedule.duration_minutes.unwrap_or(schedule.window_minutes),
        TargetKind::Assessment => schedule.window_minutes,
    };

    let mut out = Vec::new();
    let mut day = range_start;
    while day <= range_end {
        if wanted.contains(&day.weekday()) {
            let (opens_at, closes_at) =
                timeutil::local_datetime_to_utc_range(day, &schedule.local_time, window_minutes, tz)?;
            let run_date = timeutil::local_date_to_utc_midnight(day, tz)?;
            out.push(ProjectedOccurrence {
                schedule_id: schedule.id.clone(),
                run_date: timeutil::fmt_instant(run_date),
                opens_at: timeutil::fmt_instant(opens_at),
                closes_at: timeutil::fmt_instant(closes_at),
                target_kind: schedule.target_kind,
            });
        }
        day += Duration::days(1);
    }
    Ok(out)
}

/// Concatenate materialized items with projections, dropping any projection
/// whose natural key is already materialized. No key appears twice in the
/// output, and the materialized item always wins.
pub fn merge(
    materialized: Vec<Assignment>,
    projected: Vec<ProjectedOccurrence>,
) -> Vec<CalendarItem> {
    let taken: HashSet<(String, String)> = materialized
        .iter()
        .filter_map(|a| match (&a.schedule_id, &a.run_date) {
            (Some(sid), Some(rd)) => Some((sid.clone(), rd.clone())),
            _ => None,
        })
        .collect();

    let mut out: Vec<CalendarItem> = materialized
        .into_iter()
        .map(CalendarItem::Materialized)
        .collect();
    out.extend(
        projected
            .into_iter()
            .filter(|p| !taken.contains(&(p.schedule_id.clone(), p.run_date.clone())))
            .map(CalendarItem::Projected),
    );
    out
}
