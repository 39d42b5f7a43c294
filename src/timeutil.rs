use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::validation(format!("unknown timezone: {name}")))
}

/// Strict `YYYY-MM-DD`. Anything shorter, longer, or differently delimited
/// is rejected before chrono sees it.
pub fn parse_local_date(s: &str) -> Result<NaiveDate> {
    let b = s.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return Err(SchedulerError::validation(format!(
            "date must be YYYY-MM-DD, got {s:?}"
        )));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SchedulerError::validation(format!("invalid date: {s:?}")))
}

/// Strict `HH:mm`.
pub fn parse_local_time(s: &str) -> Result<NaiveTime> {
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' {
        return Err(SchedulerError::validation(format!(
            "time must be HH:mm, got {s:?}"
        )));
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| SchedulerError::validation(format!("invalid time: {s:?}")))
}

pub fn parse_weekday(token: &str) -> Result<Weekday> {
    match token.to_ascii_lowercase().as_str() {
        "monday" => Ok(Weekday::Mon),
        "tuesday" => Ok(Weekday::Tue),
        "wednesday" => Ok(Weekday::Wed),
        "thursday" => Ok(Weekday::Thu),
        "friday" => Ok(Weekday::Fri),
        "saturday" => Ok(Weekday::Sat),
        "sunday" => Ok(Weekday::Sun),
        _ => Err(SchedulerError::validation(format!(
            "not a weekday: {token:?}"
        ))),
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Canonical RFC3339 rendering used everywhere an instant is stored or
/// compared. Natural keys compare byte-for-byte only because every writer
/// funnels through this.
pub fn fmt_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| SchedulerError::validation(format!("invalid instant: {s:?}")))
}

/// Resolve a local wall-clock datetime against the zone's rules. On a
/// fall-back fold the earlier instant wins; in a spring-forward gap the
/// wall-clock shifts forward by one hour.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let shifted = date.and_time(time) + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    Ok(dt.with_timezone(&Utc))
                }
                LocalResult::None => Err(SchedulerError::validation(format!(
                    "local time {date} {time} does not exist in {tz}"
                ))),
            }
        }
    }
}

/// First local calendar day of `base` (inclusive) whose weekday is in the
/// set, scanning at most 7 days. An empty or malformed set is a caller bug
/// surfaced as a validation failure.
pub fn next_matching_local_date(
    base: DateTime<Utc>,
    weekdays: &[String],
    tz: Tz,
) -> Result<NaiveDate> {
    if weekdays.is_empty() {
        return Err(SchedulerError::validation("weekday set must not be empty"));
    }
    let set = weekdays
        .iter()
        .map(|w| parse_weekday(w))
        .collect::<Result<Vec<_>>>()?;

    let start = base.with_timezone(&tz).date_naive();
    for offset in 0..7 {
        let day = start + Duration::days(offset);
        if set.contains(&day.weekday()) {
            return Ok(day);
        }
    }
    Err(SchedulerError::validation(
        "no matching weekday within 7 days",
    ))
}

/// Interpret a local date + `HH:mm` in the zone and add the window to get
/// the close instant.
pub fn local_datetime_to_utc_range(
    local_date: NaiveDate,
    local_time: &str,
    window_minutes: i64,
    tz: Tz,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if window_minutes <= 0 {
        return Err(SchedulerError::validation(
            "windowMinutes must be positive",
        ));
    }
    let time = parse_local_time(local_time)?;
    let opens_at = resolve_local(tz, local_date, time)?;
    Ok((opens_at, opens_at + Duration::minutes(window_minutes)))
}

/// Natural-key normalization for run dates: a calendar day always maps to
/// the same instant, regardless of the time-of-day used elsewhere.
pub fn local_date_to_utc_midnight(local_date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>> {
    resolve_local(tz, local_date, NaiveTime::MIN)
}
