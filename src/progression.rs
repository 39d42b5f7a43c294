use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackLevel {
    pub track: String,
    pub level: i64,
}

/// Redistribute a single level value across an ordered list of skill
/// tracks. Tracks before the primary are treated as already mastered (max
/// level), the primary gets the incoming amount clamped to `[1, maxNumber]`,
/// and tracks after it start at level 1.
///
/// A missing primary or an empty order yields an empty list; callers treat
/// that as "nothing to write".
pub fn distribute(
    operation_order: &[String],
    primary_track: &str,
    level_amount: i64,
    max_number: i64,
) -> Vec<TrackLevel> {
    if operation_order.is_empty() || !operation_order.iter().any(|t| t == primary_track) {
        return Vec::new();
    }

    let max_number = max_number.max(1);
    let primary_level = level_amount.clamp(1, max_number);

    let mut out = Vec::with_capacity(operation_order.len());
    let mut before_primary = true;
    for track in operation_order {
        let level = if track == primary_track && before_primary {
            before_primary = false;
            primary_level
        } else if before_primary {
            max_number
        } else {
            1
        };
        out.push(TrackLevel {
            track: track.clone(),
            level,
        });
    }
    out
}

/// Distribute and persist the result for one student. Empty distributions
/// write nothing.
pub fn apply_level(
    conn: &Connection,
    student_id: &str,
    operation_order: &[String],
    primary_track: &str,
    level_amount: i64,
    max_number: i64,
) -> Result<Vec<TrackLevel>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE id = ?",
            [student_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n > 0)?;
    if !exists {
        return Err(SchedulerError::not_found(format!(
            "student not found: {student_id}"
        )));
    }

    let levels = distribute(operation_order, primary_track, level_amount, max_number);
    if levels.is_empty() {
        return Ok(levels);
    }

    let tx = conn.unchecked_transaction()?;
    for tl in &levels {
        tx.execute(
            "INSERT INTO student_track_levels(student_id, track, level)
             VALUES(?, ?, ?)
             ON CONFLICT(student_id, track) DO UPDATE SET
               level = excluded.level",
            (&student_id, &tl.track, tl.level),
        )?;
    }
    tx.commit()?;
    Ok(levels)
}
